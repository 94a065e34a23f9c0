//! End-to-end provisioning: resolve, customize, clone, wait for the guest.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clone::{submit_clone, CloneRequest, TaskWaitPolicy};
use crate::customization::{build_customization, GlobalIpSettings, PrimaryAddress};
use crate::error::CloneError;
use crate::inventory::{find_by_name, require_by_name, resolve_folder_path};
use crate::platform::{
    ControlPlane, InventoryNode, RelocationSpec, ResourceKind, ResourceRef, VmInfo,
};
use crate::readiness::{wait_for_guest_network, GuestNetworkInfo, ReadinessPolicy};

/// What to provision.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub vm_name: String,
    pub template_name: String,
    pub datacenter_name: String,
    pub cluster_name: String,
    /// Preferred host; when absent or not found the platform picks one.
    pub host_name: Option<String>,
    /// Static address for the first adapter; DHCP when `None`.
    pub primary: Option<PrimaryAddress>,
    /// Produce a powered-off template instead of a running VM.
    pub create_template: bool,
    /// Folder path the template is searched in.
    pub template_folder: Option<String>,
    /// Folder path the clone is placed in.
    pub vm_folder: Option<String>,
    /// DNS settings for the guest.
    pub global: GlobalIpSettings,
    /// Guest domain.
    pub domain: Option<String>,
}

/// What to do when a requested folder path does not resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FolderFallback {
    /// Use the datacenter's root VM folder and log a warning.
    #[default]
    RootVmFolder,
    /// Fail with `NotFound`.
    Strict,
}

/// Tunables of a provisioning run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    pub folder_fallback: FolderFallback,
    pub task_wait: TaskWaitPolicy,
    pub readiness: ReadinessPolicy,
}

/// Result of a provisioning run.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    /// Handle to the new VM or template.
    pub vm: ResourceRef,
    /// Summary right after the clone.
    pub summary: VmInfo,
    /// Guest networking; `None` for templates.
    pub guest: Option<GuestNetworkInfo>,
}

/// Provision one VM as described by `request`.
///
/// Datacenter, cluster and template must exist. A missing host leaves
/// placement to the platform; missing folders are handled per
/// `options.folder_fallback`. Guest readiness is skipped for templates.
///
/// # Errors
/// Returns `NotFound` for missing required objects, `InvalidRequest` when no
/// customization can be built for the template, and the errors of
/// [`submit_clone`] and [`wait_for_guest_network`].
pub async fn provision<P: ControlPlane + ?Sized>(
    plane: &P,
    request: &ProvisionRequest,
    options: &ProvisionOptions,
    cancel: &CancellationToken,
) -> Result<ProvisionOutcome, CloneError> {
    info!(
        vm = %request.vm_name,
        template = %request.template_name,
        datacenter = %request.datacenter_name,
        cluster = %request.cluster_name,
        "Provisioning VM"
    );

    let datacenter =
        require_by_name(plane, None, ResourceKind::Datacenter, &request.datacenter_name).await?;
    let folders = plane.datacenter_folders(&datacenter).await?;

    let cluster = require_by_name(
        plane,
        Some(&folders.host_folder),
        ResourceKind::Cluster,
        &request.cluster_name,
    )
    .await?;

    let host = match &request.host_name {
        Some(name) => {
            let host = find_by_name(plane, Some(&cluster), ResourceKind::Host, name).await?;
            if host.is_none() {
                warn!(host = %name, cluster = %cluster.name, "Host not found, letting the platform choose");
            }
            host
        }
        None => None,
    };
    let pool = plane.resource_pool(&cluster).await?;

    let vm_tree = plane.inventory_tree(&folders.vm_folder).await?;
    let template_folder = destination_folder(
        &vm_tree,
        request.template_folder.as_deref(),
        options.folder_fallback,
    )?;
    let vm_folder = destination_folder(&vm_tree, request.vm_folder.as_deref(), options.folder_fallback)?;

    let template = require_by_name(
        plane,
        Some(&template_folder),
        ResourceKind::VirtualMachine,
        &request.template_name,
    )
    .await?;
    let template_info = plane.vm_info(&template).await?;

    let customization = build_customization(
        &request.vm_name,
        template_info.nic_count,
        request.primary.as_ref(),
    )?
    .with_global_settings(request.global.clone())
    .with_domain(request.domain.clone());
    if customization.is_noop() {
        debug!(template = %template.name, "Template has no network adapters, only the hostname is customized");
    }

    let clone_request = CloneRequest {
        template,
        name: request.vm_name.clone(),
        folder: vm_folder,
        relocation: RelocationSpec::new(host, pool),
        customization: Some(customization),
        as_template: request.create_template,
    };
    let provisioned = submit_clone(plane, &clone_request, &options.task_wait, cancel).await?;

    let guest = if request.create_template {
        info!(vm = %provisioned.vm.name, "Created a template, skipping guest readiness");
        None
    } else {
        Some(wait_for_guest_network(plane, &provisioned.vm, &options.readiness, cancel).await?)
    };

    Ok(ProvisionOutcome {
        vm: provisioned.vm,
        summary: provisioned.summary,
        guest,
    })
}

/// Folder a path resolves to inside `vm_tree`, the tree root when no path
/// was requested.
fn destination_folder(
    vm_tree: &InventoryNode,
    path: Option<&str>,
    fallback: FolderFallback,
) -> Result<ResourceRef, CloneError> {
    let Some(path) = path else {
        return Ok(vm_tree.resource.clone());
    };

    if let Some(folder) = resolve_folder_path(vm_tree, path) {
        debug!(path, folder = %folder.resource.id, "Resolved folder");
        return Ok(folder.resource.clone());
    }

    match fallback {
        FolderFallback::Strict => Err(CloneError::not_found(ResourceKind::Folder, path)),
        FolderFallback::RootVmFolder => {
            warn!(path, fallback = %vm_tree.resource.name, "Folder not found, using the datacenter VM folder");
            Ok(vm_tree.resource.clone())
        }
    }
}
