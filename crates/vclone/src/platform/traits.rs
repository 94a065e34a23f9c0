//! Control-plane trait and the handle types the provisioning core works with.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::customization::CustomizationSpec;

/// Errors raised by a control-plane backend.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Reading or writing backend state failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Inventory document could not be parsed or written.
    #[error("Inventory format error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Session could not be established.
    #[error("Authentication failed for user '{0}'")]
    Auth(String),

    /// A handle does not refer to a live object of this session.
    #[error("Unknown managed object: {0}")]
    UnknownObject(String),

    /// The object exists but cannot serve the request.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Any other control-plane failure.
    #[error("API error: {0}")]
    Api(String),
}

/// Kind of an inventory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Datacenter,
    Folder,
    Cluster,
    Host,
    ResourcePool,
    VirtualMachine,
    Snapshot,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Datacenter => write!(f, "datacenter"),
            Self::Folder => write!(f, "folder"),
            Self::Cluster => write!(f, "cluster"),
            Self::Host => write!(f, "host"),
            Self::ResourcePool => write!(f, "resource pool"),
            Self::VirtualMachine => write!(f, "virtual machine"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Handle to a named inventory object.
///
/// `id` is the backend's managed-object identifier and is only meaningful
/// within the session that produced it. Names are not unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Object kind.
    pub kind: ResourceKind,
    /// Managed-object identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl ResourceRef {
    /// Create a new handle.
    pub fn new(kind: ResourceKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: name.into(),
        }
    }
}

/// In-memory snapshot of an inventory subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryNode {
    /// The object at this position.
    pub resource: ResourceRef,
    /// Children in listing order.
    pub children: Vec<InventoryNode>,
}

impl InventoryNode {
    /// A node without children.
    #[must_use]
    pub fn leaf(resource: ResourceRef) -> Self {
        Self {
            resource,
            children: Vec::new(),
        }
    }

    /// Name of the object at this node.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.resource.name
    }
}

/// The two well-known folders of a datacenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatacenterFolders {
    /// Root folder for virtual machines and templates.
    pub vm_folder: ResourceRef,
    /// Root folder for clusters and standalone hosts.
    pub host_folder: ResourceRef,
}

/// Power state of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PoweredOn,
    #[default]
    PoweredOff,
    Suspended,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoweredOn => write!(f, "poweredOn"),
            Self::PoweredOff => write!(f, "poweredOff"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// Configuration and summary facet of a virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmInfo {
    /// VM name.
    pub name: String,
    /// Number of virtual network adapters.
    pub nic_count: usize,
    /// Root snapshot list, oldest first.
    pub root_snapshots: Vec<ResourceRef>,
    /// Current power state.
    pub power_state: PowerState,
    /// Whether the VM is marked as a template.
    pub template: bool,
    /// Summary IP reported by the guest agent, if any.
    pub guest_ip: Option<String>,
}

/// Disk placement policy for a clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiskMoveType {
    /// Give the clone its own child disk on top of the template snapshot.
    #[default]
    #[serde(rename = "createNewChildDiskBacking")]
    CreateNewChildDiskBacking,
}

impl std::fmt::Display for DiskMoveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateNewChildDiskBacking => write!(f, "createNewChildDiskBacking"),
        }
    }
}

/// Where the clone is placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationSpec {
    /// Target host; `None` lets the platform choose.
    pub host: Option<ResourceRef>,
    /// Target resource pool.
    pub pool: ResourceRef,
    /// Disk backing policy.
    pub disk_move_type: DiskMoveType,
}

impl RelocationSpec {
    /// Relocation onto `pool` (and optionally `host`) with fresh child disks.
    #[must_use]
    pub fn new(host: Option<ResourceRef>, pool: ResourceRef) -> Self {
        Self {
            host,
            pool,
            disk_move_type: DiskMoveType::CreateNewChildDiskBacking,
        }
    }
}

/// Everything the control plane needs to perform a clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSpec {
    /// Placement.
    pub location: RelocationSpec,
    /// Power the clone on once created.
    pub power_on: bool,
    /// Mark the clone as a template.
    pub template: bool,
    /// Template snapshot the clone is based on.
    pub snapshot: ResourceRef,
    /// Guest customization to apply.
    pub customization: Option<CustomizationSpec>,
}

/// Handle to an asynchronous control-plane task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef {
    /// Task identifier.
    pub id: String,
    /// Human readable description.
    pub description: String,
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "success"),
            Self::Failed => write!(f, "error"),
        }
    }
}

/// Observed state of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// The task observed.
    pub task: TaskRef,
    /// Current state.
    pub state: TaskState,
    /// Entity produced by a successful task.
    pub result: Option<ResourceRef>,
    /// Platform failure detail for a failed task.
    pub error: Option<String>,
}

impl TaskInfo {
    /// Whether the task has left `Running`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state != TaskState::Running
    }
}

/// One address reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestIpAddress {
    /// IP address.
    pub ip_address: String,
    /// Prefix length.
    pub prefix_length: u8,
}

/// One network attachment reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestNic {
    /// Adapter MAC address.
    pub mac_address: String,
    /// Assigned addresses.
    #[serde(default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

/// Guest facet of a virtual machine, as last reported by its agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfo {
    /// Summary IP address.
    pub ip_address: Option<String>,
    /// Guest host name.
    pub host_name: Option<String>,
    /// Network attachments.
    #[serde(default)]
    pub networks: Vec<GuestNic>,
}

/// Operations the provisioning core needs from a virtualization control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// List the direct children of a container.
    async fn list_children(&self, container: &ResourceRef)
        -> Result<Vec<ResourceRef>, PlatformError>;

    /// Flat listing of objects of the given kinds below `root`
    /// (the inventory root folder when `None`).
    async fn container_view(
        &self,
        root: Option<&ResourceRef>,
        kinds: &[ResourceKind],
        recursive: bool,
    ) -> Result<Vec<ResourceRef>, PlatformError>;

    /// VM and host root folders of a datacenter.
    async fn datacenter_folders(
        &self,
        datacenter: &ResourceRef,
    ) -> Result<DatacenterFolders, PlatformError>;

    /// Root resource pool of a cluster.
    async fn resource_pool(&self, cluster: &ResourceRef) -> Result<ResourceRef, PlatformError>;

    /// Configuration and summary of a VM.
    async fn vm_info(&self, vm: &ResourceRef) -> Result<VmInfo, PlatformError>;

    /// Start a snapshot of `vm`.
    async fn create_snapshot(
        &self,
        vm: &ResourceRef,
        name: &str,
        memory: bool,
        quiesce: bool,
    ) -> Result<TaskRef, PlatformError>;

    /// Start cloning `template` into `folder` as `name`.
    async fn clone_vm(
        &self,
        template: &ResourceRef,
        name: &str,
        folder: &ResourceRef,
        spec: &CloneSpec,
    ) -> Result<TaskRef, PlatformError>;

    /// Current state of a task.
    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo, PlatformError>;

    /// Re-read the guest facet of a VM.
    async fn refresh_guest_info(&self, vm: &ResourceRef) -> Result<GuestInfo, PlatformError>;

    /// End the session.
    async fn disconnect(&self) -> Result<(), PlatformError>;

    /// Snapshot of the subtree rooted at `root`.
    ///
    /// Every container is listed exactly once. Children that cannot be
    /// listed are treated as empty; only a failure on `root` itself is
    /// reported.
    async fn inventory_tree(&self, root: &ResourceRef) -> Result<InventoryNode, PlatformError> {
        let mut nodes: Vec<(ResourceRef, Vec<usize>)> = vec![(root.clone(), Vec::new())];
        let mut stack = vec![0usize];

        while let Some(idx) = stack.pop() {
            let container = nodes[idx].0.clone();
            let listed = match self.list_children(&container).await {
                Ok(children) => children,
                Err(e) if idx == 0 => return Err(e),
                Err(e) => {
                    debug!(container = %container.id, error = %e, "Skipping unlistable container");
                    Vec::new()
                }
            };

            for child in listed {
                let child_idx = nodes.len();
                nodes.push((child, Vec::new()));
                nodes[idx].1.push(child_idx);
                stack.push(child_idx);
            }
        }

        Ok(assemble(&mut nodes, 0))
    }
}

fn assemble(nodes: &mut [(ResourceRef, Vec<usize>)], idx: usize) -> InventoryNode {
    let child_indices = std::mem::take(&mut nodes[idx].1);
    let children = child_indices
        .into_iter()
        .map(|child| assemble(nodes, child))
        .collect();
    InventoryNode {
        resource: nodes[idx].0.clone(),
        children,
    }
}
