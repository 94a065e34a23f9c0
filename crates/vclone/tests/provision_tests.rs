//! End-to-end provisioning against an inventory file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vclone::clone::SNAPSHOT_NAME;
use vclone::inventory::find_by_name;
use vclone::platform::local::{Credentials, LocalInventory};
use vclone::platform::{ControlPlane, PlatformError, PowerState};
use vclone::{
    provision, CloneError, FolderFallback, PrimaryAddress, ProvisionOptions, ProvisionRequest,
    ReadinessPolicy, ResourceKind, TaskWaitPolicy,
};

const INVENTORY: &str = r"
auth:
  user: administrator
  password: secret
task_polls: 1
datacenters:
  - name: DC1
    vm_folder:
      - kind: folder
        name: templates
        children:
          - kind: vm
            name: ubuntu-tpl
            template: true
            nics: 2
            boot_polls: 1
          - kind: vm
            name: appliance-tpl
            template: true
            nics: 1
            guest_agent: false
      - kind: folder
        name: prod
        children:
          - kind: folder
            name: eu
            children:
              - kind: folder
                name: web
          - kind: vm
            name: db-01
            power_state: powered_on
            nics: 1
            snapshots: [nightly]
    host_folder:
      - kind: cluster
        name: Cluster1
        hosts:
          - name: esx01
          - name: esx02
";

fn write_inventory() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("inventory.yaml");
    std::fs::write(&path, INVENTORY).unwrap();
    (dir, path)
}

fn admin() -> Credentials {
    Credentials {
        user: "administrator".to_string(),
        password: "secret".to_string(),
    }
}

async fn connect(path: &Path) -> LocalInventory {
    LocalInventory::connect(path, Some(&admin())).await.unwrap()
}

fn request(vm_name: &str) -> ProvisionRequest {
    ProvisionRequest {
        vm_name: vm_name.to_string(),
        template_name: "ubuntu-tpl".to_string(),
        datacenter_name: "DC1".to_string(),
        cluster_name: "Cluster1".to_string(),
        host_name: Some("esx01".to_string()),
        template_folder: Some("templates".to_string()),
        vm_folder: Some("prod".to_string()),
        ..ProvisionRequest::default()
    }
}

fn options() -> ProvisionOptions {
    ProvisionOptions {
        folder_fallback: FolderFallback::RootVmFolder,
        task_wait: TaskWaitPolicy {
            poll_interval: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(5)),
        },
        readiness: ReadinessPolicy::attempts(Duration::from_millis(1), 3),
    }
}

#[tokio::test]
async fn test_provision_static_vm_and_persist() {
    let (_dir, path) = write_inventory();
    let plane = connect(&path).await;

    let mut req = request("web_01");
    req.primary = Some(PrimaryAddress {
        ip: "10.20.0.15".parse().unwrap(),
        mask: "255.255.0.0".parse().unwrap(),
        gateway: Some("10.20.0.1".parse().unwrap()),
    });

    let outcome = provision(&plane, &req, &options(), &CancellationToken::new())
        .await
        .unwrap();
    plane.disconnect().await.unwrap();

    assert_eq!(outcome.summary.power_state, PowerState::PoweredOn);
    let guest = outcome.guest.unwrap();
    assert_eq!(guest.ip_address.as_deref(), Some("10.20.0.15"));
    assert_eq!(guest.host_name.as_deref(), Some("web-01"));
    assert_eq!(guest.interfaces.len(), 2);
    assert_eq!(guest.interfaces[0].addresses[0].prefix_length, 16);
    assert_eq!(guest.interfaces[1].addresses[0].ip_address, "11.0.0.1");
    assert_ne!(guest.interfaces[0].mac_address, guest.interfaces[1].mac_address);

    // the clone and the template snapshot outlive the session
    let reopened = connect(&path).await;
    let vm = find_by_name(&reopened, None, ResourceKind::VirtualMachine, "web_01")
        .await
        .unwrap()
        .unwrap();
    let info = reopened.vm_info(&vm).await.unwrap();
    assert_eq!(info.power_state, PowerState::PoweredOn);
    assert_eq!(info.guest_ip.as_deref(), Some("10.20.0.15"));

    let template = find_by_name(&reopened, None, ResourceKind::VirtualMachine, "ubuntu-tpl")
        .await
        .unwrap()
        .unwrap();
    let template = reopened.vm_info(&template).await.unwrap();
    assert_eq!(template.root_snapshots.len(), 1);
    assert_eq!(template.root_snapshots[0].name, SNAPSHOT_NAME);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let (_dir, path) = write_inventory();
    let wrong = Credentials {
        user: "administrator".to_string(),
        password: "guess".to_string(),
    };

    let result = LocalInventory::connect(&path, Some(&wrong)).await;
    assert!(matches!(result, Err(PlatformError::Auth(_))));
    assert!(matches!(
        LocalInventory::connect(&path, None).await,
        Err(PlatformError::Auth(_))
    ));
}

#[tokio::test]
async fn test_folder_path_resolves_nested_folder() {
    let (_dir, path) = write_inventory();
    let plane = connect(&path).await;

    let mut req = request("web-02");
    req.vm_folder = Some("prod/web".to_string());
    provision(&plane, &req, &options(), &CancellationToken::new())
        .await
        .unwrap();

    let web = find_by_name(&plane, None, ResourceKind::Folder, "web")
        .await
        .unwrap()
        .unwrap();
    let children = plane.list_children(&web).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name, "web-02");
    plane.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_strict_folders_fail_without_cloning() {
    let (_dir, path) = write_inventory();
    let plane = connect(&path).await;

    let mut req = request("web-03");
    req.vm_folder = Some("staging".to_string());
    let opts = ProvisionOptions {
        folder_fallback: FolderFallback::Strict,
        ..options()
    };

    let err = provision(&plane, &req, &opts, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CloneError::NotFound { kind: ResourceKind::Folder, .. }));
    assert!(find_by_name(&plane, None, ResourceKind::VirtualMachine, "web-03")
        .await
        .unwrap()
        .is_none());
    plane.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_template_creation_skips_readiness() {
    let (_dir, path) = write_inventory();
    let plane = connect(&path).await;

    let mut req = request("ubuntu-tpl-v2");
    req.create_template = true;
    req.vm_folder = Some("templates".to_string());

    let outcome = provision(&plane, &req, &options(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.guest.is_none());
    assert!(outcome.summary.template);
    assert_eq!(outcome.summary.power_state, PowerState::PoweredOff);
    plane.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_name_fails_the_clone_task() {
    let (_dir, path) = write_inventory();
    let plane = connect(&path).await;

    let err = provision(&plane, &request("db-01"), &options(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CloneError::TaskFailure { ref detail, .. } if detail == "The name 'db-01' already exists."
    ));
    plane.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_silent_guest_times_out() {
    let (_dir, path) = write_inventory();
    let plane = connect(&path).await;

    let mut req = request("appliance-01");
    req.template_name = "appliance-tpl".to_string();

    let err = provision(&plane, &req, &options(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CloneError::ReadinessTimeout { attempts: 3, ref vm, .. } if vm == "appliance-01"
    ));
    plane.disconnect().await.unwrap();
}
