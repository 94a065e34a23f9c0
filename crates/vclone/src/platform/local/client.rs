//! Inventory-file control plane implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use super::models::{
    AuthEntry, ClusterEntry, DatacenterEntry, Entry, FolderEntry, HostEntry, InventoryDocument,
    VmEntry,
};
use crate::customization::{prefix_length, NetworkInterfaceSpec};
use crate::platform::{
    CloneSpec, ControlPlane, DatacenterFolders, GuestInfo, GuestIpAddress, GuestNic,
    InventoryNode, PlatformError, PowerState, ResourceKind, ResourceRef, TaskInfo, TaskRef,
    TaskState, VmInfo,
};

/// Identifier of the inventory root folder.
const ROOT_FOLDER_ID: &str = "group-d1";

/// Network simulated DHCP leases are handed out from (/24).
const DHCP_NETWORK: [u8; 3] = [192, 168, 122];

/// Session credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Control plane backed by an inventory YAML file.
///
/// The file is read once on [`LocalInventory::connect`]; all operations then
/// run against the in-memory copy and [`ControlPlane::disconnect`] writes it
/// back when the session changed anything.
pub struct LocalInventory {
    path: PathBuf,
    state: Mutex<Session>,
}

struct Node {
    resource: ResourceRef,
    parent: Option<usize>,
    children: Vec<usize>,
    vm: Option<Box<VmNode>>,
}

#[derive(Clone)]
struct VmNode {
    entry: VmEntry,
    snapshots: Vec<ResourceRef>,
}

struct TaskRecord {
    task: TaskRef,
    polls_left: u32,
    outcome: Result<Option<ResourceRef>, String>,
}

struct Session {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    auth: Option<AuthEntry>,
    task_polls: u32,
    tasks: HashMap<String, TaskRecord>,
    guest_refreshes: HashMap<usize, u32>,
    next_id: u64,
    dirty: bool,
    closed: bool,
}

impl LocalInventory {
    /// Open a session on the inventory at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if the
    /// document declares credentials and `credentials` does not match them.
    pub async fn connect(
        path: impl Into<PathBuf>,
        credentials: Option<&Credentials>,
    ) -> Result<Self, PlatformError> {
        let path = path.into();
        let contents = tokio::fs::read_to_string(&path).await?;
        let doc: InventoryDocument = serde_yaml::from_str(&contents)?;

        if let Some(auth) = &doc.auth {
            match credentials {
                Some(c) if c.user == auth.user && c.password == auth.password => {}
                Some(c) => return Err(PlatformError::Auth(c.user.clone())),
                None => return Err(PlatformError::Auth(String::new())),
            }
        }

        let session = Session::from_document(doc);
        info!(
            path = %path.display(),
            datacenters = session.nodes[0].children.len(),
            "Connected to inventory"
        );

        Ok(Self {
            path,
            state: Mutex::new(session),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn session(&self) -> Result<MutexGuard<'_, Session>, PlatformError> {
        let guard = self
            .state
            .lock()
            .map_err(|_| PlatformError::Api("inventory session state poisoned".to_string()))?;
        if guard.closed {
            return Err(PlatformError::InvalidState("session is disconnected".to_string()));
        }
        Ok(guard)
    }
}

impl Session {
    fn from_document(doc: InventoryDocument) -> Self {
        let mut session = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            auth: doc.auth,
            task_polls: doc.task_polls,
            tasks: HashMap::new(),
            guest_refreshes: HashMap::new(),
            next_id: 2,
            dirty: false,
            closed: false,
        };

        let root = session.insert(
            None,
            ResourceRef::new(ResourceKind::Folder, ROOT_FOLDER_ID, "Datacenters"),
            None,
        );

        for dc in doc.datacenters {
            let dc_idx = session.push(root, ResourceKind::Datacenter, "datacenter-", &dc.name, None);
            let vm_folder = session.push(dc_idx, ResourceKind::Folder, "group-v", "vm", None);
            let host_folder = session.push(dc_idx, ResourceKind::Folder, "group-h", "host", None);
            session.load_entries(vm_folder, dc.vm_folder, "group-v");
            session.load_entries(host_folder, dc.host_folder, "group-h");
        }

        session
    }

    fn load_entries(&mut self, parent: usize, entries: Vec<Entry>, folder_prefix: &str) {
        for entry in entries {
            match entry {
                Entry::Folder(folder) => {
                    let idx =
                        self.push(parent, ResourceKind::Folder, folder_prefix, &folder.name, None);
                    self.load_entries(idx, folder.children, folder_prefix);
                }
                Entry::Cluster(cluster) => {
                    let idx =
                        self.push(parent, ResourceKind::Cluster, "domain-c", &cluster.name, None);
                    for host in &cluster.hosts {
                        self.push(idx, ResourceKind::Host, "host-", &host.name, None);
                    }
                    self.push(
                        idx,
                        ResourceKind::ResourcePool,
                        "resgroup-",
                        &cluster.resource_pool,
                        None,
                    );
                }
                Entry::Vm(vm) => {
                    let snapshots = vm
                        .snapshots
                        .iter()
                        .map(|name| {
                            ResourceRef::new(ResourceKind::Snapshot, self.alloc_id("snapshot-"), name)
                        })
                        .collect();
                    let name = vm.name.clone();
                    self.push(
                        parent,
                        ResourceKind::VirtualMachine,
                        "vm-",
                        &name,
                        Some(VmNode {
                            entry: vm,
                            snapshots,
                        }),
                    );
                }
            }
        }
    }

    fn alloc_id(&mut self, prefix: &str) -> String {
        let id = format!("{prefix}{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn push(
        &mut self,
        parent: usize,
        kind: ResourceKind,
        prefix: &str,
        name: &str,
        vm: Option<VmNode>,
    ) -> usize {
        let id = self.alloc_id(prefix);
        self.insert(Some(parent), ResourceRef::new(kind, id, name), vm)
    }

    fn insert(&mut self, parent: Option<usize>, resource: ResourceRef, vm: Option<VmNode>) -> usize {
        let idx = self.nodes.len();
        self.index.insert(resource.id.clone(), idx);
        self.nodes.push(Node {
            resource,
            parent,
            children: Vec::new(),
            vm: vm.map(Box::new),
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(idx);
        }
        idx
    }

    fn lookup(&self, resource: &ResourceRef) -> Result<usize, PlatformError> {
        self.index
            .get(&resource.id)
            .copied()
            .ok_or_else(|| PlatformError::UnknownObject(resource.id.clone()))
    }

    fn kind(&self, idx: usize) -> ResourceKind {
        self.nodes[idx].resource.kind
    }

    fn vm(&self, idx: usize) -> Result<&VmNode, PlatformError> {
        self.nodes[idx].vm.as_deref().ok_or_else(|| {
            PlatformError::InvalidState(format!(
                "{} is not a virtual machine",
                self.nodes[idx].resource.id
            ))
        })
    }

    fn vm_mut(&mut self, idx: usize) -> Result<&mut VmNode, PlatformError> {
        let id = self.nodes[idx].resource.id.clone();
        self.nodes[idx]
            .vm
            .as_deref_mut()
            .ok_or_else(|| PlatformError::InvalidState(format!("{id} is not a virtual machine")))
    }

    fn is_vm_folder(&self, idx: usize) -> bool {
        self.kind(idx) == ResourceKind::Folder && self.nodes[idx].resource.id.starts_with("group-v")
    }

    fn walk(&self, idx: usize, kinds: &[ResourceKind], recursive: bool, out: &mut Vec<ResourceRef>) {
        for &child in &self.nodes[idx].children {
            if kinds.contains(&self.kind(child)) {
                out.push(self.nodes[child].resource.clone());
            }
            if recursive {
                self.walk(child, kinds, recursive, out);
            }
        }
    }

    fn tree(&self, idx: usize) -> InventoryNode {
        InventoryNode {
            resource: self.nodes[idx].resource.clone(),
            children: self.nodes[idx]
                .children
                .iter()
                .map(|&child| self.tree(child))
                .collect(),
        }
    }

    fn start_task(&mut self, description: &str, outcome: Result<Option<ResourceRef>, String>) -> TaskRef {
        let task = TaskRef {
            id: self.alloc_id("task-"),
            description: description.to_string(),
        };
        self.tasks.insert(
            task.id.clone(),
            TaskRecord {
                task: task.clone(),
                polls_left: self.task_polls,
                outcome,
            },
        );
        task
    }

    /// Platform-side checks of a clone request. `Err` carries the failure
    /// detail reported on the task.
    fn validate_clone(
        &self,
        source: &VmNode,
        name: &str,
        folder: usize,
        spec: &CloneSpec,
    ) -> Result<(), String> {
        if !self.is_vm_folder(folder) {
            return Err("The operation is not supported on the object.".to_string());
        }

        let taken = self.nodes[folder]
            .children
            .iter()
            .any(|&c| self.kind(c) == ResourceKind::VirtualMachine && self.nodes[c].resource.name == name);
        if taken {
            return Err(format!("The name '{name}' already exists."));
        }

        if !source.snapshots.iter().any(|s| s.id == spec.snapshot.id) {
            return Err(format!(
                "The object 'vim.vm.Snapshot:{}' has already been deleted or has not been completely created",
                spec.snapshot.id
            ));
        }

        let pool = match self.index.get(&spec.location.pool.id) {
            Some(&idx) if self.kind(idx) == ResourceKind::ResourcePool => idx,
            _ => {
                return Err(format!(
                    "The object 'vim.ResourcePool:{}' has already been deleted or has not been completely created",
                    spec.location.pool.id
                ))
            }
        };

        if let Some(host) = &spec.location.host {
            let same_cluster = self
                .index
                .get(&host.id)
                .is_some_and(|&h| self.kind(h) == ResourceKind::Host && self.nodes[h].parent == self.nodes[pool].parent);
            if !same_cluster {
                return Err(format!(
                    "Host '{}' is not part of the cluster owning the target resource pool.",
                    host.name
                ));
            }
        }

        if let Some(customization) = &spec.customization {
            let settings = customization.interfaces.len();
            if settings > 0 && settings != source.entry.nics {
                return Err(format!(
                    "The number of network adapter settings in the customization specification: {settings} does not match the number of network adapters present in the virtual machine: {}.",
                    source.entry.nics
                ));
            }
        }

        Ok(())
    }

    fn insert_clone(
        &mut self,
        source: &VmNode,
        name: &str,
        folder: usize,
        spec: &CloneSpec,
    ) -> ResourceRef {
        let entry = VmEntry {
            name: name.to_string(),
            template: spec.template,
            power_state: if spec.power_on {
                PowerState::PoweredOn
            } else {
                PowerState::PoweredOff
            },
            nics: source.entry.nics,
            snapshots: Vec::new(),
            guest_agent: source.entry.guest_agent,
            boot_polls: source.entry.boot_polls,
            guest: None,
            customization: spec.customization.clone(),
            source: Some(source.entry.name.clone()),
            host: spec.location.host.as_ref().map(|h| h.name.clone()),
            resource_pool: Some(spec.location.pool.name.clone()),
        };

        let idx = self.push(
            folder,
            ResourceKind::VirtualMachine,
            "vm-",
            name,
            Some(VmNode {
                entry,
                snapshots: Vec::new(),
            }),
        );
        self.dirty = true;
        self.nodes[idx].resource.clone()
    }

    fn to_document(&self) -> InventoryDocument {
        let datacenters = self.nodes[0]
            .children
            .iter()
            .map(|&dc| DatacenterEntry {
                name: self.nodes[dc].resource.name.clone(),
                vm_folder: self.entries(self.nodes[dc].children[0]),
                host_folder: self.entries(self.nodes[dc].children[1]),
            })
            .collect();

        InventoryDocument {
            auth: self.auth.clone(),
            task_polls: self.task_polls,
            datacenters,
            updated_at: Some(chrono::Utc::now()),
        }
    }

    fn entries(&self, folder: usize) -> Vec<Entry> {
        self.nodes[folder]
            .children
            .iter()
            .filter_map(|&idx| {
                let node = &self.nodes[idx];
                match node.resource.kind {
                    ResourceKind::Folder => Some(Entry::Folder(FolderEntry {
                        name: node.resource.name.clone(),
                        children: self.entries(idx),
                    })),
                    ResourceKind::VirtualMachine => {
                        node.vm.as_ref().map(|vm| Entry::Vm(vm.entry.clone()))
                    }
                    ResourceKind::Cluster => {
                        let mut cluster = ClusterEntry {
                            name: node.resource.name.clone(),
                            resource_pool: String::new(),
                            hosts: Vec::new(),
                        };
                        for &child in &node.children {
                            let child = &self.nodes[child].resource;
                            match child.kind {
                                ResourceKind::Host => cluster.hosts.push(HostEntry {
                                    name: child.name.clone(),
                                }),
                                ResourceKind::ResourcePool => {
                                    cluster.resource_pool.clone_from(&child.name);
                                }
                                _ => {}
                            }
                        }
                        Some(Entry::Cluster(cluster))
                    }
                    _ => None,
                }
            })
            .collect()
    }
}

/// What the guest agent of `vm` reports once it is up.
fn simulated_guest(entry: &VmEntry, serial: usize) -> GuestInfo {
    let interfaces = entry
        .customization
        .as_ref()
        .map(|c| c.interfaces.as_slice())
        .unwrap_or_default();

    let networks: Vec<GuestNic> = (0..entry.nics)
        .map(|nic| {
            let address = match interfaces.get(nic) {
                Some(NetworkInterfaceSpec::Static { ip, mask, .. }) => GuestIpAddress {
                    ip_address: ip.to_string(),
                    prefix_length: prefix_length(*mask),
                },
                Some(NetworkInterfaceSpec::Dhcp) | None => GuestIpAddress {
                    ip_address: format!(
                        "{}.{}.{}.{}",
                        DHCP_NETWORK[0],
                        DHCP_NETWORK[1],
                        DHCP_NETWORK[2],
                        (serial + nic) % 200 + 10
                    ),
                    prefix_length: 24,
                },
            };
            GuestNic {
                mac_address: format!(
                    "00:50:56:{:02x}:{:02x}:{:02x}",
                    (serial >> 8) & 0xff,
                    serial & 0xff,
                    nic & 0xff
                ),
                ip_addresses: vec![address],
            }
        })
        .collect();

    GuestInfo {
        ip_address: networks
            .first()
            .and_then(|n| n.ip_addresses.first())
            .map(|a| a.ip_address.clone()),
        host_name: Some(
            entry
                .customization
                .as_ref()
                .map_or_else(|| entry.name.clone(), |c| c.hostname.clone()),
        ),
        networks,
    }
}

#[async_trait]
impl ControlPlane for LocalInventory {
    async fn list_children(
        &self,
        container: &ResourceRef,
    ) -> Result<Vec<ResourceRef>, PlatformError> {
        let session = self.session()?;
        let idx = session.lookup(container)?;
        match session.kind(idx) {
            ResourceKind::Folder | ResourceKind::Datacenter | ResourceKind::Cluster => Ok(session
                .nodes[idx]
                .children
                .iter()
                .map(|&c| session.nodes[c].resource.clone())
                .collect()),
            kind => Err(PlatformError::InvalidState(format!(
                "{} is a {kind}, not a container",
                container.id
            ))),
        }
    }

    async fn container_view(
        &self,
        root: Option<&ResourceRef>,
        kinds: &[ResourceKind],
        recursive: bool,
    ) -> Result<Vec<ResourceRef>, PlatformError> {
        let session = self.session()?;
        let idx = match root {
            Some(root) => session.lookup(root)?,
            None => 0,
        };
        let mut view = Vec::new();
        session.walk(idx, kinds, recursive, &mut view);
        debug!(root = %session.nodes[idx].resource.id, matches = view.len(), "Container view");
        Ok(view)
    }

    async fn datacenter_folders(
        &self,
        datacenter: &ResourceRef,
    ) -> Result<DatacenterFolders, PlatformError> {
        let session = self.session()?;
        let idx = session.lookup(datacenter)?;
        if session.kind(idx) != ResourceKind::Datacenter {
            return Err(PlatformError::InvalidState(format!(
                "{} is not a datacenter",
                datacenter.id
            )));
        }
        let children = &session.nodes[idx].children;
        Ok(DatacenterFolders {
            vm_folder: session.nodes[children[0]].resource.clone(),
            host_folder: session.nodes[children[1]].resource.clone(),
        })
    }

    async fn resource_pool(&self, cluster: &ResourceRef) -> Result<ResourceRef, PlatformError> {
        let session = self.session()?;
        let idx = session.lookup(cluster)?;
        session.nodes[idx]
            .children
            .iter()
            .find(|&&c| session.kind(c) == ResourceKind::ResourcePool)
            .map(|&c| session.nodes[c].resource.clone())
            .ok_or_else(|| {
                PlatformError::InvalidState(format!("{} has no resource pool", cluster.id))
            })
    }

    async fn vm_info(&self, vm: &ResourceRef) -> Result<VmInfo, PlatformError> {
        let session = self.session()?;
        let node = session.vm(session.lookup(vm)?)?;
        Ok(VmInfo {
            name: node.entry.name.clone(),
            nic_count: node.entry.nics,
            root_snapshots: node.snapshots.clone(),
            power_state: node.entry.power_state,
            template: node.entry.template,
            guest_ip: node.entry.guest.as_ref().and_then(|g| g.ip_address.clone()),
        })
    }

    async fn create_snapshot(
        &self,
        vm: &ResourceRef,
        name: &str,
        memory: bool,
        quiesce: bool,
    ) -> Result<TaskRef, PlatformError> {
        let mut session = self.session()?;
        let idx = session.lookup(vm)?;
        let node = session.vm(idx)?;

        let outcome = if memory && node.entry.power_state != PowerState::PoweredOn {
            Err("Cannot snapshot the memory of a virtual machine that is not powered on.".to_string())
        } else if quiesce && !node.entry.guest_agent {
            Err("Cannot quiesce a virtual machine without a running guest agent.".to_string())
        } else {
            let snapshot =
                ResourceRef::new(ResourceKind::Snapshot, session.alloc_id("snapshot-"), name);
            let node = session.vm_mut(idx)?;
            node.snapshots.push(snapshot.clone());
            node.entry.snapshots.push(name.to_string());
            session.dirty = true;
            Ok(Some(snapshot))
        };

        debug!(vm = %vm.name, snapshot = name, ok = outcome.is_ok(), "Snapshot requested");
        Ok(session.start_task("CreateSnapshot_Task", outcome))
    }

    async fn clone_vm(
        &self,
        template: &ResourceRef,
        name: &str,
        folder: &ResourceRef,
        spec: &CloneSpec,
    ) -> Result<TaskRef, PlatformError> {
        let mut session = self.session()?;
        let source = session.vm(session.lookup(template)?)?.clone();
        let folder_idx = session.lookup(folder)?;

        let outcome = match session.validate_clone(&source, name, folder_idx, spec) {
            Ok(()) => Ok(Some(session.insert_clone(&source, name, folder_idx, spec))),
            Err(detail) => Err(detail),
        };

        debug!(template = %template.name, vm = name, ok = outcome.is_ok(), "Clone requested");
        Ok(session.start_task("CloneVM_Task", outcome))
    }

    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo, PlatformError> {
        let mut session = self.session()?;
        let record = session
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| PlatformError::UnknownObject(task.id.clone()))?;

        if record.polls_left > 0 {
            record.polls_left -= 1;
            return Ok(TaskInfo {
                task: record.task.clone(),
                state: TaskState::Running,
                result: None,
                error: None,
            });
        }

        Ok(match &record.outcome {
            Ok(result) => TaskInfo {
                task: record.task.clone(),
                state: TaskState::Succeeded,
                result: result.clone(),
                error: None,
            },
            Err(detail) => TaskInfo {
                task: record.task.clone(),
                state: TaskState::Failed,
                result: None,
                error: Some(detail.clone()),
            },
        })
    }

    async fn refresh_guest_info(&self, vm: &ResourceRef) -> Result<GuestInfo, PlatformError> {
        let mut session = self.session()?;
        let idx = session.lookup(vm)?;
        let node = session.vm(idx)?;

        if let Some(guest) = &node.entry.guest {
            return Ok(guest.clone());
        }
        if node.entry.power_state != PowerState::PoweredOn || !node.entry.guest_agent {
            return Ok(GuestInfo::default());
        }

        let boot_polls = node.entry.boot_polls;
        let seen = session.guest_refreshes.entry(idx).or_insert(0);
        *seen += 1;
        if *seen <= boot_polls {
            return Ok(GuestInfo::default());
        }

        let node = session.vm_mut(idx)?;
        let guest = simulated_guest(&node.entry, idx);
        node.entry.guest = Some(guest.clone());
        session.dirty = true;
        Ok(guest)
    }

    async fn disconnect(&self) -> Result<(), PlatformError> {
        let pending = {
            let mut session = self
                .state
                .lock()
                .map_err(|_| PlatformError::Api("inventory session state poisoned".to_string()))?;
            if session.closed {
                return Ok(());
            }
            session.closed = true;
            if session.dirty {
                Some(serde_yaml::to_string(&session.to_document())?)
            } else {
                None
            }
        };

        if let Some(contents) = pending {
            tokio::fs::write(&self.path, contents).await?;
            info!(path = %self.path.display(), "Inventory saved");
        }
        info!("Disconnected from inventory");
        Ok(())
    }

    async fn inventory_tree(&self, root: &ResourceRef) -> Result<InventoryNode, PlatformError> {
        let session = self.session()?;
        Ok(session.tree(session.lookup(root)?))
    }
}
