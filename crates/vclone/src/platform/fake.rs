//! Scripted in-memory control plane that records every call.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::traits::{
    CloneSpec, ControlPlane, DatacenterFolders, GuestInfo, GuestIpAddress, GuestNic, PlatformError,
    PowerState, ResourceKind, ResourceRef, TaskInfo, TaskRef, TaskState, VmInfo,
};

const ROOT_FOLDER: &str = "group-d1";

struct FakeTask {
    polls_left: u32,
    outcome: Result<Option<ResourceRef>, String>,
}

#[derive(Default)]
struct Script {
    clone_failure: Option<String>,
    snapshot_failure: Option<String>,
    task_running_polls: u32,
    guest_ready_after: Option<u32>,
    guest_unaddressed_polls: u32,
}

pub(crate) struct FakePlane {
    objects: HashMap<String, ResourceRef>,
    children: HashMap<String, Vec<String>>,
    folders: HashMap<String, DatacenterFolders>,
    pools: HashMap<String, ResourceRef>,
    vms: Mutex<HashMap<String, VmInfo>>,
    unlistable: Mutex<HashSet<String>>,
    script: Mutex<Script>,
    tasks: Mutex<HashMap<String, FakeTask>>,
    guest_polls: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<(String, String)>>,
    last_clone: Mutex<Option<(String, String, CloneSpec)>>,
}

impl FakePlane {
    /// Two datacenters; DC1 holds `prod/web`, `templates/ubuntu-tpl` (2 NICs,
    /// no snapshot), VM `existing`, and `Cluster1` with two hosts.
    pub(crate) fn standard() -> Self {
        let mut plane = Self {
            objects: HashMap::new(),
            children: HashMap::new(),
            folders: HashMap::new(),
            pools: HashMap::new(),
            vms: Mutex::new(HashMap::new()),
            unlistable: Mutex::new(HashSet::new()),
            script: Mutex::new(Script::default()),
            tasks: Mutex::new(HashMap::new()),
            guest_polls: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            last_clone: Mutex::new(None),
        };

        use ResourceKind::{Cluster, Datacenter, Folder, Host, ResourcePool, VirtualMachine};
        plane.add(None, Folder, ROOT_FOLDER, "Datacenters");
        plane.add(Some(ROOT_FOLDER), Datacenter, "datacenter-1", "DC1");
        plane.add(Some(ROOT_FOLDER), Datacenter, "datacenter-2", "DC2");
        plane.add(Some("datacenter-1"), Folder, "group-v1", "vm");
        plane.add(Some("datacenter-1"), Folder, "group-h1", "host");
        plane.add(Some("datacenter-2"), Folder, "group-v9", "vm");
        plane.add(Some("datacenter-2"), Folder, "group-h9", "host");
        plane.add(Some("group-v1"), Folder, "group-v2", "prod");
        plane.add(Some("group-v2"), Folder, "group-v3", "web");
        plane.add(Some("group-v1"), Folder, "group-v4", "templates");
        plane.add(Some("group-v4"), VirtualMachine, "vm-10", "ubuntu-tpl");
        plane.add(Some("group-v1"), VirtualMachine, "vm-11", "existing");
        plane.add(Some("group-h1"), Cluster, "domain-c1", "Cluster1");
        plane.add(Some("domain-c1"), Host, "host-1", "esx01");
        plane.add(Some("domain-c1"), Host, "host-2", "esx02");
        plane.add(Some("domain-c1"), ResourcePool, "resgroup-1", "Resources");

        for (dc, vm, host) in [
            ("datacenter-1", "group-v1", "group-h1"),
            ("datacenter-2", "group-v9", "group-h9"),
        ] {
            plane.folders.insert(
                dc.to_string(),
                DatacenterFolders {
                    vm_folder: plane.objects[vm].clone(),
                    host_folder: plane.objects[host].clone(),
                },
            );
        }
        plane
            .pools
            .insert("domain-c1".to_string(), plane.objects["resgroup-1"].clone());

        {
            let vms = plane.vms.get_mut().unwrap();
            vms.insert("vm-10".to_string(), vm_info("ubuntu-tpl", 2, true));
            vms.insert("vm-11".to_string(), vm_info("existing", 1, false));
        }

        plane
    }

    fn add(&mut self, parent: Option<&str>, kind: ResourceKind, id: &str, name: &str) {
        self.objects
            .insert(id.to_string(), ResourceRef::new(kind, id, name));
        self.children.entry(id.to_string()).or_default();
        if let Some(parent) = parent {
            self.children
                .entry(parent.to_string())
                .or_default()
                .push(id.to_string());
        }
    }

    pub(crate) fn object(&self, id: &str) -> ResourceRef {
        self.objects[id].clone()
    }

    pub(crate) fn make_unlistable(&self, id: &str) {
        self.unlistable.lock().unwrap().insert(id.to_string());
    }

    pub(crate) fn with_template_snapshot(&self) {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms.get_mut("vm-10").unwrap();
        vm.root_snapshots.push(ResourceRef::new(
            ResourceKind::Snapshot,
            "snapshot-1",
            "golden",
        ));
    }

    pub(crate) fn set_nic_count(&self, vm: &str, count: usize) {
        self.vms.lock().unwrap().get_mut(vm).unwrap().nic_count = count;
    }

    pub(crate) fn fail_clone(&self, detail: &str) {
        self.script.lock().unwrap().clone_failure = Some(detail.to_string());
    }

    pub(crate) fn fail_snapshot(&self, detail: &str) {
        self.script.lock().unwrap().snapshot_failure = Some(detail.to_string());
    }

    pub(crate) fn set_task_running_polls(&self, polls: u32) {
        self.script.lock().unwrap().task_running_polls = polls;
    }

    /// `None` means the guest agent never reports.
    pub(crate) fn set_guest_ready_after(&self, polls: Option<u32>) {
        self.script.lock().unwrap().guest_ready_after = polls;
    }

    /// Refreshes, once the guest is up, that report its NIC without an
    /// address.
    pub(crate) fn set_guest_unaddressed_polls(&self, polls: u32) {
        self.script.lock().unwrap().guest_unaddressed_polls = polls;
    }

    pub(crate) fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    pub(crate) fn call_sequence(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub(crate) fn listed_containers(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == "list_children")
            .map(|(_, arg)| arg.clone())
            .collect()
    }

    pub(crate) fn last_clone(&self) -> Option<(String, String, CloneSpec)> {
        self.last_clone.lock().unwrap().clone()
    }

    fn record(&self, method: &str, arg: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), arg.to_string()));
    }

    fn start_task(&self, description: &str, outcome: Result<Option<ResourceRef>, String>) -> TaskRef {
        let mut tasks = self.tasks.lock().unwrap();
        let id = format!("task-{}", tasks.len() + 1);
        let polls_left = self.script.lock().unwrap().task_running_polls;
        tasks.insert(id.clone(), FakeTask { polls_left, outcome });
        TaskRef {
            id,
            description: description.to_string(),
        }
    }

    fn walk(&self, id: &str, kinds: &[ResourceKind], recursive: bool, out: &mut Vec<ResourceRef>) {
        for child in self.children.get(id).into_iter().flatten() {
            let object = &self.objects[child];
            if kinds.contains(&object.kind) {
                out.push(object.clone());
            }
            if recursive {
                self.walk(child, kinds, recursive, out);
            }
        }
    }
}

fn vm_info(name: &str, nic_count: usize, template: bool) -> VmInfo {
    VmInfo {
        name: name.to_string(),
        nic_count,
        root_snapshots: Vec::new(),
        power_state: PowerState::PoweredOff,
        template,
        guest_ip: None,
    }
}

#[async_trait]
impl ControlPlane for FakePlane {
    async fn list_children(
        &self,
        container: &ResourceRef,
    ) -> Result<Vec<ResourceRef>, PlatformError> {
        self.record("list_children", &container.id);
        if self.unlistable.lock().unwrap().contains(&container.id) {
            return Err(PlatformError::Api(format!("cannot list {}", container.id)));
        }
        let ids = self
            .children
            .get(&container.id)
            .ok_or_else(|| PlatformError::UnknownObject(container.id.clone()))?;
        Ok(ids.iter().map(|id| self.objects[id].clone()).collect())
    }

    async fn container_view(
        &self,
        root: Option<&ResourceRef>,
        kinds: &[ResourceKind],
        recursive: bool,
    ) -> Result<Vec<ResourceRef>, PlatformError> {
        let root = root.map_or(ROOT_FOLDER, |r| r.id.as_str());
        self.record("container_view", root);
        let mut out = Vec::new();
        self.walk(root, kinds, recursive, &mut out);
        Ok(out)
    }

    async fn datacenter_folders(
        &self,
        datacenter: &ResourceRef,
    ) -> Result<DatacenterFolders, PlatformError> {
        self.record("datacenter_folders", &datacenter.id);
        self.folders
            .get(&datacenter.id)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownObject(datacenter.id.clone()))
    }

    async fn resource_pool(&self, cluster: &ResourceRef) -> Result<ResourceRef, PlatformError> {
        self.record("resource_pool", &cluster.id);
        self.pools
            .get(&cluster.id)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownObject(cluster.id.clone()))
    }

    async fn vm_info(&self, vm: &ResourceRef) -> Result<VmInfo, PlatformError> {
        self.record("vm_info", &vm.id);
        self.vms
            .lock()
            .unwrap()
            .get(&vm.id)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownObject(vm.id.clone()))
    }

    async fn create_snapshot(
        &self,
        vm: &ResourceRef,
        name: &str,
        _memory: bool,
        _quiesce: bool,
    ) -> Result<TaskRef, PlatformError> {
        self.record("create_snapshot", &vm.id);
        let failure = self.script.lock().unwrap().snapshot_failure.clone();
        if let Some(detail) = failure {
            return Ok(self.start_task("CreateSnapshot", Err(detail)));
        }
        let snapshot = ResourceRef::new(ResourceKind::Snapshot, "snapshot-9", name);
        self.vms
            .lock()
            .unwrap()
            .get_mut(&vm.id)
            .ok_or_else(|| PlatformError::UnknownObject(vm.id.clone()))?
            .root_snapshots
            .push(snapshot.clone());
        Ok(self.start_task("CreateSnapshot", Ok(Some(snapshot))))
    }

    async fn clone_vm(
        &self,
        template: &ResourceRef,
        name: &str,
        folder: &ResourceRef,
        spec: &CloneSpec,
    ) -> Result<TaskRef, PlatformError> {
        self.record("clone_vm", &template.id);
        *self.last_clone.lock().unwrap() =
            Some((name.to_string(), folder.id.clone(), spec.clone()));

        let failure = self.script.lock().unwrap().clone_failure.clone();
        if let Some(detail) = failure {
            return Ok(self.start_task("CloneVM", Err(detail)));
        }

        let clone = ResourceRef::new(ResourceKind::VirtualMachine, "vm-100", name);
        let mut info = vm_info(name, 0, spec.template);
        if spec.power_on {
            info.power_state = PowerState::PoweredOn;
        }
        self.vms.lock().unwrap().insert(clone.id.clone(), info);
        Ok(self.start_task("CloneVM", Ok(Some(clone))))
    }

    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo, PlatformError> {
        self.record("task_info", &task.id);
        let mut tasks = self.tasks.lock().unwrap();
        let entry = tasks
            .get_mut(&task.id)
            .ok_or_else(|| PlatformError::UnknownObject(task.id.clone()))?;

        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(TaskInfo {
                task: task.clone(),
                state: TaskState::Running,
                result: None,
                error: None,
            });
        }

        Ok(match &entry.outcome {
            Ok(result) => TaskInfo {
                task: task.clone(),
                state: TaskState::Succeeded,
                result: result.clone(),
                error: None,
            },
            Err(detail) => TaskInfo {
                task: task.clone(),
                state: TaskState::Failed,
                result: None,
                error: Some(detail.clone()),
            },
        })
    }

    async fn refresh_guest_info(&self, vm: &ResourceRef) -> Result<GuestInfo, PlatformError> {
        self.record("refresh_guest_info", &vm.id);
        let mut polls = self.guest_polls.lock().unwrap();
        let seen = polls.entry(vm.id.clone()).or_insert(0);
        *seen += 1;

        let (ready_after, unaddressed) = {
            let script = self.script.lock().unwrap();
            (script.guest_ready_after, script.guest_unaddressed_polls)
        };
        match ready_after {
            Some(after) if *seen > after && *seen - after <= unaddressed => Ok(GuestInfo {
                ip_address: None,
                host_name: Some(vm.name.clone()),
                networks: vec![GuestNic {
                    mac_address: "00:50:56:aa:bb:01".to_string(),
                    ip_addresses: Vec::new(),
                }],
            }),
            Some(after) if *seen > after => Ok(GuestInfo {
                ip_address: Some("192.168.1.50".to_string()),
                host_name: Some(vm.name.clone()),
                networks: vec![GuestNic {
                    mac_address: "00:50:56:aa:bb:01".to_string(),
                    ip_addresses: vec![
                        GuestIpAddress {
                            ip_address: "192.168.1.50".to_string(),
                            prefix_length: 24,
                        },
                        GuestIpAddress {
                            ip_address: "fe80::250:56ff:feaa:bb01".to_string(),
                            prefix_length: 64,
                        },
                    ],
                }],
            }),
            _ => Ok(GuestInfo::default()),
        }
    }

    async fn disconnect(&self) -> Result<(), PlatformError> {
        self.record("disconnect", "");
        Ok(())
    }
}
