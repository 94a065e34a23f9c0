//! Inventory document models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::customization::CustomizationSpec;
use crate::platform::{GuestInfo, PowerState};

// ============================================================================
// Document
// ============================================================================

/// Whole-inventory document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryDocument {
    /// Credentials a session must present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthEntry>,
    /// Number of `task_info` observations a task reports as running.
    #[serde(default = "default_task_polls")]
    pub task_polls: u32,
    /// Datacenters under the root folder.
    #[serde(default)]
    pub datacenters: Vec<DatacenterEntry>,
    /// Last time a session wrote the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for InventoryDocument {
    fn default() -> Self {
        Self {
            auth: None,
            task_polls: default_task_polls(),
            datacenters: Vec::new(),
            updated_at: None,
        }
    }
}

/// Session credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    pub user: String,
    pub password: String,
}

/// A datacenter and the contents of its two root folders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatacenterEntry {
    pub name: String,
    /// Contents of the VM root folder.
    #[serde(default)]
    pub vm_folder: Vec<Entry>,
    /// Contents of the host root folder.
    #[serde(default)]
    pub host_folder: Vec<Entry>,
}

/// Anything that can sit inside a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entry {
    Folder(FolderEntry),
    Vm(VmEntry),
    Cluster(ClusterEntry),
}

/// A folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderEntry {
    pub name: String,
    #[serde(default)]
    pub children: Vec<Entry>,
}

// ============================================================================
// Compute
// ============================================================================

/// A compute cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub name: String,
    /// Name of the root resource pool.
    #[serde(default = "default_resource_pool")]
    pub resource_pool: String,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

/// A host inside a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub name: String,
}

// ============================================================================
// Virtual machines
// ============================================================================

/// A virtual machine or template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmEntry {
    pub name: String,
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub power_state: PowerState,
    /// Number of virtual network adapters.
    #[serde(default)]
    pub nics: usize,
    /// Root snapshot names, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<String>,
    /// Whether the guest runs an agent that reports networking.
    #[serde(default = "default_true")]
    pub guest_agent: bool,
    /// Empty guest refreshes before the agent reports, once powered on.
    #[serde(default = "default_boot_polls")]
    pub boot_polls: u32,
    /// Last guest report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<GuestInfo>,
    /// Customization applied when the VM was cloned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customization: Option<CustomizationSpec>,
    /// Template this VM was cloned from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Host the VM was placed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Resource pool the VM was placed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
}

fn default_task_polls() -> u32 {
    1
}

fn default_resource_pool() -> String {
    "Resources".to_string()
}

fn default_true() -> bool {
    true
}

fn default_boot_polls() -> u32 {
    2
}
