//! Inventory-file backend.
//!
//! Serves the control-plane operations from a YAML document describing
//! datacenters, folders, clusters and virtual machines. Tasks complete after
//! a configurable number of polls, guests report networking after a number
//! of refreshes, and the session writes its changes back on disconnect.
//!
//! Example document:
//!
//! ```yaml
//! auth:
//!   user: administrator
//!   password: secret
//! task_polls: 1
//! datacenters:
//!   - name: DC1
//!     vm_folder:
//!       - kind: folder
//!         name: templates
//!         children:
//!           - kind: vm
//!             name: ubuntu-22.04
//!             template: true
//!             nics: 2
//!     host_folder:
//!       - kind: cluster
//!         name: Cluster1
//!         hosts:
//!           - name: esx01.lab
//! ```

mod client;
mod models;

pub use client::{Credentials, LocalInventory};
pub use models::{
    AuthEntry, ClusterEntry, DatacenterEntry, Entry, FolderEntry, HostEntry, InventoryDocument,
    VmEntry,
};
