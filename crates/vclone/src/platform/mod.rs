//! Control-plane abstraction and backends.

#[cfg(test)]
pub(crate) mod fake;
pub mod local;
mod traits;

pub use traits::{
    CloneSpec, ControlPlane, DatacenterFolders, DiskMoveType, GuestInfo, GuestIpAddress, GuestNic,
    InventoryNode, PlatformError, PowerState, RelocationSpec, ResourceKind, ResourceRef, TaskInfo,
    TaskRef, TaskState, VmInfo,
};
