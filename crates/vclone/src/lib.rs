//! VM clone provisioning.
//!
//! This crate clones a virtual machine from a template inside a hierarchical
//! virtualization inventory, applies per-adapter guest customization and
//! waits for the clone task and the guest's networking to come up.
//!
//! The control plane is reached through the [`platform::ControlPlane`] trait;
//! [`platform::local::LocalInventory`] implements it over an inventory file.
//!
//! # Example
//!
//! ```rust,ignore
//! use tokio_util::sync::CancellationToken;
//! use vclone::platform::local::LocalInventory;
//! use vclone::provision::{provision, ProvisionOptions, ProvisionRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let plane = LocalInventory::connect("inventory.yaml", None).await?;
//!
//!     let request = ProvisionRequest {
//!         vm_name: "web-01".into(),
//!         template_name: "ubuntu-22.04".into(),
//!         datacenter_name: "DC1".into(),
//!         cluster_name: "Cluster1".into(),
//!         ..Default::default()
//!     };
//!     let outcome = provision(&plane, &request, &ProvisionOptions::default(), &CancellationToken::new()).await;
//!
//!     plane.disconnect().await?;
//!     println!("{:?}", outcome?.guest);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clone;
pub mod customization;
pub mod error;
pub mod inventory;
pub mod platform;
pub mod provision;
pub mod readiness;

pub use clone::{submit_clone, wait_for_tasks, CloneRequest, ProvisionedVm, TaskWaitPolicy};
pub use customization::{build_customization, CustomizationSpec, NetworkInterfaceSpec, PrimaryAddress};
pub use error::CloneError;
pub use platform::{ControlPlane, PlatformError, ResourceKind, ResourceRef};
pub use provision::{provision, FolderFallback, ProvisionOptions, ProvisionOutcome, ProvisionRequest};
pub use readiness::{wait_for_guest_network, GuestNetworkInfo, ReadinessPolicy};
