//! Guest readiness polling.
//!
//! After a clone is powered on, the platform's guest agent publishes the
//! guest's networking some time later, independently of the clone task. The
//! poller re-reads the guest facet until at least one network attachment
//! carries an address, within an attempt and/or time budget. Attachments are
//! often reported before their address is assigned; those do not count.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::CloneError;
use crate::platform::{ControlPlane, GuestInfo, GuestIpAddress, ResourceRef};

/// Bounds of the readiness wait.
///
/// At least one of `max_attempts` and `max_duration` must be set, and an
/// attempt limit must be non-zero; the wait stops at whichever is reached
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Delay between guest refreshes.
    pub interval: Duration,
    /// Maximum number of refreshes.
    pub max_attempts: Option<u32>,
    /// Maximum time spent waiting.
    pub max_duration: Option<Duration>,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: Some(300),
            max_duration: None,
        }
    }
}

impl ReadinessPolicy {
    /// Policy bounded by attempt count only.
    #[must_use]
    pub fn attempts(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
            max_duration: None,
        }
    }

    fn validate(&self) -> Result<(), CloneError> {
        match (self.max_attempts, self.max_duration) {
            (Some(0), _) => Err(CloneError::InvalidRequest(
                "readiness attempt limit must be at least 1".to_string(),
            )),
            (None, None) => Err(CloneError::InvalidRequest(
                "readiness wait needs an attempt or time limit".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.max_duration.is_some_and(|max| elapsed >= max)
    }
}

/// One guest network attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestInterface {
    pub mac_address: String,
    pub addresses: Vec<GuestIpAddress>,
}

/// Guest networking as reported once the VM is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestNetworkInfo {
    /// Summary IP address.
    pub ip_address: Option<String>,
    /// Guest host name.
    pub host_name: Option<String>,
    /// Attachments in the order the agent reported them.
    pub interfaces: Vec<GuestInterface>,
}

impl From<GuestInfo> for GuestNetworkInfo {
    fn from(guest: GuestInfo) -> Self {
        Self {
            ip_address: guest.ip_address,
            host_name: guest.host_name,
            interfaces: guest
                .networks
                .into_iter()
                .map(|nic| GuestInterface {
                    mac_address: nic.mac_address,
                    addresses: nic.ip_addresses,
                })
                .collect(),
        }
    }
}

/// Poll the guest facet of `vm` until at least one reported network
/// attachment has an assigned address.
///
/// # Errors
/// Returns `ReadinessTimeout` once the policy budget is spent, `Cancelled`
/// when `cancel` fires between polls, `InvalidRequest` for an unbounded
/// policy or a zero attempt limit, or the control-plane failure.
pub async fn wait_for_guest_network<P: ControlPlane + ?Sized>(
    plane: &P,
    vm: &ResourceRef,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<GuestNetworkInfo, CloneError> {
    policy.validate()?;

    info!(
        vm = %vm.name,
        max_attempts = ?policy.max_attempts,
        max_duration_secs = ?policy.max_duration.map(|d| d.as_secs()),
        "Waiting for guest networking"
    );

    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let guest = plane.refresh_guest_info(vm).await?;

        debug!(
            vm = %vm.name,
            attempt = attempts,
            networks = guest.networks.len(),
            elapsed_secs = start.elapsed().as_secs(),
            "Polling guest networking"
        );

        if guest.networks.iter().any(|nic| !nic.ip_addresses.is_empty()) {
            let network = GuestNetworkInfo::from(guest);
            info!(
                vm = %vm.name,
                ip = network.ip_address.as_deref().unwrap_or("-"),
                interfaces = network.interfaces.len(),
                attempts,
                "Guest networking is up"
            );
            return Ok(network);
        }

        if policy.exhausted(attempts, start.elapsed()) {
            return Err(CloneError::ReadinessTimeout {
                vm: vm.name.clone(),
                attempts,
                elapsed_secs: start.elapsed().as_secs(),
            });
        }

        tokio::select! {
            () = cancel.cancelled() => {
                return Err(CloneError::Cancelled(format!(
                    "waiting for guest networking on '{}'",
                    vm.name
                )));
            }
            () = tokio::time::sleep(policy.interval) => {}
        }
    }
}
