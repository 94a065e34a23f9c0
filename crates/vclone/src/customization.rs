//! Guest customization for a clone.
//!
//! The builder is pure: given the requested VM name, the number of network
//! adapters on the template and an optional static address for the first
//! adapter it produces one setting per adapter plus the guest hostname.
//!
//! Adapters after the first always get a synthetic static address
//! (`{10+index}.0.0.1/255.255.255.0`, no gateway). Without it, guest
//! customization of a multi-NIC template stalls waiting for leases on
//! interfaces nobody configured.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Most virtual network adapters a VM can carry.
pub const MAX_NICS: usize = 10;

/// Netmask of the synthetic fallback addresses.
const FALLBACK_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Errors from building a customization spec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustomizationError {
    /// The template exposes more adapters than a VM can have.
    #[error("Template has {0} network adapters, at most {MAX_NICS} are supported")]
    TooManyInterfaces(usize),

    /// The VM name leaves nothing to use as a guest hostname.
    #[error("VM name '{0}' does not yield a guest hostname")]
    EmptyHostname(String),
}

/// Address settings for one network adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkInterfaceSpec {
    /// Obtain an address via DHCP.
    Dhcp,
    /// Fixed address.
    Static {
        ip: Ipv4Addr,
        mask: Ipv4Addr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gateway: Option<Ipv4Addr>,
    },
}

/// Caller supplied address for the first adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryAddress {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

/// DNS settings shared by all adapters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalIpSettings {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_suffixes: Vec<String>,
}

/// Linux-prep style guest customization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomizationSpec {
    /// Fixed guest hostname.
    pub hostname: String,
    /// Guest domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// One entry per template adapter, in adapter order.
    #[serde(default)]
    pub interfaces: Vec<NetworkInterfaceSpec>,
    /// Global IP settings.
    #[serde(default)]
    pub global: GlobalIpSettings,
}

impl CustomizationSpec {
    /// Replace the global IP settings.
    #[must_use]
    pub fn with_global_settings(mut self, global: GlobalIpSettings) -> Self {
        self.global = global;
        self
    }

    /// Set the guest domain.
    #[must_use]
    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    /// A spec without adapters configures nothing on the network side; the
    /// platform is free to skip customization for it.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.interfaces.is_empty()
    }
}

/// Build the customization for a clone named `vm_name` of a template with
/// `nic_count` adapters.
///
/// # Errors
/// Returns [`CustomizationError::TooManyInterfaces`] when `nic_count`
/// exceeds [`MAX_NICS`], and [`CustomizationError::EmptyHostname`] when
/// [`derive_hostname`] yields an empty name (e.g. `"team/"`).
pub fn build_customization(
    vm_name: &str,
    nic_count: usize,
    primary: Option<&PrimaryAddress>,
) -> Result<CustomizationSpec, CustomizationError> {
    if nic_count > MAX_NICS {
        return Err(CustomizationError::TooManyInterfaces(nic_count));
    }

    let hostname = derive_hostname(vm_name);
    if hostname.is_empty() {
        return Err(CustomizationError::EmptyHostname(vm_name.to_string()));
    }

    let interfaces = (0..nic_count)
        .map(|index| match (index, primary) {
            (0, Some(p)) => NetworkInterfaceSpec::Static {
                ip: p.ip,
                mask: p.mask,
                gateway: p.gateway,
            },
            (0, None) => NetworkInterfaceSpec::Dhcp,
            _ => fallback_interface(index),
        })
        .collect();

    Ok(CustomizationSpec {
        hostname,
        domain: None,
        interfaces,
        global: GlobalIpSettings::default(),
    })
}

/// Guest hostname for a VM name: spaces and underscores become hyphens and
/// only the last `/` segment is kept.
#[must_use]
pub fn derive_hostname(vm_name: &str) -> String {
    let sanitized = vm_name.replace([' ', '_'], "-");
    match sanitized.rsplit_once('/') {
        Some((_, last)) => last.to_string(),
        None => sanitized,
    }
}

/// Prefix length of a netmask.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn prefix_length(mask: Ipv4Addr) -> u8 {
    u32::from(mask).count_ones() as u8
}

#[allow(clippy::cast_possible_truncation)]
fn fallback_interface(index: usize) -> NetworkInterfaceSpec {
    // index < MAX_NICS, so the first octet stays below 20
    NetworkInterfaceSpec::Static {
        ip: Ipv4Addr::new(10 + index as u8, 0, 0, 1),
        mask: FALLBACK_MASK,
        gateway: None,
    }
}
