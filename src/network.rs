//! Address Resolver (C3): a pure function selecting internal and external
//! endpoints from guest-agent network data.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{ProviderError, Result};
use crate::settings::NetworkProtocol;

/// One address reported by the guest agent for a network interface.
#[derive(Debug, Clone)]
pub struct AgentIpAddress {
    pub address_type: IpAddressType,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAddressType {
    Ipv4,
    Ipv6,
}

/// One network interface as reported by the Proxmox guest agent.
#[derive(Debug, Clone)]
pub struct AgentNetworkIface {
    pub name: String,
    pub ip_addresses: Vec<AgentIpAddress>,
}

fn is_private_v4(addr: &Ipv4Addr) -> bool {
    addr.is_private() || is_cgnat(addr)
}

fn is_cgnat(addr: &Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 100 && (octets[1] & 0b1100_0000) == 64
}

fn is_global_unicast_v4(addr: &Ipv4Addr) -> bool {
    !(addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_link_local()
        || addr.is_multicast()
        || addr.is_broadcast()
        || addr.is_documentation())
}

fn is_unique_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

fn is_global_unicast_v6(addr: &Ipv6Addr) -> bool {
    !(addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        || is_unique_local_v6(addr)
        || (addr.segments()[0] & 0xffc0) == 0xfe80) // link-local fe80::/10
}

#[derive(Default)]
struct Candidates {
    internal_v4: Option<String>,
    external_v4: Option<String>,
    internal_v6: Option<String>,
    external_v6: Option<String>,
}

fn determine_possible_addresses(
    interfaces: &[AgentNetworkIface],
    requested_interface: &str,
) -> Candidates {
    let mut candidates = Candidates::default();

    let Some(iface) = interfaces.iter().find(|i| i.name == requested_interface) else {
        return candidates;
    };

    for entry in &iface.ip_addresses {
        let Ok(parsed) = entry.address.parse::<IpAddr>() else {
            continue;
        };

        match (entry.address_type, parsed) {
            (IpAddressType::Ipv4, IpAddr::V4(v4)) => {
                if v4.is_loopback() || v4.is_unspecified() {
                    continue;
                }
                if is_private_v4(&v4) {
                    candidates.internal_v4 = Some(entry.address.clone());
                } else if is_global_unicast_v4(&v4) {
                    candidates.external_v4 = Some(entry.address.clone());
                }
            }
            (IpAddressType::Ipv6, IpAddr::V6(v6)) => {
                if v6.is_loopback() || v6.is_unspecified() {
                    continue;
                }
                if is_unique_local_v6(&v6) {
                    candidates.internal_v6 = Some(entry.address.clone());
                } else if is_global_unicast_v6(&v6) {
                    candidates.external_v6 = Some(entry.address.clone());
                }
            }
            _ => continue,
        }
    }

    candidates
}

/// Selects `(internal, external)` addresses from guest-agent interface data
/// for the requested interface name and protocol preference.
pub fn resolve_addresses(
    interfaces: &[AgentNetworkIface],
    requested_interface: &str,
    requested_protocol: NetworkProtocol,
    vmid: u32,
) -> Result<(String, String)> {
    let candidates = determine_possible_addresses(interfaces, requested_interface);

    if matches!(
        requested_protocol,
        NetworkProtocol::Ipv6 | NetworkProtocol::Any
    ) {
        let internal = candidates.internal_v6.clone().unwrap_or_default();
        let mut external = candidates.external_v6.clone().unwrap_or_default();
        if external.is_empty() {
            external = internal.clone();
        }
        if !external.is_empty() {
            return Ok((internal, external));
        }
    }

    if matches!(
        requested_protocol,
        NetworkProtocol::Ipv4 | NetworkProtocol::Any
    ) {
        let internal = candidates.internal_v4.clone().unwrap_or_default();
        let mut external = candidates.external_v4.clone().unwrap_or_default();
        if external.is_empty() {
            external = internal.clone();
        }
        if !external.is_empty() {
            return Ok((internal, external));
        }
    }

    Err(ProviderError::NoReachableAddress {
        vmid,
        iface: requested_interface.to_string(),
    })
}
