//! LAN discovery: resolve per-interface IPv4 broadcast destinations for discovery requests.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};

use get_if_addrs::IfAddr;
use tracing::{debug, warn};

/// IPv4 address/netmask pairs of one network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddrs {
    pub name: String,
    pub v4: Vec<(Ipv4Addr, Ipv4Addr)>,
}

/// Enumerate local interfaces, grouping addresses by interface name.
pub fn local_interfaces() -> std::io::Result<Vec<InterfaceAddrs>> {
    let mut out: Vec<InterfaceAddrs> = Vec::new();
    for iface in get_if_addrs::get_if_addrs()? {
        let pos = match out.iter().position(|i| i.name == iface.name) {
            Some(pos) => pos,
            None => {
                out.push(InterfaceAddrs {
                    name: iface.name.clone(),
                    v4: Vec::new(),
                });
                out.len() - 1
            }
        };
        if let IfAddr::V4(v4) = &iface.addr {
            out[pos].v4.push((v4.ip, v4.netmask));
        }
    }
    Ok(out)
}

/// Directed broadcast address of `ip` within `netmask`.
pub fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// One broadcast address per interface: the first non-link-local address wins, a link-local
/// address is kept only as a fallback. Loopback addresses are never used.
fn interface_broadcast(iface: &InterfaceAddrs) -> Option<Ipv4Addr> {
    let mut fallback = None;
    for &(ip, netmask) in &iface.v4 {
        if ip.is_loopback() {
            continue;
        }
        let broadcast = broadcast_address(ip, netmask);
        if !ip.is_link_local() {
            return Some(broadcast);
        }
        fallback.get_or_insert(broadcast);
    }
    fallback
}

/// Sorted, deduplicated broadcast destinations on `port`. Falls back to the limited
/// broadcast address when no interface qualifies.
pub fn resolve_broadcast_destinations(interfaces: &[InterfaceAddrs], port: u16) -> Vec<SocketAddr> {
    let mut set: BTreeSet<SocketAddr> = interfaces
        .iter()
        .filter_map(interface_broadcast)
        .map(|ip| SocketAddr::from((ip, port)))
        .collect();
    if set.is_empty() {
        set.insert(SocketAddr::from((Ipv4Addr::BROADCAST, port)));
    }
    set.into_iter().collect()
}

/// Broadcast destinations for this host's interfaces.
pub fn broadcast_destinations(port: u16) -> Vec<SocketAddr> {
    let interfaces = match local_interfaces() {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "cannot enumerate network interfaces");
            Vec::new()
        }
    };
    let out = resolve_broadcast_destinations(&interfaces, port);
    debug!(destinations = ?out, "resolved broadcast destinations");
    out
}
