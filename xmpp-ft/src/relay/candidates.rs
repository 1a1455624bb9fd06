//! Streamhost candidate gathering
//!
//! Candidates are offered in a fixed order: operator-configured hosts, local
//! addresses, the UPnP-mapped external address, then resolved proxies.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use ipnet::Ipv4Net;
use xmpp_ft_common::Jid;
use xmpp_ft_common::stanza::StreamhostEntry;

use crate::record::Streamhost;
use crate::upnp::get_local_ipv4;

/// RFC1918 blocks
const PRIVATE_RANGES: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

/// Whether `ip` is in a private (RFC1918) block
#[must_use]
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    PRIVATE_RANGES.iter().any(|(addr, len)| {
        Ipv4Net::new(*addr, *len)
            .ok()
            .is_some_and(|net| net.contains(&ip))
    })
}

fn is_usable(ip: &IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

/// Local addresses worth offering to a peer
///
/// Starts with the address of the XMPP connection, then adds the address of
/// the default route. Loopback and duplicate addresses are skipped.
///
/// # Errors
///
/// Returns the routing lookup error when no address at all could be found.
pub fn local_addresses(connection_ip: Option<IpAddr>) -> Result<Vec<IpAddr>, String> {
    let mut ips: Vec<IpAddr> = connection_ip.into_iter().filter(is_usable).collect();

    match get_local_ipv4() {
        Ok(ip) => {
            let ip = IpAddr::V4(ip);
            if is_usable(&ip) && !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        Err(e) if ips.is_empty() => return Err(e),
        Err(_) => {}
    }
    Ok(ips)
}

/// Everything that goes into one streamhost offer
#[derive(Debug, Clone, Copy)]
pub struct CandidatePlan<'a> {
    /// Our own JID, used for every non-proxy candidate
    pub sender: &'a Jid,
    pub port: u16,
    pub additional_hosts: &'a [String],
    pub local_ips: &'a [IpAddr],
    pub upnp: Option<SocketAddr>,
    pub proxies: &'a [Streamhost],
}

/// Build the `<streamhost/>` list in offer order
#[must_use]
pub fn build_candidates(plan: &CandidatePlan<'_>) -> Vec<StreamhostEntry> {
    let mut entries: Vec<StreamhostEntry> = plan
        .additional_hosts
        .iter()
        .map(|host| host.trim())
        .filter(|host| !host.is_empty())
        .map(|host| StreamhostEntry::new(plan.sender, host, plan.port))
        .collect();

    let is_known = |entries: &[StreamhostEntry], host: &str, port: u16| {
        let port = port.to_string();
        entries
            .iter()
            .any(|e| e.host.as_deref() == Some(host) && e.port.as_deref() == Some(port.as_str()))
    };

    for ip in plan.local_ips {
        let host = ip.to_string();
        if !is_known(&entries, &host, plan.port) {
            entries.push(StreamhostEntry::new(plan.sender, &host, plan.port));
        }
    }

    if let Some(external) = plan.upnp {
        let host = external.ip().to_string();
        if !is_known(&entries, &host, external.port()) {
            entries.push(StreamhostEntry::new(plan.sender, &host, external.port()));
        }
    }

    entries.extend(
        plan.proxies
            .iter()
            .map(|proxy| StreamhostEntry::new(&proxy.jid, &proxy.host, proxy.port)),
    );
    entries
}
