//! UPnP/IGD port mapping for SOCKS5 streamhosts
//!
//! When the account is connected from a private (RFC1918) address, the
//! listener port can be mapped through the local router so the peer gets a
//! reachable external candidate. The mapping is requested once per offer:
//!
//! 1. **Gateway discovery** via multicast, bounded by the session's UPnP timeout
//! 2. **External address** lookup on the gateway
//! 3. **Port mapping** of any external port to the local listener, 1-hour lease
//!
//! ## Failure Handling
//!
//! All failures are non-fatal: the offer is sent without the UPnP candidate.
//! A gateway that does not answer at all within the timeout disables UPnP
//! for the rest of the session (see [`UpnpOutcome::TimedOut`]).
//!
//! ## Local IP Detection
//!
//! [`get_local_ipv4`] finds the address of the default route by "connecting"
//! a UDP socket to a public address. This is a routing table lookup only;
//! no packets are sent.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use igd_next::{SearchError, SearchOptions};

use crate::constants::*;

/// UPnP port mapping lease duration (in seconds)
/// 3600 seconds = 1 hour
const LEASE_DURATION: u32 = 3600;

/// Description shown in the router's mapping table
const PROTOCOL_DESCRIPTION: &str = "XMPP file transfer";

/// Network addresses for routing detection
const UDP_BIND_ADDRESS: &str = "0.0.0.0:0";

/// Remote address for local routing table lookup (no actual connection is made)
const ROUTING_TEST_ADDRESS: &str = "8.8.8.8:80";

/// Result of a mapping attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpnpOutcome {
    /// External address the peer can dial
    Mapped(SocketAddr),
    /// Gateway answered but mapping failed
    Failed(String),
    /// No answer within the timeout
    TimedOut,
}

#[derive(Debug)]
enum MappingError {
    /// Nothing answered the gateway search
    NoAnswer,
    Failed(String),
}

impl From<String> for MappingError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

/// Whether a search error means no gateway answered in time
fn is_silent(error: &SearchError) -> bool {
    match error {
        SearchError::NoResponseWithinTimeout => true,
        SearchError::IoError(e) => {
            matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        }
        _ => false,
    }
}

/// Map `port` on the gateway towards `local_ip:port`
///
/// Never fails; errors are folded into [`UpnpOutcome`].
pub async fn map_port(local_ip: Ipv4Addr, port: u16, timeout: Duration) -> UpnpOutcome {
    match tokio::time::timeout(timeout, request_mapping(local_ip, port, timeout)).await {
        Ok(Ok(external)) => UpnpOutcome::Mapped(external),
        Ok(Err(MappingError::Failed(e))) => UpnpOutcome::Failed(e),
        Ok(Err(MappingError::NoAnswer)) | Err(_) => UpnpOutcome::TimedOut,
    }
}

async fn request_mapping(
    local_ip: Ipv4Addr,
    port: u16,
    search_timeout: Duration,
) -> Result<SocketAddr, MappingError> {
    let gateway = tokio::task::spawn_blocking(move || {
        igd_next::search_gateway(SearchOptions {
            timeout: Some(search_timeout),
            ..Default::default()
        })
    })
    .await
    .map_err(|e| format!("{}{}", ERR_UPNP_SEARCH_TASK, e))?
    .map_err(|e| {
        if is_silent(&e) {
            MappingError::NoAnswer
        } else {
            MappingError::Failed(format!("{}{}", ERR_UPNP_GATEWAY_NOT_FOUND, e))
        }
    })?;

    let external_ip = tokio::task::spawn_blocking({
        let gateway = gateway.clone();
        move || gateway.get_external_ip()
    })
    .await
    .map_err(|e| format!("{}{}", ERR_UPNP_EXTERNAL_IP_TASK, e))?
    .map_err(|e| format!("{}{}", ERR_UPNP_EXTERNAL_IP, e))?;

    let local = SocketAddr::V4(SocketAddrV4::new(local_ip, port));
    let external_port = tokio::task::spawn_blocking(move || {
        gateway.add_any_port(
            igd_next::PortMappingProtocol::TCP,
            local,
            LEASE_DURATION,
            PROTOCOL_DESCRIPTION,
        )
    })
    .await
    .map_err(|e| format!("{}{}", ERR_UPNP_ADD_PORT_TASK, e))?
    .map_err(|e| format!("{}{}", ERR_UPNP_ADD_PORT, e))?;

    Ok(SocketAddr::new(external_ip.into(), external_port))
}

/// Get the local IPv4 address of the default route
///
/// Creates a UDP socket and "connects" it to a remote address, which makes
/// the OS pick the outgoing interface. No packets are sent.
///
/// # Errors
///
/// Returns a message if the socket cannot be created or only loopback or
/// IPv6 routes exist.
pub fn get_local_ipv4() -> Result<Ipv4Addr, String> {
    let socket = UdpSocket::bind(UDP_BIND_ADDRESS)
        .map_err(|e| format!("{}{}", ERR_UPNP_CREATE_UDP_SOCKET, e))?;

    socket
        .connect(ROUTING_TEST_ADDRESS)
        .map_err(|e| format!("{}{}", ERR_UPNP_DETERMINE_ROUTING, e))?;

    match socket.local_addr() {
        Ok(addr) => match addr.ip() {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => Ok(ipv4),
            IpAddr::V4(_) => Err(ERR_UPNP_LOOPBACK_ONLY.to_string()),
            IpAddr::V6(_) => Err(ERR_UPNP_IPV6_EXPECTED_IPV4.to_string()),
        },
        Err(e) => Err(format!("{}{}", ERR_UPNP_GET_LOCAL_ADDRESS, e)),
    }
}
