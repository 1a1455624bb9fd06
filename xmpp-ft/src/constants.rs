//! Constants used across the transfer engine
//!
//! User-visible strings, stanza id prefixes and timing values.

use std::time::Duration;

// =============================================================================
// Stanza ids
// =============================================================================

/// Prefix for the id of the streamhost offer IQ
pub const STREAMHOST_ID_PREFIX: &str = "id_";

/// Prefix for the id of the proxy activation IQ
pub const ACTIVATE_ID_PREFIX: &str = "au_";

/// Prefix for proxy discovery queries
pub const PROXY_QUERY_ID_PREFIX: &str = "px_";

/// Prefix for IBB stanza ids
pub const IBB_ID_PREFIX: &str = "ibb_";

/// Prefix for generated stream ids
pub const SID_PREFIX: &str = "s5b_";

// =============================================================================
// Timing
// =============================================================================

/// How long to wait for a UPnP-IGD answer before giving up on it
pub const UPNP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long one SOCKS5 candidate gets to connect and authenticate
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for an inbound SOCKS5 handshake on the local listener
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keepalive idle time for bytestream sockets
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Chunk size for copying file data over SOCKS5 sockets
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

// =============================================================================
// Messages
// =============================================================================

pub const MSG_BANNER: &str = "xmpp-ftd v";
pub const MSG_CANDIDATES: &str = "Streamhost candidates for ";
pub const MSG_LISTENING: &str = "SOCKS5 listener on port ";
pub const MSG_UPNP_MAPPED: &str = "UPnP mapped external address ";
pub const MSG_DIAL_OK: &str = "SOCKS5 handshake succeeded with ";
pub const MSG_WAITING_PEER: &str = "Waiting for the peer to connect, destination hash ";
pub const MSG_SEND_DONE: &str = "Sent ";

pub const WARN_UPNP_TIMEOUT: &str = "No UPnP-IGD answer, disabling UPnP for this session";
pub const WARN_UPNP_FAILED: &str = "UPnP port mapping failed: ";
pub const WARN_NO_LOCAL_IPS: &str = "Could not determine local IP addresses: ";
pub const WARN_LISTENER_FAILED: &str = "Could not start SOCKS5 listener: ";

pub const ERR_GENERIC: &str = "Error: ";
pub const ERR_CONFIG_READ: &str = "Failed to read config file: ";
pub const ERR_INVALID_JID: &str = "Invalid JID: ";
pub const ERR_PEER_REQUIRED: &str = "--peer is required with --dial and --listen";
pub const ERR_DIAL_ADDRESS: &str = "Expected HOST:PORT, got ";
pub const ERR_DIAL_FAILED: &str = "SOCKS5 dial failed: ";
pub const ERR_SEND_FAILED: &str = "Transfer failed: ";
pub const ERR_SIGNAL: &str = "Failed to install signal handler: ";
pub const ERR_UPNP_SEARCH_TASK: &str = "UPnP gateway search task failed: ";
pub const ERR_UPNP_GATEWAY_NOT_FOUND: &str = "No UPnP gateway found: ";
pub const ERR_UPNP_EXTERNAL_IP_TASK: &str = "UPnP external IP task failed: ";
pub const ERR_UPNP_EXTERNAL_IP: &str = "Could not get external IP: ";
pub const ERR_UPNP_ADD_PORT_TASK: &str = "UPnP port mapping task failed: ";
pub const ERR_UPNP_ADD_PORT: &str = "Could not add port mapping: ";
pub const ERR_UPNP_CREATE_UDP_SOCKET: &str = "Failed to create UDP socket: ";
pub const ERR_UPNP_DETERMINE_ROUTING: &str = "Failed to determine routing: ";
pub const ERR_UPNP_GET_LOCAL_ADDRESS: &str = "Failed to get local address: ";
pub const ERR_UPNP_LOOPBACK_ONLY: &str = "Only a loopback address is routable";
pub const ERR_UPNP_IPV6_EXPECTED_IPV4: &str = "Routing picked IPv6, expected IPv4";

/// Text of the error sent when the user declines an offer
pub const TEXT_OFFER_DECLINED: &str = "Offer Declined";
