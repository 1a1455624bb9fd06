//! XMPP File Transfer Common Library
//!
//! Shared wire vocabulary for XMPP file-transfer negotiation: namespaces,
//! addresses, the typed stanza model and its XML codec, SOCKS5 framing,
//! input validators and the error codes surfaced to the UI layer.

mod error_kind;
pub mod events;
pub mod hash;
pub mod jid;
pub mod socks5;
pub mod stanza;
pub mod validators;
pub mod xml;

pub use error_kind::{ConnectErrorCode, TransferErrorCode};
pub use jid::Jid;

/// Stream Initiation (XEP-0095)
pub const NS_SI: &str = "http://jabber.org/protocol/si";

/// SI file-transfer profile (XEP-0096)
pub const NS_FILE: &str = "http://jabber.org/protocol/si/profile/file-transfer";

/// Feature negotiation (XEP-0020)
pub const NS_FEATURE: &str = "http://jabber.org/protocol/feature-neg";

/// Data forms (XEP-0004)
pub const NS_DATA: &str = "jabber:x:data";

/// SOCKS5 Bytestreams (XEP-0065)
pub const NS_BYTESTREAM: &str = "http://jabber.org/protocol/bytestreams";

/// In-Band Bytestreams (XEP-0047)
pub const NS_IBB: &str = "http://jabber.org/protocol/ibb";

/// Stanza error conditions (RFC 6120)
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Default client namespace for top-level stanzas
pub const NS_CLIENT: &str = "jabber:client";

/// Data form field carrying the stream method choice
pub const STREAM_METHOD_FIELD: &str = "stream-method";

/// Default local port for the SOCKS5 listener
pub const DEFAULT_FILE_TRANSFERS_PORT: u16 = 28011;

/// Default IBB block size in bytes (before base64)
pub const DEFAULT_IBB_BLOCK_SIZE: u16 = 4096;

/// Buffer size for hashing operations (1MB for fewer syscalls)
pub const HASH_BUFFER_SIZE: usize = 1024 * 1024;
