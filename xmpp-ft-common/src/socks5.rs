//! SOCKS5 framing for XEP-0065 bytestreams
//!
//! Only the subset used by bytestreams is supported: no authentication,
//! the CONNECT command, and a domain-name destination that carries
//! `hex(SHA1(sid + initiator + target))` with port 0.
//!
//! ## Wire layout
//!
//! ```text
//! greeting          05 01 00
//! method selection  05 00
//! connect request   05 01 00 03 <len> <hash> 00 00
//! reply             05 <status> 00 03 <len> <hash> 00 00
//! ```
//!
//! Parsers take complete buffers. Async readers use [`request_len`] to learn
//! how many bytes remain after the fixed five byte head.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::Jid;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;

/// Bytes read before the variable-length part of a request or reply
pub const HEAD_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    /// Buffer shorter than the frame it should contain
    Truncated,
    BadVersion(u8),
    /// Peer does not offer or accept "no authentication"
    NoAcceptableMethod,
    UnsupportedCommand(u8),
    UnsupportedAddressType(u8),
    /// Reply carried a non-zero status
    Rejected(u8),
    DomainTooLong,
}

impl fmt::Display for Socks5Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => f.write_str("truncated SOCKS5 frame"),
            Self::BadVersion(v) => write!(f, "unexpected SOCKS version {v:#04x}"),
            Self::NoAcceptableMethod => f.write_str("no acceptable authentication method"),
            Self::UnsupportedCommand(c) => write!(f, "unsupported command {c:#04x}"),
            Self::UnsupportedAddressType(t) => write!(f, "unsupported address type {t:#04x}"),
            Self::Rejected(code) => write!(f, "connect rejected with status {code:#04x}"),
            Self::DomainTooLong => f.write_str("destination address longer than 255 bytes"),
        }
    }
}

impl std::error::Error for Socks5Error {}

/// Destination address for a bytestream: `hex(SHA1(sid + initiator + target))`
#[must_use]
pub fn destination_hash(sid: &str, initiator: &Jid, target: &Jid) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.to_string().as_bytes());
    hasher.update(target.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Client greeting offering only "no authentication"
#[must_use]
pub fn greeting() -> [u8; 3] {
    [SOCKS5_VERSION, 0x01, METHOD_NO_AUTH]
}

/// Parse a client greeting and return the offered methods
///
/// # Errors
///
/// Fails on version mismatch or a method count that exceeds the buffer.
pub fn parse_greeting(buf: &[u8]) -> Result<Vec<u8>, Socks5Error> {
    let [version, count, rest @ ..] = buf else {
        return Err(Socks5Error::Truncated);
    };
    if *version != SOCKS5_VERSION {
        return Err(Socks5Error::BadVersion(*version));
    }
    let count = usize::from(*count);
    if rest.len() < count {
        return Err(Socks5Error::Truncated);
    }
    Ok(rest[..count].to_vec())
}

#[must_use]
pub fn method_selection(method: u8) -> [u8; 2] {
    [SOCKS5_VERSION, method]
}

/// Check the server's method selection
///
/// # Errors
///
/// Fails unless the server chose "no authentication".
pub fn parse_method_selection(buf: &[u8]) -> Result<(), Socks5Error> {
    let [version, method, ..] = buf else {
        return Err(Socks5Error::Truncated);
    };
    if *version != SOCKS5_VERSION {
        return Err(Socks5Error::BadVersion(*version));
    }
    if *method != METHOD_NO_AUTH {
        return Err(Socks5Error::NoAcceptableMethod);
    }
    Ok(())
}

fn domain_frame(second: u8, domain: &str) -> Result<Vec<u8>, Socks5Error> {
    let len = u8::try_from(domain.len()).map_err(|_| Socks5Error::DomainTooLong)?;
    let mut frame = Vec::with_capacity(HEAD_LEN + domain.len() + 2);
    frame.extend_from_slice(&[SOCKS5_VERSION, second, 0x00, ATYP_DOMAIN, len]);
    frame.extend_from_slice(domain.as_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    Ok(frame)
}

/// CONNECT request for a domain destination with port 0
///
/// # Errors
///
/// Fails if the domain does not fit a one-byte length.
pub fn connect_request(domain: &str) -> Result<Vec<u8>, Socks5Error> {
    domain_frame(CMD_CONNECT, domain)
}

/// Reply echoing the requested domain
///
/// # Errors
///
/// Fails if the domain does not fit a one-byte length.
pub fn connect_reply(status: u8, domain: &str) -> Result<Vec<u8>, Socks5Error> {
    domain_frame(status, domain)
}

/// Bytes remaining after the five byte head of a request or reply
///
/// # Errors
///
/// Fails on version mismatch or an unknown address type.
pub fn request_len(head: &[u8; HEAD_LEN]) -> Result<usize, Socks5Error> {
    if head[0] != SOCKS5_VERSION {
        return Err(Socks5Error::BadVersion(head[0]));
    }
    match head[3] {
        // The fifth byte already belongs to the address
        ATYP_IPV4 => Ok(4 - 1 + 2),
        ATYP_IPV6 => Ok(16 - 1 + 2),
        ATYP_DOMAIN => Ok(usize::from(head[4]) + 2),
        other => Err(Socks5Error::UnsupportedAddressType(other)),
    }
}

/// A parsed request or reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Frame {
    /// Command for requests, status for replies
    pub code: u8,
    pub address: String,
    pub port: u16,
}

fn parse_frame(buf: &[u8]) -> Result<Socks5Frame, Socks5Error> {
    let head: &[u8; HEAD_LEN] = buf
        .get(..HEAD_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(Socks5Error::Truncated)?;
    let total = HEAD_LEN + request_len(head)?;
    if buf.len() < total {
        return Err(Socks5Error::Truncated);
    }
    let port = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
    let address = match head[3] {
        ATYP_IPV4 => {
            let octets: [u8; 4] = buf[4..8].try_into().map_err(|_| Socks5Error::Truncated)?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = buf[4..20].try_into().map_err(|_| Socks5Error::Truncated)?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => String::from_utf8_lossy(&buf[HEAD_LEN..total - 2]).into_owned(),
    };
    Ok(Socks5Frame {
        code: head[1],
        address,
        port,
    })
}

/// Parse a CONNECT request received by a listener
///
/// # Errors
///
/// Fails on truncation, version mismatch or a non-CONNECT command.
pub fn parse_connect_request(buf: &[u8]) -> Result<Socks5Frame, Socks5Error> {
    let frame = parse_frame(buf)?;
    if frame.code != CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(frame.code));
    }
    Ok(frame)
}

/// Parse a server reply
///
/// # Errors
///
/// Fails on truncation, version mismatch or a non-zero status.
pub fn parse_reply(buf: &[u8]) -> Result<Socks5Frame, Socks5Error> {
    let frame = parse_frame(buf)?;
    if frame.code != REPLY_SUCCEEDED {
        return Err(Socks5Error::Rejected(frame.code));
    }
    Ok(frame)
}
