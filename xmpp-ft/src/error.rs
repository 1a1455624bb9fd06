//! Error types for the transfer engine

use std::io;

use thiserror::Error;
use xmpp_ft_common::socks5::Socks5Error;
use xmpp_ft_common::xml::CodecError;

/// Errors raised by configuration, sockets and the public controller API
///
/// Protocol failures during a transfer are not errors in this sense: they
/// are recorded on the transfer and reported to the peer and the UI.
#[derive(Debug, Error)]
pub enum FtError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid config file: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stanza codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    #[error("Timed out: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("UPnP error: {0}")]
    Upnp(String),

    #[error("No transfer with id {0}")]
    UnknownTransfer(String),

    #[error("Invalid address: {0}")]
    InvalidJid(String),

    #[error("Account is not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, FtError>;
