//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

/// Get default config path help text for current platform
fn default_config_help() -> String {
    #[cfg(target_os = "linux")]
    return "Config file path (default: ~/.config/xmpp-ft/config.json)".to_string();

    #[cfg(target_os = "macos")]
    return "Config file path (default: ~/Library/Application Support/xmpp-ft/config.json)"
        .to_string();

    #[cfg(target_os = "windows")]
    return "Config file path (default: %APPDATA%\\xmpp-ft\\config.json)".to_string();

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    return "Config file path (overrides platform default)".to_string();
}

/// XMPP file-transfer bytestream tool
///
/// Without `--dial` or `--listen`, prints the streamhost candidates this
/// host would offer.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file path (overrides platform default)
    #[arg(short, long, help = default_config_help())]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    pub debug: bool,

    /// Try UPnP port mapping for the listener port
    #[arg(long, default_value = "false")]
    pub upnp: bool,

    /// SOCKS5 listener port (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Our full JID
    #[arg(short, long)]
    pub jid: String,

    /// Peer's full JID (required with --dial and --listen)
    #[arg(long)]
    pub peer: Option<String>,

    /// Stream id used for the destination hash
    #[arg(long, default_value = "dial")]
    pub sid: String,

    /// Dial a streamhost (host:port) as target of a transfer from --peer
    #[arg(long, value_name = "HOST:PORT")]
    pub dial: Option<String>,

    /// Listen as initiator of a transfer to --peer and send this file
    #[arg(long, value_name = "FILE")]
    pub listen: Option<PathBuf>,

    /// Extra streamhost addresses, comma separated (overrides config)
    #[arg(long, value_delimiter = ',')]
    pub additional_hosts: Vec<String>,
}
