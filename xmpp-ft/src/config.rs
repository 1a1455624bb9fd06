//! File-transfer settings
//!
//! Per-account settings, loaded from a JSON file. Every field has a default
//! so a partial (or missing) file is fine. Host and proxy lists may be
//! written either as JSON arrays or as a single comma-separated string.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use xmpp_ft_common::validators::{parse_block_size, validate_jid};
use xmpp_ft_common::{DEFAULT_FILE_TRANSFERS_PORT, DEFAULT_IBB_BLOCK_SIZE};

use crate::constants::{CONNECT_TIMEOUT, ERR_CONFIG_READ, UPNP_TIMEOUT};
use crate::error::{FtError, Result};

/// Directory name under the platform config/data dirs
const APP_DIR_NAME: &str = "xmpp-ft";

/// Config file name inside [`APP_DIR_NAME`]
const CONFIG_FILE_NAME: &str = "config.json";

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FtConfig {
    /// Local port for the SOCKS5 listener
    #[serde(default = "default_port")]
    pub file_transfers_port: u16,

    /// Extra hosts to advertise as streamhosts, ahead of local addresses
    #[serde(default, deserialize_with = "string_list")]
    pub additional_hosts: Vec<String>,

    /// Advertise the addresses of local interfaces
    #[serde(default = "default_true")]
    pub send_local_ips: bool,

    /// Offer SOCKS5 proxies as a last resort
    #[serde(default = "default_true")]
    pub use_ft_proxies: bool,

    /// Proxy JIDs to query, in preference order
    #[serde(default, deserialize_with = "string_list")]
    pub proxies: Vec<String>,

    /// Block size offered when opening an in-band stream
    #[serde(default = "default_block_size")]
    pub ibb_block_size: u16,

    /// Try to map the listener port through a UPnP gateway
    #[serde(default)]
    pub upnp: bool,

    #[serde(default = "default_upnp_timeout")]
    pub upnp_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Where accepted files are saved when no path is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
}

impl Default for FtConfig {
    fn default() -> Self {
        Self {
            file_transfers_port: DEFAULT_FILE_TRANSFERS_PORT,
            additional_hosts: Vec::new(),
            send_local_ips: true,
            use_ft_proxies: true,
            proxies: Vec::new(),
            ibb_block_size: DEFAULT_IBB_BLOCK_SIZE,
            upnp: false,
            upnp_timeout_secs: UPNP_TIMEOUT.as_secs(),
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
            download_dir: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_FILE_TRANSFERS_PORT
}

fn default_true() -> bool {
    true
}

fn default_block_size() -> u16 {
    DEFAULT_IBB_BLOCK_SIZE
}

fn default_upnp_timeout() -> u64 {
    UPNP_TIMEOUT.as_secs()
}

fn default_connect_timeout() -> u64 {
    CONNECT_TIMEOUT.as_secs()
}

/// Accept `["a", "b"]` or `"a, b"`
fn string_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringList {
        List(Vec<String>),
        Joined(String),
    }

    let items = match StringList::deserialize(deserializer)? {
        StringList::List(items) => items,
        StringList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

impl FtConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            FtError::Config(format!("{}{}: {}", ERR_CONFIG_READ, path.display(), e))
        })?;
        let config: FtConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the platform default path, falling back to defaults
    /// when no file exists
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is unreadable or invalid.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check value ranges and proxy addresses
    ///
    /// # Errors
    ///
    /// Returns `FtError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.file_transfers_port == 0 {
            return Err(FtError::Config(
                "file_transfers_port must be non-zero".to_string(),
            ));
        }
        parse_block_size(Some(&self.ibb_block_size.to_string()))
            .map_err(|e| FtError::Config(format!("ibb_block_size: {e:?}")))?;
        for proxy in &self.proxies {
            validate_jid(proxy)
                .map_err(|e| FtError::Config(format!("proxy '{proxy}': {e}")))?;
        }
        if self.upnp_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(FtError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn upnp_timeout(&self) -> Duration {
        Duration::from_secs(self.upnp_timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Configured download directory, else the platform downloads folder
    #[must_use]
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// `<config dir>/xmpp-ft/config.json` for the current platform
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}
