//! Per-account context shared by the negotiation components
//!
//! An [`AccountSession`] owns everything a component may touch outside its
//! own state: the outgoing stanza sink, the UI event sink, the Jingle
//! session hook, the socket pool, the proxy directory and the account's
//! settings. Components receive it by `&mut` on every call instead of
//! reaching for process-wide state, so two accounts never share a listener
//! decision or a UPnP verdict.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use tracing::debug;
use xmpp_ft_common::Jid;
use xmpp_ft_common::events::TransferEvent;
use xmpp_ft_common::stanza::Iq;

use crate::config::FtConfig;
use crate::pool::SocketPool;
use crate::relay::ProxyDirectory;

/// Whether a stanza handler consumed the stanza
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaOutcome {
    Handled,
    Unhandled,
}

/// Outgoing stanza path (the XMPP stream)
pub trait StanzaSink: Send {
    fn send(&mut self, iq: Iq);
}

/// UI notification path
pub trait EventSink: Send {
    fn emit(&mut self, event: TransferEvent);
}

/// Hook into the Jingle layer for transfers it negotiated
pub trait JingleSessions: Send {
    /// End the Jingle session owning the given transfer
    fn cancel_session(&mut self, peer: &Jid, sid: &str);
}

/// Work the service loop must run off the state machines
#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundRequest {
    /// Map `port` on the gateway towards `local_ip`
    MapPort {
        sid: String,
        local_ip: Ipv4Addr,
        port: u16,
    },
    /// Hash a received file and compare
    VerifyHash {
        sid: String,
        path: PathBuf,
        algo: Option<String>,
        expected: String,
    },
}

pub struct AccountSession {
    account: String,
    jid: Jid,
    connected: bool,
    /// Local address of the connection to the XMPP server
    local_ip: Option<IpAddr>,
    config: FtConfig,
    upnp_enabled: bool,
    stanzas: Box<dyn StanzaSink>,
    events: Box<dyn EventSink>,
    jingle: Option<Box<dyn JingleSessions>>,
    pool: Box<dyn SocketPool>,
    proxies: ProxyDirectory,
    requests: Vec<BackgroundRequest>,
    next_id: u64,
}

impl AccountSession {
    pub fn new(
        account: &str,
        jid: Jid,
        config: FtConfig,
        stanzas: Box<dyn StanzaSink>,
        events: Box<dyn EventSink>,
        pool: Box<dyn SocketPool>,
    ) -> Self {
        Self {
            account: account.to_string(),
            jid,
            connected: true,
            local_ip: None,
            upnp_enabled: config.upnp,
            config,
            stanzas,
            events,
            jingle: None,
            pool,
            proxies: ProxyDirectory::new(),
            requests: Vec::new(),
            next_id: 0,
        }
    }

    #[must_use]
    pub fn with_jingle(mut self, jingle: Box<dyn JingleSessions>) -> Self {
        self.jingle = Some(jingle);
        self
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Our full JID
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn config(&self) -> &FtConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    pub fn set_local_ip(&mut self, ip: Option<IpAddr>) {
        self.local_ip = ip;
    }

    /// Send a stanza; dropped while the account is offline
    pub fn send(&mut self, iq: Iq) -> bool {
        if !self.connected {
            debug!(account = %self.account, id = %iq.id, "offline, dropping stanza");
            return false;
        }
        self.stanzas.send(iq);
        true
    }

    pub fn emit(&mut self, event: TransferEvent) {
        self.events.emit(event);
    }

    /// Tell the Jingle layer to end a session; no-op without a Jingle hook
    pub fn cancel_jingle(&mut self, peer: &Jid, sid: &str) {
        if let Some(jingle) = self.jingle.as_mut() {
            jingle.cancel_session(peer, sid);
        }
    }

    pub fn pool(&mut self) -> &mut dyn SocketPool {
        self.pool.as_mut()
    }

    pub fn proxies(&self) -> &ProxyDirectory {
        &self.proxies
    }

    pub fn proxies_mut(&mut self) -> &mut ProxyDirectory {
        &mut self.proxies
    }

    pub fn upnp_enabled(&self) -> bool {
        self.upnp_enabled
    }

    /// Stop trying UPnP for the rest of this session
    pub fn disable_upnp(&mut self) {
        self.upnp_enabled = false;
    }

    pub(crate) fn request(&mut self, request: BackgroundRequest) {
        self.requests.push(request);
    }

    /// Drain work queued by the state machines
    pub fn take_requests(&mut self) -> Vec<BackgroundRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Fresh stanza id with the given prefix
    pub fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }
}
