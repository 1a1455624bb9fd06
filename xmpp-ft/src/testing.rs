//! Recording sinks and a scripted socket pool for unit tests

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use xmpp_ft_common::Jid;
use xmpp_ft_common::events::TransferEvent;
use xmpp_ft_common::stanza::Iq;

use crate::config::FtConfig;
use crate::pool::{DataChannel, SocketPool};
use crate::record::{ConnectionIdx, Streamhost};
use crate::session::{AccountSession, EventSink, JingleSessions, StanzaSink};

#[derive(Debug, Clone, PartialEq)]
pub enum PoolCall {
    StartListener { port: u16, auth_hash: String },
    ConnectHosts { hosts: Vec<(String, u16)> },
    ConnectProxy { host: String, idx: ConnectionIdx },
    ActivateProxy(ConnectionIdx),
    SendFile { channel: DataChannel, path: PathBuf, offset: u64 },
    ReceiveFile { idx: ConnectionIdx, offset: u64, expected: u64 },
    RemoveReceiver(ConnectionIdx),
    RemoveSender(String),
}

#[derive(Clone, Default)]
pub struct Recorder {
    pub stanzas: Arc<Mutex<Vec<Iq>>>,
    pub events: Arc<Mutex<Vec<TransferEvent>>>,
    pub calls: Arc<Mutex<Vec<PoolCall>>>,
    pub jingle: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn take_stanzas(&self) -> Vec<Iq> {
        std::mem::take(&mut *self.stanzas.lock().unwrap())
    }

    pub fn take_events(&self) -> Vec<TransferEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn take_calls(&self) -> Vec<PoolCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

struct Stanzas(Arc<Mutex<Vec<Iq>>>);

impl StanzaSink for Stanzas {
    fn send(&mut self, iq: Iq) {
        self.0.lock().unwrap().push(iq);
    }
}

struct Events(Arc<Mutex<Vec<TransferEvent>>>);

impl EventSink for Events {
    fn emit(&mut self, event: TransferEvent) {
        self.0.lock().unwrap().push(event);
    }
}

struct Jingle(Arc<Mutex<Vec<String>>>);

impl JingleSessions for Jingle {
    fn cancel_session(&mut self, _peer: &Jid, sid: &str) {
        self.0.lock().unwrap().push(sid.to_string());
    }
}

pub struct FakePool {
    calls: Arc<Mutex<Vec<PoolCall>>>,
    listener_ok: bool,
    next_idx: ConnectionIdx,
}

impl SocketPool for FakePool {
    fn start_listener(&mut self, port: u16, auth_hash: &str, _sid: &str) -> bool {
        self.record(PoolCall::StartListener {
            port,
            auth_hash: auth_hash.to_string(),
        });
        self.listener_ok
    }

    fn connect_to_hosts(
        &mut self,
        _sid: &str,
        _auth_hash: &str,
        hosts: &[Streamhost],
    ) -> Vec<ConnectionIdx> {
        self.record(PoolCall::ConnectHosts {
            hosts: hosts.iter().map(|h| (h.host.clone(), h.port)).collect(),
        });
        hosts.iter().map(|_| self.fresh_idx()).collect()
    }

    fn connect_to_proxy(
        &mut self,
        _sid: &str,
        _auth_hash: &str,
        proxy: &Streamhost,
    ) -> ConnectionIdx {
        let idx = self.fresh_idx();
        self.record(PoolCall::ConnectProxy {
            host: proxy.host.clone(),
            idx,
        });
        idx
    }

    fn activate_proxy(&mut self, idx: ConnectionIdx) {
        self.record(PoolCall::ActivateProxy(idx));
    }

    fn send_file(&mut self, _sid: &str, channel: DataChannel, path: &Path, offset: u64) {
        self.record(PoolCall::SendFile {
            channel,
            path: path.to_path_buf(),
            offset,
        });
    }

    fn receive_file(
        &mut self,
        _sid: &str,
        idx: ConnectionIdx,
        _path: &Path,
        offset: u64,
        expected: u64,
    ) {
        self.record(PoolCall::ReceiveFile {
            idx,
            offset,
            expected,
        });
    }

    fn remove_receiver(&mut self, idx: ConnectionIdx) {
        self.record(PoolCall::RemoveReceiver(idx));
    }

    fn remove_sender(&mut self, auth_hash: &str) {
        self.record(PoolCall::RemoveSender(auth_hash.to_string()));
    }
}

impl FakePool {
    fn record(&self, call: PoolCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn fresh_idx(&mut self) -> ConnectionIdx {
        self.next_idx += 1;
        self.next_idx
    }
}

pub fn jid(s: &str) -> Jid {
    Jid::parse(s).unwrap()
}

/// Session for `jid` with UPnP and local addresses off, so offers are
/// deterministic
pub fn session(me: &str) -> (AccountSession, Recorder) {
    let config = FtConfig {
        send_local_ips: false,
        ..FtConfig::default()
    };
    session_with(me, config, true)
}

pub fn session_with(me: &str, config: FtConfig, listener_ok: bool) -> (AccountSession, Recorder) {
    let recorder = Recorder::default();
    let pool = FakePool {
        calls: recorder.calls.clone(),
        listener_ok,
        next_idx: 0,
    };
    let session = AccountSession::new(
        "test",
        jid(me),
        config,
        Box::new(Stanzas(recorder.stanzas.clone())),
        Box::new(Events(recorder.events.clone())),
        Box::new(pool),
    )
    .with_jingle(Box::new(Jingle(recorder.jingle.clone())));
    (session, recorder)
}
