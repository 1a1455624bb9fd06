//! Shared helpers for integration tests
//!
//! A [`Peer`] is one account: session, controller and recording sinks. The
//! [`exchange`] helper moves stanzas between two peers the way a server
//! would, stamping `from` on the way.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use xmpp_ft::config::FtConfig;
use xmpp_ft::controller::TransferController;
use xmpp_ft::pool::{DataChannel, SocketPool};
use xmpp_ft::record::{ConnectionIdx, Streamhost};
use xmpp_ft::session::{AccountSession, EventSink, JingleSessions, StanzaSink};
use xmpp_ft_common::Jid;
use xmpp_ft_common::events::TransferEvent;
use xmpp_ft_common::stanza::Iq;

pub const ALICE: &str = "alice@example.com/laptop";
pub const BOB: &str = "bob@example.net/phone";
pub const PROXY: &str = "proxy.example.com";

#[derive(Debug, Clone, PartialEq)]
pub enum PoolCall {
    StartListener { port: u16 },
    ConnectHosts(Vec<(String, u16)>),
    ConnectProxy { host: String, idx: ConnectionIdx },
    ActivateProxy(ConnectionIdx),
    SendFile(DataChannel),
    ReceiveFile { idx: ConnectionIdx, expected: u64 },
    RemoveReceiver(ConnectionIdx),
    RemoveSender,
}

type Shared<T> = Arc<Mutex<Vec<T>>>;

struct Outbox(Shared<Iq>);

impl StanzaSink for Outbox {
    fn send(&mut self, iq: Iq) {
        self.0.lock().unwrap().push(iq);
    }
}

struct Inbox(Shared<TransferEvent>);

impl EventSink for Inbox {
    fn emit(&mut self, event: TransferEvent) {
        self.0.lock().unwrap().push(event);
    }
}

struct JingleLog(Shared<String>);

impl JingleSessions for JingleLog {
    fn cancel_session(&mut self, _peer: &Jid, sid: &str) {
        self.0.lock().unwrap().push(sid.to_string());
    }
}

/// Socket pool that only records what it was asked to do
struct ScriptedPool {
    calls: Shared<PoolCall>,
    next_idx: ConnectionIdx,
}

impl ScriptedPool {
    fn push(&self, call: PoolCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn fresh(&mut self) -> ConnectionIdx {
        self.next_idx += 1;
        self.next_idx
    }
}

impl SocketPool for ScriptedPool {
    fn start_listener(&mut self, port: u16, _auth_hash: &str, _sid: &str) -> bool {
        self.push(PoolCall::StartListener { port });
        true
    }

    fn connect_to_hosts(
        &mut self,
        _sid: &str,
        _auth_hash: &str,
        hosts: &[Streamhost],
    ) -> Vec<ConnectionIdx> {
        self.push(PoolCall::ConnectHosts(
            hosts.iter().map(|h| (h.host.clone(), h.port)).collect(),
        ));
        hosts.iter().map(|_| self.fresh()).collect()
    }

    fn connect_to_proxy(
        &mut self,
        _sid: &str,
        _auth_hash: &str,
        proxy: &Streamhost,
    ) -> ConnectionIdx {
        let idx = self.fresh();
        self.push(PoolCall::ConnectProxy {
            host: proxy.host.clone(),
            idx,
        });
        idx
    }

    fn activate_proxy(&mut self, idx: ConnectionIdx) {
        self.push(PoolCall::ActivateProxy(idx));
    }

    fn send_file(&mut self, _sid: &str, channel: DataChannel, _path: &Path, _offset: u64) {
        self.push(PoolCall::SendFile(channel));
    }

    fn receive_file(
        &mut self,
        _sid: &str,
        idx: ConnectionIdx,
        _path: &Path,
        _offset: u64,
        expected: u64,
    ) {
        self.push(PoolCall::ReceiveFile { idx, expected });
    }

    fn remove_receiver(&mut self, idx: ConnectionIdx) {
        self.push(PoolCall::RemoveReceiver(idx));
    }

    fn remove_sender(&mut self, _auth_hash: &str) {
        self.push(PoolCall::RemoveSender);
    }
}

pub struct Peer {
    pub jid: Jid,
    pub session: AccountSession,
    pub controller: TransferController,
    outbox: Shared<Iq>,
    events: Shared<TransferEvent>,
    calls: Shared<PoolCall>,
    jingle: Shared<String>,
}

impl Peer {
    pub fn new(jid: &str) -> Self {
        Self::with_config(
            jid,
            FtConfig {
                send_local_ips: false,
                ..FtConfig::default()
            },
        )
    }

    pub fn with_config(jid: &str, config: FtConfig) -> Self {
        let jid = Jid::parse(jid).unwrap();
        let outbox: Shared<Iq> = Arc::default();
        let events: Shared<TransferEvent> = Arc::default();
        let calls: Shared<PoolCall> = Arc::default();
        let jingle: Shared<String> = Arc::default();

        let session = AccountSession::new(
            "test",
            jid.clone(),
            config,
            Box::new(Outbox(outbox.clone())),
            Box::new(Inbox(events.clone())),
            Box::new(ScriptedPool {
                calls: calls.clone(),
                next_idx: 0,
            }),
        )
        .with_jingle(Box::new(JingleLog(jingle.clone())));

        Self {
            jid,
            session,
            controller: TransferController::new(),
            outbox,
            events,
            calls,
            jingle,
        }
    }

    /// Stanzas sent since the last call, stamped with our address
    pub fn take_stanzas(&self) -> Vec<Iq> {
        let mut sent = std::mem::take(&mut *self.outbox.lock().unwrap());
        for iq in &mut sent {
            iq.from = Some(self.jid.clone());
        }
        sent
    }

    pub fn take_events(&self) -> Vec<TransferEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn take_calls(&self) -> Vec<PoolCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn jingle_cancels(&self) -> Vec<String> {
        self.jingle.lock().unwrap().clone()
    }

    /// Hand a stanza to this peer's controller
    pub fn receive(&mut self, iq: &Iq) {
        self.controller.handle_iq(&mut self.session, iq);
    }

    pub fn offer(&mut self, to: &Peer, path: PathBuf) -> String {
        self.controller
            .send_file_request(&mut self.session, to.jid.clone(), path, None)
            .unwrap()
    }
}

/// Move stanzas between two peers until both are quiet
///
/// Stanzas addressed to anyone else are returned.
pub fn exchange(a: &mut Peer, b: &mut Peer) -> Vec<Iq> {
    let mut elsewhere = Vec::new();
    loop {
        let from_a = a.take_stanzas();
        let from_b = b.take_stanzas();
        if from_a.is_empty() && from_b.is_empty() {
            return elsewhere;
        }
        for iq in from_a {
            if iq.to.as_ref() == Some(&b.jid) {
                b.receive(&iq);
            } else {
                elsewhere.push(iq);
            }
        }
        for iq in from_b {
            if iq.to.as_ref() == Some(&a.jid) {
                a.receive(&iq);
            } else {
                elsewhere.push(iq);
            }
        }
    }
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
