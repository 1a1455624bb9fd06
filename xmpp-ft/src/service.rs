//! Single-task service loop for one account
//!
//! [`TransferService`] owns the [`AccountSession`] and the
//! [`TransferController`] and is the only place either is mutated. It
//! selects over:
//!
//! - inbound IQs from the XMPP stream
//! - user commands
//! - socket pool events
//! - results of background work (UPnP mapping, hashing)
//!
//! Background work queued by the state machines is spawned on the runtime
//! after every step and its result comes back through the same loop.

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use xmpp_ft_common::Jid;
use xmpp_ft_common::events::TransferEvent;
use xmpp_ft_common::hash::{HashCheck, verify_file_hash};
use xmpp_ft_common::stanza::Iq;

use crate::controller::TransferController;
use crate::error::Result;
use crate::pool::PoolEvent;
use crate::record::{FileTransferRecord, StreamMethod};
use crate::session::{AccountSession, BackgroundRequest, EventSink, StanzaOutcome, StanzaSink};
use crate::upnp::{UpnpOutcome, map_port};

impl StanzaSink for mpsc::UnboundedSender<Iq> {
    fn send(&mut self, iq: Iq) {
        if mpsc::UnboundedSender::send(self, iq).is_err() {
            debug!("stanza channel closed");
        }
    }
}

impl EventSink for mpsc::UnboundedSender<TransferEvent> {
    fn emit(&mut self, event: TransferEvent) {
        let _ = self.send(event);
    }
}

/// Requests from the UI or the embedding client
#[derive(Debug)]
pub enum Command {
    SendFile {
        to: Jid,
        path: PathBuf,
        desc: Option<String>,
        reply: oneshot::Sender<Result<String>>,
    },
    Approve {
        sid: String,
        path: PathBuf,
        method: Option<StreamMethod>,
    },
    Decline {
        sid: String,
    },
    Cancel {
        sid: String,
    },
    Pause {
        sid: String,
    },
    Resume {
        sid: String,
    },
    /// A Jingle session negotiated a transfer; start its transport
    AddJingleTransfer(Box<FileTransferRecord>),
    /// Contact (or one of its resources) went offline
    ContactOffline(Jid),
    DiscoverProxies,
    /// The account's XMPP connection came up or went down
    SetConnected(bool),
    Shutdown,
}

#[derive(Debug)]
enum BackgroundResult {
    Upnp {
        sid: String,
        outcome: UpnpOutcome,
    },
    Hash {
        sid: String,
        check: io::Result<HashCheck>,
    },
}

pub struct TransferService {
    session: AccountSession,
    controller: TransferController,
    stanzas: mpsc::UnboundedReceiver<Iq>,
    commands: mpsc::UnboundedReceiver<Command>,
    pool_events: mpsc::UnboundedReceiver<PoolEvent>,
    background_tx: mpsc::UnboundedSender<BackgroundResult>,
    background_rx: mpsc::UnboundedReceiver<BackgroundResult>,
}

impl TransferService {
    pub fn new(
        session: AccountSession,
        stanzas: mpsc::UnboundedReceiver<Iq>,
        commands: mpsc::UnboundedReceiver<Command>,
        pool_events: mpsc::UnboundedReceiver<PoolEvent>,
    ) -> Self {
        let (background_tx, background_rx) = mpsc::unbounded_channel();
        Self {
            session,
            controller: TransferController::new(),
            stanzas,
            commands,
            pool_events,
            background_tx,
            background_rx,
        }
    }

    pub fn session(&self) -> &AccountSession {
        &self.session
    }

    pub fn controller(&self) -> &TransferController {
        &self.controller
    }

    /// Run until shutdown or until both the stanza and command channels closed
    ///
    /// Pool events and background results do not keep the loop alive.
    pub async fn run(mut self) -> Self {
        info!(
            account = %self.session.account(),
            jid = %self.session.jid(),
            "transfer service started"
        );
        self.controller.discover_proxies(&mut self.session);
        self.spawn_background();

        let mut stanzas_open = true;
        let mut commands_open = true;
        while stanzas_open || commands_open {
            tokio::select! {
                iq = self.stanzas.recv(), if stanzas_open => match iq {
                    Some(iq) => {
                        let outcome = self.controller.handle_iq(&mut self.session, &iq);
                        if outcome == StanzaOutcome::Unhandled {
                            debug!(id = %iq.id, "stanza not for file transfer");
                        }
                    }
                    None => {
                        debug!("stanza channel closed");
                        stanzas_open = false;
                    }
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::Shutdown) => break,
                    Some(command) => self.apply(command),
                    None => {
                        debug!("command channel closed");
                        commands_open = false;
                    }
                },
                Some(event) = self.pool_events.recv() => {
                    self.controller.handle_pool_event(&mut self.session, event);
                }
                Some(result) = self.background_rx.recv() => {
                    self.finish_background(result);
                }
                else => break,
            }
            self.spawn_background();
        }

        self.controller.remove_all_transfers(&mut self.session);
        info!(account = %self.session.account(), "transfer service stopped");
        self
    }

    fn apply(&mut self, command: Command) {
        let session = &mut self.session;
        match command {
            Command::SendFile {
                to,
                path,
                desc,
                reply,
            } => {
                let result = self.controller.send_file_request(session, to, path, desc);
                if let Err(e) = &result {
                    warn!("file offer failed: {}", e);
                }
                let _ = reply.send(result);
            }
            Command::Approve { sid, path, method } => {
                if let Err(e) = self.controller.approve(session, &sid, path, method) {
                    warn!(sid = %sid, "{}", e);
                }
            }
            Command::Decline { sid } => {
                self.controller.decline(session, &sid);
            }
            Command::Cancel { sid } => {
                self.controller.cancel_transfer(session, &sid);
            }
            Command::Pause { sid } => {
                self.controller.pause_transfer(&sid);
            }
            Command::Resume { sid } => {
                self.controller.resume_transfer(session, &sid);
            }
            Command::AddJingleTransfer(record) => {
                let sid = record.sid.clone();
                self.controller.add_transfer(*record);
                self.controller.start_transport(session, &sid);
            }
            Command::ContactOffline(contact) => {
                self.controller.stop_all_for_contact(session, &contact);
            }
            Command::DiscoverProxies => self.controller.discover_proxies(session),
            Command::SetConnected(connected) => {
                session.set_connected(connected);
                if connected {
                    self.controller.discover_proxies(session);
                } else {
                    self.controller.remove_all_transfers(session);
                }
            }
            Command::Shutdown => {}
        }
    }

    fn finish_background(&mut self, result: BackgroundResult) {
        match result {
            BackgroundResult::Upnp { sid, outcome } => {
                self.controller.complete_upnp(&mut self.session, &sid, &outcome);
            }
            BackgroundResult::Hash { sid, check } => {
                self.controller.hash_checked(&mut self.session, &sid, check);
            }
        }
    }

    fn spawn_background(&mut self) {
        for request in self.session.take_requests() {
            let tx = self.background_tx.clone();
            match request {
                BackgroundRequest::MapPort {
                    sid,
                    local_ip,
                    port,
                } => {
                    let timeout = self.session.config().upnp_timeout();
                    tokio::spawn(async move {
                        let outcome = map_port(local_ip, port, timeout).await;
                        let _ = tx.send(BackgroundResult::Upnp { sid, outcome });
                    });
                }
                BackgroundRequest::VerifyHash {
                    sid,
                    path,
                    algo,
                    expected,
                } => {
                    tokio::spawn(async move {
                        let check = verify_file_hash(&path, algo.as_deref(), &expected).await;
                        let _ = tx.send(BackgroundResult::Hash { sid, check });
                    });
                }
            }
        }
    }
}
