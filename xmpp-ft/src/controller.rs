//! Per-account transfer controller
//!
//! Owns the registry of live transfers and the three protocol engines, and
//! routes every inbound stanza, socket pool event and background result to
//! the right one. It is the only component that adds or removes records.
//!
//! IQ results are matched by id:
//!
//! | id                        | meaning                          |
//! |---------------------------|----------------------------------|
//! | `<sid>`                   | answer to our SI offer           |
//! | `ibb_<n>`                 | ack for an IBB open/data/close   |
//! | `au_<transport sid>`      | proxy activation                 |
//! | `px_<n>`                  | proxy discovery                  |
//! | `id_<transport sid>`      | answer to our streamhost offer   |

use std::io;
use std::path::PathBuf;

use rand::RngExt;
use tracing::{debug, info, warn};
use xmpp_ft_common::events::TransferEvent;
use xmpp_ft_common::hash::HashCheck;
use xmpp_ft_common::stanza::{
    BytestreamQuery, ErrorCondition, ErrorType, Iq, IqPayload, IqType, Si, StanzaError,
};
use xmpp_ft_common::{ConnectErrorCode, Jid, TransferErrorCode};

use crate::constants::{ACTIVATE_ID_PREFIX, SID_PREFIX, STREAMHOST_ID_PREFIX};
use crate::error::{FtError, Result};
use crate::ibb::{IbbStep, InBandStreamEngine};
use crate::negotiator::{OfferCheck, RejectReason, StreamNegotiator};
use crate::pool::PoolEvent;
use crate::record::{Direction, FileTransferRecord, StateEvent, StreamMethod, TransferState};
use crate::registry::TransferRegistry;
use crate::relay::{CandidateStep, OfferStep, SocksRelayCoordinator, StreamhostsStep, UsedStep};
use crate::session::{AccountSession, BackgroundRequest, StanzaOutcome};
use crate::upnp::UpnpOutcome;

/// Record for `transport_sid` if `from` is its peer
fn peer_record<'a>(
    registry: &'a mut TransferRegistry,
    transport_sid: &str,
    from: Option<&Jid>,
) -> Option<&'a mut FileTransferRecord> {
    registry
        .get_by_transport_mut(transport_sid)
        .filter(|r| from.is_none_or(|from| r.peer() == from))
}

#[derive(Debug, Default)]
pub struct TransferController {
    registry: TransferRegistry,
    negotiator: StreamNegotiator,
    relay: SocksRelayCoordinator,
    ibb: InBandStreamEngine,
}

impl TransferController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    pub fn get(&self, sid: &str) -> Option<&FileTransferRecord> {
        self.registry.get(sid)
    }

    // =========================================================================
    // User actions
    // =========================================================================

    /// Offer a local file to `receiver`; returns the new sid
    ///
    /// # Errors
    ///
    /// Fails when the account is offline or `path` is not a readable file.
    pub fn send_file_request(
        &mut self,
        session: &mut AccountSession,
        receiver: Jid,
        path: PathBuf,
        desc: Option<String>,
    ) -> Result<String> {
        if !session.is_connected() {
            return Err(FtError::NotConnected);
        }
        let metadata = std::fs::metadata(&path)?;
        if !metadata.is_file() {
            return Err(FtError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            )));
        }

        let bytes: [u8; 8] = rand::rng().random();
        let sid = format!("{}{}", SID_PREFIX, hex::encode(bytes));
        let mut record = FileTransferRecord::outgoing(
            &sid,
            session.jid().clone(),
            receiver,
            path,
            metadata.len(),
        );
        record.desc = desc;

        self.negotiator.propose(session, &record);
        self.registry.insert(record);
        Ok(sid)
    }

    /// Register a record negotiated outside SI (Jingle)
    pub fn add_transfer(&mut self, record: FileTransferRecord) {
        debug!(sid = %record.sid, transport = %record.transport_sid, "adding transfer");
        self.registry.insert(record);
    }

    /// Accept a received offer, saving to `path`
    ///
    /// # Errors
    ///
    /// Fails if `sid` is not a pending incoming offer.
    pub fn approve(
        &mut self,
        session: &mut AccountSession,
        sid: &str,
        path: PathBuf,
        method: Option<StreamMethod>,
    ) -> Result<()> {
        let Some(record) = self
            .registry
            .get_mut(sid)
            .filter(|r| {
                r.direction == Direction::Receive && r.state() == TransferState::Negotiating
            })
        else {
            return Err(FtError::UnknownTransfer(sid.to_string()));
        };
        record.file_path = Some(path);
        if self.negotiator.accept_offer(session, record, method).is_none() {
            self.remove_transfer(session, sid);
        }
        Ok(())
    }

    /// Decline a received offer
    pub fn decline(&mut self, session: &mut AccountSession, sid: &str) -> bool {
        let Some(record) = self.registry.get_mut(sid) else {
            return false;
        };
        self.negotiator
            .reject(session, record, RejectReason::Declined);
        self.remove_transfer(session, sid);
        true
    }

    /// Cancel a transfer in any state
    pub fn cancel_transfer(&mut self, session: &mut AccountSession, sid: &str) -> bool {
        let Some(record) = self.registry.get_mut(sid) else {
            return false;
        };
        if !record.is_stopped() {
            let _ = record.transition(StateEvent::Stop);
        }
        info!(sid, "transfer cancelled");
        self.remove_transfer(session, sid);
        true
    }

    pub fn pause_transfer(&mut self, sid: &str) -> bool {
        self.registry
            .get_mut(sid)
            .is_some_and(|r| r.transition(StateEvent::Pause).is_ok())
    }

    pub fn resume_transfer(&mut self, session: &mut AccountSession, sid: &str) -> bool {
        let Some(record) = self.registry.get_mut(sid) else {
            return false;
        };
        if record.transition(StateEvent::Resume).is_err() {
            return false;
        }
        if record.direction == Direction::Send && record.method == Some(StreamMethod::Ibb) {
            let step = self.ibb.resume(session, record);
            self.after_ibb_step(session, sid, step);
        }
        true
    }

    /// Ask configured proxies for their streamhosts
    pub fn discover_proxies(&mut self, session: &mut AccountSession) {
        if !session.config().use_ft_proxies {
            return;
        }
        let configured = session.config().proxies.clone();
        let queries = session.proxies_mut().discovery_queries(&configured);
        for iq in queries {
            session.send(iq);
        }
    }

    /// Start the data channel of an accepted transfer
    ///
    /// Receivers wait for the sender, so only outgoing records act here.
    pub fn start_transport(&mut self, session: &mut AccountSession, sid: &str) {
        let Some(record) = self.registry.get_mut(sid) else {
            return;
        };
        if record.direction != Direction::Send {
            return;
        }
        match record.method {
            Some(StreamMethod::Socks5) => {
                if self.relay.offer_streamhosts(session, record) == OfferStep::ListenerFailed {
                    self.connect_error(session, sid, ConnectErrorCode::NotAcceptable);
                }
            }
            Some(StreamMethod::Ibb) => {
                if !self.ibb.open_stream(session, record) {
                    self.fail_transfer(session, sid, TransferErrorCode::Failed, None);
                }
            }
            None => {}
        }
    }

    // =========================================================================
    // Stanzas
    // =========================================================================

    /// Route one inbound IQ
    pub fn handle_iq(&mut self, session: &mut AccountSession, iq: &Iq) -> StanzaOutcome {
        match (iq.kind, &iq.payload) {
            (IqType::Result | IqType::Error, _) => self.on_response(session, iq),
            (IqType::Set, IqPayload::Si(si)) => {
                self.on_offer(session, iq, si);
                StanzaOutcome::Handled
            }
            (IqType::Set, IqPayload::Bytestream(query)) if !query.streamhosts.is_empty() => {
                self.on_streamhosts(session, iq, query);
                StanzaOutcome::Handled
            }
            (IqType::Set, IqPayload::IbbOpen(open)) => {
                let tsid = open.sid.clone().unwrap_or_default();
                let record = peer_record(&mut self.registry, &tsid, iq.from.as_ref());
                let sid = record.as_ref().map(|r| r.sid.clone());
                let step = self.ibb.handle_open(session, iq, open, record);
                if let Some(sid) = sid {
                    self.after_ibb_step(session, &sid, step);
                }
                StanzaOutcome::Handled
            }
            (IqType::Set, IqPayload::IbbData(data)) => {
                let tsid = data.sid.clone().unwrap_or_default();
                let record = peer_record(&mut self.registry, &tsid, iq.from.as_ref());
                let sid = record.as_ref().map(|r| r.sid.clone());
                let step = self.ibb.handle_data(session, iq, data, record);
                if let Some(sid) = sid {
                    self.after_ibb_step(session, &sid, step);
                }
                StanzaOutcome::Handled
            }
            (IqType::Set, IqPayload::IbbClose(close)) => {
                let tsid = close.sid.clone().unwrap_or_default();
                let record = peer_record(&mut self.registry, &tsid, iq.from.as_ref());
                let sid = record.as_ref().map(|r| r.sid.clone());
                let step = self.ibb.handle_close(session, iq, record);
                if let Some(sid) = sid {
                    self.after_ibb_step(session, &sid, step);
                }
                StanzaOutcome::Handled
            }
            _ => StanzaOutcome::Unhandled,
        }
    }

    fn on_offer(&mut self, session: &mut AccountSession, iq: &Iq, si: &Si) {
        match self.negotiator.receive_offer(session, iq, si) {
            OfferCheck::Valid(record) => {
                if self.registry.contains(&record.sid) {
                    debug!(sid = %record.sid, "duplicate offer, ignoring");
                    return;
                }
                session.emit(TransferEvent::FileRequestReceived {
                    jid: record.sender.to_string(),
                    sid: record.sid.clone(),
                    name: record.name.clone(),
                    size: record.size,
                    desc: record.desc.clone(),
                    mime_type: record.mime_type.clone(),
                });
                self.registry.insert(*record);
            }
            OfferCheck::Rejected(condition) => {
                debug!(id = %iq.id, condition = condition.as_str(), "offer refused");
            }
            OfferCheck::Dropped => {}
        }
    }

    fn on_streamhosts(&mut self, session: &mut AccountSession, iq: &Iq, query: &BytestreamQuery) {
        let tsid = query.sid.clone().unwrap_or_default();
        let Some(record) = peer_record(&mut self.registry, &tsid, iq.from.as_ref())
            .filter(|r| r.direction == Direction::Receive)
        else {
            debug!(sid = %tsid, "streamhosts for unknown transfer");
            session.send(iq.error_reply(StanzaError::new(
                ErrorType::Cancel,
                ErrorCondition::ItemNotFound,
            )));
            return;
        };
        let sid = record.sid.clone();
        match self.relay.handle_streamhosts(session, record, iq, query) {
            StreamhostsStep::Connecting => {}
            StreamhostsStep::NoCandidates => {
                self.connect_error(session, &sid, ConnectErrorCode::Unreachable);
            }
            StreamhostsStep::Refused => {
                session.send(iq.error_reply(StanzaError::new(
                    ErrorType::Modify,
                    ErrorCondition::NotAcceptable,
                )));
            }
        }
    }

    fn on_response(&mut self, session: &mut AccountSession, iq: &Iq) -> StanzaOutcome {
        let id = iq.id.as_str();
        let error = match &iq.payload {
            IqPayload::Error(err) => Some(err),
            _ => None,
        };
        let is_error = iq.kind == IqType::Error;

        // answer to our SI offer
        if let Some(record) = self.registry.get_mut(id).filter(|r| {
            r.direction == Direction::Send
                && r.state() == TransferState::Negotiating
                && !r.is_jingle()
        }) {
            if is_error {
                self.negotiator.handle_error(session, record, error);
                self.remove_transfer(session, id);
                return StanzaOutcome::Handled;
            }
            let si = match &iq.payload {
                IqPayload::Si(si) => Some(si),
                _ => None,
            };
            if self.negotiator.handle_result(record, si).is_some() {
                self.start_transport(session, id);
            } else {
                self.report(session, id, None);
            }
            return StanzaOutcome::Handled;
        }

        if let Some(tsid) = self.ibb.stream_for_iq(id) {
            let Some(record) = self.registry.get_by_transport_mut(&tsid) else {
                return StanzaOutcome::Handled;
            };
            let sid = record.sid.clone();
            let step = if is_error {
                self.ibb.handle_error(record)
            } else {
                self.ibb.handle_result(session, record, id)
            };
            self.after_ibb_step(session, &sid, step);
            return StanzaOutcome::Handled;
        }

        if let Some(tsid) = id.strip_prefix(ACTIVATE_ID_PREFIX) {
            let Some(record) = self.registry.get_by_transport_mut(tsid) else {
                return StanzaOutcome::Handled;
            };
            let sid = record.sid.clone();
            if is_error || !self.relay.handle_activation_result(session, record) {
                warn!(sid = %sid, "proxy activation failed");
                let message = error.map(StanzaError::describe);
                self.fail_transfer(session, &sid, TransferErrorCode::Bytestream, message);
            }
            return StanzaOutcome::Handled;
        }

        if session.proxies().owns_query(id) {
            match &iq.payload {
                IqPayload::Bytestream(query) if !is_error => {
                    session.proxies_mut().handle_result(id, query);
                }
                IqPayload::Empty if !is_error => {
                    session.proxies_mut().handle_result(id, &BytestreamQuery::default());
                }
                _ => {
                    session.proxies_mut().handle_error(id);
                }
            }
            return StanzaOutcome::Handled;
        }

        if let Some(tsid) = id.strip_prefix(STREAMHOST_ID_PREFIX) {
            let Some(record) = self
                .registry
                .get_by_transport_mut(tsid)
                .filter(|r| r.direction == Direction::Send)
            else {
                return StanzaOutcome::Handled;
            };
            let sid = record.sid.clone();
            if is_error {
                self.bytestream_error(session, &sid, error);
                return StanzaOutcome::Handled;
            }
            let used = match &iq.payload {
                IqPayload::Bytestream(query) => query.streamhost_used.clone(),
                _ => None,
            };
            let step = match used {
                Some(used) => self.relay.handle_streamhost_used(session, record, &used),
                None => UsedStep::Unknown,
            };
            if matches!(step, UsedStep::Unknown | UsedStep::ChannelFailed) {
                self.fail_transfer(session, &sid, TransferErrorCode::Bytestream, None);
            }
            return StanzaOutcome::Handled;
        }

        StanzaOutcome::Unhandled
    }

    /// Error answer to our streamhost offer
    fn bytestream_error(
        &mut self,
        session: &mut AccountSession,
        sid: &str,
        error: Option<&StanzaError>,
    ) {
        if let Some(proxy) = self
            .registry
            .get(sid)
            .and_then(|r| r.used_streamhost().filter(|_| r.is_a_proxy))
            .map(|h| h.jid.clone())
        {
            session.proxies_mut().invalidate(&proxy);
        }
        let message = error.map(StanzaError::describe);
        info!(sid, reason = message.as_deref().unwrap_or("unknown"), "bytestream refused");
        self.fail_transfer(session, sid, TransferErrorCode::Bytestream, message);
    }

    // =========================================================================
    // Socket pool and background results
    // =========================================================================

    pub fn handle_pool_event(&mut self, session: &mut AccountSession, event: PoolEvent) {
        match event {
            PoolEvent::CandidateConnected { sid: tsid, idx } => {
                let Some(record) = self.registry.get_by_transport_mut(&tsid) else {
                    session.pool().remove_receiver(idx);
                    return;
                };
                let sid = record.sid.clone();
                let step = self.relay.on_candidate_connected(session, record, idx);
                debug!(sid = %sid, idx, step = ?step, "candidate connected");
                if step == CandidateStep::ChannelFailed {
                    let reason = Some("data channel could not be started".to_string());
                    self.fail_transfer(session, &sid, TransferErrorCode::Bytestream, reason);
                }
            }
            PoolEvent::CandidateFailed { sid: tsid, idx, reason } => {
                let Some(record) = self.registry.get_by_transport_mut(&tsid) else {
                    return;
                };
                let sid = record.sid.clone();
                debug!(sid = %sid, idx, "candidate failed: {}", reason);
                match self.relay.on_candidate_failed(session, record, idx) {
                    CandidateStep::AllFailed => {
                        self.connect_error(session, &sid, ConnectErrorCode::Unreachable);
                    }
                    CandidateStep::ProxyFailed => {
                        let reason = Some(reason);
                        self.fail_transfer(session, &sid, TransferErrorCode::Bytestream, reason);
                    }
                    _ => {}
                }
            }
            PoolEvent::PeerConnected { sid: tsid, auth_hash } => {
                if let Some(record) = self.registry.get_by_transport_mut(&tsid) {
                    debug!(sid = %record.sid, hash = %auth_hash, "peer authenticated on listener");
                    record.auth_hash.get_or_insert(auth_hash);
                }
            }
            PoolEvent::Progress { sid: tsid, bytes } => {
                let Some(record) = self.registry.get_by_transport_mut(&tsid) else {
                    return;
                };
                if record.transition(StateEvent::Transferred(bytes)).is_ok() {
                    session.emit(TransferEvent::Progress {
                        sid: record.sid.clone(),
                        transferred: record.received_len,
                        size: record.size,
                    });
                }
            }
            PoolEvent::Finished { sid: tsid } => {
                let sid = self.registry.get_by_transport_mut(&tsid).map(|r| r.sid.clone());
                if let Some(sid) = sid {
                    self.finish_transfer(session, &sid);
                }
            }
            PoolEvent::Failed { sid: tsid, reason } => {
                let sid = self.registry.get_by_transport_mut(&tsid).map(|r| r.sid.clone());
                if let Some(sid) = sid {
                    warn!(sid = %sid, "bytestream failed: {}", reason);
                    self.fail_transfer(session, &sid, TransferErrorCode::Bytestream, Some(reason));
                }
            }
        }
    }

    /// UPnP attempt for a parked offer returned
    pub fn complete_upnp(
        &mut self,
        session: &mut AccountSession,
        sid: &str,
        outcome: &UpnpOutcome,
    ) {
        if let Some(record) = self.registry.get_mut(sid) {
            self.relay.complete_upnp(session, record, outcome);
        }
    }

    /// Result of verifying a received file against the advertised hash
    pub fn hash_checked(
        &mut self,
        session: &mut AccountSession,
        sid: &str,
        check: io::Result<HashCheck>,
    ) {
        let Some(record) = self.registry.get_mut(sid) else {
            return;
        };
        let mut message = None;
        match check {
            Ok(HashCheck::Match) => {
                debug!(sid, "hash verified");
                let _ = record.transition(StateEvent::Finish);
            }
            Ok(HashCheck::Unsupported) => {
                debug!(sid, algo = ?record.algo, "hash not checked");
                let _ = record.transition(StateEvent::Finish);
            }
            Ok(HashCheck::Mismatch) => {
                warn!(sid, "received file does not match its hash");
                message = Some("hash mismatch".to_string());
                let _ = record.transition(StateEvent::Fail(TransferErrorCode::Bytestream));
            }
            Err(e) => {
                warn!(sid, "could not hash received file: {}", e);
                let _ = record.transition(StateEvent::Finish);
            }
        }
        self.report(session, sid, message);
    }

    // =========================================================================
    // Completion and teardown
    // =========================================================================

    fn after_ibb_step(&mut self, session: &mut AccountSession, sid: &str, step: IbbStep) {
        match step {
            IbbStep::Finished => self.finish_transfer(session, sid),
            IbbStep::Failed(_) => self.report(session, sid, None),
            IbbStep::Continue | IbbStep::Ignored => {}
        }
    }

    /// The data stream ended; settle completeness and report
    fn finish_transfer(&mut self, session: &mut AccountSession, sid: &str) {
        let Some(record) = self.registry.get_mut(sid) else {
            return;
        };
        if matches!(record.state(), TransferState::Streaming | TransferState::Closing) {
            let verify = record.direction == Direction::Receive
                && record.received_len >= record.expected_len()
                && record.offset == 0;
            if let (true, Some(expected), Some(path)) =
                (verify, record.hash.clone(), record.file_path.clone())
            {
                debug!(sid, "verifying received file");
                session.request(BackgroundRequest::VerifyHash {
                    sid: sid.to_string(),
                    path,
                    algo: record.algo.clone(),
                    expected,
                });
                return;
            }
            let _ = record.transition(StateEvent::Finish);
        }
        self.report(session, sid, None);
    }

    /// Emit the terminal event of a record and remove it
    fn report(&mut self, session: &mut AccountSession, sid: &str, message: Option<String>) {
        let Some(record) = self.registry.get(sid) else {
            return;
        };
        match record.state() {
            TransferState::Completed => {
                info!(sid, size = record.size, "transfer completed");
                session.emit(TransferEvent::Completed {
                    sid: sid.to_string(),
                });
            }
            TransferState::Failed(code) => {
                session.emit(TransferEvent::FileRequestError {
                    jid: record.peer().to_string(),
                    sid: sid.to_string(),
                    code: code.code(),
                    error_msg: message,
                });
            }
            _ => {}
        }
        self.remove_transfer(session, sid);
    }

    /// Mark a transfer failed, tell the UI and tear it down
    pub fn fail_transfer(
        &mut self,
        session: &mut AccountSession,
        sid: &str,
        code: TransferErrorCode,
        message: Option<String>,
    ) {
        if let Some(record) = self.registry.get_mut(sid) {
            let _ = record.transition(StateEvent::Fail(code));
            self.report(session, sid, message);
        }
    }

    /// Tell the peer we could not set up the bytestream and drop the transfer
    pub fn connect_error(
        &mut self,
        session: &mut AccountSession,
        sid: &str,
        code: ConnectErrorCode,
    ) {
        let Some(record) = self.registry.get_mut(sid) else {
            return;
        };
        let (error_type, condition) = match code {
            ConnectErrorCode::Unreachable => (ErrorType::Cancel, ErrorCondition::ItemNotFound),
            ConnectErrorCode::Cancelled => (ErrorType::Cancel, ErrorCondition::NotAllowed),
            ConnectErrorCode::NotAcceptable => (ErrorType::Modify, ErrorCondition::NotAcceptable),
        };
        warn!(sid, peer = %record.peer(), "connect error {}", code);

        session.send(Iq::new(
            IqType::Error,
            record.request_id.clone().unwrap_or_else(|| record.sid.clone()),
            Some(record.peer().clone()),
            IqPayload::Error(
                StanzaError::new(error_type, condition)
                    .with_code(code.code())
                    .with_text(code.reason()),
            ),
        ));

        let _ = record.transition(StateEvent::Fail(TransferErrorCode::Failed));
        if code == ConnectErrorCode::Unreachable {
            record.clear_candidates();
        }
        self.report(session, sid, Some(code.reason().to_string()));
    }

    /// Release sockets and streams of a transfer and forget it
    ///
    /// Safe to call repeatedly; only the first call touches the pool.
    pub fn remove_transfer(
        &mut self,
        session: &mut AccountSession,
        sid: &str,
    ) -> Option<FileTransferRecord> {
        let mut record = self.registry.remove(sid)?;
        self.relay.forget(sid);
        self.ibb.close_stream(session, &record);

        for host in &mut record.streamhosts {
            if let Some(idx) = host.idx.take() {
                session.pool().remove_receiver(idx);
            }
        }
        if record.direction == Direction::Send {
            if let Some(idx) = record.used_streamhost().and_then(|h| h.idx) {
                session.pool().remove_receiver(idx);
            }
            if let Some(hash) = record.auth_hash.take() {
                session.pool().remove_sender(&hash);
            }
        }
        debug!(sid, state = ?record.state(), "transfer removed");
        Some(record)
    }

    /// Abort every transfer with `contact` (the contact went offline)
    ///
    /// A full JID matches exactly; a bare JID matches every resource.
    pub fn stop_all_for_contact(&mut self, session: &mut AccountSession, contact: &Jid) {
        let is_contact = |jid: &Jid| {
            if contact.is_full() {
                jid == contact
            } else {
                jid.same_bare(contact)
            }
        };
        let sids = self.registry.sids_matching(|r| {
            !r.is_stopped() && (is_contact(&r.receiver) || is_contact(&r.sender))
        });

        for sid in sids {
            let Some(record) = self.registry.get(&sid) else {
                continue;
            };
            let code = if is_contact(&record.receiver) {
                TransferErrorCode::Listener
            } else {
                TransferErrorCode::Failed
            };
            info!(sid = %sid, contact = %contact, "contact gone, stopping transfer");
            self.fail_transfer(session, &sid, code, None);
        }
    }

    /// Drop every transfer, e.g. when the account disconnects
    pub fn remove_all_transfers(&mut self, session: &mut AccountSession) {
        for sid in self.registry.sids() {
            self.remove_transfer(session, &sid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PoolCall, jid, session};
    use tempfile::TempDir;
    use xmpp_ft_common::stanza::{DataForm, IbbOpen, StreamhostEntry};
    use xmpp_ft_common::{NS_BYTESTREAM, STREAM_METHOD_FIELD};

    fn offer_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello world").unwrap();
        path
    }

    fn si_result(id: &str, method: &str) -> Iq {
        let mut iq = Iq::new(
            IqType::Result,
            id,
            Some(jid("alice@example.com/laptop")),
            IqPayload::Si(Si {
                feature: Some(DataForm::submit(STREAM_METHOD_FIELD, method)),
                ..Default::default()
            }),
        );
        iq.from = Some(jid("bob@example.com/phone"));
        iq
    }

    fn streamhosts_from_alice(tsid: &str) -> Iq {
        let mut iq = Iq::new(
            IqType::Set,
            format!("{}{}", STREAMHOST_ID_PREFIX, tsid),
            Some(jid("bob@example.com/phone")),
            IqPayload::Bytestream(BytestreamQuery {
                sid: Some(tsid.into()),
                streamhosts: vec![StreamhostEntry::new(
                    &jid("alice@example.com/laptop"),
                    "192.0.2.1",
                    1,
                )],
                ..Default::default()
            }),
        );
        iq.from = Some(jid("alice@example.com/laptop"));
        iq
    }

    fn offer_from_alice(sid: &str) -> FileTransferRecord {
        FileTransferRecord::incoming(
            sid,
            jid("alice@example.com/laptop"),
            jid("bob@example.com/phone"),
            "a.bin",
            10,
        )
    }

    fn error_condition(iq: &Iq) -> ErrorCondition {
        match &iq.payload {
            IqPayload::Error(err) => err.condition.clone(),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_send_file_request_offers_and_registers() {
        let dir = TempDir::new().unwrap();
        let (mut alice, rec) = session("alice@example.com/laptop");
        let mut controller = TransferController::new();

        let sid = controller
            .send_file_request(&mut alice, jid("bob@example.com/phone"), offer_file(&dir), None)
            .unwrap();
        assert!(sid.starts_with(SID_PREFIX));
        assert_eq!(controller.get(&sid).unwrap().size, 11);
        let sent = rec.take_stanzas();
        assert_eq!(sent[0].id, sid);
        assert!(matches!(sent[0].payload, IqPayload::Si(_)));
    }

    #[test]
    fn test_send_file_request_offline() {
        let dir = TempDir::new().unwrap();
        let (mut alice, _) = session("alice@example.com/laptop");
        alice.set_connected(false);
        let result = TransferController::new().send_file_request(
            &mut alice,
            jid("bob@example.com/phone"),
            offer_file(&dir),
            None,
        );
        assert!(matches!(result, Err(FtError::NotConnected)));
    }

    #[test]
    fn test_socks5_answer_offers_streamhosts() {
        let dir = TempDir::new().unwrap();
        let (mut alice, rec) = session("alice@example.com/laptop");
        let mut controller = TransferController::new();
        let sid = controller
            .send_file_request(&mut alice, jid("bob@example.com/phone"), offer_file(&dir), None)
            .unwrap();
        rec.take_stanzas();

        controller.handle_iq(&mut alice, &si_result(&sid, NS_BYTESTREAM));
        let sent = rec.take_stanzas();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, format!("{}{}", STREAMHOST_ID_PREFIX, sid));
        assert!(matches!(
            rec.take_calls()[0],
            PoolCall::StartListener { port: 28011, .. }
        ));
    }

    #[test]
    fn test_listener_failure_reports_minus_five() {
        let dir = TempDir::new().unwrap();
        let config = crate::config::FtConfig {
            send_local_ips: false,
            ..Default::default()
        };
        let (mut alice, rec) =
            crate::testing::session_with("alice@example.com/laptop", config, false);
        let mut controller = TransferController::new();
        let sid = controller
            .send_file_request(&mut alice, jid("bob@example.com/phone"), offer_file(&dir), None)
            .unwrap();
        rec.take_stanzas();

        controller.handle_iq(&mut alice, &si_result(&sid, NS_BYTESTREAM));

        let sent = rec.take_stanzas();
        let IqPayload::Error(err) = &sent[0].payload else {
            panic!("expected connect error");
        };
        assert_eq!(err.code, Some(406));
        assert!(matches!(
            rec.take_events()[0],
            TransferEvent::FileRequestError { code: -5, .. }
        ));
        assert!(controller.get(&sid).is_none());
    }

    #[test]
    fn test_remove_transfer_twice() {
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut controller = TransferController::new();
        let mut record = FileTransferRecord::incoming(
            "s1",
            jid("alice@example.com/laptop"),
            jid("bob@example.com/phone"),
            "a.bin",
            10,
        );
        record.streamhosts = vec![crate::record::Streamhost {
            jid: jid("alice@example.com/laptop"),
            host: "192.0.2.1".into(),
            port: 28011,
            initiator: jid("alice@example.com/laptop"),
            target: jid("bob@example.com/phone"),
            request_id: "id_s1".into(),
            state: crate::record::HostState::Pending,
            idx: Some(7),
        }];
        controller.add_transfer(record);

        assert!(controller.remove_transfer(&mut bob, "s1").is_some());
        assert!(controller.remove_transfer(&mut bob, "s1").is_none());
        assert_eq!(rec.take_calls(), vec![PoolCall::RemoveReceiver(7)]);
    }

    #[test]
    fn test_streamhosts_for_unknown_transfer() {
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut iq = Iq::new(
            IqType::Set,
            "id_x",
            Some(jid("bob@example.com/phone")),
            IqPayload::Bytestream(BytestreamQuery {
                sid: Some("x".into()),
                streamhosts: vec![StreamhostEntry::new(
                    &jid("alice@example.com/laptop"),
                    "192.0.2.1",
                    1,
                )],
                ..Default::default()
            }),
        );
        iq.from = Some(jid("alice@example.com/laptop"));

        assert_eq!(TransferController::new().handle_iq(&mut bob, &iq), StanzaOutcome::Handled);
        let IqPayload::Error(err) = &rec.take_stanzas()[0].payload else {
            panic!("expected error");
        };
        assert_eq!(err.condition, ErrorCondition::ItemNotFound);
    }

    #[test]
    fn test_streamhosts_before_approval_are_refused() {
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut controller = TransferController::new();
        controller.add_transfer(offer_from_alice("s1"));

        controller.handle_iq(&mut bob, &streamhosts_from_alice("s1"));

        let sent = rec.take_stanzas();
        assert_eq!(sent.len(), 1);
        assert_eq!(error_condition(&sent[0]), ErrorCondition::NotAcceptable);
        assert!(rec.take_calls().is_empty());
        assert!(rec.take_events().is_empty());
        assert_eq!(controller.get("s1").unwrap().state(), TransferState::Negotiating);
    }

    #[test]
    fn test_in_band_transfer_refuses_socks5_channel() {
        let dir = TempDir::new().unwrap();
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut controller = TransferController::new();
        let mut record = offer_from_alice("s1");
        record.file_path = Some(dir.path().join("a.bin"));
        record.transition(StateEvent::Accepted(StreamMethod::Ibb)).unwrap();
        controller.add_transfer(record);

        let mut open = Iq::new(
            IqType::Set,
            "o1",
            Some(jid("bob@example.com/phone")),
            IqPayload::IbbOpen(IbbOpen {
                sid: Some("s1".into()),
                block_size: Some("4096".into()),
                stanza: None,
            }),
        );
        open.from = Some(jid("alice@example.com/laptop"));
        controller.handle_iq(&mut bob, &open);
        assert_eq!(controller.get("s1").unwrap().state(), TransferState::Streaming);
        rec.take_stanzas();

        controller.handle_iq(&mut bob, &streamhosts_from_alice("s1"));
        assert_eq!(error_condition(&rec.take_stanzas()[0]), ErrorCondition::NotAcceptable);

        let connected = PoolEvent::CandidateConnected { sid: "s1".into(), idx: 1 };
        controller.handle_pool_event(&mut bob, connected);
        assert!(rec.take_calls().is_empty());
        assert_eq!(controller.get("s1").unwrap().state(), TransferState::Streaming);
    }

    #[test]
    fn test_candidate_without_channel_fails_transfer() {
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut controller = TransferController::new();
        let mut record = offer_from_alice("s1");
        record.transition(StateEvent::Accepted(StreamMethod::Socks5)).unwrap();
        controller.add_transfer(record);
        controller.handle_iq(&mut bob, &streamhosts_from_alice("s1"));
        rec.take_calls();

        let connected = PoolEvent::CandidateConnected { sid: "s1".into(), idx: 1 };
        controller.handle_pool_event(&mut bob, connected);

        assert!(controller.get("s1").is_none());
        assert!(matches!(
            rec.take_events()[..],
            [TransferEvent::FileRequestError { code: -4, .. }]
        ));
        assert_eq!(rec.take_calls(), vec![PoolCall::RemoveReceiver(1)]);
        assert!(rec.take_stanzas().is_empty());
    }

    #[test]
    fn test_unrelated_iq_is_unhandled() {
        let (mut bob, _) = session("bob@example.com/phone");
        let iq = Iq::new(IqType::Result, "roster_1", None, IqPayload::Empty);
        assert_eq!(TransferController::new().handle_iq(&mut bob, &iq), StanzaOutcome::Unhandled);

        let iq = Iq::new(
            IqType::Get,
            "v1",
            None,
            IqPayload::Unknown {
                name: "query".into(),
                namespace: Some("jabber:iq:version".into()),
            },
        );
        assert_eq!(TransferController::new().handle_iq(&mut bob, &iq), StanzaOutcome::Unhandled);
    }

    #[test]
    fn test_hash_mismatch_fails_transfer() {
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut controller = TransferController::new();
        let mut record = FileTransferRecord::incoming(
            "s1",
            jid("alice@example.com/laptop"),
            jid("bob@example.com/phone"),
            "a.bin",
            3,
        );
        record.hash = Some("00".repeat(32));
        record.file_path = Some("/tmp/a.bin".into());
        record.transition(StateEvent::Accepted(StreamMethod::Socks5)).unwrap();
        record.transition(StateEvent::ChannelReady).unwrap();
        controller.add_transfer(record);

        controller.handle_pool_event(&mut bob, PoolEvent::Progress { sid: "s1".into(), bytes: 3 });
        controller.handle_pool_event(&mut bob, PoolEvent::Finished { sid: "s1".into() });
        assert!(matches!(
            bob.take_requests()[0],
            BackgroundRequest::VerifyHash { .. }
        ));
        assert!(controller.get("s1").is_some());

        controller.hash_checked(&mut bob, "s1", Ok(HashCheck::Mismatch));
        assert!(controller.get("s1").is_none());
        let events = rec.take_events();
        assert!(matches!(
            events.last(),
            Some(TransferEvent::FileRequestError { code: -4, .. })
        ));
    }

    #[test]
    fn test_stop_all_for_contact_codes() {
        let (mut alice, rec) = session("alice@example.com/laptop");
        let mut controller = TransferController::new();
        controller.add_transfer(FileTransferRecord::outgoing(
            "out",
            jid("alice@example.com/laptop"),
            jid("bob@example.com/phone"),
            "/tmp/x".into(),
            1,
        ));
        controller.add_transfer(FileTransferRecord::incoming(
            "in",
            jid("bob@example.com/phone"),
            jid("alice@example.com/laptop"),
            "y",
            1,
        ));
        controller.add_transfer(FileTransferRecord::incoming(
            "other",
            jid("carol@example.com/x"),
            jid("alice@example.com/laptop"),
            "z",
            1,
        ));

        controller.stop_all_for_contact(&mut alice, &jid("bob@example.com/phone"));

        let mut codes: Vec<(String, i32)> = rec
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                TransferEvent::FileRequestError { sid, code, .. } => Some((sid, code)),
                _ => None,
            })
            .collect();
        codes.sort();
        assert_eq!(codes, vec![("in".to_string(), -3), ("out".to_string(), -5)]);
        assert_eq!(controller.registry().len(), 1);
    }
}
