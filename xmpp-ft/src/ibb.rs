//! In-band bytestreams
//!
//! File data travels base64 encoded inside `<data/>` IQs. The sender keeps
//! exactly one data IQ in flight and sends the next block when the previous
//! one is acknowledged. Sequence numbers are 16 bit and wrap to 0 after
//! 65535; the receiver only accepts the exact next number.
//!
//! ```text
//! sender                          receiver
//!   open(sid, block-size)  --->   record found? ack : item-not-found
//!   data(seq=0)            --->   seq ok? write + ack : unexpected-request
//!   ...
//!   close                  --->   received >= size ? completed : incomplete
//! ```

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::{debug, info, warn};
use xmpp_ft_common::events::TransferEvent;
use xmpp_ft_common::stanza::{
    ErrorCondition, ErrorType, IbbClose, IbbData, IbbOpen, Iq, IqPayload, IqType, StanzaError,
};
use xmpp_ft_common::validators::{parse_block_size, validate_sid};
use xmpp_ft_common::{Jid, TransferErrorCode};

use crate::constants::IBB_ID_PREFIX;
use crate::record::{
    Direction, FileTransferRecord, SessionType, StateEvent, StreamMethod, TransferState,
};
use crate::session::AccountSession;

/// What the controller should do after an IBB event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IbbStep {
    Continue,
    /// Stream closed; the record holds the final state
    Finished,
    /// Stream aborted; the record is failed with this code
    Failed(TransferErrorCode),
    /// Not for a stream we know
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    Streaming,
    Closing,
}

#[derive(Debug)]
struct OutgoingStream {
    peer: Jid,
    file: File,
    block_size: u16,
    seq: u16,
    phase: Phase,
    /// Id of the IQ awaiting its result
    in_flight: Option<String>,
}

#[derive(Debug)]
struct IncomingStream {
    file: File,
    block_size: u16,
    expected_seq: u16,
}

/// Sequence number following `seq`
#[must_use]
pub fn next_seq(seq: u16) -> u16 {
    seq.wrapping_add(1)
}

fn read_block(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn error_reply(
    session: &mut AccountSession,
    iq: &Iq,
    error_type: ErrorType,
    condition: ErrorCondition,
) {
    session.send(iq.error_reply(StanzaError::new(error_type, condition)));
}

/// Streams keyed by transport sid
#[derive(Debug, Default)]
pub struct InBandStreamEngine {
    outgoing: HashMap<String, OutgoingStream>,
    incoming: HashMap<String, IncomingStream>,
}

impl InBandStreamEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_stream(&self, transport_sid: &str) -> bool {
        self.outgoing.contains_key(transport_sid) || self.incoming.contains_key(transport_sid)
    }

    /// Transport sid of the outgoing stream waiting on IQ `id`
    pub fn stream_for_iq(&self, id: &str) -> Option<String> {
        self.outgoing
            .iter()
            .find(|(_, s)| s.in_flight.as_deref() == Some(id))
            .map(|(sid, _)| sid.clone())
    }

    // =========================================================================
    // Sender
    // =========================================================================

    /// Send `<open/>` for an accepted outgoing record
    pub fn open_stream(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
    ) -> bool {
        let peer = record.receiver.clone();
        if peer.resource().is_none() {
            warn!(sid = %record.sid, peer = %peer, "refusing in-band stream to a bare JID");
            return false;
        }
        let Some(path) = record.file_path.clone() else {
            return false;
        };
        let file = match File::open(&path).and_then(|mut f| {
            f.seek(SeekFrom::Start(record.offset))?;
            Ok(f)
        }) {
            Ok(file) => file,
            Err(e) => {
                warn!(sid = %record.sid, path = %path.display(), "cannot read file: {}", e);
                let _ = record.transition(StateEvent::Fail(TransferErrorCode::Failed));
                return false;
            }
        };

        let block_size = session.config().ibb_block_size;
        let id = session.next_id(IBB_ID_PREFIX);
        debug!(sid = %record.sid, block_size, "opening in-band stream");
        session.send(Iq::new(
            IqType::Set,
            id.clone(),
            Some(peer.clone()),
            IqPayload::IbbOpen(IbbOpen {
                sid: Some(record.transport_sid.clone()),
                block_size: Some(block_size.to_string()),
                stanza: Some("iq".to_string()),
            }),
        ));
        self.outgoing.insert(
            record.transport_sid.clone(),
            OutgoingStream {
                peer,
                file,
                block_size,
                seq: 0,
                phase: Phase::Opening,
                in_flight: Some(id),
            },
        );
        true
    }

    /// Result for one of our IQs: open, data or close
    pub fn handle_result(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        id: &str,
    ) -> IbbStep {
        let Some(stream) = self.outgoing.get_mut(&record.transport_sid) else {
            return IbbStep::Ignored;
        };
        if stream.in_flight.as_deref() != Some(id) {
            return IbbStep::Ignored;
        }
        stream.in_flight = None;

        match stream.phase {
            Phase::Opening => {
                stream.phase = Phase::Streaming;
                if let Err(e) = record.transition(StateEvent::ChannelReady) {
                    debug!(sid = %record.sid, "{}", e);
                }
                self.send_next(session, record)
            }
            Phase::Streaming => self.send_next(session, record),
            Phase::Closing => {
                self.outgoing.remove(&record.transport_sid);
                let _ = record.transition(StateEvent::Finish);
                info!(sid = %record.sid, state = ?record.state(), "in-band stream closed");
                IbbStep::Finished
            }
        }
    }

    /// Continue a paused outgoing stream
    pub fn resume(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
    ) -> IbbStep {
        match self.outgoing.get(&record.transport_sid) {
            Some(stream) if stream.in_flight.is_none() && stream.phase == Phase::Streaming => {
                self.send_next(session, record)
            }
            Some(_) => IbbStep::Continue,
            None => IbbStep::Ignored,
        }
    }

    fn send_next(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
    ) -> IbbStep {
        if record.is_paused() {
            return IbbStep::Continue;
        }
        let Some(stream) = self.outgoing.get_mut(&record.transport_sid) else {
            return IbbStep::Ignored;
        };

        let remaining = record.expected_len().saturating_sub(record.received_len);
        let want = remaining.min(u64::from(stream.block_size)) as usize;
        let mut buf = vec![0u8; want];
        let read = match read_block(&mut stream.file, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(sid = %record.sid, "read failed: {}", e);
                return self.abort(session, record, TransferErrorCode::Failed);
            }
        };

        let id = session.next_id(IBB_ID_PREFIX);
        if read == 0 {
            debug!(sid = %record.sid, "data exhausted, closing stream");
            stream.phase = Phase::Closing;
            stream.in_flight = Some(id.clone());
            let peer = stream.peer.clone();
            session.send(Iq::new(
                IqType::Set,
                id,
                Some(peer),
                IqPayload::IbbClose(IbbClose {
                    sid: Some(record.transport_sid.clone()),
                }),
            ));
            let _ = record.transition(StateEvent::Close);
            if record.session_type == (SessionType::Jingle { initiated_by_us: true }) {
                session.cancel_jingle(&record.receiver, &record.sid);
            }
            return IbbStep::Continue;
        }

        buf.truncate(read);
        let seq = stream.seq;
        stream.seq = next_seq(seq);
        stream.in_flight = Some(id.clone());
        let peer = stream.peer.clone();
        session.send(Iq::new(
            IqType::Set,
            id,
            Some(peer),
            IqPayload::IbbData(IbbData {
                sid: Some(record.transport_sid.clone()),
                seq: Some(seq.to_string()),
                data: Some(buf),
            }),
        ));
        let _ = record.transition(StateEvent::Transferred(read as u64));
        session.emit(TransferEvent::Progress {
            sid: record.sid.clone(),
            transferred: record.received_len,
            size: record.size,
        });
        IbbStep::Continue
    }

    // =========================================================================
    // Receiver
    // =========================================================================

    /// Peer asked to open a stream
    pub fn handle_open(
        &mut self,
        session: &mut AccountSession,
        iq: &Iq,
        open: &IbbOpen,
        record: Option<&mut FileTransferRecord>,
    ) -> IbbStep {
        let sid_ok = open.sid.as_deref().is_some_and(|sid| validate_sid(sid).is_ok());
        let block_size = parse_block_size(open.block_size.as_deref());
        let (true, Ok(block_size)) = (sid_ok, block_size) else {
            debug!(id = %iq.id, "malformed in-band open");
            error_reply(session, iq, ErrorType::Modify, ErrorCondition::BadRequest);
            return IbbStep::Ignored;
        };
        let Some(record) = record else {
            debug!(id = %iq.id, sid = ?open.sid, "in-band open for unknown transfer");
            error_reply(session, iq, ErrorType::Cancel, ErrorCondition::ItemNotFound);
            return IbbStep::Ignored;
        };
        if record.direction != Direction::Receive
            || record.state() != TransferState::Opening
            || record.method != Some(StreamMethod::Ibb)
        {
            debug!(sid = %record.sid, method = ?record.method, "in-band open not expected");
            error_reply(session, iq, ErrorType::Cancel, ErrorCondition::NotAcceptable);
            return IbbStep::Ignored;
        }

        let opened = record.file_path.clone().map(|path| {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(record.offset == 0)
                .open(&path)
                .and_then(|mut f| {
                    f.seek(SeekFrom::Start(record.offset))?;
                    Ok(f)
                })
        });
        let file = match opened {
            Some(Ok(file)) => file,
            Some(Err(e)) => {
                warn!(sid = %record.sid, "cannot open destination: {}", e);
                error_reply(session, iq, ErrorType::Cancel, ErrorCondition::NotAcceptable);
                let _ = record.transition(StateEvent::Fail(TransferErrorCode::Failed));
                return IbbStep::Failed(TransferErrorCode::Failed);
            }
            None => {
                error_reply(session, iq, ErrorType::Cancel, ErrorCondition::NotAcceptable);
                return IbbStep::Ignored;
            }
        };

        info!(sid = %record.sid, block_size, "in-band stream opened");
        self.incoming.insert(
            record.transport_sid.clone(),
            IncomingStream {
                file,
                block_size,
                expected_seq: 0,
            },
        );
        let _ = record.transition(StateEvent::ChannelReady);
        session.send(iq.ack());
        IbbStep::Continue
    }

    /// One block of data from the peer
    pub fn handle_data(
        &mut self,
        session: &mut AccountSession,
        iq: &Iq,
        data: &IbbData,
        record: Option<&mut FileTransferRecord>,
    ) -> IbbStep {
        let Some(record) = record else {
            error_reply(session, iq, ErrorType::Cancel, ErrorCondition::ItemNotFound);
            return IbbStep::Ignored;
        };
        let Some(stream) = self.incoming.get_mut(&record.transport_sid) else {
            warn!(sid = %record.sid, "in-band data before open");
            error_reply(session, iq, ErrorType::Cancel, ErrorCondition::ItemNotFound);
            return self.fail(record, TransferErrorCode::Bytestream);
        };

        let seq = data.seq.as_deref().and_then(|s| s.parse::<u16>().ok());
        if seq != Some(stream.expected_seq) {
            warn!(
                sid = %record.sid,
                expected = stream.expected_seq,
                got = ?data.seq,
                "in-band sequence mismatch"
            );
            error_reply(session, iq, ErrorType::Cancel, ErrorCondition::UnexpectedRequest);
            return self.fail(record, TransferErrorCode::Bytestream);
        }

        let Some(payload) = data
            .data
            .as_deref()
            .filter(|p| p.len() <= usize::from(stream.block_size))
        else {
            warn!(sid = %record.sid, "in-band payload invalid or larger than block size");
            error_reply(session, iq, ErrorType::Modify, ErrorCondition::BadRequest);
            return self.fail(record, TransferErrorCode::Bytestream);
        };

        if let Err(e) = stream.file.write_all(payload) {
            warn!(sid = %record.sid, "write failed: {}", e);
            error_reply(session, iq, ErrorType::Cancel, ErrorCondition::NotAcceptable);
            return self.fail(record, TransferErrorCode::Failed);
        }
        stream.expected_seq = next_seq(stream.expected_seq);

        let _ = record.transition(StateEvent::Transferred(payload.len() as u64));
        session.send(iq.ack());
        session.emit(TransferEvent::Progress {
            sid: record.sid.clone(),
            transferred: record.received_len,
            size: record.size,
        });
        IbbStep::Continue
    }

    /// Peer closed the stream
    ///
    /// The record is left in `Closing`; completeness is settled by the caller.
    pub fn handle_close(
        &mut self,
        session: &mut AccountSession,
        iq: &Iq,
        record: Option<&mut FileTransferRecord>,
    ) -> IbbStep {
        let Some(record) = record.filter(|r| self.has_stream(&r.transport_sid)) else {
            error_reply(session, iq, ErrorType::Cancel, ErrorCondition::ItemNotFound);
            return IbbStep::Ignored;
        };

        if let Some(mut stream) = self.incoming.remove(&record.transport_sid)
            && let Err(e) = stream.file.flush()
        {
            warn!(sid = %record.sid, "flush failed: {}", e);
        }
        self.outgoing.remove(&record.transport_sid);
        session.send(iq.ack());

        let _ = record.transition(StateEvent::Close);
        info!(
            sid = %record.sid,
            received = record.received_len,
            expected = record.expected_len(),
            "in-band stream closed by peer"
        );
        IbbStep::Finished
    }

    /// Peer answered one of our IQs with an error
    pub fn handle_error(&mut self, record: &mut FileTransferRecord) -> IbbStep {
        if self.outgoing.remove(&record.transport_sid).is_none() {
            return IbbStep::Ignored;
        }
        warn!(sid = %record.sid, "peer refused in-band stream");
        let _ = record.transition(StateEvent::Fail(TransferErrorCode::Bytestream));
        IbbStep::Failed(TransferErrorCode::Bytestream)
    }

    /// Close our side of a stream while tearing a transfer down
    pub fn close_stream(&mut self, session: &mut AccountSession, record: &FileTransferRecord) {
        if let Some(stream) = self.outgoing.remove(&record.transport_sid)
            && stream.phase != Phase::Closing
        {
            let id = session.next_id(IBB_ID_PREFIX);
            session.send(Iq::new(
                IqType::Set,
                id,
                Some(stream.peer),
                IqPayload::IbbClose(IbbClose {
                    sid: Some(record.transport_sid.clone()),
                }),
            ));
        }
        self.incoming.remove(&record.transport_sid);
    }

    fn abort(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        code: TransferErrorCode,
    ) -> IbbStep {
        self.close_stream(session, record);
        self.fail(record, code)
    }

    fn fail(&mut self, record: &mut FileTransferRecord, code: TransferErrorCode) -> IbbStep {
        self.outgoing.remove(&record.transport_sid);
        self.incoming.remove(&record.transport_sid);
        let _ = record.transition(StateEvent::Fail(code));
        IbbStep::Failed(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FtConfig;
    use crate::testing::{jid, session, session_with};
    use tempfile::TempDir;

    fn sender_record(dir: &TempDir, content: &[u8]) -> FileTransferRecord {
        let path = dir.path().join("out.bin");
        std::fs::write(&path, content).unwrap();
        let mut record = FileTransferRecord::outgoing(
            "ibb1",
            jid("alice@example.com/laptop"),
            jid("bob@example.com/phone"),
            path,
            content.len() as u64,
        );
        record.transition(StateEvent::Accepted(StreamMethod::Ibb)).unwrap();
        record
    }

    fn receiver_record(dir: &TempDir, size: u64) -> FileTransferRecord {
        let mut record = FileTransferRecord::incoming(
            "ibb1",
            jid("alice@example.com/laptop"),
            jid("bob@example.com/phone"),
            "in.bin",
            size,
        );
        record.file_path = Some(dir.path().join("in.bin"));
        record.transition(StateEvent::Accepted(StreamMethod::Ibb)).unwrap();
        record
    }

    fn from_alice(mut iq: Iq) -> Iq {
        iq.from = Some(jid("alice@example.com/laptop"));
        iq.to = Some(jid("bob@example.com/phone"));
        iq
    }

    fn open_iq(sid: Option<&str>, block_size: Option<&str>) -> (Iq, IbbOpen) {
        let open = IbbOpen {
            sid: sid.map(String::from),
            block_size: block_size.map(String::from),
            stanza: None,
        };
        let iq = from_alice(Iq::new(IqType::Set, "o1", None, IqPayload::IbbOpen(open.clone())));
        (iq, open)
    }

    fn data_iq(seq: &str, bytes: &[u8]) -> (Iq, IbbData) {
        let data = IbbData {
            sid: Some("ibb1".into()),
            seq: Some(seq.into()),
            data: Some(bytes.to_vec()),
        };
        let iq = from_alice(Iq::new(
            IqType::Set,
            format!("d{}", seq),
            None,
            IqPayload::IbbData(data.clone()),
        ));
        (iq, data)
    }

    fn error_condition(iq: &Iq) -> ErrorCondition {
        match &iq.payload {
            IqPayload::Error(err) => err.condition.clone(),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_seq_wraps_after_65535() {
        let mut seq = 0u16;
        for _ in 0..65536 {
            seq = next_seq(seq);
        }
        assert_eq!(seq, 0);
        assert_eq!(next_seq(u16::MAX), 0);
    }

    #[test]
    fn test_sender_streams_blocks_one_at_a_time() {
        let dir = TempDir::new().unwrap();
        let config = FtConfig {
            ibb_block_size: 4,
            ..FtConfig::default()
        };
        let (mut alice, rec) = session_with("alice@example.com/laptop", config, true);
        let mut record = sender_record(&dir, b"0123456789");
        let mut engine = InBandStreamEngine::new();

        assert!(engine.open_stream(&mut alice, &mut record));
        let open = rec.take_stanzas().remove(0);
        assert!(matches!(
            &open.payload,
            IqPayload::IbbOpen(o) if o.block_size.as_deref() == Some("4")
        ));

        let mut id = open.id;
        let mut chunks = Vec::new();
        loop {
            assert_eq!(engine.handle_result(&mut alice, &mut record, &id), IbbStep::Continue);
            let sent = rec.take_stanzas();
            assert_eq!(sent.len(), 1, "exactly one IQ in flight");
            id = sent[0].id.clone();
            match &sent[0].payload {
                IqPayload::IbbData(d) => {
                    chunks.push((d.seq.clone().unwrap(), d.data.clone().unwrap()))
                }
                IqPayload::IbbClose(_) => break,
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], ("0".to_string(), b"0123".to_vec()));
        assert_eq!(chunks[2], ("2".to_string(), b"89".to_vec()));
        assert_eq!(record.state(), TransferState::Closing);

        assert_eq!(engine.handle_result(&mut alice, &mut record, &id), IbbStep::Finished);
        assert!(record.completed());
        assert!(!engine.has_stream("ibb1"));
    }

    #[test]
    fn test_sender_ignores_stale_ack() {
        let dir = TempDir::new().unwrap();
        let (mut alice, rec) = session("alice@example.com/laptop");
        let mut record = sender_record(&dir, b"abc");
        let mut engine = InBandStreamEngine::new();

        engine.open_stream(&mut alice, &mut record);
        rec.take_stanzas();
        assert_eq!(engine.handle_result(&mut alice, &mut record, "bogus"), IbbStep::Ignored);
        assert!(rec.take_stanzas().is_empty());
    }

    #[test]
    fn test_open_to_bare_jid_is_refused() {
        let dir = TempDir::new().unwrap();
        let (mut alice, rec) = session("alice@example.com/laptop");
        let mut record = sender_record(&dir, b"abc");
        record.receiver = jid("bob@example.com");

        assert!(!InBandStreamEngine::new().open_stream(&mut alice, &mut record));
        assert!(rec.take_stanzas().is_empty());
    }

    #[test]
    fn test_seq_wraps_on_the_wire() {
        let dir = TempDir::new().unwrap();
        let config = FtConfig {
            ibb_block_size: 1,
            ..FtConfig::default()
        };
        let (mut alice, rec) = session_with("alice@example.com/laptop", config, true);
        let mut record = sender_record(&dir, &vec![7u8; 65537]);
        let mut engine = InBandStreamEngine::new();

        engine.open_stream(&mut alice, &mut record);
        let mut id = rec.take_stanzas().remove(0).id;
        let mut last_seq = None;
        for _ in 0..65537 {
            engine.handle_result(&mut alice, &mut record, &id);
            let iq = rec.take_stanzas().remove(0);
            id = iq.id;
            if let IqPayload::IbbData(d) = iq.payload {
                last_seq = d.seq;
            }
        }
        rec.take_events();
        // 65537th block carries seq 0 again
        assert_eq!(last_seq.as_deref(), Some("0"));
        assert!(record.error().is_none());
    }

    #[test]
    fn test_receiver_end_to_end() {
        let dir = TempDir::new().unwrap();
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut record = receiver_record(&dir, 6);
        let mut engine = InBandStreamEngine::new();

        let (iq, open) = open_iq(Some("ibb1"), Some("4096"));
        assert_eq!(engine.handle_open(&mut bob, &iq, &open, Some(&mut record)), IbbStep::Continue);
        assert_eq!(rec.take_stanzas()[0].kind, IqType::Result);

        for (seq, bytes) in [("0", b"abc"), ("1", b"def")] {
            let (iq, data) = data_iq(seq, bytes);
            assert_eq!(
                engine.handle_data(&mut bob, &iq, &data, Some(&mut record)),
                IbbStep::Continue
            );
        }
        let close = from_alice(Iq::new(
            IqType::Set,
            "c1",
            None,
            IqPayload::IbbClose(IbbClose {
                sid: Some("ibb1".into()),
            }),
        ));
        assert_eq!(engine.handle_close(&mut bob, &close, Some(&mut record)), IbbStep::Finished);
        assert_eq!(record.state(), TransferState::Closing);

        assert_eq!(record.transition(StateEvent::Finish), Ok(TransferState::Completed));
        assert_eq!(std::fs::read(dir.path().join("in.bin")).unwrap(), b"abcdef");
    }

    #[test]
    fn test_short_stream_is_incomplete() {
        let dir = TempDir::new().unwrap();
        let (mut bob, _) = session("bob@example.com/phone");
        let mut record = receiver_record(&dir, 100);
        let mut engine = InBandStreamEngine::new();

        let (iq, open) = open_iq(Some("ibb1"), Some("4096"));
        engine.handle_open(&mut bob, &iq, &open, Some(&mut record));
        let (iq, data) = data_iq("0", b"abc");
        engine.handle_data(&mut bob, &iq, &data, Some(&mut record));
        let close = from_alice(Iq::new(
            IqType::Set,
            "c1",
            None,
            IqPayload::IbbClose(IbbClose {
                sid: Some("ibb1".into()),
            }),
        ));
        engine.handle_close(&mut bob, &close, Some(&mut record));
        record.transition(StateEvent::Finish).unwrap();

        assert!(!record.completed());
        assert_eq!(record.error_code(), -1);
    }

    #[test]
    fn test_malformed_open_is_bad_request() {
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut engine = InBandStreamEngine::new();

        let cases = [
            (None, Some("4096")),
            (Some("ibb1"), None),
            (Some("ibb1"), Some("big")),
        ];
        for (sid, block) in cases {
            let (iq, open) = open_iq(sid, block);
            assert_eq!(engine.handle_open(&mut bob, &iq, &open, None), IbbStep::Ignored);
            assert_eq!(error_condition(&rec.take_stanzas()[0]), ErrorCondition::BadRequest);
        }
    }

    #[test]
    fn test_open_for_unknown_transfer_is_item_not_found() {
        let (mut bob, rec) = session("bob@example.com/phone");
        let (iq, open) = open_iq(Some("nope"), Some("4096"));
        InBandStreamEngine::new().handle_open(&mut bob, &iq, &open, None);
        assert_eq!(error_condition(&rec.take_stanzas()[0]), ErrorCondition::ItemNotFound);
    }

    #[test]
    fn test_open_for_socks5_transfer_is_refused() {
        let dir = TempDir::new().unwrap();
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut record = FileTransferRecord::incoming(
            "ibb1",
            jid("alice@example.com/laptop"),
            jid("bob@example.com/phone"),
            "in.bin",
            10,
        );
        record.file_path = Some(dir.path().join("in.bin"));
        record.transition(StateEvent::Accepted(StreamMethod::Socks5)).unwrap();
        let mut engine = InBandStreamEngine::new();

        let (iq, open) = open_iq(Some("ibb1"), Some("4096"));
        let step = engine.handle_open(&mut bob, &iq, &open, Some(&mut record));

        assert_eq!(step, IbbStep::Ignored);
        assert_eq!(error_condition(&rec.take_stanzas()[0]), ErrorCondition::NotAcceptable);
        assert_eq!(record.state(), TransferState::Opening);
        assert!(!engine.has_stream("ibb1"));
        assert!(!dir.path().join("in.bin").exists());
    }

    #[test]
    fn test_seq_mismatch_aborts() {
        let dir = TempDir::new().unwrap();
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut record = receiver_record(&dir, 6);
        let mut engine = InBandStreamEngine::new();

        let (iq, open) = open_iq(Some("ibb1"), Some("4096"));
        engine.handle_open(&mut bob, &iq, &open, Some(&mut record));
        rec.take_stanzas();

        let (iq, data) = data_iq("1", b"abc");
        assert_eq!(
            engine.handle_data(&mut bob, &iq, &data, Some(&mut record)),
            IbbStep::Failed(TransferErrorCode::Bytestream)
        );
        assert_eq!(error_condition(&rec.take_stanzas()[0]), ErrorCondition::UnexpectedRequest);
        assert_eq!(record.error_code(), -4);
        assert!(!engine.has_stream("ibb1"));
    }

    #[test]
    fn test_data_before_open_aborts() {
        let dir = TempDir::new().unwrap();
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut record = receiver_record(&dir, 6);

        let (iq, data) = data_iq("0", b"abc");
        assert_eq!(
            InBandStreamEngine::new().handle_data(&mut bob, &iq, &data, Some(&mut record)),
            IbbStep::Failed(TransferErrorCode::Bytestream)
        );
        assert_eq!(error_condition(&rec.take_stanzas()[0]), ErrorCondition::ItemNotFound);
    }

    #[test]
    fn test_oversized_block_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (mut bob, rec) = session("bob@example.com/phone");
        let mut record = receiver_record(&dir, 6);
        let mut engine = InBandStreamEngine::new();

        let (iq, open) = open_iq(Some("ibb1"), Some("2"));
        engine.handle_open(&mut bob, &iq, &open, Some(&mut record));
        rec.take_stanzas();

        let (iq, data) = data_iq("0", b"abc");
        engine.handle_data(&mut bob, &iq, &data, Some(&mut record));
        assert_eq!(error_condition(&rec.take_stanzas()[0]), ErrorCondition::BadRequest);
        assert_eq!(record.error_code(), -4);
    }

    #[test]
    fn test_jingle_initiator_cancels_session_when_exhausted() {
        let dir = TempDir::new().unwrap();
        let (mut alice, rec) = session("alice@example.com/laptop");
        let mut record = sender_record(&dir, b"x");
        record.session_type = SessionType::Jingle {
            initiated_by_us: true,
        };
        let mut engine = InBandStreamEngine::new();

        engine.open_stream(&mut alice, &mut record);
        let mut id = rec.take_stanzas().remove(0).id;
        engine.handle_result(&mut alice, &mut record, &id);
        id = rec.take_stanzas().remove(0).id;
        engine.handle_result(&mut alice, &mut record, &id);

        assert_eq!(*rec.jingle.lock().unwrap(), vec!["ibb1"]);
    }
}
