//! Live state of one file transfer
//!
//! A [`FileTransferRecord`] is created when an offer is sent or received and
//! lives in the controller's registry until the transfer completes, fails or
//! is cancelled. Lifecycle flags are derived from a single [`TransferState`]
//! that only changes through [`FileTransferRecord::transition`].
//!
//! ```text
//! Negotiating --Accepted--> Opening --ChannelReady--> Streaming --Close--> Closing
//!                                                         |                  |
//!                                                         +------Finish------+--> Completed
//!                                                                                 | Failed(Incomplete)
//! any non-terminal --Stop--> Stopped
//! any non-terminal --Fail(code)--> Failed(code)
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use xmpp_ft_common::{Jid, NS_BYTESTREAM, NS_IBB, TransferErrorCode};

/// Handle for one outbound socket in the socket pool
pub type ConnectionIdx = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    /// Negotiated with stream initiation
    FileTransfer,
    /// Negotiated by a Jingle session, which must be told when the stream ends
    Jingle { initiated_by_us: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamMethod {
    Socks5,
    Ibb,
}

impl StreamMethod {
    #[must_use]
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Socks5 => NS_BYTESTREAM,
            Self::Ibb => NS_IBB,
        }
    }

    #[must_use]
    pub fn from_namespace(ns: &str) -> Option<Self> {
        match ns {
            NS_BYTESTREAM => Some(Self::Socks5),
            NS_IBB => Some(Self::Ibb),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Pending,
    Connected,
    Failed,
}

/// A SOCKS5 candidate, either offered by us or by the peer
#[derive(Debug, Clone, PartialEq)]
pub struct Streamhost {
    pub jid: Jid,
    pub host: String,
    pub port: u16,
    pub initiator: Jid,
    pub target: Jid,
    /// Id of the IQ that carried the offer, reused for `streamhost-used`
    pub request_id: String,
    pub state: HostState,
    pub idx: Option<ConnectionIdx>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Negotiating,
    Opening,
    Streaming,
    Closing,
    Completed,
    Stopped,
    Failed(TransferErrorCode),
}

impl TransferState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// A stream method was agreed on
    Accepted(StreamMethod),
    /// The bytestream is usable
    ChannelReady,
    /// Bytes moved over the stream
    Transferred(u64),
    Pause,
    Resume,
    /// Close was sent or received, final bookkeeping pending
    Close,
    /// Stream ended; completeness decides the terminal state
    Finish,
    /// Cancelled locally
    Stop,
    Fail(TransferErrorCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: TransferState,
    pub event: StateEvent,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} is not valid in state {:?}", self.event, self.from)
    }
}

impl std::error::Error for IllegalTransition {}

#[derive(Debug, Clone)]
pub struct FileTransferRecord {
    /// Negotiation id
    pub sid: String,
    /// Bytestream id, equal to `sid` for SI transfers
    pub transport_sid: String,
    pub direction: Direction,
    pub session_type: SessionType,
    pub sender: Jid,
    pub receiver: Jid,

    pub name: String,
    pub size: u64,
    pub desc: Option<String>,
    pub mime_type: Option<String>,
    pub date: Option<String>,
    /// Advertised content hash
    pub hash: Option<String>,
    pub algo: Option<String>,
    /// Source file for sends, destination for receives
    pub file_path: Option<PathBuf>,
    /// Resume offset agreed through `<range/>`
    pub offset: u64,
    pub length: Option<u64>,

    /// Methods the peer advertised in its offer
    pub stream_methods: Vec<String>,
    pub method: Option<StreamMethod>,

    /// Id of our streamhost offer IQ
    pub request_id: Option<String>,
    /// SOCKS5 destination hash, registered with the listener while sending
    pub auth_hash: Option<String>,
    pub streamhosts: Vec<Streamhost>,
    pub proxyhosts: Vec<Streamhost>,
    pub is_a_proxy: bool,
    pub proxy_sender: Option<Jid>,
    pub proxy_receiver: Option<Jid>,

    /// Bytes moved so far (received, or sent for outgoing transfers)
    pub received_len: u64,
    /// `(elapsed, received_len)` after each chunk
    pub samples: Vec<(Duration, u64)>,

    used_streamhost: Option<Streamhost>,
    state: TransferState,
    paused: bool,
    started_at: Option<Instant>,
}

impl FileTransferRecord {
    fn new(
        sid: &str,
        direction: Direction,
        sender: Jid,
        receiver: Jid,
        name: &str,
        size: u64,
    ) -> Self {
        Self {
            sid: sid.to_string(),
            transport_sid: sid.to_string(),
            direction,
            session_type: SessionType::FileTransfer,
            sender,
            receiver,
            name: name.to_string(),
            size,
            desc: None,
            mime_type: None,
            date: None,
            hash: None,
            algo: None,
            file_path: None,
            offset: 0,
            length: None,
            stream_methods: Vec::new(),
            method: None,
            request_id: None,
            auth_hash: None,
            streamhosts: Vec::new(),
            proxyhosts: Vec::new(),
            is_a_proxy: false,
            proxy_sender: None,
            proxy_receiver: None,
            received_len: 0,
            samples: Vec::new(),
            used_streamhost: None,
            state: TransferState::Negotiating,
            paused: false,
            started_at: None,
        }
    }

    /// A file we are about to offer
    #[must_use]
    pub fn outgoing(sid: &str, sender: Jid, receiver: Jid, path: PathBuf, size: u64) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut record = Self::new(sid, Direction::Send, sender, receiver, &name, size);
        record.file_path = Some(path);
        record
    }

    /// A file a peer offered us
    #[must_use]
    pub fn incoming(sid: &str, sender: Jid, receiver: Jid, name: &str, size: u64) -> Self {
        Self::new(sid, Direction::Receive, sender, receiver, name, size)
    }

    /// The other party of the transfer
    #[must_use]
    pub fn peer(&self) -> &Jid {
        match self.direction {
            Direction::Send => &self.receiver,
            Direction::Receive => &self.sender,
        }
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Bytes the stream must carry for the transfer to be complete
    #[must_use]
    pub fn expected_len(&self) -> u64 {
        self.length
            .unwrap_or_else(|| self.size.saturating_sub(self.offset))
    }

    /// Apply a lifecycle event
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` and leaves the record untouched when the
    /// event makes no sense in the current state.
    pub fn transition(&mut self, event: StateEvent) -> Result<TransferState, IllegalTransition> {
        use TransferState::*;

        let next = match (self.state, event) {
            (Negotiating, StateEvent::Accepted(method)) => {
                self.method = Some(method);
                Opening
            }
            (Opening, StateEvent::ChannelReady) => {
                self.started_at.get_or_insert_with(Instant::now);
                Streaming
            }
            (Streaming, StateEvent::Transferred(bytes)) => {
                self.received_len = self.received_len.saturating_add(bytes);
                let elapsed = self.started_at.map(|t| t.elapsed()).unwrap_or_default();
                self.samples.push((elapsed, self.received_len));
                Streaming
            }
            (Streaming, StateEvent::Pause) => {
                self.paused = true;
                Streaming
            }
            (Streaming, StateEvent::Resume) => {
                self.paused = false;
                Streaming
            }
            (Opening | Streaming, StateEvent::Close) => Closing,
            (Streaming | Closing, StateEvent::Finish) => {
                if self.received_len >= self.expected_len() {
                    Completed
                } else {
                    Failed(TransferErrorCode::Incomplete)
                }
            }
            (state, StateEvent::Stop) if !state.is_terminal() => Stopped,
            (state, StateEvent::Fail(code)) if !state.is_terminal() => Failed(code),
            (from, event) => return Err(IllegalTransition { from, event }),
        };
        self.state = next;
        Ok(next)
    }

    #[must_use]
    pub fn connected(&self) -> bool {
        matches!(self.state, TransferState::Streaming | TransferState::Closing)
    }

    #[must_use]
    pub fn started(&self) -> bool {
        self.started_at.is_some()
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        self.state == TransferState::Completed
    }

    #[must_use]
    pub fn error(&self) -> Option<TransferErrorCode> {
        match self.state {
            TransferState::Failed(code) => Some(code),
            _ => None,
        }
    }

    /// Numeric error, 0 when none
    #[must_use]
    pub fn error_code(&self) -> i32 {
        self.error().map_or(0, TransferErrorCode::code)
    }

    /// Streaming and paused by the user
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused && self.state == TransferState::Streaming
    }

    /// Bytes are flowing right now
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransferState::Streaming && !self.paused
    }

    /// Completed, failed or cancelled
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.is_terminal()
    }

    // -------------------------------------------------------------------------
    // SOCKS5 candidate selection
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn streamhost_used(&self) -> bool {
        self.used_streamhost.is_some()
    }

    #[must_use]
    pub fn used_streamhost(&self) -> Option<&Streamhost> {
        self.used_streamhost.as_ref()
    }

    /// Record the winning candidate; only the first call takes effect
    pub fn mark_streamhost_used(&mut self, host: Streamhost) -> bool {
        if self.used_streamhost.is_some() {
            return false;
        }
        self.used_streamhost = Some(host);
        true
    }

    /// Forget all candidates once the transfer is torn down
    pub fn clear_candidates(&mut self) {
        self.streamhosts.clear();
        self.proxyhosts.clear();
        self.proxy_sender = None;
        self.proxy_receiver = None;
    }

    #[must_use]
    pub fn is_jingle(&self) -> bool {
        matches!(self.session_type, SessionType::Jingle { .. })
    }
}
