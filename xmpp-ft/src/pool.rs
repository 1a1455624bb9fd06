//! SOCKS5 socket pool
//!
//! The negotiation state machines never touch sockets. They ask a
//! [`SocketPool`] to listen, dial candidates, and pump file data, and learn
//! about the results through [`PoolEvent`]s fed back into the service loop.
//!
//! [`TokioSocketPool`] is the production implementation:
//!
//! - **Listener**: one TCP listener per port, accepting SOCKS5 handshakes
//!   whose destination hash was registered by an outgoing transfer. Only the
//!   first peer to authenticate with a hash is kept; later ones are refused
//! - **Candidates**: each streamhost is dialled in its own task with a
//!   connect + handshake deadline; the first success wins upstream
//! - **Proxy streams**: parked after the handshake until the proxy has
//!   confirmed activation; data written before that is refused
//! - **Data**: file bytes are copied in 64KB chunks with a progress event
//!   per chunk

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xmpp_ft_common::socks5::{self, HEAD_LEN, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH, Socks5Error};

use crate::constants::{
    HANDSHAKE_TIMEOUT, KEEPALIVE_TIME, MSG_LISTENING, STREAM_CHUNK_SIZE, WARN_LISTENER_FAILED,
};
use crate::error::{FtError, Result};
use crate::record::{ConnectionIdx, Streamhost};

/// Where file data is written to or read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannel {
    /// A peer that connected to our listener with this destination hash
    Inbound(String),
    /// A socket we dialled
    Outbound(ConnectionIdx),
}

/// Results reported back to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A dialled candidate (or proxy) completed its SOCKS5 handshake
    CandidateConnected { sid: String, idx: ConnectionIdx },
    CandidateFailed {
        sid: String,
        idx: ConnectionIdx,
        reason: String,
    },
    /// A peer authenticated on our listener
    PeerConnected { sid: String, auth_hash: String },
    Progress { sid: String, bytes: u64 },
    /// Data copy ended (EOF or expected length reached)
    Finished { sid: String },
    Failed { sid: String, reason: String },
}

pub trait SocketPool: Send {
    /// Listen on `port` and accept the given destination hash for `sid`
    fn start_listener(&mut self, port: u16, auth_hash: &str, sid: &str) -> bool;

    /// Dial every candidate; returned handles follow the order of `hosts`
    fn connect_to_hosts(
        &mut self,
        sid: &str,
        auth_hash: &str,
        hosts: &[Streamhost],
    ) -> Vec<ConnectionIdx>;

    /// Dial a proxy and park the stream until [`SocketPool::activate_proxy`]
    fn connect_to_proxy(&mut self, sid: &str, auth_hash: &str, proxy: &Streamhost)
    -> ConnectionIdx;

    /// Mark a proxy stream as activated by the proxy
    fn activate_proxy(&mut self, idx: ConnectionIdx);

    /// Copy `path` from `offset` onwards to the channel
    fn send_file(&mut self, sid: &str, channel: DataChannel, path: &Path, offset: u64);

    /// Copy up to `expected` bytes from the connection into `path` at `offset`
    fn receive_file(
        &mut self,
        sid: &str,
        idx: ConnectionIdx,
        path: &Path,
        offset: u64,
        expected: u64,
    );

    /// Drop a dialled connection and any task using it
    fn remove_receiver(&mut self, idx: ConnectionIdx);

    /// Forget a listener registration and drop its accepted stream
    fn remove_sender(&mut self, auth_hash: &str);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!("could not enable TCP keepalive: {}", e);
    }
}

// =============================================================================
// SOCKS5 handshakes
// =============================================================================

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = [0u8; HEAD_LEN];
    stream.read_exact(&mut head).await?;
    let rest = socks5::request_len(&head)?;
    let mut frame = head.to_vec();
    frame.resize(HEAD_LEN + rest, 0);
    stream.read_exact(&mut frame[HEAD_LEN..]).await?;
    Ok(frame)
}

/// Connect to a streamhost and authenticate with the destination hash
///
/// # Errors
///
/// Fails on connect errors and on any SOCKS5 framing or status error.
pub async fn socks5_connect(host: &str, port: u16, auth_hash: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((host, port)).await?;
    set_keepalive(&stream);

    stream.write_all(&socks5::greeting()).await?;
    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    socks5::parse_method_selection(&selection)?;

    stream.write_all(&socks5::connect_request(auth_hash)?).await?;
    let reply = read_frame(&mut stream).await?;
    socks5::parse_reply(&reply)?;
    Ok(stream)
}

/// Hashes registered with the listener and those already taken by a peer
#[derive(Debug, Default)]
struct Registrations {
    /// destination hash -> sid
    expected: HashMap<String, String>,
    claimed: HashSet<String>,
}

impl Registrations {
    /// Sid for `auth_hash` if it is registered and no peer holds it yet
    fn claim(&mut self, auth_hash: &str) -> Option<String> {
        let sid = self.expected.get(auth_hash)?.clone();
        self.claimed.insert(auth_hash.to_string()).then_some(sid)
    }
}

/// Serve one inbound handshake; returns the destination hash and its sid
async fn accept_handshake(
    stream: &mut TcpStream,
    registrations: &Mutex<Registrations>,
) -> Result<(String, String)> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut greeting = head.to_vec();
    greeting.resize(2 + usize::from(head[1]), 0);
    stream.read_exact(&mut greeting[2..]).await?;

    let methods = socks5::parse_greeting(&greeting)?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&socks5::method_selection(METHOD_NO_ACCEPTABLE))
            .await?;
        return Err(Socks5Error::NoAcceptableMethod.into());
    }
    stream
        .write_all(&socks5::method_selection(METHOD_NO_AUTH))
        .await?;

    let frame = read_frame(stream).await?;
    let request = socks5::parse_connect_request(&frame)?;
    let sid = lock(registrations).claim(&request.address);
    match sid {
        Some(sid) => {
            let reply = socks5::connect_reply(socks5::REPLY_SUCCEEDED, &request.address)?;
            if let Err(e) = stream.write_all(&reply).await {
                lock(registrations).claimed.remove(&request.address);
                return Err(e.into());
            }
            Ok((request.address, sid))
        }
        None => {
            stream
                .write_all(&socks5::connect_reply(
                    socks5::REPLY_GENERAL_FAILURE,
                    &request.address,
                )?)
                .await?;
            Err(Socks5Error::Rejected(socks5::REPLY_GENERAL_FAILURE).into())
        }
    }
}

// =============================================================================
// Data pumps
// =============================================================================

async fn pump_file_out(
    sid: &str,
    mut stream: TcpStream,
    path: &Path,
    offset: u64,
    events: &mpsc::UnboundedSender<PoolEvent>,
) -> Result<()> {
    let mut file = File::open(path).await?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    let mut buffer = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buffer[..n]).await?;
        let _ = events.send(PoolEvent::Progress {
            sid: sid.to_string(),
            bytes: n as u64,
        });
    }
    stream.shutdown().await?;
    Ok(())
}

async fn pump_file_in(
    sid: &str,
    mut stream: TcpStream,
    path: &Path,
    offset: u64,
    expected: u64,
    events: &mpsc::UnboundedSender<PoolEvent>,
) -> Result<()> {
    let mut file = if offset > 0 {
        let mut file = OpenOptions::new().write(true).create(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file
    } else {
        File::create(path).await?
    };
    let mut buffer = vec![0u8; STREAM_CHUNK_SIZE];
    let mut remaining = expected;
    while remaining > 0 {
        let want = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = stream.read(&mut buffer[..want]).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n]).await?;
        remaining -= n as u64;
        let _ = events.send(PoolEvent::Progress {
            sid: sid.to_string(),
            bytes: n as u64,
        });
    }
    file.flush().await?;
    Ok(())
}

fn report_end(sid: String, result: Result<()>, events: &mpsc::UnboundedSender<PoolEvent>) {
    let event = match result {
        Ok(()) => PoolEvent::Finished { sid },
        Err(e) => PoolEvent::Failed {
            sid,
            reason: e.to_string(),
        },
    };
    let _ = events.send(event);
}

// =============================================================================
// Tokio implementation
// =============================================================================

pub struct TokioSocketPool {
    events: mpsc::UnboundedSender<PoolEvent>,
    connect_timeout: Duration,
    listener_port: Option<u16>,
    listener_task: Option<JoinHandle<()>>,
    registrations: Arc<Mutex<Registrations>>,
    /// authenticated inbound streams by destination hash
    inbound: Arc<Mutex<HashMap<String, TcpStream>>>,
    /// connected outbound streams
    outbound: Arc<Mutex<HashMap<ConnectionIdx, TcpStream>>>,
    /// proxy connections, and whether they are activated
    proxies: HashMap<ConnectionIdx, bool>,
    connection_tasks: HashMap<ConnectionIdx, JoinHandle<()>>,
    sender_tasks: HashMap<String, JoinHandle<()>>,
    next_idx: ConnectionIdx,
}

impl TokioSocketPool {
    pub fn new(events: mpsc::UnboundedSender<PoolEvent>, connect_timeout: Duration) -> Self {
        Self {
            events,
            connect_timeout,
            listener_port: None,
            listener_task: None,
            registrations: Arc::default(),
            inbound: Arc::new(Mutex::new(HashMap::new())),
            outbound: Arc::new(Mutex::new(HashMap::new())),
            proxies: HashMap::new(),
            connection_tasks: HashMap::new(),
            sender_tasks: HashMap::new(),
            next_idx: 1,
        }
    }

    /// Port the listener is bound to, if any
    pub fn listener_port(&self) -> Option<u16> {
        self.listener_port
    }

    fn bind(&mut self, port: u16) -> Result<()> {
        let std_listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let bound = listener.local_addr()?.port();
        info!("{}{}", MSG_LISTENING, bound);

        let registrations = Arc::clone(&self.registrations);
        let inbound = Arc::clone(&self.inbound);
        let events = self.events.clone();
        self.listener_task = Some(tokio::spawn(async move {
            accept_loop(listener, registrations, inbound, events).await;
        }));
        self.listener_port = Some(port);
        Ok(())
    }

    fn dial(&mut self, sid: &str, auth_hash: &str, host: &Streamhost) -> ConnectionIdx {
        let idx = self.next_idx;
        self.next_idx += 1;

        let sid = sid.to_string();
        let auth_hash = auth_hash.to_string();
        let address = host.host.clone();
        let port = host.port;
        let deadline = self.connect_timeout;
        let outbound = Arc::clone(&self.outbound);
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let attempt =
                tokio::time::timeout(deadline, socks5_connect(&address, port, &auth_hash)).await;
            let event = match attempt {
                Ok(Ok(stream)) => {
                    lock(&outbound).insert(idx, stream);
                    PoolEvent::CandidateConnected { sid, idx }
                }
                Ok(Err(e)) => PoolEvent::CandidateFailed {
                    sid,
                    idx,
                    reason: e.to_string(),
                },
                Err(e) => PoolEvent::CandidateFailed {
                    sid,
                    idx,
                    reason: FtError::from(e).to_string(),
                },
            };
            let _ = events.send(event);
        });
        self.connection_tasks.insert(idx, task);
        idx
    }

    fn take_outbound(&mut self, idx: ConnectionIdx) -> Option<TcpStream> {
        lock(&self.outbound).remove(&idx)
    }
}

async fn accept_loop(
    listener: TcpListener,
    registrations: Arc<Mutex<Registrations>>,
    inbound: Arc<Mutex<HashMap<String, TcpStream>>>,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("SOCKS5 accept failed: {}", e);
                continue;
            }
        };
        set_keepalive(&stream);
        let registrations = Arc::clone(&registrations);
        let inbound = Arc::clone(&inbound);
        let events = events.clone();
        tokio::spawn(async move {
            let handshake = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                accept_handshake(&mut stream, &registrations),
            )
            .await;
            match handshake {
                Ok(Ok((auth_hash, sid))) => {
                    debug!(%peer, %sid, "peer authenticated on listener");
                    lock(&inbound).insert(auth_hash.clone(), stream);
                    let _ = events.send(PoolEvent::PeerConnected { sid, auth_hash });
                }
                Ok(Err(e)) => debug!(%peer, "rejected SOCKS5 handshake: {}", e),
                Err(_) => debug!(%peer, "SOCKS5 handshake timed out"),
            }
        });
    }
}

impl SocketPool for TokioSocketPool {
    fn start_listener(&mut self, port: u16, auth_hash: &str, sid: &str) -> bool {
        if self.listener_port != Some(port) {
            if let Some(task) = self.listener_task.take() {
                task.abort();
            }
            if let Err(e) = self.bind(port) {
                warn!("{}{}", WARN_LISTENER_FAILED, e);
                self.listener_port = None;
                return false;
            }
        }
        lock(&self.registrations)
            .expected
            .insert(auth_hash.to_string(), sid.to_string());
        true
    }

    fn connect_to_hosts(
        &mut self,
        sid: &str,
        auth_hash: &str,
        hosts: &[Streamhost],
    ) -> Vec<ConnectionIdx> {
        hosts
            .iter()
            .map(|host| self.dial(sid, auth_hash, host))
            .collect()
    }

    fn connect_to_proxy(
        &mut self,
        sid: &str,
        auth_hash: &str,
        proxy: &Streamhost,
    ) -> ConnectionIdx {
        let idx = self.dial(sid, auth_hash, proxy);
        self.proxies.insert(idx, false);
        idx
    }

    fn activate_proxy(&mut self, idx: ConnectionIdx) {
        if let Some(activated) = self.proxies.get_mut(&idx) {
            *activated = true;
        }
    }

    fn send_file(&mut self, sid: &str, channel: DataChannel, path: &Path, offset: u64) {
        let (stream, key) = match &channel {
            DataChannel::Inbound(auth_hash) => {
                (lock(&self.inbound).remove(auth_hash), auth_hash.clone())
            }
            DataChannel::Outbound(idx) => {
                if self.proxies.get(idx) == Some(&false) {
                    warn!(%sid, "refusing to write to a proxy before activation");
                    let _ = self.events.send(PoolEvent::Failed {
                        sid: sid.to_string(),
                        reason: "proxy not activated".to_string(),
                    });
                    return;
                }
                (self.take_outbound(*idx), sid.to_string())
            }
        };
        let Some(stream) = stream else {
            let _ = self.events.send(PoolEvent::Failed {
                sid: sid.to_string(),
                reason: "no connected stream".to_string(),
            });
            return;
        };

        let sid = sid.to_string();
        let path: PathBuf = path.to_path_buf();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = pump_file_out(&sid, stream, &path, offset, &events).await;
            report_end(sid, result, &events);
        });
        match channel {
            DataChannel::Inbound(_) => {
                self.sender_tasks.insert(key, task);
            }
            DataChannel::Outbound(idx) => {
                self.connection_tasks.insert(idx, task);
            }
        }
    }

    fn receive_file(
        &mut self,
        sid: &str,
        idx: ConnectionIdx,
        path: &Path,
        offset: u64,
        expected: u64,
    ) {
        let Some(stream) = self.take_outbound(idx) else {
            let _ = self.events.send(PoolEvent::Failed {
                sid: sid.to_string(),
                reason: "no connected stream".to_string(),
            });
            return;
        };
        let sid = sid.to_string();
        let path = path.to_path_buf();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = pump_file_in(&sid, stream, &path, offset, expected, &events).await;
            report_end(sid, result, &events);
        });
        self.connection_tasks.insert(idx, task);
    }

    fn remove_receiver(&mut self, idx: ConnectionIdx) {
        if let Some(task) = self.connection_tasks.remove(&idx) {
            task.abort();
        }
        self.proxies.remove(&idx);
        drop(self.take_outbound(idx));
    }

    fn remove_sender(&mut self, auth_hash: &str) {
        {
            let mut registrations = lock(&self.registrations);
            registrations.expected.remove(auth_hash);
            registrations.claimed.remove(auth_hash);
        }
        drop(lock(&self.inbound).remove(auth_hash));
        if let Some(task) = self.sender_tasks.remove(auth_hash) {
            task.abort();
        }
    }
}

impl Drop for TokioSocketPool {
    fn drop(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
        for (_, task) in self.connection_tasks.drain() {
            task.abort();
        }
        for (_, task) in self.sender_tasks.drain() {
            task.abort();
        }
    }
}
