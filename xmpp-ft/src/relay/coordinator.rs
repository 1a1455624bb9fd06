//! SOCKS5 bytestream negotiation
//!
//! ## Sender
//!
//! 1. Register the destination hash with the local listener
//! 2. Gather candidates; if UPnP applies, park the offer until the mapping
//!    attempt returns
//! 3. Send every candidate in one `<query/>`
//! 4. On `streamhost-used`: stream straight to the peer that authenticated on
//!    our listener, or dial the proxy, send `<activate/>`, and only write once
//!    the proxy acknowledged it
//!
//! ## Receiver
//!
//! 1. Dial every offered candidate at once, but only for an accepted
//!    SOCKS5 transfer that has no channel yet
//! 2. The first candidate to finish the handshake wins; later successes are
//!    dropped
//! 3. Answer the offer with `streamhost-used` and start reading
//! 4. If every candidate failed, the controller reports 404

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info, warn};
use xmpp_ft_common::events::TransferEvent;
use xmpp_ft_common::socks5::destination_hash;
use xmpp_ft_common::stanza::{BytestreamQuery, Iq, IqPayload, IqType};
use xmpp_ft_common::{Jid, TransferErrorCode};

use super::candidates::{CandidatePlan, build_candidates, is_private_ipv4, local_addresses};
use crate::constants::{
    ACTIVATE_ID_PREFIX, STREAMHOST_ID_PREFIX, WARN_NO_LOCAL_IPS, WARN_UPNP_FAILED,
    WARN_UPNP_TIMEOUT,
};
use crate::pool::DataChannel;
use crate::record::{
    ConnectionIdx, Direction, FileTransferRecord, HostState, StateEvent, StreamMethod, Streamhost,
    TransferState,
};
use crate::session::{AccountSession, BackgroundRequest};
use crate::upnp::{UpnpOutcome, get_local_ipv4};

/// Result of starting a streamhost offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStep {
    Sent,
    /// Waiting for the UPnP mapping before sending
    AwaitingUpnp,
    /// The listener could not be started; the record is failed
    ListenerFailed,
}

/// Result of handling a peer's streamhost list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamhostsStep {
    Connecting,
    /// Nothing usable in the offer
    NoCandidates,
    /// The transfer is not waiting for a SOCKS5 channel
    Refused,
}

/// Result of a dialled connection finishing or failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStep {
    /// This candidate won and data is flowing
    Selected,
    /// Another candidate already won; this one was closed
    Discarded,
    /// Still waiting on other candidates
    Pending,
    /// Every candidate failed
    AllFailed,
    /// Connected to the proxy, activation requested
    ActivationSent,
    ProxyFailed,
    /// The record cannot take a channel any more; the connection was closed
    ChannelFailed,
    Ignored,
}

/// Result of the peer naming the candidate it used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsedStep {
    /// Streaming to the peer connected to our listener
    Direct,
    /// Dialling the proxy the peer chose
    ProxyConnecting,
    /// Not a candidate we offered
    Unknown,
    /// The data channel could not be started
    ChannelFailed,
    Ignored,
}

#[derive(Debug)]
struct PendingOffer {
    local_ips: Vec<IpAddr>,
    proxies: Vec<Streamhost>,
}

#[derive(Debug, Default)]
pub struct SocksRelayCoordinator {
    /// Offers parked until UPnP answers, by sid
    pending: HashMap<String, PendingOffer>,
}

impl SocksRelayCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an offer for `sid` is waiting on UPnP
    pub fn is_awaiting_upnp(&self, sid: &str) -> bool {
        self.pending.contains_key(sid)
    }

    /// Drop state kept for a transfer
    pub fn forget(&mut self, sid: &str) {
        self.pending.remove(sid);
    }

    // =========================================================================
    // Sender
    // =========================================================================

    /// Start the listener and offer our candidates to the receiver
    pub fn offer_streamhosts(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
    ) -> OfferStep {
        let auth_hash = destination_hash(&record.transport_sid, &record.sender, &record.receiver);
        let port = session.config().file_transfers_port;

        if !session
            .pool()
            .start_listener(port, &auth_hash, &record.transport_sid)
        {
            warn!(sid = %record.sid, port, "listener unavailable, failing transfer");
            let _ = record.transition(StateEvent::Fail(TransferErrorCode::Listener));
            return OfferStep::ListenerFailed;
        }

        let request_id = format!("{}{}", STREAMHOST_ID_PREFIX, record.transport_sid);
        record.auth_hash = Some(auth_hash);
        record.request_id = Some(request_id.clone());

        let local_ips = if session.config().send_local_ips {
            match local_addresses(session.local_ip()) {
                Ok(ips) => ips,
                Err(e) => {
                    warn!(sid = %record.sid, "{}{}", WARN_NO_LOCAL_IPS, e);
                    session.emit(TransferEvent::Information {
                        message: format!("{}{}", WARN_NO_LOCAL_IPS, e),
                    });
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let proxies = if session.config().use_ft_proxies {
            let configured = session.config().proxies.clone();
            session.proxies().streamhosts(
                &configured,
                &record.sender,
                &record.receiver,
                &request_id,
            )
        } else {
            Vec::new()
        };
        if !proxies.is_empty() {
            record.proxy_sender = Some(record.sender.clone());
            record.proxy_receiver = Some(record.receiver.clone());
        }
        record.proxyhosts = proxies.clone();

        if session.upnp_enabled()
            && let Some(local_ip) = upnp_candidate_ip(session.local_ip())
        {
            debug!(sid = %record.sid, %local_ip, "requesting UPnP mapping");
            self.pending
                .insert(record.sid.clone(), PendingOffer { local_ips, proxies });
            session.request(BackgroundRequest::MapPort {
                sid: record.sid.clone(),
                local_ip,
                port,
            });
            return OfferStep::AwaitingUpnp;
        }

        send_offer(session, record, &local_ips, None, &proxies);
        OfferStep::Sent
    }

    /// Finish an offer parked on UPnP; returns whether it was sent
    pub fn complete_upnp(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        outcome: &UpnpOutcome,
    ) -> bool {
        let Some(offer) = self.pending.remove(&record.sid) else {
            return false;
        };

        let external = match outcome {
            UpnpOutcome::Mapped(addr) => {
                info!(sid = %record.sid, %addr, "UPnP mapping added");
                Some(*addr)
            }
            UpnpOutcome::Failed(e) => {
                warn!(sid = %record.sid, "{}{}", WARN_UPNP_FAILED, e);
                None
            }
            UpnpOutcome::TimedOut => {
                warn!(account = %session.account(), "{}", WARN_UPNP_TIMEOUT);
                session.disable_upnp();
                None
            }
        };

        if record.is_stopped() {
            return false;
        }
        send_offer(session, record, &offer.local_ips, external, &offer.proxies);
        true
    }

    /// The receiver named the candidate it connected to
    pub fn handle_streamhost_used(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        used: &str,
    ) -> UsedStep {
        if record.streamhost_used() || record.state() != TransferState::Opening {
            debug!(sid = %record.sid, state = ?record.state(), "ignoring late streamhost-used");
            return UsedStep::Ignored;
        }
        let Ok(used_jid) = Jid::parse(used) else {
            return UsedStep::Unknown;
        };

        if let Some(proxy) = record.proxyhosts.iter().find(|p| p.jid == used_jid).cloned() {
            let Some(auth_hash) = record.auth_hash.clone() else {
                return UsedStep::Unknown;
            };
            info!(sid = %record.sid, proxy = %proxy.jid, "peer chose proxy");
            let idx = session
                .pool()
                .connect_to_proxy(&record.transport_sid, &auth_hash, &proxy);
            let mut proxy = proxy;
            proxy.idx = Some(idx);
            record.is_a_proxy = true;
            record.mark_streamhost_used(proxy);
            return UsedStep::ProxyConnecting;
        }

        if used_jid != record.sender {
            warn!(sid = %record.sid, used = %used_jid, "peer used a streamhost we never offered");
            return UsedStep::Unknown;
        }

        let Some(auth_hash) = record.auth_hash.clone() else {
            return UsedStep::Unknown;
        };
        record.mark_streamhost_used(Streamhost {
            jid: used_jid,
            host: String::new(),
            port: session.config().file_transfers_port,
            initiator: record.sender.clone(),
            target: record.receiver.clone(),
            request_id: record.request_id.clone().unwrap_or_default(),
            state: HostState::Connected,
            idx: None,
        });
        if !start_sending(session, record, DataChannel::Inbound(auth_hash)) {
            return UsedStep::ChannelFailed;
        }
        UsedStep::Direct
    }

    /// The proxy acknowledged `<activate/>`; data may flow now
    pub fn handle_activation_result(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
    ) -> bool {
        let Some(idx) = record
            .used_streamhost()
            .filter(|_| record.is_a_proxy && record.state() == TransferState::Opening)
            .and_then(|host| host.idx)
        else {
            return false;
        };
        info!(sid = %record.sid, "proxy activated");
        session.pool().activate_proxy(idx);
        start_sending(session, record, DataChannel::Outbound(idx))
    }

    // =========================================================================
    // Receiver
    // =========================================================================

    /// Dial the candidates a sender offered
    ///
    /// Only an accepted SOCKS5 transfer still in `Opening` takes an offer;
    /// anything else is [`StreamhostsStep::Refused`] without dialling.
    pub fn handle_streamhosts(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        iq: &Iq,
        query: &BytestreamQuery,
    ) -> StreamhostsStep {
        if record.streamhost_used()
            || record.state() != TransferState::Opening
            || record.method != Some(StreamMethod::Socks5)
        {
            debug!(
                sid = %record.sid,
                state = ?record.state(),
                method = ?record.method,
                "refusing streamhosts"
            );
            return StreamhostsStep::Refused;
        }
        let initiator = iq.from.clone().unwrap_or_else(|| record.sender.clone());
        let target = iq.to.clone().unwrap_or_else(|| session.jid().clone());

        record.streamhosts = query
            .streamhosts
            .iter()
            .filter_map(|entry| {
                let jid = Jid::parse(entry.jid.as_deref()?).ok()?;
                let host = entry.host.clone().filter(|h| !h.is_empty())?;
                let port = entry.port.as_deref()?.parse().ok()?;
                Some(Streamhost {
                    jid,
                    host,
                    port,
                    initiator: initiator.clone(),
                    target: target.clone(),
                    request_id: iq.id.clone(),
                    state: HostState::Pending,
                    idx: None,
                })
            })
            .collect();
        record.request_id = Some(iq.id.clone());

        if record.streamhosts.is_empty() {
            warn!(sid = %record.sid, "streamhost offer without usable candidates");
            return StreamhostsStep::NoCandidates;
        }

        let auth_hash = destination_hash(&record.transport_sid, &initiator, &target);
        let handles = session.pool().connect_to_hosts(
            &record.transport_sid,
            &auth_hash,
            &record.streamhosts,
        );
        for (host, idx) in record.streamhosts.iter_mut().zip(handles) {
            host.idx = Some(idx);
        }
        debug!(sid = %record.sid, count = record.streamhosts.len(), "dialling streamhosts");
        StreamhostsStep::Connecting
    }

    /// A dialled connection finished its SOCKS5 handshake
    pub fn on_candidate_connected(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        idx: ConnectionIdx,
    ) -> CandidateStep {
        if record.direction == Direction::Send {
            return self.on_proxy_connected(session, record, idx);
        }

        let Some(pos) = record.streamhosts.iter().position(|h| h.idx == Some(idx)) else {
            // losing candidates are closed when the winner is picked
            if record.streamhost_used() {
                debug!(sid = %record.sid, idx, "late candidate already closed");
                return CandidateStep::Discarded;
            }
            return CandidateStep::Ignored;
        };
        let close = |session: &mut AccountSession, record: &mut FileTransferRecord| {
            record.streamhosts[pos].state = HostState::Failed;
            record.streamhosts[pos].idx = None;
            session.pool().remove_receiver(idx);
        };
        if record.streamhost_used() || record.is_stopped() {
            debug!(sid = %record.sid, idx, "late candidate, closing");
            close(session, record);
            return CandidateStep::Discarded;
        }
        let Some(path) = record
            .file_path
            .clone()
            .filter(|_| record.state() == TransferState::Opening)
        else {
            warn!(sid = %record.sid, state = ?record.state(), "no channel to start");
            close(session, record);
            return CandidateStep::ChannelFailed;
        };
        if let Err(e) = record.transition(StateEvent::ChannelReady) {
            warn!(sid = %record.sid, "{}", e);
            close(session, record);
            return CandidateStep::ChannelFailed;
        }

        record.streamhosts[pos].state = HostState::Connected;
        let winner = record.streamhosts[pos].clone();
        record.mark_streamhost_used(winner.clone());
        info!(sid = %record.sid, host = %winner.host, port = winner.port, "streamhost selected");

        for host in &mut record.streamhosts {
            if host.idx != Some(idx) && host.state == HostState::Pending {
                host.state = HostState::Failed;
                if let Some(other) = host.idx.take() {
                    session.pool().remove_receiver(other);
                }
            }
        }

        session.send(Iq::new(
            IqType::Result,
            winner.request_id.clone(),
            Some(winner.initiator.clone()),
            IqPayload::Bytestream(BytestreamQuery {
                sid: Some(record.transport_sid.clone()),
                streamhost_used: Some(winner.jid.to_string()),
                ..Default::default()
            }),
        ));

        let expected = record.expected_len();
        session
            .pool()
            .receive_file(&record.transport_sid, idx, &path, record.offset, expected);
        CandidateStep::Selected
    }

    fn on_proxy_connected(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        idx: ConnectionIdx,
    ) -> CandidateStep {
        let Some(proxy) = record
            .used_streamhost()
            .filter(|h| record.is_a_proxy && h.idx == Some(idx))
            .cloned()
        else {
            return CandidateStep::Ignored;
        };
        debug!(sid = %record.sid, proxy = %proxy.jid, "connected to proxy, activating");
        session.send(Iq::new(
            IqType::Set,
            format!("{}{}", ACTIVATE_ID_PREFIX, record.transport_sid),
            Some(proxy.jid),
            IqPayload::Bytestream(BytestreamQuery {
                sid: Some(record.transport_sid.clone()),
                activate: Some(record.receiver.to_string()),
                ..Default::default()
            }),
        ));
        CandidateStep::ActivationSent
    }

    /// A dialled connection failed
    pub fn on_candidate_failed(
        &mut self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        idx: ConnectionIdx,
    ) -> CandidateStep {
        if record.direction == Direction::Send {
            let is_proxy = record
                .used_streamhost()
                .is_some_and(|h| record.is_a_proxy && h.idx == Some(idx));
            if !is_proxy {
                return CandidateStep::Ignored;
            }
            if let Some(proxy) = record.used_streamhost().map(|h| h.jid.clone()) {
                session.proxies_mut().invalidate(&proxy);
            }
            session.pool().remove_receiver(idx);
            return CandidateStep::ProxyFailed;
        }

        let Some(host) = record.streamhosts.iter_mut().find(|h| h.idx == Some(idx)) else {
            return CandidateStep::Ignored;
        };
        host.state = HostState::Failed;
        host.idx = None;
        debug!(sid = %record.sid, host = %host.host, port = host.port, "candidate failed");
        session.pool().remove_receiver(idx);

        if record.streamhost_used() {
            return CandidateStep::Discarded;
        }
        if record
            .streamhosts
            .iter()
            .all(|h| h.state == HostState::Failed)
        {
            warn!(sid = %record.sid, "all streamhosts failed");
            return CandidateStep::AllFailed;
        }
        CandidateStep::Pending
    }
}

/// Local address to map through UPnP, if the connection is from a private one
fn upnp_candidate_ip(connection_ip: Option<IpAddr>) -> Option<std::net::Ipv4Addr> {
    let ip = match connection_ip {
        Some(IpAddr::V4(ip)) => ip,
        Some(IpAddr::V6(_)) => return None,
        None => get_local_ipv4().ok()?,
    };
    is_private_ipv4(ip).then_some(ip)
}

fn send_offer(
    session: &mut AccountSession,
    record: &FileTransferRecord,
    local_ips: &[IpAddr],
    upnp: Option<SocketAddr>,
    proxies: &[Streamhost],
) {
    let additional = session.config().additional_hosts.clone();
    let entries = build_candidates(&CandidatePlan {
        sender: &record.sender,
        port: session.config().file_transfers_port,
        additional_hosts: &additional,
        local_ips,
        upnp,
        proxies,
    });
    info!(
        sid = %record.sid,
        peer = %record.receiver,
        candidates = entries.len(),
        "offering streamhosts"
    );

    let id = record.request_id.clone().unwrap_or_default();
    session.send(Iq::new(
        IqType::Set,
        id,
        Some(record.receiver.clone()),
        IqPayload::Bytestream(BytestreamQuery {
            sid: Some(record.transport_sid.clone()),
            streamhosts: entries,
            ..Default::default()
        }),
    ));
}

/// Start writing the file; false if the record cannot take a channel
fn start_sending(
    session: &mut AccountSession,
    record: &mut FileTransferRecord,
    channel: DataChannel,
) -> bool {
    let Some(path) = record.file_path.clone() else {
        return false;
    };
    if let Err(e) = record.transition(StateEvent::ChannelReady) {
        warn!(sid = %record.sid, "{}", e);
        return false;
    }
    session
        .pool()
        .send_file(&record.transport_sid, channel, &path, record.offset);
    true
}
