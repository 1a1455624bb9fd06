//! Stream initiation for the file-transfer profile
//!
//! The sender offers a file and the stream methods it supports in one SI
//! `set`. The receiver either answers with the chosen method in a submitted
//! form, or with an error:
//!
//! | Situation                | Condition     | SI condition       |
//! |--------------------------|---------------|--------------------|
//! | user declined            | `forbidden`   |                    |
//! | not the file profile     | `bad-request` | `bad-profile`      |
//! | no method we support     | `bad-request` | `no-valid-streams` |
//!
//! Offers missing the `<file/>` or `<feature/>` elements, or with unusable
//! identifiers, are dropped without an answer.

use tracing::{debug, info, warn};
use xmpp_ft_common::events::TransferEvent;
use xmpp_ft_common::stanza::{
    DataForm, ErrorCondition, ErrorType, FileDescription, Iq, IqPayload, IqType, Range, Si,
    SiCondition, StanzaError,
};
use xmpp_ft_common::validators::{validate_file_name, validate_sid};
use xmpp_ft_common::{NS_BYTESTREAM, NS_FILE, NS_IBB, STREAM_METHOD_FIELD, TransferErrorCode};

use crate::constants::TEXT_OFFER_DECLINED;
use crate::record::{FileTransferRecord, StateEvent, StreamMethod};
use crate::session::AccountSession;

/// Outcome of checking a received offer
#[derive(Debug)]
pub enum OfferCheck {
    /// A well-formed offer; the record awaits the user's decision
    Valid(Box<FileTransferRecord>),
    /// Refused with an error reply
    Rejected(SiCondition),
    /// Malformed, dropped without a reply
    Dropped,
}

/// Why an offer is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Declined,
    BadProfile,
    NoValidStreams,
}

impl RejectReason {
    fn error(self) -> StanzaError {
        match self {
            Self::Declined => StanzaError::new(ErrorType::Cancel, ErrorCondition::Forbidden)
                .with_code(403)
                .with_text(TEXT_OFFER_DECLINED),
            Self::BadProfile => StanzaError::new(ErrorType::Modify, ErrorCondition::BadRequest)
                .with_code(400)
                .with_si_condition(SiCondition::BadProfile),
            Self::NoValidStreams => StanzaError::new(ErrorType::Cancel, ErrorCondition::BadRequest)
                .with_code(400)
                .with_si_condition(SiCondition::NoValidStreams),
        }
    }
}

/// Methods we can run, most preferred first
const SUPPORTED_METHODS: [StreamMethod; 2] = [StreamMethod::Socks5, StreamMethod::Ibb];

#[derive(Debug, Default)]
pub struct StreamNegotiator;

impl StreamNegotiator {
    pub fn new() -> Self {
        Self
    }

    // =========================================================================
    // Sender
    // =========================================================================

    /// Send the SI offer for an outgoing record; the IQ id is the sid
    pub fn propose(&self, session: &mut AccountSession, record: &FileTransferRecord) -> bool {
        let si = Si {
            id: Some(record.sid.clone()),
            profile: Some(NS_FILE.to_string()),
            mime_type: record.mime_type.clone(),
            file: Some(FileDescription {
                name: Some(record.name.clone()),
                size: Some(record.size),
                hash: record.hash.clone(),
                date: record.date.clone(),
                desc: record.desc.clone(),
                range: Some(Range::default()),
            }),
            feature: Some(DataForm::list_single(
                STREAM_METHOD_FIELD,
                &[NS_BYTESTREAM, NS_IBB],
            )),
        };
        info!(sid = %record.sid, peer = %record.receiver, name = %record.name, "offering file");
        session.send(Iq::new(
            IqType::Set,
            record.sid.clone(),
            Some(record.receiver.clone()),
            IqPayload::Si(si),
        ))
    }

    /// The receiver accepted; returns the method it chose
    ///
    /// Unknown or missing methods fail the record with
    /// [`TransferErrorCode::Failed`].
    pub fn handle_result(
        &self,
        record: &mut FileTransferRecord,
        si: Option<&Si>,
    ) -> Option<StreamMethod> {
        let chosen = si.and_then(|si| {
            si.stream_methods()
                .iter()
                .find_map(|ns| StreamMethod::from_namespace(ns))
        });

        let Some(method) = chosen else {
            warn!(sid = %record.sid, "SI answer without a usable stream method");
            let _ = record.transition(StateEvent::Fail(TransferErrorCode::Failed));
            return None;
        };

        if let Some(range) = si.and_then(|si| si.file.as_ref()).and_then(|f| f.range) {
            record.offset = range.offset.unwrap_or(0);
            record.length = range.length;
        }
        if let Err(e) = record.transition(StateEvent::Accepted(method)) {
            debug!(sid = %record.sid, "{}", e);
            return None;
        }
        info!(sid = %record.sid, method = ?method, offset = record.offset, "offer accepted");
        Some(method)
    }

    /// The receiver refused our offer or it bounced
    pub fn handle_error(
        &self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        error: Option<&StanzaError>,
    ) {
        let message = error.map(StanzaError::describe);
        info!(sid = %record.sid, reason = message.as_deref().unwrap_or("unknown"), "offer refused");
        let _ = record.transition(StateEvent::Fail(TransferErrorCode::Failed));
        session.emit(TransferEvent::FileRequestError {
            jid: record.peer().to_string(),
            sid: record.sid.clone(),
            code: TransferErrorCode::Failed.code(),
            error_msg: message,
        });
    }

    // =========================================================================
    // Receiver
    // =========================================================================

    /// Check an incoming offer and build the record for it
    pub fn receive_offer(&self, session: &mut AccountSession, iq: &Iq, si: &Si) -> OfferCheck {
        let Some(sender) = iq.from.clone() else {
            debug!(id = %iq.id, "offer without sender");
            return OfferCheck::Dropped;
        };

        if si.profile.as_deref() != Some(NS_FILE) {
            warn!(peer = %sender, profile = ?si.profile, "offer with unknown profile");
            self.send_error(session, &iq.id, &sender, RejectReason::BadProfile);
            return OfferCheck::Rejected(SiCondition::BadProfile);
        }

        let (Some(file), Some(_)) = (si.file.as_ref(), si.feature.as_ref()) else {
            debug!(peer = %sender, "offer without file or feature, dropping");
            return OfferCheck::Dropped;
        };
        let Some(sid) = si.id.as_deref().filter(|sid| validate_sid(sid).is_ok()) else {
            debug!(peer = %sender, "offer with invalid sid, dropping");
            return OfferCheck::Dropped;
        };
        let (Some(name), Some(size)) = (file.name.as_deref(), file.size) else {
            debug!(peer = %sender, sid, "offer without name or size, dropping");
            return OfferCheck::Dropped;
        };
        if let Err(e) = validate_file_name(name) {
            debug!(peer = %sender, sid, "offer with unusable file name: {:?}", e);
            return OfferCheck::Dropped;
        }

        let methods = si.stream_methods();
        if !methods
            .iter()
            .any(|ns| StreamMethod::from_namespace(ns).is_some())
        {
            warn!(peer = %sender, sid, "offer without a stream method we support");
            self.send_error(session, &iq.id, &sender, RejectReason::NoValidStreams);
            return OfferCheck::Rejected(SiCondition::NoValidStreams);
        }

        let receiver = iq.to.clone().unwrap_or_else(|| session.jid().clone());
        let mut record = FileTransferRecord::incoming(sid, sender, receiver, name, size);
        record.desc = file.desc.clone();
        record.mime_type = si.mime_type.clone();
        record.hash = file.hash.clone();
        record.date = file.date.clone();
        record.stream_methods = methods;
        record.request_id = Some(iq.id.clone());
        info!(sid, peer = %record.sender, name, size, "file offered");
        OfferCheck::Valid(Box::new(record))
    }

    /// Accept an offer with `chosen`, or the preferred method the peer offered
    pub fn accept_offer(
        &self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        chosen: Option<StreamMethod>,
    ) -> Option<StreamMethod> {
        let offered: Vec<StreamMethod> = record
            .stream_methods
            .iter()
            .filter_map(|ns| StreamMethod::from_namespace(ns))
            .collect();
        let method = chosen
            .filter(|m| offered.contains(m))
            .or_else(|| SUPPORTED_METHODS.into_iter().find(|m| offered.contains(m)));

        let Some(method) = method else {
            self.reject(session, record, RejectReason::NoValidStreams);
            return None;
        };
        if let Err(e) = record.transition(StateEvent::Accepted(method)) {
            debug!(sid = %record.sid, "{}", e);
            return None;
        }

        let file = (record.offset > 0).then(|| FileDescription {
            range: Some(Range {
                offset: Some(record.offset),
                length: record.length,
            }),
            ..Default::default()
        });
        let si = Si {
            file,
            feature: Some(DataForm::submit(STREAM_METHOD_FIELD, method.namespace())),
            ..Default::default()
        };
        info!(sid = %record.sid, method = ?method, "accepting offer");
        session.send(Iq::new(
            IqType::Result,
            record.request_id.clone().unwrap_or_default(),
            Some(record.sender.clone()),
            IqPayload::Si(si),
        ));
        Some(method)
    }

    /// Refuse an offer and stop the record
    ///
    /// Transfers negotiated by Jingle are refused by ending the Jingle
    /// session instead of answering an SI request.
    pub fn reject(
        &self,
        session: &mut AccountSession,
        record: &mut FileTransferRecord,
        reason: RejectReason,
    ) {
        if record.is_jingle() {
            session.cancel_jingle(&record.sender, &record.sid);
        } else {
            let id = record.request_id.clone().unwrap_or_default();
            self.send_error(session, &id, &record.sender, reason);
        }
        let _ = record.transition(StateEvent::Stop);
    }

    fn send_error(
        &self,
        session: &mut AccountSession,
        id: &str,
        to: &xmpp_ft_common::Jid,
        reason: RejectReason,
    ) {
        session.send(Iq::new(
            IqType::Error,
            id,
            Some(to.clone()),
            IqPayload::Error(reason.error()),
        ));
    }
}
