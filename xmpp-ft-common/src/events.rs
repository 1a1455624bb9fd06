//! Events surfaced to the UI layer
//!
//! The negotiation core never talks to a UI directly. It emits these
//! through its event sink; a front-end may forward them as JSON lines.

use serde::{Deserialize, Serialize};

/// Transfer lifecycle notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferEvent {
    /// A peer offered us a file and is waiting for approval
    FileRequestReceived {
        jid: String,
        sid: String,
        name: String,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        desc: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// A transfer failed or was refused
    FileRequestError {
        jid: String,
        sid: String,
        /// Code from `TransferErrorCode`, 0 when the error is a plain refusal
        code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_msg: Option<String>,
    },
    /// Bytes moved so far
    Progress {
        sid: String,
        transferred: u64,
        size: u64,
    },
    /// Stream finished and all bytes were accounted for
    Completed { sid: String },
    /// Non-fatal notice (e.g. local addresses could not be enumerated)
    Information { message: String },
}

impl TransferEvent {
    /// The transfer this event belongs to, if any
    #[must_use]
    pub fn sid(&self) -> Option<&str> {
        match self {
            Self::FileRequestReceived { sid, .. }
            | Self::FileRequestError { sid, .. }
            | Self::Progress { sid, .. }
            | Self::Completed { sid } => Some(sid),
            Self::Information { .. } => None,
        }
    }
}
