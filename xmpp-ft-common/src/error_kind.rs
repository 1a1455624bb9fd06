//! Numeric error codes for file transfers
//!
//! `TransferErrorCode` is what a transfer record carries in its `error`
//! field and what the UI receives in failure events. `ConnectErrorCode` is
//! the reason passed when a bytestream negotiation is torn down and the
//! peer must be told why.

use std::fmt;

/// Terminal error recorded on a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferErrorCode {
    /// Stream closed before the advertised size arrived
    Incomplete,

    /// Negotiation failed or the peer refused
    Failed,

    /// Bytestream level failure (proxy error, broken stream, hash mismatch)
    Bytestream,

    /// Local listener could not be started, or the contact went away
    Listener,
}

impl TransferErrorCode {
    /// Numeric code stored on the record
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Incomplete => -1,
            Self::Failed => -3,
            Self::Bytestream => -4,
            Self::Listener => -5,
        }
    }

    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Incomplete),
            -3 => Some(Self::Failed),
            -4 => Some(Self::Bytestream),
            -5 => Some(Self::Listener),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Failed => "failed",
            Self::Bytestream => "bytestream",
            Self::Listener => "listener",
        }
    }
}

impl fmt::Display for TransferErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Reason a bytestream negotiation is aborted towards the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectErrorCode {
    /// None of the offered streamhosts could be reached
    Unreachable,

    /// Transfer was cancelled locally
    Cancelled,

    /// Offered stream method cannot be used
    NotAcceptable,
}

impl ConnectErrorCode {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Unreachable => 404,
            Self::Cancelled => 405,
            Self::NotAcceptable => 406,
        }
    }

    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            404 => Some(Self::Unreachable),
            405 => Some(Self::Cancelled),
            406 => Some(Self::NotAcceptable),
            _ => None,
        }
    }

    /// Human readable reason sent in the error stanza and the UI event
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::Unreachable => "Could not connect to given hosts",
            Self::Cancelled => "Cancelled",
            Self::NotAcceptable => "Not acceptable",
        }
    }
}

impl fmt::Display for ConnectErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_codes() {
        assert_eq!(TransferErrorCode::Incomplete.code(), -1);
        assert_eq!(TransferErrorCode::Failed.code(), -3);
        assert_eq!(TransferErrorCode::Bytestream.code(), -4);
        assert_eq!(TransferErrorCode::Listener.code(), -5);
    }

    #[test]
    fn test_transfer_from_code() {
        for kind in [
            TransferErrorCode::Incomplete,
            TransferErrorCode::Failed,
            TransferErrorCode::Bytestream,
            TransferErrorCode::Listener,
        ] {
            assert_eq!(TransferErrorCode::from_code(kind.code()), Some(kind));
        }
        assert_eq!(TransferErrorCode::from_code(0), None);
        assert_eq!(TransferErrorCode::from_code(-2), None);
    }

    #[test]
    fn test_connect_codes() {
        assert_eq!(ConnectErrorCode::Unreachable.code(), 404);
        assert_eq!(ConnectErrorCode::Cancelled.code(), 405);
        assert_eq!(ConnectErrorCode::NotAcceptable.code(), 406);
        assert_eq!(
            ConnectErrorCode::from_code(404),
            Some(ConnectErrorCode::Unreachable)
        );
        assert_eq!(ConnectErrorCode::from_code(500), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(TransferErrorCode::Incomplete.to_string(), "incomplete (-1)");
        assert_eq!(
            ConnectErrorCode::Unreachable.to_string(),
            "404 Could not connect to given hosts"
        );
    }
}
