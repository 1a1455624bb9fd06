//! Stream identifier validation
//!
//! Stream ids travel in SI offers, bytestream queries and IBB open/data/close
//! elements. They are also hashed into the SOCKS5 destination address, so
//! only printable ASCII is accepted.

/// Maximum length for stream ids in bytes
pub const MAX_SID_LENGTH: usize = 128;

/// Validation error for stream ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidError {
    /// Stream id is empty
    Empty,
    /// Stream id exceeds maximum length
    TooLong,
    /// Stream id contains whitespace, control or non-ASCII characters
    InvalidCharacters,
}

/// Validate a stream id
///
/// # Errors
///
/// Returns a `SidError` variant describing the validation failure.
pub fn validate_sid(sid: &str) -> Result<(), SidError> {
    if sid.is_empty() {
        return Err(SidError::Empty);
    }
    if sid.len() > MAX_SID_LENGTH {
        return Err(SidError::TooLong);
    }
    if !sid.chars().all(|ch| ch.is_ascii_graphic()) {
        return Err(SidError::InvalidCharacters);
    }
    Ok(())
}
