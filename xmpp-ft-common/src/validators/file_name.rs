//! Offered file name validation
//!
//! A file name from a peer's offer becomes the default name on disk, so it
//! must be a single path component.

/// Maximum length for offered file names in bytes
pub const MAX_FILE_NAME_LENGTH: usize = 255;

/// Validation error for offered file names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileNameError {
    /// File name is empty
    Empty,
    /// File name exceeds maximum length
    TooLong,
    /// File name contains a path separator or is a relative path component
    PathTraversal,
    /// File name contains control characters
    InvalidCharacters,
}

/// Validate a file name received in an offer
///
/// Checks:
/// - Not empty and at most 255 bytes
/// - No `/` or `\` separators, not `.` or `..`
/// - No control characters (including NUL)
///
/// # Errors
///
/// Returns a `FileNameError` variant describing the validation failure.
pub fn validate_file_name(name: &str) -> Result<(), FileNameError> {
    if name.is_empty() {
        return Err(FileNameError::Empty);
    }
    if name.len() > MAX_FILE_NAME_LENGTH {
        return Err(FileNameError::TooLong);
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(FileNameError::PathTraversal);
    }
    if name.chars().any(char::is_control) {
        return Err(FileNameError::InvalidCharacters);
    }
    Ok(())
}
