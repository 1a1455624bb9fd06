//! IBB block-size parsing
//!
//! The `block-size` attribute of an IBB `<open/>` is an unsigned short.

/// Largest block size an IBB open may request
pub const MAX_BLOCK_SIZE: u32 = u16::MAX as u32;

/// Validation error for IBB block sizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSizeError {
    /// Attribute was absent
    Missing,
    /// Attribute is not a decimal number
    NotNumeric,
    /// Zero-sized blocks cannot carry data
    Zero,
    /// Block size exceeds an unsigned short
    TooLarge,
}

/// Parse a `block-size` attribute value
///
/// # Errors
///
/// Returns a `BlockSizeError` variant describing why the value is unusable.
pub fn parse_block_size(value: Option<&str>) -> Result<u16, BlockSizeError> {
    let value = value.ok_or(BlockSizeError::Missing)?.trim();
    if value.is_empty() || !value.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(BlockSizeError::NotNumeric);
    }
    let size: u64 = value.parse().map_err(|_| BlockSizeError::TooLarge)?;
    if size == 0 {
        return Err(BlockSizeError::Zero);
    }
    if size > u64::from(MAX_BLOCK_SIZE) {
        return Err(BlockSizeError::TooLarge);
    }
    Ok(size as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_block_sizes() {
        assert_eq!(parse_block_size(Some("4096")), Ok(4096));
        assert_eq!(parse_block_size(Some("1")), Ok(1));
        assert_eq!(parse_block_size(Some("65535")), Ok(65535));
        assert_eq!(parse_block_size(Some(" 512 ")), Ok(512));
    }

    #[test]
    fn test_missing() {
        assert_eq!(parse_block_size(None), Err(BlockSizeError::Missing));
    }

    #[test]
    fn test_not_numeric() {
        assert_eq!(parse_block_size(Some("")), Err(BlockSizeError::NotNumeric));
        assert_eq!(parse_block_size(Some("4k")), Err(BlockSizeError::NotNumeric));
        assert_eq!(parse_block_size(Some("-1")), Err(BlockSizeError::NotNumeric));
    }

    #[test]
    fn test_bounds() {
        assert_eq!(parse_block_size(Some("0")), Err(BlockSizeError::Zero));
        assert_eq!(parse_block_size(Some("65536")), Err(BlockSizeError::TooLarge));
        assert_eq!(
            parse_block_size(Some("99999999999999999999999")),
            Err(BlockSizeError::TooLarge)
        );
    }
}
