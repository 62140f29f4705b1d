use thiserror::Error;

/// Errors that can occur while decoding bencode.
///
/// Encoding is infallible; only the decoder produces these.
///
/// # Examples
///
/// ```
/// use rdht::bencode::{decode, BencodeError};
///
/// // Truncated input
/// assert!(matches!(decode(b"i42"), Err(BencodeError::UnexpectedEof)));
///
/// // Integers may not carry leading zeros
/// assert!(matches!(decode(b"i007e"), Err(BencodeError::InvalidInteger(_))));
///
/// // Exactly one value per buffer
/// assert!(matches!(decode(b"i42eextra"), Err(BencodeError::TrailingData)));
/// ```
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Integer is malformed: empty, non-numeric, leading zeros, or overflow.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Byte-string length prefix is not a valid number.
    #[error("invalid string length")]
    InvalidStringLength,

    /// A byte that cannot begin or continue a value at this position.
    #[error("unexpected byte 0x{0:02x}")]
    UnexpectedByte(u8),

    /// A dictionary key that is not a byte string.
    #[error("dictionary key is not a byte string")]
    InvalidDictKey,

    /// Extra data exists after the value.
    #[error("trailing data after value")]
    TrailingData,

    /// Recursion limit exceeded.
    #[error("nesting too deep")]
    NestingTooDeep,
}
