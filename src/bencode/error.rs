use thiserror::Error;

/// Errors produced while encoding or decoding bencode.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Integer is malformed (empty, leading zeros, or out of range).
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Byte-string length prefix is not a valid number.
    #[error("invalid string length")]
    InvalidStringLength,

    /// Encountered a byte that cannot start a value at this position.
    #[error("unexpected byte: {0:#04x}")]
    UnexpectedByte(u8),

    /// Extra data after the value.
    #[error("trailing data after value")]
    TrailingData,

    /// Recursion limit exceeded.
    #[error("nesting too deep")]
    NestingTooDeep,
}
