//! Error types for data parsing in sesame-types.

use thiserror::Error;

/// Errors that can occur when parsing SesameOS3 values.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in sesame-core).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The string is not a 6-byte Bluetooth address.
    #[error("Invalid Bluetooth address: '{0}'")]
    InvalidAddress(String),

    /// A history record carried a type code this crate does not know.
    #[error("Unknown history type: {0}")]
    UnknownHistoryType(u8),

    /// A model name or code is not a known SesameOS3 model.
    #[error("Unknown device model: {0}")]
    UnknownModel(String),

    /// Not enough bytes to decode a value.
    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
}

/// Result type alias using sesame-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
