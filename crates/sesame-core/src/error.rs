//! Error types for sesame-core.
//!
//! This module defines every failure the session manager can surface, from
//! radio-level connect failures to commands issued without a baseline state.
//!
//! # Recovery
//!
//! | Error Type | Strategy | Rationale |
//! |------------|----------|-----------|
//! | [`Error::ConnectionFailed`] | Rescan with backoff | Lock may be out of range or busy |
//! | [`Error::Timeout`] | Retry | An awaited event did not arrive in time |
//! | [`Error::NotConnected`] | Retry once reconnected | The session rescans on its own |
//! | [`Error::Bluetooth`] | Retry, then rescan | Often transient |
//! | [`Error::UnavailableState`] | Do not retry | Wait for the lock to report settings |
//! | [`Error::Query`] | Ignore | History lookups are best-effort |
//! | [`Error::OutOfRange`] | Do not retry | Fix the requested value |
//! | [`Error::InvalidConfig`] | Do not retry | Fix configuration and restart |
//!
//! Nothing here is fatal to the hosting process: the session degrades to an
//! unknown lock state or to "disconnected, scanning" instead.

use std::time::Duration;

use thiserror::Error;

use sesame_types::{DeviceAddress, ParseError};

/// Errors that can occur while managing a lock session.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The link could not be established or was lost.
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// The lock that failed to connect.
        address: DeviceAddress,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// An awaited operation or event did not complete in time.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation attempted while no live connection exists.
    #[error("Not connected to device")]
    NotConnected,

    /// The operation needs a snapshot the lock has never reported.
    #[error("State unavailable: {0}")]
    UnavailableState(String),

    /// A history query failed.
    #[error("History query failed: {0}")]
    Query(String),

    /// Operation was cancelled because the session is closing.
    #[error("Operation cancelled")]
    Cancelled,

    /// Data received from the lock or a scan could not be decoded.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A numeric parameter was outside its documented range.
    #[error("{field} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        /// Parameter key.
        field: String,
        /// Rejected value.
        value: i64,
        /// Inclusive lower bound.
        min: i64,
        /// Inclusive upper bound.
        max: i64,
    },

    /// A value could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Lock is out of range.
    OutOfRange,
    /// The encrypted session handshake was rejected.
    Rejected,
    /// Connection attempt timed out.
    Timeout,
    /// The established link dropped.
    LinkLost,
    /// Generic BLE error.
    BleError(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::OutOfRange => write!(f, "device out of range"),
            Self::Rejected => write!(f, "session handshake rejected"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::LinkLost => write!(f, "link lost"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(address: DeviceAddress, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { address, reason }
    }

    /// Create an unavailable-state error.
    pub fn unavailable(what: impl Into<String>) -> Self {
        Self::UnavailableState(what.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an out-of-range error for a numeric parameter.
    pub fn out_of_range(field: impl Into<String>, value: i64, min: i64, max: i64) -> Self {
        Self::OutOfRange {
            field: field.into(),
            value,
            min,
            max,
        }
    }

    /// Whether retrying after the session reconnects may succeed.
    ///
    /// Command timeouts belong to the same class as [`Error::NotConnected`]:
    /// they are surfaced to the caller but never treated as fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::NotConnected
                | Error::ConnectionFailed { .. }
                | Error::Bluetooth(_)
        )
    }
}

/// Result type alias using sesame-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> DeviceAddress {
        DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
    }

    #[test]
    fn test_error_display() {
        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected to device");

        let err = Error::timeout("wait_for(mech_status)", Duration::from_secs(10));
        assert!(err.to_string().contains("wait_for(mech_status)"));
        assert!(err.to_string().contains("10s"));

        let err = Error::connection_failed(addr(), ConnectionFailureReason::OutOfRange);
        assert_eq!(
            err.to_string(),
            "Connection to AA:BB:CC:DD:EE:FF failed: device out of range"
        );

        let err = Error::out_of_range("lock", 40000, -32768, 32767);
        assert!(err.to_string().contains("lock = 40000"));
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = ParseError::InvalidAddress("xyz".into()).into();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().contains("xyz"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NotConnected.is_retryable());
        assert!(Error::timeout("lock", Duration::from_secs(1)).is_retryable());
        assert!(
            Error::connection_failed(addr(), ConnectionFailureReason::LinkLost).is_retryable()
        );
        assert!(!Error::unavailable("settings").is_retryable());
        assert!(!Error::Query("boom".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::invalid_config("x").is_retryable());
    }
}
