//! Diagnostics sink injected into a session.
//!
//! Sessions never log through a global. Everything noteworthy is turned into
//! a typed [`Diagnostic`] and handed to the [`DiagnosticsSink`] supplied at
//! construction. [`TracingSink`] forwards to `tracing`; [`MemorySink`]
//! records for inspection in tests.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use sesame_types::DeviceAddress;

use crate::events::{Command, EventKind};
use crate::session::ConnectionState;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
}

/// Something a session wants to report.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Diagnostic {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ConnectFailed {
        address: DeviceAddress,
        error: String,
        retry_in: Duration,
    },
    InitialStatusTimedOut {
        timeout: Duration,
    },
    DeviceInfoFailed {
        error: String,
    },
    HistoryLookupFailed {
        error: String,
    },
    HandlerFailed {
        kind: EventKind,
        message: String,
    },
    /// The scanner could not see the lock, so no connect was attempted.
    DeviceAbsent {
        address: DeviceAddress,
    },
    ScanStarted,
    ScanStopped,
    ScanFailed {
        error: String,
        retry_in: Duration,
    },
    CandidateFound {
        address: DeviceAddress,
        rssi: Option<i16>,
    },
    /// The identifier a transient address can be matched by was learned.
    DeviceUuidLearned {
        device_uuid: uuid::Uuid,
    },
    LinkLost {
        reason: String,
    },
    StaleDisconnectIgnored,
    CommandFailed {
        command: Command,
        error: String,
    },
}

impl Diagnostic {
    /// Severity used when forwarding to a log.
    pub fn level(&self) -> Level {
        match self {
            Diagnostic::StateChanged { .. }
            | Diagnostic::CandidateFound { .. }
            | Diagnostic::DeviceUuidLearned { .. }
            | Diagnostic::DeviceAbsent { .. }
            | Diagnostic::LinkLost { .. } => Level::Info,
            Diagnostic::ConnectFailed { .. }
            | Diagnostic::InitialStatusTimedOut { .. }
            | Diagnostic::DeviceInfoFailed { .. }
            | Diagnostic::HandlerFailed { .. }
            | Diagnostic::ScanFailed { .. }
            | Diagnostic::CommandFailed { .. } => Level::Warn,
            Diagnostic::HistoryLookupFailed { .. }
            | Diagnostic::ScanStarted
            | Diagnostic::ScanStopped
            | Diagnostic::StaleDisconnectIgnored => Level::Debug,
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StateChanged { from, to } => write!(f, "connection state {from} -> {to}"),
            Self::ConnectFailed {
                address,
                error,
                retry_in,
            } => write!(
                f,
                "connect to {address} failed: {error}; scanning again in {retry_in:?}"
            ),
            Self::InitialStatusTimedOut { timeout } => write!(
                f,
                "no status within {timeout:?} of connecting; continuing with unknown state"
            ),
            Self::DeviceInfoFailed { error } => write!(f, "device info unavailable: {error}"),
            Self::HistoryLookupFailed { error } => write!(f, "history lookup failed: {error}"),
            Self::HandlerFailed { kind, message } => {
                write!(f, "{kind} handler failed: {message}")
            }
            Self::DeviceAbsent { address } => {
                write!(f, "{address} not in range; waiting for an advertisement")
            }
            Self::ScanStarted => write!(f, "scan started"),
            Self::ScanStopped => write!(f, "scan stopped"),
            Self::ScanFailed { error, retry_in } => {
                write!(f, "scan failed: {error}; retrying in {retry_in:?}")
            }
            Self::CandidateFound { address, rssi } => match rssi {
                Some(rssi) => write!(f, "found {address} (rssi {rssi})"),
                None => write!(f, "found {address}"),
            },
            Self::DeviceUuidLearned { device_uuid } => {
                write!(f, "learned device uuid {device_uuid}")
            }
            Self::LinkLost { reason } => write!(f, "link lost: {reason}"),
            Self::StaleDisconnectIgnored => write!(f, "ignored stale disconnect notification"),
            Self::CommandFailed { command, error } => write!(f, "{command} failed: {error}"),
        }
    }
}

/// Receiver of session diagnostics.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    address: Option<DeviceAddress>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the lock address to every log line.
    pub fn for_device(address: DeviceAddress) -> Self {
        Self {
            address: Some(address),
        }
    }
}

impl DiagnosticsSink for TracingSink {
    fn record(&self, diagnostic: Diagnostic) {
        let device = self.address.map(|a| a.to_string()).unwrap_or_default();
        match diagnostic.level() {
            Level::Debug => debug!(device = %device, "{}", diagnostic),
            Level::Info => info!(device = %device, "{}", diagnostic),
            Level::Warn => warn!(device = %device, "{}", diagnostic),
        }
    }
}

/// Records diagnostics in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, oldest first.
    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of recorded diagnostics matching `pred`.
    pub fn count(&self, pred: impl Fn(&Diagnostic) -> bool) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|d| pred(d))
            .count()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl DiagnosticsSink for MemorySink {
    fn record(&self, diagnostic: Diagnostic) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(diagnostic);
    }
}
