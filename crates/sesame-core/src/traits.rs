//! Boundary with the client that owns the encrypted BLE session.
//!
//! The [`LockClient`] trait is the capability surface a session drives: link
//! management, cached snapshots, the history tail, firmware version and the
//! lock commands. It abstracts over a real SesameOS3 client and
//! [`MockLockClient`](crate::mock::MockLockClient) for testing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use sesame_types::{DeviceAddress, HistoryEntry, MechSettings, MechStatus};

use crate::error::{Error, Result};

/// Events emitted by a client.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ClientEvent {
    /// A status notification arrived.
    MechStatus(MechStatus),
    /// A settings notification arrived.
    MechSettings(MechSettings),
    /// The link dropped or was closed.
    Disconnected { reason: String },
}

/// Kinds of [`ClientEvent`], for [`LockClient::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    MechStatus,
    MechSettings,
    Disconnected,
}

impl ClientEvent {
    pub fn kind(&self) -> ClientEventKind {
        match self {
            ClientEvent::MechStatus(_) => ClientEventKind::MechStatus,
            ClientEvent::MechSettings(_) => ClientEventKind::MechSettings,
            ClientEvent::Disconnected { .. } => ClientEventKind::Disconnected,
        }
    }
}

/// Trait abstracting a SesameOS3 client.
///
/// # Example
///
/// ```ignore
/// use sesame_core::{LockClient, Result};
///
/// async fn lock_now<C: LockClient>(client: &C) -> Result<()> {
///     if client.is_connected().await {
///         client.lock("sesame-core").await?;
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait LockClient: Send + Sync {
    // --- Connection Management ---

    /// Establish the link and the encrypted session.
    async fn connect(&self, address: DeviceAddress) -> Result<()>;

    /// Close the link. Closing an already closed link is a no-op.
    async fn disconnect(&self) -> Result<()>;

    /// Check if the link is up.
    async fn is_connected(&self) -> bool;

    // --- Cached State ---

    /// Latest status the client has seen, if any.
    fn current_status(&self) -> Option<MechStatus>;

    /// Latest settings the client has seen, if any.
    fn current_settings(&self) -> Option<MechSettings>;

    // --- Queries ---

    /// Most recent history record. Errors map to [`Error::Query`].
    async fn history_tail(&self) -> Result<Option<HistoryEntry>>;

    /// Firmware version string.
    async fn firmware_version(&self) -> Result<String>;

    // --- Commands ---

    /// Lock, labelling the action with `tag`.
    async fn lock(&self, tag: &str) -> Result<()>;

    /// Unlock, labelling the action with `tag`.
    async fn unlock(&self, tag: &str) -> Result<()>;

    /// Write new mechanical settings.
    async fn apply_settings(&self, settings: MechSettings) -> Result<()>;

    // --- Events ---

    /// Subscribe to the client's event stream.
    fn events(&self) -> broadcast::Receiver<ClientEvent>;

    /// Wait for the next client event of `kind`.
    async fn wait_for(&self, kind: ClientEventKind, timeout: Duration) -> Result<ClientEvent> {
        let mut rx = self.events();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind() == kind => return Ok(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::NotConnected),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout(format!("wait_for({kind:?})"), timeout))?
    }
}
