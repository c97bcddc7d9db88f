//! Session guard for automatic teardown on drop.
//!
//! A [`SessionGuard`] owns a [`DeviceSession`] handle and tears the session
//! down when it goes out of scope.

use std::ops::Deref;

use tokio::runtime::Handle;
use tracing::warn;

use crate::session::DeviceSession;

/// A guard that disconnects its session when dropped.
///
/// Other clones of the session handle stay valid but observe a closed
/// session once the guard is gone.
///
/// # Example
///
/// ```ignore
/// use sesame_core::{DeviceSession, SessionGuard};
///
/// async fn lock_once(session: DeviceSession) -> sesame_core::Result<()> {
///     let guard = SessionGuard::new(session);
///     guard.initialize().await?;
///     guard.lock().await
///     // The session is disconnected when `guard` goes out of scope
/// }
/// ```
pub struct SessionGuard {
    session: DeviceSession,
    armed: bool,
}

impl SessionGuard {
    pub fn new(session: DeviceSession) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    /// Take the session back, preventing automatic disconnect.
    ///
    /// After calling this, you are responsible for disconnecting the session.
    pub fn into_inner(mut self) -> DeviceSession {
        self.armed = false;
        self.session.clone()
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }
}

impl Deref for SessionGuard {
    type Target = DeviceSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed || self.session.is_closed() {
            return;
        }
        let session = self.session.clone();
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = session.disconnect().await {
                    warn!(address = %session.address(), "Failed to disconnect session in guard drop: {}", e);
                }
            });
        } else {
            warn!(address = %session.address(), "No tokio runtime available for session disconnect in guard drop");
        }
    }
}
