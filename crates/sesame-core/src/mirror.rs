//! Local mirror of the lock's latest snapshots.
//!
//! The mirror is written only by its own bus handlers: each status or
//! settings event replaces the stored snapshot wholesale. Reads are
//! synchronous and return copies.

use std::sync::{Arc, RwLock};

use sesame_types::{MechSettings, MechStatus};

use crate::events::{EventBus, EventKind, LockEvent, SubscriptionToken};

/// Latest status and settings snapshots.
#[derive(Debug, Default)]
pub struct StatusMirror {
    status: RwLock<Option<MechStatus>>,
    settings: RwLock<Option<MechSettings>>,
}

impl StatusMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest status, or `None` before the first status event.
    pub fn status(&self) -> Option<MechStatus> {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest settings, or `None` before the first settings event.
    pub fn settings(&self) -> Option<MechSettings> {
        *self.settings.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the mirror's handlers on `bus`.
    ///
    /// Attach before any other status observer so that observers see the
    /// updated snapshot when they read the mirror.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> [SubscriptionToken; 2] {
        let mirror = Arc::clone(self);
        let status = bus.subscribe(EventKind::MechStatus, move |event| {
            if let LockEvent::MechStatus { status } = event {
                *mirror.status.write().unwrap_or_else(|e| e.into_inner()) = Some(*status);
            }
            Ok(())
        });

        let mirror = Arc::clone(self);
        let settings = bus.subscribe(EventKind::MechSettings, move |event| {
            if let LockEvent::MechSettings { settings } = event {
                *mirror.settings.write().unwrap_or_else(|e| e.into_inner()) = Some(*settings);
            }
            Ok(())
        });

        [status, settings]
    }
}
