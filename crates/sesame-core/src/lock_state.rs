//! Derivation of the externally visible lock state.
//!
//! [`derive`] is the only place a [`DerivedLockState`] is produced. It is a
//! pure function of the latest status and settings snapshots, the command
//! currently assumed to be in flight, and the latest history classification.
//! [`LockStateTracker`] holds the last two inputs between status events.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use sesame_types::{ChangedBy, MechSettings, MechStatus};

/// Lock state as shown to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Locked,
    Unlocked,
    Locking,
    Unlocking,
    Unknown,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LockState::Locked => "locked",
            LockState::Unlocked => "unlocked",
            LockState::Locking => "locking",
            LockState::Unlocking => "unlocking",
            LockState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Direction of a locally issued lock command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockCommand {
    Lock,
    Unlock,
}

/// Lock state derived from telemetry.
///
/// `None` in any of the tri-state fields means the value cannot be known
/// from the information available; it is never a guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DerivedLockState {
    /// The thumb-turn sits inside the lock range.
    pub is_locked: Option<bool>,
    /// The mechanism is moving toward the lock position.
    pub is_locking: Option<bool>,
    /// The mechanism is moving toward the unlock position.
    pub is_unlocking: Option<bool>,
    /// A local command is in flight and no status has corroborated it yet.
    pub assumed: bool,
    /// Actor behind the most recent lock/unlock, if known.
    pub changed_by: Option<ChangedBy>,
}

impl DerivedLockState {
    /// Collapse the tri-state flags into a single [`LockState`].
    ///
    /// Motion wins over position, matching how a lock entity reports a
    /// mechanism that is still turning.
    pub fn state(&self) -> LockState {
        if self.is_locking == Some(true) {
            LockState::Locking
        } else if self.is_unlocking == Some(true) {
            LockState::Unlocking
        } else {
            match self.is_locked {
                Some(true) => LockState::Locked,
                Some(false) => LockState::Unlocked,
                None => LockState::Unknown,
            }
        }
    }
}

/// Compute the lock state.
///
/// 1. `stop` means the mechanism is idle: neither locking nor unlocking.
/// 2. A moving mechanism without settings has an unknown direction.
///    With settings, `clockwise == (lock < unlock)` means locking.
/// 3. `is_locked` mirrors `lock_range`.
/// 4. A pending command forces its own direction and marks the state assumed.
pub fn derive(
    status: Option<&MechStatus>,
    settings: Option<&MechSettings>,
    pending: Option<LockCommand>,
    changed_by: Option<ChangedBy>,
) -> DerivedLockState {
    let (is_locked, is_locking, is_unlocking) = match status {
        None => (None, None, None),
        Some(status) => {
            let (locking, unlocking) = if status.stop {
                (Some(false), Some(false))
            } else {
                match settings {
                    None => (None, None),
                    Some(settings) => {
                        let toward_lock = status.clockwise == settings.lock_below_unlock();
                        (Some(toward_lock), Some(!toward_lock))
                    }
                }
            };
            (Some(status.lock_range), locking, unlocking)
        }
    };

    let (is_locking, is_unlocking) = match pending {
        Some(LockCommand::Lock) => (Some(true), Some(false)),
        Some(LockCommand::Unlock) => (Some(false), Some(true)),
        None => (is_locking, is_unlocking),
    };

    DerivedLockState {
        is_locked,
        is_locking,
        is_unlocking,
        assumed: pending.is_some(),
        changed_by,
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    pending: Option<LockCommand>,
    changed_by: Option<ChangedBy>,
    generation: u64,
}

/// Mutable inputs of [`derive`] that are not snapshots.
///
/// Every status event bumps a generation counter. History lookups are tagged
/// with the generation they were started for, so a slow lookup can never
/// overwrite the attribution of a newer status.
#[derive(Debug, Default)]
pub struct LockStateTracker {
    state: Mutex<TrackerState>,
}

impl LockStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Mark a command as in flight.
    pub fn begin_command(&self, command: LockCommand) {
        self.with(|s| s.pending = Some(command));
    }

    /// Clear the pending command if it is still `command`.
    ///
    /// Returns `true` if it was cleared, i.e. no status event arrived while
    /// the command ran and the optimistic state must be reverted.
    pub fn revert_command(&self, command: LockCommand) -> bool {
        self.with(|s| {
            if s.pending == Some(command) {
                s.pending = None;
                true
            } else {
                false
            }
        })
    }

    /// Record a status event: clears any pending command and starts a new
    /// history generation, which is returned.
    pub fn on_status(&self) -> u64 {
        self.with(|s| {
            s.pending = None;
            s.generation = s.generation.wrapping_add(1);
            s.generation
        })
    }

    /// Apply the result of a history lookup started for `generation`.
    ///
    /// Returns `false` (and changes nothing) if a newer status arrived since.
    pub fn resolve_history(&self, generation: u64, changed_by: Option<ChangedBy>) -> bool {
        self.with(|s| {
            if s.generation == generation {
                s.changed_by = changed_by;
                true
            } else {
                false
            }
        })
    }

    /// The command currently assumed to be in flight.
    pub fn pending(&self) -> Option<LockCommand> {
        self.with(|s| s.pending)
    }

    /// The latest history classification.
    pub fn changed_by(&self) -> Option<ChangedBy> {
        self.with(|s| s.changed_by)
    }

    /// Derive the lock state from the given snapshots and the tracked inputs.
    pub fn derive(
        &self,
        status: Option<&MechStatus>,
        settings: Option<&MechSettings>,
    ) -> DerivedLockState {
        let (pending, changed_by) = self.with(|s| (s.pending, s.changed_by));
        derive(status, settings, pending, changed_by)
    }
}
