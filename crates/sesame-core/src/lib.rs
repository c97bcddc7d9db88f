//! Connection and lock-state session manager for SesameOS3 smart locks.
//!
//! This crate keeps a long-lived session to a CANDY HOUSE Sesame lock over
//! Bluetooth Low Energy: it finds the lock, connects through an external
//! client that owns the encrypted session, mirrors the lock's status and
//! settings, derives a lock state from them and reconnects when the link
//! drops.
//!
//! # Features
//!
//! - **Connection management**: `Disconnected -> Connecting -> Synchronizing -> Connected`,
//!   falling back to scanning with backoff after a failure or link loss
//! - **Event bus**: typed per-kind handlers, one-shot waits and a broadcast stream
//! - **Lock-state derivation**: locked/locking/unlocking with optimistic command state
//! - **Attribution**: who changed the lock last, from the history tail
//! - **Rediscovery**: matches the lock under a transient address by its device identifier
//! - **Host facade**: entities per model profile with range-checked numbers
//!
//! # Supported Devices
//!
//! | Device | Offers |
//! |--------|--------|
//! | Sesame 5 | Lock, numbers, sensors, binary sensors |
//! | Sesame 5 Pro | Lock, numbers, sensors, binary sensors |
//! | Other SesameOS3 locks | Lock |
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use sesame_core::{ConnectionState, DeviceSession, MockLockClient, MechStatus};
//!
//! #[tokio::main]
//! async fn main() -> sesame_core::Result<()> {
//!     let client = Arc::new(MockLockClient::new());
//!     client.set_cached_status(Some(MechStatus { lock_range: true, stop: true, ..Default::default() }));
//!
//!     let session = DeviceSession::builder("AA:BB:CC:DD:EE:FF".parse()?, client).build();
//!     assert_eq!(session.initialize().await?, ConnectionState::Connected);
//!     assert_eq!(session.lock_state().is_locked, Some(true));
//!
//!     session.disconnect().await
//! }
//! ```

pub mod advertisement;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod facade;
pub mod fields;
pub mod guard;
pub mod lock_state;
pub mod mirror;
pub mod mock;
pub mod profile;
pub mod reconnect;
pub mod scan;
pub mod session;
pub mod traits;

// Re-export the types crate for downstream users
pub use sesame_types;
pub use sesame_types::uuid as uuids;
pub use sesame_types::{
    ChangedBy, DeviceAddress, DeviceInfo, DeviceModel, HistoryEntry, HistoryType, MechSettings,
    MechStatus,
};

// Core exports
pub use error::{ConnectionFailureReason, Error, Result};
pub use session::{ConnectionState, DeviceSession, SessionBuilder, SessionOptions};
pub use traits::{ClientEvent, ClientEventKind, LockClient};

pub use advertisement::{Advertisement, DeviceMatcher, SesameAdvertisement, parse_manufacturer_data};
pub use config::{Config, ConfigError, ValidationError};
pub use diagnostics::{Diagnostic, DiagnosticsSink, Level, MemorySink, TracingSink};
pub use events::{
    Command, EventBus, EventKind, EventReceiver, EventSender, EventWaiter, HandlerError,
    HandlerResult, LockEvent, SubscriptionToken,
};
pub use facade::{EntityDescriptor, EntityFacade, EntitySink, EntityState, EntityValue};
pub use fields::{DeviceClass, EntityCategory, FieldValue, SettingsField, StatusField};
pub use guard::SessionGuard;
pub use lock_state::{DerivedLockState, LockCommand, LockState};
pub use mirror::StatusMirror;
pub use mock::{MockLockClient, MockScanner};
pub use profile::{DeviceProfile, GenericLock, Offer, Sesame5, Sesame5Pro, profile_for};
pub use reconnect::ReconnectOptions;
pub use scan::{AdvertisementSource, BtleplugScanner};
