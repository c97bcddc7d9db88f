//! Platform-agnostic types for SesameOS3 smart locks.
//!
//! This crate holds the plain data shared by every layer of the session
//! manager: device addresses, mechanical status and settings snapshots,
//! history records and device metadata.
//!
//! # Example
//!
//! ```
//! use sesame_types::{DeviceAddress, MechSettings, MechStatus};
//!
//! let addr: DeviceAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
//! let settings = MechSettings { lock: -90, unlock: 90, auto_lock_seconds: 0 };
//! let status = MechStatus { lock_range: true, stop: true, ..Default::default() };
//! assert!(settings.lock_below_unlock());
//! assert!(status.lock_range);
//! # let _ = addr;
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{
    ChangedBy, DeviceAddress, DeviceInfo, DeviceModel, HistoryEntry, HistoryType, MechSettings,
    MechStatus,
};
pub use uuid as uuids;
