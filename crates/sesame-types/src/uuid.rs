//! Bluetooth identifiers for SesameOS3 devices.

use uuid::{Uuid, uuid};

/// CANDY HOUSE Bluetooth SIG company identifier.
///
/// Manufacturer-specific advertisement data for SesameOS3 devices is keyed
/// by this value.
pub const CANDY_HOUSE_COMPANY_ID: u16 = 0x055A;

/// SesameOS3 primary service (16-bit UUID 0xFD81).
pub const SESAME_SERVICE: Uuid = uuid!("0000fd81-0000-1000-8000-00805f9b34fb");

/// Manufacturer string reported for every SesameOS3 device.
pub const MANUFACTURER: &str = "CANDY HOUSE JAPAN, Inc.";
