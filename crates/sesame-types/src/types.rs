//! Core types for SesameOS3 lock state.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

/// A 6-byte Bluetooth device address.
///
/// Parses `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` and bare `AABBCCDDEEFF`
/// (case-insensitive). Displays in upper-case colon form.
///
/// # Examples
///
/// ```
/// use sesame_types::DeviceAddress;
///
/// let addr: DeviceAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
/// assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
/// assert_eq!(addr.format_mac(), "aa:bb:cc:dd:ee:ff");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Create an address from raw bytes (most significant byte first).
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes.
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Lower-case colon form, used to build stable unique identifiers.
    #[must_use]
    pub fn format_mac(&self) -> String {
        self.to_string().to_lowercase()
    }
}

impl FromStr for DeviceAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex: String = trimmed
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();

        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::InvalidAddress(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = hex
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| ParseError::InvalidAddress(s.to_string()))?;
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| ParseError::InvalidAddress(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[cfg(feature = "serde")]
impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// SesameOS3 lock models.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new models
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum DeviceModel {
    /// Sesame 5.
    Sesame5,
    /// Sesame 5 Pro.
    Sesame5Pro,
    /// Any other SesameOS3 lock; only the lock itself is exposed.
    Generic,
}

impl DeviceModel {
    /// Model code carried in the manufacturer advertisement payload.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            5 => Some(DeviceModel::Sesame5),
            7 => Some(DeviceModel::Sesame5Pro),
            _ => None,
        }
    }

    /// Human-readable model name, as shown in device metadata.
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            DeviceModel::Sesame5 => "Sesame 5",
            DeviceModel::Sesame5Pro => "Sesame 5 Pro",
            DeviceModel::Generic => "SesameOS3 Lock",
        }
    }
}

impl FromStr for DeviceModel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "sesame5" | "sesame_5" => Ok(DeviceModel::Sesame5),
            "sesame5_pro" | "sesame_5_pro" | "sesame5pro" => Ok(DeviceModel::Sesame5Pro),
            "generic" => Ok(DeviceModel::Generic),
            _ => Err(ParseError::UnknownModel(s.to_string())),
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Mechanical status reported by the lock.
///
/// A snapshot is replaced wholesale on every status event; fields are never
/// merged across snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MechStatus {
    /// Battery voltage in millivolts.
    pub battery: u16,
    /// Angle the motor is driving toward, in degrees.
    pub target: i16,
    /// Current angle of the thumb-turn, in degrees.
    pub position: i16,
    /// The clutch failed to engage.
    pub clutch_failed: bool,
    /// Position is inside the configured lock range.
    pub lock_range: bool,
    /// Position is inside the configured unlock range.
    pub unlock_range: bool,
    /// The mechanism reported a critical condition.
    pub critical: bool,
    /// The motor is not moving.
    pub stop: bool,
    /// Battery is low.
    pub low_battery: bool,
    /// The motor is turning clockwise.
    pub clockwise: bool,
}

/// Mechanical settings of the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MechSettings {
    /// Lock position threshold, in degrees.
    pub lock: i16,
    /// Unlock position threshold, in degrees.
    pub unlock: i16,
    /// Auto-lock delay in seconds (0 disables auto-lock).
    pub auto_lock_seconds: u16,
}

impl MechSettings {
    /// Whether the lock position sits at a lower angle than the unlock position.
    ///
    /// Together with [`MechStatus::clockwise`] this decides whether a moving
    /// mechanism is travelling toward lock or toward unlock.
    #[must_use]
    pub fn lock_below_unlock(&self) -> bool {
        self.lock < self.unlock
    }
}

/// Type of a device history record.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
#[repr(u8)]
pub enum HistoryType {
    None = 0,
    BleLock = 1,
    BleUnlock = 2,
    TimeChanged = 3,
    AutolockUpdated = 4,
    MechSettingUpdated = 5,
    Autolock = 6,
    ManualLocked = 7,
    ManualUnlocked = 8,
    ManualElse = 9,
    DriveLocked = 10,
    DriveUnlocked = 11,
    DriveFailed = 12,
    BleAdvParameterUpdated = 13,
    Wm2Lock = 14,
    Wm2Unlock = 15,
    WebLock = 16,
    WebUnlock = 17,
    BleClick = 18,
    Wm2Click = 19,
    WebClick = 20,
    DriveClicked = 21,
}

impl TryFrom<u8> for HistoryType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use HistoryType::*;
        Ok(match value {
            0 => HistoryType::None,
            1 => BleLock,
            2 => BleUnlock,
            3 => TimeChanged,
            4 => AutolockUpdated,
            5 => MechSettingUpdated,
            6 => Autolock,
            7 => ManualLocked,
            8 => ManualUnlocked,
            9 => ManualElse,
            10 => DriveLocked,
            11 => DriveUnlocked,
            12 => DriveFailed,
            13 => BleAdvParameterUpdated,
            14 => Wm2Lock,
            15 => Wm2Unlock,
            16 => WebLock,
            17 => WebUnlock,
            18 => BleClick,
            19 => Wm2Click,
            20 => WebClick,
            21 => DriveClicked,
            other => return Err(ParseError::UnknownHistoryType(other)),
        })
    }
}

/// The most recent history record of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistoryEntry {
    /// Record sequence number.
    pub id: i32,
    /// What happened.
    pub history_type: HistoryType,
    /// When it happened, if the device clock is set.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub timestamp: Option<time::OffsetDateTime>,
    /// Actor label attached to the command, if any.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub tag: Option<String>,
}

impl HistoryEntry {
    /// Create an entry with only a type, as most callers need.
    pub fn new(id: i32, history_type: HistoryType) -> Self {
        Self {
            id,
            history_type,
            timestamp: None,
            tag: None,
        }
    }
}

/// Actor class responsible for the most recent lock/unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ChangedBy {
    /// The lock's own auto-lock timer.
    Autolock,
    /// A Bluetooth command.
    Bluetooth,
    /// A command relayed through the cloud.
    Web,
    /// Someone turned the thumb-turn by hand.
    Manual,
}

impl ChangedBy {
    /// Classify a history record type. Types that are not lock/unlock
    /// actions by a recognised actor map to `None`.
    ///
    /// ```
    /// use sesame_types::{ChangedBy, HistoryType};
    ///
    /// assert_eq!(ChangedBy::from_history_type(HistoryType::BleUnlock), Some(ChangedBy::Bluetooth));
    /// assert_eq!(ChangedBy::from_history_type(HistoryType::TimeChanged), None);
    /// ```
    #[must_use]
    pub fn from_history_type(history_type: HistoryType) -> Option<Self> {
        match history_type {
            HistoryType::Autolock => Some(ChangedBy::Autolock),
            HistoryType::BleLock | HistoryType::BleUnlock => Some(ChangedBy::Bluetooth),
            HistoryType::WebLock | HistoryType::WebUnlock => Some(ChangedBy::Web),
            HistoryType::ManualLocked | HistoryType::ManualUnlocked | HistoryType::ManualElse => {
                Some(ChangedBy::Manual)
            }
            _ => None,
        }
    }

    /// Stable lower-case label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangedBy::Autolock => "autolock",
            ChangedBy::Bluetooth => "bluetooth",
            ChangedBy::Web => "web",
            ChangedBy::Manual => "manual",
        }
    }
}

impl fmt::Display for ChangedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device metadata published once the lock is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// User-facing device name.
    pub name: String,
    /// Model name.
    pub model: String,
    /// Manufacturer name.
    pub manufacturer: String,
    /// Firmware version, once fetched from the device.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub sw_version: Option<String>,
}
