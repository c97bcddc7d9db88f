//! Observable fields of the status and settings snapshots.
//!
//! Each field is a variant of a tagged enum with a lookup function, so an
//! entity can be bound to "the `position` of the latest status" without any
//! reflective attribute access.

use serde::{Deserialize, Serialize};

use sesame_types::{MechSettings, MechStatus};

use crate::error::{Error, Result};
use crate::profile::Offer;

/// A field value as presented to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            FieldValue::Int(_) => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Bool(true) => write!(f, "on"),
            FieldValue::Bool(false) => write!(f, "off"),
        }
    }
}

/// Host-side classification of an entity, where one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Voltage,
    Problem,
    Battery,
    Duration,
}

/// Where the host should list an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    /// Read-only diagnostics.
    Diagnostic,
    /// Adjustable configuration.
    Config,
}

/// Fields of [`MechStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusField {
    Battery,
    Target,
    Position,
    ClutchFailed,
    LockRange,
    UnlockRange,
    Critical,
    Stop,
    LowBattery,
    Clockwise,
}

impl StatusField {
    pub const ALL: [StatusField; 10] = [
        StatusField::Battery,
        StatusField::Target,
        StatusField::Position,
        StatusField::ClutchFailed,
        StatusField::LockRange,
        StatusField::UnlockRange,
        StatusField::Critical,
        StatusField::Stop,
        StatusField::LowBattery,
        StatusField::Clockwise,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            StatusField::Battery => "battery",
            StatusField::Target => "target",
            StatusField::Position => "position",
            StatusField::ClutchFailed => "clutch_failed",
            StatusField::LockRange => "lock_range",
            StatusField::UnlockRange => "unlock_range",
            StatusField::Critical => "critical",
            StatusField::Stop => "stop",
            StatusField::LowBattery => "low_battery",
            StatusField::Clockwise => "clockwise",
        }
    }

    /// Read this field from a snapshot.
    pub fn value(&self, status: &MechStatus) -> FieldValue {
        match self {
            StatusField::Battery => FieldValue::Int(status.battery.into()),
            StatusField::Target => FieldValue::Int(status.target.into()),
            StatusField::Position => FieldValue::Int(status.position.into()),
            StatusField::ClutchFailed => FieldValue::Bool(status.clutch_failed),
            StatusField::LockRange => FieldValue::Bool(status.lock_range),
            StatusField::UnlockRange => FieldValue::Bool(status.unlock_range),
            StatusField::Critical => FieldValue::Bool(status.critical),
            StatusField::Stop => FieldValue::Bool(status.stop),
            StatusField::LowBattery => FieldValue::Bool(status.low_battery),
            StatusField::Clockwise => FieldValue::Bool(status.clockwise),
        }
    }

    /// Numeric fields are sensors, flags are binary sensors.
    pub fn offer(&self) -> Offer {
        match self {
            StatusField::Battery | StatusField::Target | StatusField::Position => Offer::Sensor,
            _ => Offer::BinarySensor,
        }
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self {
            StatusField::Battery => Some("mV"),
            StatusField::Target | StatusField::Position => Some("°"),
            _ => None,
        }
    }

    pub fn device_class(&self) -> Option<DeviceClass> {
        match self {
            StatusField::Battery => Some(DeviceClass::Voltage),
            StatusField::ClutchFailed | StatusField::Critical => Some(DeviceClass::Problem),
            StatusField::LowBattery => Some(DeviceClass::Battery),
            _ => None,
        }
    }

    /// Whether the host should enable the entity when first registering it.
    pub fn enabled_by_default(&self) -> bool {
        matches!(
            self,
            StatusField::Position | StatusField::Critical | StatusField::LowBattery
        )
    }
}

impl std::str::FromStr for StatusField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StatusField::ALL
            .into_iter()
            .find(|f| f.key() == s)
            .ok_or_else(|| Error::InvalidData(format!("unknown status field '{s}'")))
    }
}

/// Fields of [`MechSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsField {
    AutoLockSeconds,
    Lock,
    Unlock,
}

impl SettingsField {
    pub const ALL: [SettingsField; 3] = [
        SettingsField::AutoLockSeconds,
        SettingsField::Lock,
        SettingsField::Unlock,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            SettingsField::AutoLockSeconds => "auto_lock_seconds",
            SettingsField::Lock => "lock",
            SettingsField::Unlock => "unlock",
        }
    }

    pub fn value(&self, settings: &MechSettings) -> FieldValue {
        match self {
            SettingsField::AutoLockSeconds => FieldValue::Int(settings.auto_lock_seconds.into()),
            SettingsField::Lock => FieldValue::Int(settings.lock.into()),
            SettingsField::Unlock => FieldValue::Int(settings.unlock.into()),
        }
    }

    /// Inclusive range accepted by the lock.
    pub fn range(&self) -> (i64, i64) {
        match self {
            SettingsField::AutoLockSeconds => (u16::MIN.into(), u16::MAX.into()),
            SettingsField::Lock | SettingsField::Unlock => (i16::MIN.into(), i16::MAX.into()),
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SettingsField::AutoLockSeconds => "s",
            SettingsField::Lock | SettingsField::Unlock => "°",
        }
    }

    pub fn device_class(&self) -> Option<DeviceClass> {
        match self {
            SettingsField::AutoLockSeconds => Some(DeviceClass::Duration),
            _ => None,
        }
    }

    /// Check `value` against [`range`](Self::range).
    pub fn check(&self, value: i64) -> Result<()> {
        let (min, max) = self.range();
        if (min..=max).contains(&value) {
            Ok(())
        } else {
            Err(Error::out_of_range(self.key(), value, min, max))
        }
    }
}

impl std::str::FromStr for SettingsField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SettingsField::ALL
            .into_iter()
            .find(|f| f.key() == s)
            .ok_or_else(|| Error::InvalidData(format!("unknown settings field '{s}'")))
    }
}
