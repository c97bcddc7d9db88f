//! Per-model capability sets.
//!
//! A [`DeviceProfile`] says which kinds of entities ("offers") a lock model
//! exposes to the host and which snapshot fields back them. The lock itself
//! is always offered.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use sesame_types::DeviceModel;

use crate::fields::{SettingsField, StatusField};

/// A capability category exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Offer {
    Lock,
    Number,
    Sensor,
    BinarySensor,
}

/// Capabilities of one lock model.
pub trait DeviceProfile: Send + Sync + std::fmt::Debug {
    fn model(&self) -> DeviceModel;

    /// Offer categories, in registration order.
    fn offers(&self) -> &'static [Offer];

    /// Status fields exposed as sensors or binary sensors.
    fn sensors(&self) -> &'static [StatusField] {
        &[]
    }

    /// Settings fields exposed as adjustable numbers.
    fn numbers(&self) -> &'static [SettingsField] {
        &[]
    }

    fn offers_kind(&self, offer: Offer) -> bool {
        self.offers().contains(&offer)
    }
}

const FULL_OFFERS: &[Offer] = &[Offer::Lock, Offer::Number, Offer::Sensor, Offer::BinarySensor];

const MOTORISED_NUMBERS: &[SettingsField] = &[
    SettingsField::AutoLockSeconds,
    SettingsField::Lock,
    SettingsField::Unlock,
];

/// Sesame 5.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sesame5;

impl DeviceProfile for Sesame5 {
    fn model(&self) -> DeviceModel {
        DeviceModel::Sesame5
    }

    fn offers(&self) -> &'static [Offer] {
        FULL_OFFERS
    }

    fn sensors(&self) -> &'static [StatusField] {
        &StatusField::ALL
    }

    fn numbers(&self) -> &'static [SettingsField] {
        MOTORISED_NUMBERS
    }
}

/// Sesame 5 Pro. Same mechanism and telemetry as the Sesame 5.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sesame5Pro;

impl DeviceProfile for Sesame5Pro {
    fn model(&self) -> DeviceModel {
        DeviceModel::Sesame5Pro
    }

    fn offers(&self) -> &'static [Offer] {
        FULL_OFFERS
    }

    fn sensors(&self) -> &'static [StatusField] {
        &StatusField::ALL
    }

    fn numbers(&self) -> &'static [SettingsField] {
        MOTORISED_NUMBERS
    }
}

/// Any other SesameOS3 lock: lock and unlock only.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericLock;

impl DeviceProfile for GenericLock {
    fn model(&self) -> DeviceModel {
        DeviceModel::Generic
    }

    fn offers(&self) -> &'static [Offer] {
        &[Offer::Lock]
    }
}

/// Profile for a model.
pub fn profile_for(model: DeviceModel) -> Arc<dyn DeviceProfile> {
    match model {
        DeviceModel::Sesame5 => Arc::new(Sesame5),
        DeviceModel::Sesame5Pro => Arc::new(Sesame5Pro),
        _ => Arc::new(GenericLock),
    }
}
