//! Advertisement decoding and candidate matching.
//!
//! SesameOS3 locks advertise manufacturer-specific data under the CANDY HOUSE
//! company identifier. The payload carries the model code, a registration
//! flag and the lock's 16-byte device identifier, which stays stable when the
//! radio address does not.
//!
//! Payload layout (little-endian, company identifier already stripped):
//! - bytes 0-1: model code (u16)
//! - byte 2: registered flag
//! - bytes 3-18: device identifier

use std::collections::HashMap;

use bytes::Buf;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sesame_types::uuid::CANDY_HOUSE_COMPANY_ID;
use sesame_types::{DeviceAddress, DeviceModel};

use crate::error::{Error, Result};

/// Minimum manufacturer payload length.
pub const MANUFACTURER_DATA_LEN: usize = 19;

/// One advertisement observed by a scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertised radio address.
    pub address: DeviceAddress,
    /// Signal strength in dBm, if reported.
    pub rssi: Option<i16>,
    /// Manufacturer-specific data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

impl Advertisement {
    /// An advertisement carrying only an address.
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            rssi: None,
            manufacturer_data: HashMap::new(),
            services: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    #[must_use]
    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, data);
        self
    }

    /// Decode the CANDY HOUSE payload, if the advertisement carries one.
    pub fn sesame(&self) -> Option<Result<SesameAdvertisement>> {
        self.manufacturer_data
            .get(&CANDY_HOUSE_COMPANY_ID)
            .map(|data| parse_manufacturer_data(data))
    }
}

/// Decoded CANDY HOUSE manufacturer payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SesameAdvertisement {
    /// Raw model code.
    pub model_code: u16,
    /// Whether the lock has been registered to an owner.
    pub registered: bool,
    /// Stable 16-byte device identifier.
    pub device_uuid: Uuid,
}

impl SesameAdvertisement {
    /// Known model for the advertised code.
    pub fn model(&self) -> Option<DeviceModel> {
        DeviceModel::from_code(self.model_code)
    }
}

/// Parse a CANDY HOUSE manufacturer payload (company identifier excluded).
pub fn parse_manufacturer_data(data: &[u8]) -> Result<SesameAdvertisement> {
    if data.len() < MANUFACTURER_DATA_LEN {
        return Err(Error::InvalidData(format!(
            "SesameOS3 advertisement requires {} bytes, got {}",
            MANUFACTURER_DATA_LEN,
            data.len()
        )));
    }

    let mut buf = data;
    let model_code = buf.get_u16_le();
    let registered = buf.get_u8() != 0;
    let mut id = [0u8; 16];
    buf.copy_to_slice(&mut id);

    Ok(SesameAdvertisement {
        model_code,
        registered,
        device_uuid: Uuid::from_bytes(id),
    })
}

/// Decides whether an advertisement belongs to the session's lock.
///
/// An advertisement matches if its address equals the lock's address, or if
/// its CANDY HOUSE payload carries the recorded device identifier (the lock
/// is advertising from a transient address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMatcher {
    address: DeviceAddress,
    device_uuid: Option<Uuid>,
}

impl DeviceMatcher {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            device_uuid: None,
        }
    }

    /// Match by a known device identifier as well as by address.
    #[must_use]
    pub fn with_device_uuid(mut self, device_uuid: Uuid) -> Self {
        self.device_uuid = Some(device_uuid);
        self
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn device_uuid(&self) -> Option<Uuid> {
        self.device_uuid
    }

    /// Whether `adv` was sent by this lock.
    pub fn matches(&self, adv: &Advertisement) -> bool {
        if adv.address == self.address {
            return true;
        }
        match (self.device_uuid, adv.sesame()) {
            (Some(expected), Some(Ok(payload))) => payload.device_uuid == expected,
            _ => false,
        }
    }

    /// Record the device identifier from an advertisement sent from the
    /// lock's own address. Returns the identifier if it was newly learned.
    pub fn learn(&mut self, adv: &Advertisement) -> Option<Uuid> {
        if self.device_uuid.is_some() || adv.address != self.address {
            return None;
        }
        let payload = adv.sesame()?.ok()?;
        self.device_uuid = Some(payload.device_uuid);
        Some(payload.device_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: [u8; 16] = [
        0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC,
        0xFE,
    ];

    fn payload(model: u16, registered: bool) -> Vec<u8> {
        let mut data = model.to_le_bytes().to_vec();
        data.push(registered as u8);
        data.extend_from_slice(&ID);
        data
    }

    fn home() -> DeviceAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    fn other() -> DeviceAddress {
        "11:22:33:44:55:66".parse().unwrap()
    }

    #[test]
    fn test_parse_manufacturer_data() {
        let adv = parse_manufacturer_data(&payload(5, true)).unwrap();
        assert_eq!(adv.model_code, 5);
        assert_eq!(adv.model(), Some(DeviceModel::Sesame5));
        assert!(adv.registered);
        assert_eq!(adv.device_uuid, Uuid::from_bytes(ID));
    }

    #[test]
    fn test_parse_manufacturer_data_too_short() {
        let err = parse_manufacturer_data(&[5, 0, 1]).unwrap_err();
        assert!(err.to_string().contains("requires 19 bytes"));
    }

    #[test]
    fn test_parse_unknown_model_keeps_code() {
        let adv = parse_manufacturer_data(&payload(0x7F, false)).unwrap();
        assert_eq!(adv.model(), None);
        assert!(!adv.registered);
    }

    #[test]
    fn test_matches_by_address() {
        let matcher = DeviceMatcher::new(home());
        assert!(matcher.matches(&Advertisement::new(home())));
        assert!(!matcher.matches(&Advertisement::new(other())));
    }

    #[test]
    fn test_matches_transient_address_by_uuid() {
        let matcher = DeviceMatcher::new(home()).with_device_uuid(Uuid::from_bytes(ID));
        let adv = Advertisement::new(other())
            .with_manufacturer_data(CANDY_HOUSE_COMPANY_ID, payload(5, true));
        assert!(matcher.matches(&adv));

        // Same payload under another company id is not ours.
        let adv = Advertisement::new(other()).with_manufacturer_data(0x004C, payload(5, true));
        assert!(!matcher.matches(&adv));
    }

    #[test]
    fn test_no_uuid_match_without_recorded_uuid() {
        let matcher = DeviceMatcher::new(home());
        let adv = Advertisement::new(other())
            .with_manufacturer_data(CANDY_HOUSE_COMPANY_ID, payload(5, true));
        assert!(!matcher.matches(&adv));
    }

    #[test]
    fn test_learn_from_own_address_only() {
        let mut matcher = DeviceMatcher::new(home());
        let foreign = Advertisement::new(other())
            .with_manufacturer_data(CANDY_HOUSE_COMPANY_ID, payload(5, true));
        assert_eq!(matcher.learn(&foreign), None);

        let own = Advertisement::new(home())
            .with_rssi(-60)
            .with_manufacturer_data(CANDY_HOUSE_COMPANY_ID, payload(5, true));
        assert_eq!(matcher.learn(&own), Some(Uuid::from_bytes(ID)));
        assert_eq!(matcher.learn(&own), None);
        assert!(matcher.matches(&foreign));
    }
}
