//! Hardware tests for the BLE scanner.
//!
//! These tests require a Bluetooth adapter and a Sesame lock in range:
//! ```text
//! SESAME_DEVICE="AA:BB:CC:DD:EE:FF" cargo test --package sesame-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::time::Duration;

use sesame_core::scan::AdvertisementSource;
use sesame_core::{BtleplugScanner, DeviceAddress, DeviceMatcher};
use tokio::time::timeout;

/// How long to listen for advertisements.
const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn device_address() -> Option<DeviceAddress> {
    env::var("SESAME_DEVICE").ok()?.parse().ok()
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_scan_finds_sesame_advertisements() {
    init_tracing();
    let scanner = BtleplugScanner::new().await.expect("no Bluetooth adapter");
    let mut rx = scanner.subscribe().await.expect("failed to start scan");

    let found = timeout(SCAN_TIMEOUT, async {
        while let Some(adv) = rx.recv().await {
            if let Some(Ok(payload)) = adv.sesame() {
                println!(
                    "{} model={} registered={} id={} rssi={:?}",
                    adv.address, payload.model_code, payload.registered, payload.device_uuid, adv.rssi
                );
                return true;
            }
        }
        false
    })
    .await;

    assert_eq!(found, Ok(true), "no SesameOS3 advertisement seen");
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_configured_lock_is_present() {
    init_tracing();
    let Some(address) = device_address() else {
        println!("SESAME_DEVICE not set, skipping");
        return;
    };
    let scanner = BtleplugScanner::new().await.expect("no Bluetooth adapter");
    let mut rx = scanner.subscribe().await.expect("failed to start scan");
    let mut matcher = DeviceMatcher::new(address);

    let matched = timeout(SCAN_TIMEOUT, async {
        while let Some(adv) = rx.recv().await {
            if let Some(id) = matcher.learn(&adv) {
                println!("Learned device id {id}");
            }
            if matcher.matches(&adv) {
                return true;
            }
        }
        false
    })
    .await;
    drop(rx);

    assert_eq!(matched, Ok(true), "lock {address} not seen");
    assert!(scanner.is_present(address).await);
}
