//! Mock client and scanner for testing.
//!
//! [`MockLockClient`] implements [`LockClient`] and [`MockScanner`]
//! implements [`AdvertisementSource`], so sessions can be driven end to end
//! without BLE hardware.
//!
//! # Features
//!
//! - **Failure injection**: transient connect failures, history and command failures
//! - **Latency simulation**: artificial delays on connect and commands
//! - **Event injection**: push status and settings, simulate link loss

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use sesame_types::uuid::CANDY_HOUSE_COMPANY_ID;
use sesame_types::{DeviceAddress, HistoryEntry, MechSettings, MechStatus};

use crate::advertisement::Advertisement;
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::scan::AdvertisementSource;
use crate::traits::{ClientEvent, LockClient};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A mock SesameOS3 client.
///
/// # Example
///
/// ```
/// use sesame_core::{LockClient, MockLockClient};
///
/// #[tokio::main]
/// async fn main() {
///     let client = MockLockClient::new();
///     client.connect("AA:BB:CC:DD:EE:FF".parse().unwrap()).await.unwrap();
///     client.lock("test").await.unwrap();
///     assert_eq!(client.lock_count(), 1);
/// }
/// ```
pub struct MockLockClient {
    connected: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
    status: Mutex<Option<MechStatus>>,
    settings: Mutex<Option<MechSettings>>,
    history: Mutex<Option<HistoryEntry>>,
    firmware: Mutex<Option<String>>,
    last_tag: Mutex<Option<String>>,
    last_address: Mutex<Option<DeviceAddress>>,
    applied: Mutex<Vec<MechSettings>>,
    connect_count: AtomicU32,
    disconnect_count: AtomicU32,
    lock_count: AtomicU32,
    unlock_count: AtomicU32,
    apply_count: AtomicU32,
    history_count: AtomicU32,
    /// Connect attempts to fail before succeeding.
    remaining_connect_failures: AtomicU32,
    connect_should_fail: AtomicBool,
    history_should_fail: AtomicBool,
    command_should_fail: AtomicBool,
    /// Push a confirming status after each lock/unlock.
    respond_to_commands: AtomicBool,
    /// Pushed (cached and emitted) as each connect completes.
    status_on_connect: Mutex<Option<MechStatus>>,
    connect_latency_ms: AtomicU64,
    command_latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockLockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLockClient")
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("connect_count", &self.connect_count())
            .finish()
    }
}

impl Default for MockLockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLockClient {
    /// Create a disconnected mock with no cached snapshots.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connected: AtomicBool::new(false),
            events,
            status: Mutex::new(None),
            settings: Mutex::new(None),
            history: Mutex::new(None),
            firmware: Mutex::new(Some("3.0-5.mock".to_string())),
            last_tag: Mutex::new(None),
            last_address: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            lock_count: AtomicU32::new(0),
            unlock_count: AtomicU32::new(0),
            apply_count: AtomicU32::new(0),
            history_count: AtomicU32::new(0),
            remaining_connect_failures: AtomicU32::new(0),
            connect_should_fail: AtomicBool::new(false),
            history_should_fail: AtomicBool::new(false),
            command_should_fail: AtomicBool::new(false),
            respond_to_commands: AtomicBool::new(false),
            status_on_connect: Mutex::new(None),
            connect_latency_ms: AtomicU64::new(0),
            command_latency_ms: AtomicU64::new(0),
        }
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn command_latency(&self) {
        let latency = self.command_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine: nothing is listening yet.
        let _ = self.events.send(event);
    }

    // --- Test control methods ---

    /// Push a status notification, updating the cached snapshot.
    pub fn push_status(&self, status: MechStatus) {
        *lock(&self.status) = Some(status);
        self.emit(ClientEvent::MechStatus(status));
    }

    /// Push a settings notification, updating the cached snapshot.
    pub fn push_settings(&self, settings: MechSettings) {
        *lock(&self.settings) = Some(settings);
        self.emit(ClientEvent::MechSettings(settings));
    }

    /// Set the cached status without emitting an event.
    pub fn set_cached_status(&self, status: Option<MechStatus>) {
        *lock(&self.status) = status;
    }

    /// Set the cached settings without emitting an event.
    pub fn set_cached_settings(&self, settings: Option<MechSettings>) {
        *lock(&self.settings) = settings;
    }

    /// Drop the link as the radio would.
    pub fn simulate_disconnect(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(ClientEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Emit a disconnect notification while the link stays up.
    pub fn emit_stale_disconnect(&self) {
        self.emit(ClientEvent::Disconnected {
            reason: "stale".to_string(),
        });
    }

    /// Fail the next `count` connect attempts.
    pub fn set_transient_connect_failures(&self, count: u32) {
        self.remaining_connect_failures
            .store(count, Ordering::SeqCst);
    }

    /// Fail every connect attempt.
    pub fn set_connect_should_fail(&self, fail: bool) {
        self.connect_should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_history_should_fail(&self, fail: bool) {
        self.history_should_fail.store(fail, Ordering::SeqCst);
    }

    /// Fail lock, unlock and settings writes.
    pub fn set_command_should_fail(&self, fail: bool) {
        self.command_should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_respond_to_commands(&self, respond: bool) {
        self.respond_to_commands.store(respond, Ordering::SeqCst);
    }

    /// Report `status` during the connect handshake, as a real lock does.
    pub fn set_status_on_connect(&self, status: Option<MechStatus>) {
        *lock(&self.status_on_connect) = status;
    }

    /// Set the entry returned by the history tail.
    pub fn set_history(&self, entry: Option<HistoryEntry>) {
        *lock(&self.history) = entry;
    }

    /// Set the firmware version. `None` makes the query fail.
    pub fn set_firmware_version(&self, version: Option<&str>) {
        *lock(&self.firmware) = version.map(str::to_string);
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Delay lock, unlock and settings writes by `latency`.
    pub fn set_command_latency(&self, latency: Duration) {
        self.command_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnect_count.load(Ordering::SeqCst)
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::SeqCst)
    }

    pub fn unlock_count(&self) -> u32 {
        self.unlock_count.load(Ordering::SeqCst)
    }

    pub fn apply_count(&self) -> u32 {
        self.apply_count.load(Ordering::SeqCst)
    }

    pub fn history_count(&self) -> u32 {
        self.history_count.load(Ordering::SeqCst)
    }

    /// Tag passed with the last lock or unlock.
    pub fn last_tag(&self) -> Option<String> {
        lock(&self.last_tag).clone()
    }

    /// Address of the last connect attempt.
    pub fn last_connect_address(&self) -> Option<DeviceAddress> {
        *lock(&self.last_address)
    }

    /// Settings written so far, oldest first.
    pub fn applied_settings(&self) -> Vec<MechSettings> {
        lock(&self.applied).clone()
    }

    async fn command(&self, tag: &str, locked: bool) -> Result<()> {
        self.check_connected()?;
        self.command_latency().await;
        if self.command_should_fail.load(Ordering::SeqCst) {
            return Err(Error::InvalidData("mock command failure".to_string()));
        }
        *lock(&self.last_tag) = Some(tag.to_string());

        if self.respond_to_commands.load(Ordering::SeqCst) {
            let status = MechStatus {
                lock_range: locked,
                unlock_range: !locked,
                stop: true,
                ..lock(&self.status).unwrap_or_default()
            };
            self.push_status(status);
        }
        Ok(())
    }
}

#[async_trait]
impl LockClient for MockLockClient {
    async fn connect(&self, address: DeviceAddress) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_address) = Some(address);

        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        // Check for transient failures first
        if self.remaining_connect_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_connect_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::connection_failed(
                address,
                ConnectionFailureReason::OutOfRange,
            ));
        }
        if self.connect_should_fail.load(Ordering::SeqCst) {
            return Err(Error::connection_failed(
                address,
                ConnectionFailureReason::Rejected,
            ));
        }

        self.connected.store(true, Ordering::SeqCst);
        let reported = *lock(&self.status_on_connect);
        if let Some(status) = reported {
            self.push_status(status);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn current_status(&self) -> Option<MechStatus> {
        *lock(&self.status)
    }

    fn current_settings(&self) -> Option<MechSettings> {
        *lock(&self.settings)
    }

    async fn history_tail(&self) -> Result<Option<HistoryEntry>> {
        self.history_count.fetch_add(1, Ordering::SeqCst);
        if self.history_should_fail.load(Ordering::SeqCst) {
            return Err(Error::Query("mock history failure".to_string()));
        }
        Ok(lock(&self.history).clone())
    }

    async fn firmware_version(&self) -> Result<String> {
        self.check_connected()?;
        lock(&self.firmware)
            .clone()
            .ok_or_else(|| Error::Query("firmware version unavailable".to_string()))
    }

    async fn lock(&self, tag: &str) -> Result<()> {
        self.lock_count.fetch_add(1, Ordering::SeqCst);
        self.command(tag, true).await
    }

    async fn unlock(&self, tag: &str) -> Result<()> {
        self.unlock_count.fetch_add(1, Ordering::SeqCst);
        self.command(tag, false).await
    }

    async fn apply_settings(&self, settings: MechSettings) -> Result<()> {
        self.apply_count.fetch_add(1, Ordering::SeqCst);
        self.check_connected()?;
        self.command_latency().await;
        if self.command_should_fail.load(Ordering::SeqCst) {
            return Err(Error::InvalidData("mock command failure".to_string()));
        }
        lock(&self.applied).push(settings);
        self.push_settings(settings);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// A mock advertisement source.
///
/// Advertisements passed to [`advertise`](Self::advertise) are delivered to
/// every live subscription.
#[derive(Debug, Default)]
pub struct MockScanner {
    present: Mutex<HashSet<DeviceAddress>>,
    subscribers: Mutex<Vec<mpsc::Sender<Advertisement>>>,
    subscribe_count: AtomicU32,
    remaining_subscribe_failures: AtomicU32,
}

impl MockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_present(&self, address: DeviceAddress, present: bool) {
        let mut set = lock(&self.present);
        if present {
            set.insert(address);
        } else {
            set.remove(&address);
        }
    }

    /// Fail the next `count` subscriptions.
    pub fn set_subscribe_failures(&self, count: u32) {
        self.remaining_subscribe_failures
            .store(count, Ordering::SeqCst);
    }

    /// Deliver `adv` to every live subscription. Returns how many received it.
    pub fn advertise(&self, adv: Advertisement) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers
            .iter()
            .filter(|tx| tx.try_send(adv.clone()).is_ok())
            .count()
    }

    /// Subscriptions whose receiver is still alive.
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Subscriptions handed out so far.
    pub fn subscribe_count(&self) -> u32 {
        self.subscribe_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdvertisementSource for MockScanner {
    async fn is_present(&self, address: DeviceAddress) -> bool {
        lock(&self.present).contains(&address)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Advertisement>> {
        if self.remaining_subscribe_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_subscribe_failures
                .fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Bluetooth(btleplug::Error::NotSupported(
                "mock scan failure".to_string(),
            )));
        }
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        lock(&self.subscribers).push(tx);
        Ok(rx)
    }
}

/// An advertisement carrying a CANDY HOUSE payload.
pub fn sesame_advertisement(
    address: DeviceAddress,
    model_code: u16,
    device_uuid: Uuid,
) -> Advertisement {
    let mut data = model_code.to_le_bytes().to_vec();
    data.push(1);
    data.extend_from_slice(device_uuid.as_bytes());
    Advertisement::new(address).with_manufacturer_data(CANDY_HOUSE_COMPANY_ID, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ClientEventKind;
    use sesame_types::HistoryType;

    fn address() -> DeviceAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    #[tokio::test]
    async fn test_mock_connect() {
        let client = MockLockClient::new();
        assert!(!client.is_connected().await);
        client.connect(address()).await.unwrap();
        assert!(client.is_connected().await);
        client.disconnect().await.unwrap();
        assert!(!client.is_connected().await);
        assert_eq!(client.connect_count(), 1);
        assert_eq!(client.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_connect_failures() {
        let client = MockLockClient::new();
        client.set_transient_connect_failures(2);

        assert!(client.connect(address()).await.is_err());
        assert!(client.connect(address()).await.is_err());
        client.connect(address()).await.unwrap();
        assert_eq!(client.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let client = MockLockClient::new();
        assert!(matches!(client.lock("t").await, Err(Error::NotConnected)));
        assert!(matches!(
            client.apply_settings(MechSettings::default()).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_respond_to_commands() {
        let client = MockLockClient::new();
        client.connect(address()).await.unwrap();
        client.set_respond_to_commands(true);
        let mut rx = client.events();

        client.lock("front").await.unwrap();
        let Ok(ClientEvent::MechStatus(status)) = rx.recv().await else {
            panic!("expected a status event");
        };
        assert!(status.lock_range);
        assert!(status.stop);
        assert_eq!(client.last_tag().as_deref(), Some("front"));
        assert_eq!(client.current_status(), Some(status));
    }

    #[tokio::test]
    async fn test_apply_settings_records_and_notifies() {
        let client = MockLockClient::new();
        client.connect(address()).await.unwrap();
        let settings = MechSettings {
            lock: 10,
            unlock: 90,
            auto_lock_seconds: 30,
        };
        client.apply_settings(settings).await.unwrap();
        assert_eq!(client.applied_settings(), vec![settings]);
        assert_eq!(client.current_settings(), Some(settings));
    }

    #[tokio::test]
    async fn test_history_failure() {
        let client = MockLockClient::new();
        client.set_history(Some(HistoryEntry::new(1, HistoryType::Autolock)));
        assert!(client.history_tail().await.unwrap().is_some());

        client.set_history_should_fail(true);
        assert!(matches!(client.history_tail().await, Err(Error::Query(_))));
        assert_eq!(client.history_count(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_default_method() {
        let client = MockLockClient::new();
        client.connect(address()).await.unwrap();

        let waiting = client.wait_for(ClientEventKind::Disconnected, Duration::from_secs(1));
        let (event, ()) = tokio::join!(waiting, async {
            tokio::task::yield_now().await;
            client.simulate_disconnect("gone");
        });
        assert_eq!(
            event.unwrap(),
            ClientEvent::Disconnected {
                reason: "gone".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let client = MockLockClient::new();
        let err = client
            .wait_for(ClientEventKind::MechStatus, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_scanner_delivers_to_live_subscriptions() {
        let scanner = MockScanner::new();
        let mut rx = scanner.subscribe().await.unwrap();
        assert_eq!(scanner.active_subscriptions(), 1);

        assert_eq!(scanner.advertise(Advertisement::new(address())), 1);
        assert_eq!(rx.recv().await.unwrap().address, address());

        drop(rx);
        assert_eq!(scanner.active_subscriptions(), 0);
        assert_eq!(scanner.advertise(Advertisement::new(address())), 0);
    }

    #[tokio::test]
    async fn test_scanner_presence_and_failures() {
        let scanner = MockScanner::new();
        assert!(!scanner.is_present(address()).await);
        scanner.set_present(address(), true);
        assert!(scanner.is_present(address()).await);

        scanner.set_subscribe_failures(1);
        assert!(scanner.subscribe().await.is_err());
        assert!(scanner.subscribe().await.is_ok());
        assert_eq!(scanner.subscribe_count(), 1);
    }

    #[test]
    fn test_sesame_advertisement_payload() {
        let id = Uuid::from_u128(0x1234);
        let adv = sesame_advertisement(address(), 5, id);
        let payload = adv.sesame().unwrap().unwrap();
        assert_eq!(payload.device_uuid, id);
        assert_eq!(payload.model_code, 5);
    }
}
