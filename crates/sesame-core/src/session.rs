//! Connection manager for one lock.
//!
//! A [`DeviceSession`] owns the lifecycle of the link to a single lock:
//!
//! ```text
//! Disconnected -> Connecting -> Synchronizing -> Connected
//!                    |  ^                           |
//!          (backoff) v  | matching advertisement    | link lost
//!                  Scanning <-----------------------+
//! ```
//!
//! Every transition runs under one async mutex, so at most one connect
//! attempt is ever in flight and the state is written by transition code
//! only. Device events flow from the client into the session's
//! [`EventBus`]; the [`StatusMirror`] and the lock-state tracker are plain
//! bus observers.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sesame_core::{DeviceSession, BtleplugScanner};
//!
//! let scanner = Arc::new(BtleplugScanner::new().await?);
//! let session = DeviceSession::builder("AA:BB:CC:DD:EE:FF".parse()?, client)
//!     .scanner(scanner)
//!     .build();
//! session.initialize().await?;
//! session.lock().await?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use sesame_types::uuid::MANUFACTURER;
use sesame_types::{ChangedBy, DeviceAddress, DeviceInfo, MechSettings, MechStatus};

use crate::advertisement::{Advertisement, DeviceMatcher};
use crate::diagnostics::{Diagnostic, DiagnosticsSink, TracingSink};
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::events::{
    Command, EventBus, EventKind, EventReceiver, HandlerResult, LockEvent, SubscriptionToken,
};
use crate::lock_state::{DerivedLockState, LockCommand, LockStateTracker};
use crate::mirror::StatusMirror;
use crate::profile::{DeviceProfile, profile_for};
use crate::reconnect::ReconnectOptions;
use crate::scan::AdvertisementSource;
use crate::traits::{ClientEvent, LockClient};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Synchronizing,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Synchronizing => "synchronizing",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Default actor label sent with lock and unlock commands.
pub const DEFAULT_COMMAND_TAG: &str = "sesame-core";

/// Timeouts and policies of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Limit on a single connect attempt.
    pub connect_timeout: Duration,
    /// How long synchronization waits for the first status.
    pub initial_status_timeout: Duration,
    /// How long a command waits for the client and for a confirming status.
    pub command_status_timeout: Duration,
    /// Buffer of the bus's broadcast view.
    pub event_capacity: usize,
    /// Actor label sent with lock and unlock commands.
    pub command_tag: String,
    /// Backoff between a failed connect and the next scan.
    pub reconnect: ReconnectOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            initial_status_timeout: Duration::from_secs(10),
            command_status_timeout: Duration::from_secs(10),
            event_capacity: 64,
            command_tag: DEFAULT_COMMAND_TAG.to_string(),
            reconnect: ReconnectOptions::default(),
        }
    }
}

/// Builder for [`DeviceSession`].
pub struct SessionBuilder {
    address: DeviceAddress,
    client: Arc<dyn LockClient>,
    name: Option<String>,
    profile: Option<Arc<dyn DeviceProfile>>,
    scanner: Option<Arc<dyn AdvertisementSource>>,
    device_uuid: Option<Uuid>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    options: SessionOptions,
}

impl SessionBuilder {
    /// Display name of the lock. Defaults to the model name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Capability profile. Defaults to the Sesame 5 profile.
    #[must_use]
    pub fn profile(mut self, profile: Arc<dyn DeviceProfile>) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Source of advertisements used while scanning.
    ///
    /// Without one the session only reacts to
    /// [`DeviceSession::on_advertisement`].
    #[must_use]
    pub fn scanner(mut self, scanner: Arc<dyn AdvertisementSource>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Known device identifier, for rediscovery under a transient address.
    #[must_use]
    pub fn device_uuid(mut self, device_uuid: Uuid) -> Self {
        self.device_uuid = Some(device_uuid);
        self
    }

    /// Sink for diagnostics. Defaults to [`TracingSink`].
    #[must_use]
    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    #[must_use]
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> DeviceSession {
        let diagnostics = self
            .diagnostics
            .unwrap_or_else(|| Arc::new(TracingSink::for_device(self.address)));
        let profile = self
            .profile
            .unwrap_or_else(|| profile_for(sesame_types::DeviceModel::Sesame5));
        let name = self
            .name
            .unwrap_or_else(|| profile.model().display_name().to_string());
        let mut matcher = DeviceMatcher::new(self.address);
        if let Some(device_uuid) = self.device_uuid {
            matcher = matcher.with_device_uuid(device_uuid);
        }
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        DeviceSession {
            inner: Arc::new(Inner {
                address: self.address,
                name,
                profile,
                client: self.client,
                scanner: self.scanner,
                bus: EventBus::new(self.options.event_capacity, Arc::clone(&diagnostics)),
                options: self.options,
                mirror: Arc::new(StatusMirror::new()),
                tracker: LockStateTracker::new(),
                diagnostics,
                state_tx,
                transition: tokio::sync::Mutex::new(()),
                matcher: Mutex::new(matcher),
                scan: Mutex::new(None),
                candidate_claimed: AtomicBool::new(false),
                device_info: RwLock::new(None),
                failures: AtomicU32::new(0),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                pump: Mutex::new(None),
                seed: Arc::new(Notify::new()),
                own_tokens: Mutex::new(Vec::new()),
            }),
        }
    }
}

type TransitionGuard<'a> = tokio::sync::MutexGuard<'a, ()>;

struct ScanHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    address: DeviceAddress,
    name: String,
    profile: Arc<dyn DeviceProfile>,
    client: Arc<dyn LockClient>,
    scanner: Option<Arc<dyn AdvertisementSource>>,
    options: SessionOptions,
    bus: EventBus,
    mirror: Arc<StatusMirror>,
    tracker: LockStateTracker,
    diagnostics: Arc<dyn DiagnosticsSink>,
    state_tx: watch::Sender<ConnectionState>,
    /// Held for the whole of every state transition.
    transition: tokio::sync::Mutex<()>,
    matcher: Mutex<DeviceMatcher>,
    scan: Mutex<Option<ScanHandle>>,
    /// Set once an advertisement has been handed to a connect attempt during
    /// the current scanning period.
    candidate_claimed: AtomicBool,
    device_info: RwLock<Option<DeviceInfo>>,
    /// Consecutive failed connect attempts.
    failures: AtomicU32,
    cancel: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Asks the pump to apply the client's cached snapshots.
    seed: Arc<Notify>,
    own_tokens: Mutex<Vec<SubscriptionToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runtime session for one lock.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.inner.address)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceSession {
    /// Start building a session for the lock at `address`.
    pub fn builder(address: DeviceAddress, client: Arc<dyn LockClient>) -> SessionBuilder {
        SessionBuilder {
            address,
            client,
            name: None,
            profile: None,
            scanner: None,
            device_uuid: None,
            diagnostics: None,
            options: SessionOptions::default(),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.inner.address
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn profile(&self) -> Arc<dyn DeviceProfile> {
        Arc::clone(&self.inner.profile)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> Result<()> {
        let mut rx = self.state_changes();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::timeout(format!("wait for state {target}"), timeout)),
        }
    }

    /// The session's event bus.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Register a handler on the session's bus.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionToken
    where
        F: Fn(&LockEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(kind, handler)
    }

    /// Remove a handler. Unsubscribing twice is a no-op.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.inner.bus.unsubscribe(token)
    }

    /// Broadcast view of every event.
    pub fn stream(&self) -> EventReceiver {
        self.inner.bus.stream()
    }

    /// Latest status snapshot.
    pub fn status(&self) -> Option<MechStatus> {
        self.inner.mirror.status()
    }

    /// Latest settings snapshot.
    pub fn settings(&self) -> Option<MechSettings> {
        self.inner.mirror.settings()
    }

    /// The lock state derived from the current snapshots.
    pub fn lock_state(&self) -> DerivedLockState {
        self.inner.derived()
    }

    /// Device metadata, once the lock has been reached.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.inner
            .device_info
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Device identifier used to recognise the lock under another address.
    pub fn device_uuid(&self) -> Option<Uuid> {
        lock(&self.inner.matcher).device_uuid()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Start the session and attempt the first connection.
    ///
    /// A failed attempt is not an error: the session backs off and starts
    /// scanning. Returns the state reached. Calling this again after the
    /// first call only reports the current state.
    pub async fn initialize(&self) -> Result<ConnectionState> {
        if self.is_closed() {
            return Err(Error::Cancelled);
        }
        if !self.inner.start() {
            return Ok(self.state());
        }
        Ok(self.inner.initial_connect().await)
    }

    /// Feed an advertisement observed by the host.
    ///
    /// Returns `true` if it matched the lock and was handed to a connect
    /// attempt. Only the first match of a scanning period is taken.
    pub fn on_advertisement(&self, adv: Advertisement) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.start();
        self.inner.offer_candidate(adv)
    }

    /// Lock the device.
    pub async fn lock(&self) -> Result<()> {
        self.inner.run_lock_command(LockCommand::Lock).await
    }

    /// Unlock the device.
    pub async fn unlock(&self) -> Result<()> {
        self.inner.run_lock_command(LockCommand::Unlock).await
    }

    /// Set the lock position threshold, in degrees.
    pub async fn set_lock_threshold(&self, degrees: i16) -> Result<()> {
        self.inner
            .update_settings(Command::SetLockThreshold(degrees), |s| s.lock = degrees)
            .await
    }

    /// Set the unlock position threshold, in degrees.
    pub async fn set_unlock_threshold(&self, degrees: i16) -> Result<()> {
        self.inner
            .update_settings(Command::SetUnlockThreshold(degrees), |s| s.unlock = degrees)
            .await
    }

    /// Set the auto-lock delay in seconds (0 disables it).
    pub async fn set_autolock_duration(&self, seconds: u16) -> Result<()> {
        self.inner
            .update_settings(Command::SetAutolockDuration(seconds), |s| {
                s.auto_lock_seconds = seconds
            })
            .await
    }

    /// Report a command the caller rejected before it reached the lock.
    pub(crate) fn report_command_failure(&self, command: Command, error: &Error) {
        self.inner.report_command_failure(command, error);
    }

    /// Tear the session down.
    ///
    /// Cancels any outstanding connect attempt or history lookup, releases
    /// the scan subscription and closes the client link. Each resource is
    /// released once; calling this again is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, diagnostic: Diagnostic) {
        self.diagnostics.record(diagnostic);
    }

    /// Only transition code holds a [`TransitionGuard`].
    fn set_state(&self, _guard: &TransitionGuard<'_>, to: ConnectionState) {
        let from = self.state_tx.send_replace(to);
        if from != to {
            self.record(Diagnostic::StateChanged { from, to });
            self.bus.dispatch(LockEvent::Connection { state: to });
        }
    }

    fn derived(&self) -> DerivedLockState {
        self.tracker
            .derive(self.mirror.status().as_ref(), self.mirror.settings().as_ref())
    }

    fn publish_lock_state(&self) {
        self.bus.dispatch(LockEvent::LockState {
            state: self.derived(),
        });
    }

    /// Start the event pump and attach the session's own observers.
    /// Returns `false` if already started.
    fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let mut tokens = self.mirror.attach(&self.bus).to_vec();

        let weak = Arc::downgrade(self);
        tokens.push(self.bus.subscribe(EventKind::MechStatus, move |_| {
            if let Some(inner) = weak.upgrade() {
                let generation = inner.tracker.on_status();
                inner.publish_lock_state();
                inner.spawn_history_refresh(generation);
            }
            Ok(())
        }));

        let weak = Arc::downgrade(self);
        tokens.push(self.bus.subscribe(EventKind::MechSettings, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.publish_lock_state();
            }
            Ok(())
        }));

        lock(&self.own_tokens).extend(tokens);
        *lock(&self.pump) = Some(self.spawn_pump());
        true
    }

    /// Forward client events to the bus until the session closes.
    ///
    /// The pump is the only path from the client onto the bus. A seed
    /// request is served only once every queued client event has been
    /// forwarded, so a snapshot the client both cached and emitted is
    /// delivered once.
    fn spawn_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.client.events();
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let seed = Arc::clone(&self.seed);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => Some(received),
                    _ = seed.notified() => None,
                };
                let Some(inner) = weak.upgrade() else { break };
                let Some(received) = received else {
                    inner.seed_from_cache();
                    continue;
                };
                match received {
                    Ok(ClientEvent::MechStatus(status)) => {
                        inner.bus.dispatch(LockEvent::MechStatus { status });
                    }
                    Ok(ClientEvent::MechSettings(settings)) => {
                        inner.bus.dispatch(LockEvent::MechSettings { settings });
                    }
                    Ok(ClientEvent::Disconnected { reason }) => {
                        tokio::spawn(async move { inner.handle_disconnect(reason).await });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Client event pump lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Dispatch the client's cached snapshots for kinds the mirror has not
    /// seen yet. Settings first, so the status derivation has them.
    fn seed_from_cache(&self) {
        if self.mirror.settings().is_none()
            && let Some(settings) = self.client.current_settings()
        {
            self.bus.dispatch(LockEvent::MechSettings { settings });
        }
        if self.mirror.status().is_none()
            && let Some(status) = self.client.current_status()
        {
            self.bus.dispatch(LockEvent::MechStatus { status });
        }
    }

    /// First connect of a session. A lock the scanner cannot see goes
    /// straight to scanning.
    async fn initial_connect(self: &Arc<Self>) -> ConnectionState {
        if let Some(scanner) = &self.scanner
            && !scanner.is_present(self.address).await
        {
            let guard = self.transition.lock().await;
            if !self.is_closed() && self.state() == ConnectionState::Disconnected {
                self.record(Diagnostic::DeviceAbsent {
                    address: self.address,
                });
                self.begin_scanning(&guard);
            }
            return self.state();
        }
        self.connect_candidate(self.address).await
    }

    /// Run one connect attempt for `address`.
    ///
    /// Only starts from `Disconnected` or `Scanning`; otherwise returns the
    /// current state untouched.
    async fn connect_candidate(self: &Arc<Self>, address: DeviceAddress) -> ConnectionState {
        let guard = self.transition.lock().await;
        let current = self.state();
        if self.is_closed()
            || !matches!(
                current,
                ConnectionState::Disconnected | ConnectionState::Scanning
            )
        {
            return current;
        }

        self.release_scan();
        self.set_state(&guard, ConnectionState::Connecting);

        match self.establish(address).await {
            Ok(()) => {
                self.failures.store(0, Ordering::SeqCst);
                self.set_state(&guard, ConnectionState::Synchronizing);
                self.synchronize().await;
                if !self.is_closed() {
                    self.set_state(&guard, ConnectionState::Connected);
                }
            }
            Err(Error::Cancelled) => {}
            Err(e) => {
                let attempt = self.failures.fetch_add(1, Ordering::SeqCst);
                let retry_in = self.options.reconnect.delay_for_attempt(attempt);
                self.record(Diagnostic::ConnectFailed {
                    address,
                    error: e.to_string(),
                    retry_in,
                });
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(retry_in) => self.begin_scanning(&guard),
                }
            }
        }

        self.state()
    }

    async fn establish(&self, address: DeviceAddress) -> Result<()> {
        let timeout = self.options.connect_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.client.connect(address)) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::connection_failed(address, ConnectionFailureReason::Timeout)),
            },
        }
    }

    /// Bring the mirror up to date after connecting and fetch metadata.
    async fn synchronize(self: &Arc<Self>) {
        let waiter = self.bus.waiter(EventKind::MechStatus);
        self.seed.notify_one();

        if self.mirror.status().is_none() {
            let timeout = self.options.initial_status_timeout;
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = waiter.wait(timeout) => {
                    if let Err(Error::Timeout { .. }) = result {
                        self.record(Diagnostic::InitialStatusTimedOut { timeout });
                    }
                }
            }
        }

        self.refresh_device_info().await;
    }

    async fn refresh_device_info(&self) {
        let timeout = self.options.initial_status_timeout;
        let version = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = tokio::time::timeout(timeout, self.client.firmware_version()) => {
                result.unwrap_or_else(|_| Err(Error::timeout("firmware_version", timeout)))
            }
        };

        let sw_version = match version {
            Ok(version) => Some(version),
            Err(e) => {
                self.record(Diagnostic::DeviceInfoFailed {
                    error: e.to_string(),
                });
                None
            }
        };

        let info = DeviceInfo {
            name: self.name.clone(),
            model: self.profile.model().display_name().to_string(),
            manufacturer: MANUFACTURER.to_string(),
            sw_version,
        };
        *self.device_info.write().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
        self.bus.dispatch(LockEvent::DeviceInfo { info });
    }

    fn begin_scanning(self: &Arc<Self>, guard: &TransitionGuard<'_>) {
        self.candidate_claimed.store(false, Ordering::SeqCst);
        self.set_state(guard, ConnectionState::Scanning);
        if let Some(scanner) = &self.scanner {
            let token = self.cancel.child_token();
            let task = self.spawn_scan_watcher(Arc::clone(scanner), token.clone());
            if let Some(previous) = lock(&self.scan).replace(ScanHandle { token, task }) {
                previous.token.cancel();
            }
        }
    }

    fn spawn_scan_watcher(
        self: &Arc<Self>,
        scanner: Arc<dyn AdvertisementSource>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut attempt = 0;
            let mut rx = loop {
                let subscribed = tokio::select! {
                    _ = token.cancelled() => return,
                    subscribed = scanner.subscribe() => subscribed,
                };
                let Some(inner) = weak.upgrade() else { return };
                match subscribed {
                    Ok(rx) => {
                        inner.record(Diagnostic::ScanStarted);
                        break rx;
                    }
                    Err(e) => {
                        let retry_in = inner.options.reconnect.delay_for_attempt(attempt);
                        attempt = attempt.saturating_add(1);
                        inner.record(Diagnostic::ScanFailed {
                            error: e.to_string(),
                            retry_in,
                        });
                        drop(inner);
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(retry_in) => {}
                        }
                    }
                }
            };

            loop {
                let adv = tokio::select! {
                    _ = token.cancelled() => break,
                    adv = rx.recv() => adv,
                };
                let (Some(adv), Some(inner)) = (adv, weak.upgrade()) else {
                    break;
                };
                if inner.offer_candidate(adv) {
                    break;
                }
            }

            drop(rx);
            if let Some(inner) = weak.upgrade() {
                inner.record(Diagnostic::ScanStopped);
            }
        })
    }

    fn release_scan(&self) {
        if let Some(handle) = lock(&self.scan).take() {
            handle.token.cancel();
            drop(handle.task);
        }
    }

    /// Hand a matching advertisement to a connect attempt.
    fn offer_candidate(self: &Arc<Self>, adv: Advertisement) -> bool {
        let matched = {
            let mut matcher = lock(&self.matcher);
            if let Some(device_uuid) = matcher.learn(&adv) {
                self.record(Diagnostic::DeviceUuidLearned { device_uuid });
            }
            matcher.matches(&adv)
        };
        if !matched || self.is_closed() {
            return false;
        }
        if !matches!(
            self.state(),
            ConnectionState::Scanning | ConnectionState::Disconnected
        ) {
            return false;
        }
        if self.candidate_claimed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.record(Diagnostic::CandidateFound {
            address: adv.address,
            rssi: adv.rssi,
        });
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.connect_candidate(adv.address).await;
        });
        true
    }

    async fn handle_disconnect(self: &Arc<Self>, reason: String) {
        let guard = self.transition.lock().await;
        if self.is_closed() {
            return;
        }
        if self.client.is_connected().await {
            self.record(Diagnostic::StaleDisconnectIgnored);
            return;
        }
        if self.state() == ConnectionState::Connected {
            self.record(Diagnostic::LinkLost { reason });
            self.begin_scanning(&guard);
        }
    }

    /// Resolve `changed_by` for the status of `generation` in the background.
    fn spawn_history_refresh(self: &Arc<Self>, generation: u64) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let timeout = self.options.command_status_timeout;

        handle.spawn(async move {
            let Some(inner) = weak.upgrade() else { return };
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, inner.client.history_tail()) => {
                    result.unwrap_or_else(|_| Err(Error::timeout("history_tail", timeout)))
                }
            };

            let changed_by = match result {
                Ok(entry) => entry.and_then(|e| ChangedBy::from_history_type(e.history_type)),
                Err(e) => {
                    inner.record(Diagnostic::HistoryLookupFailed {
                        error: e.to_string(),
                    });
                    None
                }
            };

            let before = inner.tracker.changed_by();
            if inner.tracker.resolve_history(generation, changed_by) && before != changed_by {
                inner.publish_lock_state();
            }
        });
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Cancelled);
        }
        if self.state() != ConnectionState::Connected || !self.client.is_connected().await {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn report_command_failure(&self, command: Command, error: &Error) {
        self.record(Diagnostic::CommandFailed {
            command,
            error: error.to_string(),
        });
        self.bus.dispatch(LockEvent::CommandFailed {
            command,
            error: error.to_string(),
        });
    }

    async fn run_lock_command(self: &Arc<Self>, command: LockCommand) -> Result<()> {
        let result = self.lock_command(command).await;
        if let Err(e) = &result {
            let command = match command {
                LockCommand::Lock => Command::Lock,
                LockCommand::Unlock => Command::Unlock,
            };
            self.report_command_failure(command, e);
        }
        result
    }

    /// Issue the command and wait for the next status, optimistically
    /// showing the commanded motion until that status arrives.
    async fn lock_command(self: &Arc<Self>, command: LockCommand) -> Result<()> {
        self.ensure_connected().await?;

        let waiter = self.bus.waiter(EventKind::MechStatus);
        self.tracker.begin_command(command);
        self.publish_lock_state();

        let timeout = self.options.command_status_timeout;
        let tag = self.options.command_tag.as_str();
        let (name, op) = match command {
            LockCommand::Lock => ("lock", self.client.lock(tag)),
            LockCommand::Unlock => ("unlock", self.client.unlock(tag)),
        };
        let issue = async {
            tokio::time::timeout(timeout, op)
                .await
                .unwrap_or_else(|_| Err(Error::timeout(name, timeout)))
        };

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            outcome = async { tokio::try_join!(issue, waiter.wait(timeout)) } => outcome.map(|_| ()),
        };

        // Still pending means no status arrived: drop the assumed state.
        if self.tracker.revert_command(command) {
            self.publish_lock_state();
        }
        outcome
    }

    async fn update_settings(
        self: &Arc<Self>,
        command: Command,
        apply: impl FnOnce(&mut MechSettings),
    ) -> Result<()> {
        let result = async {
            let mut settings = self
                .mirror
                .settings()
                .ok_or_else(|| Error::unavailable("mechanical settings have not been reported"))?;
            self.ensure_connected().await?;
            apply(&mut settings);

            let timeout = self.options.command_status_timeout;
            tokio::select! {
                _ = self.cancel.cancelled() => Err(Error::Cancelled),
                result = tokio::time::timeout(timeout, self.client.apply_settings(settings)) => {
                    result.unwrap_or_else(|_| Err(Error::timeout(command.to_string(), timeout)))
                }
            }
        }
        .await;

        if let Err(e) = &result {
            self.report_command_failure(command, e);
        }
        result
    }

    async fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.bus.cancel_waiters();

        let guard = self.transition.lock().await;
        self.release_scan();
        let result = self.client.disconnect().await;
        self.set_state(&guard, ConnectionState::Disconnected);

        for token in lock(&self.own_tokens).drain(..) {
            self.bus.unsubscribe(token);
        }
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        result
    }
}
