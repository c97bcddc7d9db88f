//! Host-facing entity facade.
//!
//! An [`EntityFacade`] presents a session to a home-automation host as a set
//! of entities: one lock, an adjustable number per settings field and a
//! sensor per status field, gated by the lock's [`DeviceProfile`]. Values
//! flow from the session's bus into a host-provided [`EntitySink`]; host
//! commands flow back through the session, so failures surface on the same
//! bus as everything else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use sesame_types::{DeviceInfo, MechSettings, MechStatus};

use crate::error::{Error, Result};
use crate::events::{Command, EventKind, LockEvent, SubscriptionToken};
use crate::fields::{DeviceClass, EntityCategory, FieldValue, SettingsField, StatusField};
use crate::lock_state::DerivedLockState;
use crate::profile::{DeviceProfile, Offer};
use crate::session::{ConnectionState, DeviceSession};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// What an entity reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "source", content = "field", rename_all = "snake_case")]
pub enum EntityBinding {
    /// The derived lock state.
    Lock,
    Status(StatusField),
    Settings(SettingsField),
}

/// Registration data for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDescriptor {
    /// Stable id: the lock's MAC for the lock entity, `<mac>_<key>` otherwise.
    pub unique_id: String,
    pub key: &'static str,
    pub offer: Offer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<DeviceClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<EntityCategory>,
    pub enabled_by_default: bool,
    /// Inclusive range for numbers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<(i64, i64)>,
    pub binding: EntityBinding,
}

/// Value of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityValue {
    Lock(DerivedLockState),
    Field(FieldValue),
}

/// An update pushed to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub unique_id: String,
    /// `None` until the backing snapshot has been observed.
    pub value: Option<EntityValue>,
    /// Whether the session is connected.
    pub available: bool,
}

/// Host side of the facade.
pub trait EntitySink: Send + Sync {
    fn register(&self, descriptor: &EntityDescriptor);

    fn update(&self, state: &EntityState);

    fn device_info(&self, _info: &DeviceInfo) {}

    fn remove(&self, _unique_id: &str) {}
}

/// Build the descriptors a profile offers, lock first.
pub fn descriptors_for(mac: &str, profile: &dyn DeviceProfile) -> Vec<EntityDescriptor> {
    let mut descriptors = vec![EntityDescriptor {
        unique_id: mac.to_string(),
        key: "lock",
        offer: Offer::Lock,
        device_class: None,
        unit: None,
        category: None,
        enabled_by_default: true,
        range: None,
        binding: EntityBinding::Lock,
    }];

    if profile.offers_kind(Offer::Number) {
        descriptors.extend(profile.numbers().iter().map(|field| EntityDescriptor {
            unique_id: format!("{mac}_{}", field.key()),
            key: field.key(),
            offer: Offer::Number,
            device_class: field.device_class(),
            unit: Some(field.unit()),
            category: Some(EntityCategory::Config),
            enabled_by_default: true,
            range: Some(field.range()),
            binding: EntityBinding::Settings(*field),
        }));
    }

    descriptors.extend(
        profile
            .sensors()
            .iter()
            .filter(|field| profile.offers_kind(field.offer()))
            .map(|field| EntityDescriptor {
                unique_id: format!("{mac}_{}", field.key()),
                key: field.key(),
                offer: field.offer(),
                device_class: field.device_class(),
                unit: field.unit(),
                category: Some(EntityCategory::Diagnostic),
                enabled_by_default: field.enabled_by_default(),
                range: None,
                binding: EntityBinding::Status(*field),
            }),
    );

    descriptors
}

/// State shared with the bus handlers. Holds no session handle, so an
/// attached facade never keeps its session alive.
struct Shared {
    sink: Arc<dyn EntitySink>,
    descriptors: Vec<EntityDescriptor>,
    values: Mutex<HashMap<String, EntityValue>>,
    available: AtomicBool,
}

impl Shared {
    fn push(&self, descriptor: &EntityDescriptor, value: Option<EntityValue>) {
        let value = {
            let mut values = lock(&self.values);
            match value {
                Some(value) => {
                    values.insert(descriptor.unique_id.clone(), value);
                    Some(value)
                }
                None => values.get(&descriptor.unique_id).copied(),
            }
        };
        self.sink.update(&EntityState {
            unique_id: descriptor.unique_id.clone(),
            value,
            available: self.available.load(Ordering::SeqCst),
        });
    }

    fn push_lock(&self, state: DerivedLockState) {
        for d in self.descriptors.iter().filter(|d| d.binding == EntityBinding::Lock) {
            self.push(d, Some(EntityValue::Lock(state)));
        }
    }

    fn push_status(&self, status: &MechStatus) {
        for d in &self.descriptors {
            if let EntityBinding::Status(field) = d.binding {
                self.push(d, Some(EntityValue::Field(field.value(status))));
            }
        }
    }

    fn push_settings(&self, settings: &MechSettings) {
        for d in &self.descriptors {
            if let EntityBinding::Settings(field) = d.binding {
                self.push(d, Some(EntityValue::Field(field.value(settings))));
            }
        }
    }

    fn set_available(&self, available: bool) {
        if self.available.swap(available, Ordering::SeqCst) != available {
            for d in &self.descriptors {
                self.push(d, None);
            }
        }
    }
}

/// Presents one session to the host as entities.
pub struct EntityFacade {
    session: DeviceSession,
    shared: Arc<Shared>,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl std::fmt::Debug for EntityFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityFacade")
            .field("session", &self.session)
            .field("entities", &self.shared.descriptors.len())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl EntityFacade {
    pub fn new(session: DeviceSession, sink: Arc<dyn EntitySink>) -> Self {
        let mac = session.address().format_mac();
        let descriptors = descriptors_for(&mac, session.profile().as_ref());
        Self {
            session,
            shared: Arc::new(Shared {
                sink,
                descriptors,
                values: Mutex::new(HashMap::new()),
                available: AtomicBool::new(false),
            }),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn descriptors(&self) -> &[EntityDescriptor] {
        &self.shared.descriptors
    }

    pub fn is_attached(&self) -> bool {
        !lock(&self.tokens).is_empty()
    }

    /// Register every entity, push the current values and follow the bus.
    ///
    /// Attaching an attached facade is a no-op.
    pub fn attach(&self) {
        let mut tokens = lock(&self.tokens);
        if !tokens.is_empty() {
            return;
        }

        let shared = &self.shared;
        shared.available.store(
            self.session.state() == ConnectionState::Connected,
            Ordering::SeqCst,
        );
        for d in &shared.descriptors {
            shared.sink.register(d);
        }
        if let Some(info) = self.session.device_info() {
            shared.sink.device_info(&info);
        }

        shared.push_lock(self.session.lock_state());
        match self.session.settings() {
            Some(settings) => shared.push_settings(&settings),
            None => self.push_empty(|b| matches!(b, EntityBinding::Settings(_))),
        }
        match self.session.status() {
            Some(status) => shared.push_status(&status),
            None => self.push_empty(|b| matches!(b, EntityBinding::Status(_))),
        }

        let bus = self.session.bus();

        let s = Arc::clone(shared);
        tokens.push(bus.subscribe(EventKind::LockState, move |event| {
            if let LockEvent::LockState { state } = event {
                s.push_lock(*state);
            }
            Ok(())
        }));

        let s = Arc::clone(shared);
        tokens.push(bus.subscribe(EventKind::MechStatus, move |event| {
            if let LockEvent::MechStatus { status } = event {
                s.push_status(status);
            }
            Ok(())
        }));

        let s = Arc::clone(shared);
        tokens.push(bus.subscribe(EventKind::MechSettings, move |event| {
            if let LockEvent::MechSettings { settings } = event {
                s.push_settings(settings);
            }
            Ok(())
        }));

        let s = Arc::clone(shared);
        tokens.push(bus.subscribe(EventKind::Connection, move |event| {
            if let LockEvent::Connection { state } = event {
                s.set_available(*state == ConnectionState::Connected);
            }
            Ok(())
        }));

        let s = Arc::clone(shared);
        tokens.push(bus.subscribe(EventKind::DeviceInfo, move |event| {
            if let LockEvent::DeviceInfo { info } = event {
                s.sink.device_info(info);
            }
            Ok(())
        }));
    }

    fn push_empty(&self, select: impl Fn(&EntityBinding) -> bool) {
        for d in self.shared.descriptors.iter().filter(|d| select(&d.binding)) {
            self.shared.push(d, None);
        }
    }

    /// Stop following the bus and remove every entity from the host.
    pub fn detach(&self) {
        let tokens: Vec<_> = lock(&self.tokens).drain(..).collect();
        if tokens.is_empty() {
            return;
        }
        for token in tokens {
            self.session.unsubscribe(token);
        }
        for d in &self.shared.descriptors {
            self.shared.sink.remove(&d.unique_id);
        }
        lock(&self.shared.values).clear();
    }

    pub async fn lock(&self) -> Result<()> {
        self.session.lock().await
    }

    pub async fn unlock(&self) -> Result<()> {
        self.session.unlock().await
    }

    /// Set a number entity, checking its range before touching the lock.
    ///
    /// A rejected value is reported on the bus like any other failed command.
    pub async fn set_number(&self, field: SettingsField, value: i64) -> Result<()> {
        if let Err(e) = self.check_number(field, value) {
            self.session
                .report_command_failure(command_for(field, value), &e);
            return Err(e);
        }

        let (min, max) = field.range();
        let out_of_range = |_| Error::out_of_range(field.key(), value, min, max);
        match field {
            SettingsField::Lock => {
                let degrees = i16::try_from(value).map_err(out_of_range)?;
                self.session.set_lock_threshold(degrees).await
            }
            SettingsField::Unlock => {
                let degrees = i16::try_from(value).map_err(out_of_range)?;
                self.session.set_unlock_threshold(degrees).await
            }
            SettingsField::AutoLockSeconds => {
                let seconds = u16::try_from(value).map_err(out_of_range)?;
                self.session.set_autolock_duration(seconds).await
            }
        }
    }

    fn check_number(&self, field: SettingsField, value: i64) -> Result<()> {
        let profile = self.session.profile();
        if !profile.offers_kind(Offer::Number) || !profile.numbers().contains(&field) {
            return Err(Error::InvalidData(format!(
                "{} does not offer number '{}'",
                profile.model(),
                field.key()
            )));
        }
        field.check(value)
    }

    /// Route a host command.
    pub async fn execute(&self, command: Command) -> Result<()> {
        match command {
            Command::Lock => self.lock().await,
            Command::Unlock => self.unlock().await,
            Command::SetLockThreshold(degrees) => {
                self.set_number(SettingsField::Lock, degrees.into()).await
            }
            Command::SetUnlockThreshold(degrees) => {
                self.set_number(SettingsField::Unlock, degrees.into()).await
            }
            Command::SetAutolockDuration(seconds) => {
                self.set_number(SettingsField::AutoLockSeconds, seconds.into())
                    .await
            }
        }
    }
}

/// The command a number write stands for. Values the payload cannot hold
/// are pinned to its nearest bound; the error carries the requested value.
fn command_for(field: SettingsField, value: i64) -> Command {
    match field {
        SettingsField::Lock => {
            Command::SetLockThreshold(value.clamp(i16::MIN.into(), i16::MAX.into()) as i16)
        }
        SettingsField::Unlock => {
            Command::SetUnlockThreshold(value.clamp(i16::MIN.into(), i16::MAX.into()) as i16)
        }
        SettingsField::AutoLockSeconds => {
            Command::SetAutolockDuration(value.clamp(u16::MIN.into(), u16::MAX.into()) as u16)
        }
    }
}

impl Drop for EntityFacade {
    fn drop(&mut self) {
        for token in lock(&self.tokens).drain(..) {
            self.session.unsubscribe(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLockClient;
    use crate::profile::GenericLock;

    #[derive(Default)]
    struct RecordingSink {
        registered: Mutex<Vec<String>>,
        updates: Mutex<Vec<EntityState>>,
        removed: Mutex<Vec<String>>,
        infos: Mutex<Vec<DeviceInfo>>,
    }

    impl RecordingSink {
        fn last(&self, unique_id: &str) -> Option<EntityState> {
            lock(&self.updates)
                .iter()
                .rev()
                .find(|s| s.unique_id == unique_id)
                .cloned()
        }
    }

    impl EntitySink for RecordingSink {
        fn register(&self, descriptor: &EntityDescriptor) {
            lock(&self.registered).push(descriptor.unique_id.clone());
        }

        fn update(&self, state: &EntityState) {
            lock(&self.updates).push(state.clone());
        }

        fn device_info(&self, info: &DeviceInfo) {
            lock(&self.infos).push(info.clone());
        }

        fn remove(&self, unique_id: &str) {
            lock(&self.removed).push(unique_id.to_string());
        }
    }

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    fn facade(profile: Option<Arc<dyn DeviceProfile>>) -> (EntityFacade, Arc<MockLockClient>, Arc<RecordingSink>) {
        let client = Arc::new(MockLockClient::new());
        let mut builder = DeviceSession::builder(MAC.parse().unwrap(), client.clone());
        if let Some(profile) = profile {
            builder = builder.profile(profile);
        }
        let sink = Arc::new(RecordingSink::default());
        (EntityFacade::new(builder.build(), sink.clone()), client, sink)
    }

    #[test]
    fn test_sesame5_descriptors() {
        let (facade, _, _) = facade(None);
        let descriptors = facade.descriptors();
        assert_eq!(descriptors.len(), 14);
        assert_eq!(descriptors[0].unique_id, MAC);
        assert_eq!(descriptors[0].offer, Offer::Lock);

        let battery = descriptors
            .iter()
            .find(|d| d.key == "battery")
            .unwrap();
        assert_eq!(battery.unique_id, "aa:bb:cc:dd:ee:ff_battery");
        assert_eq!(battery.unit, Some("mV"));
        assert!(!battery.enabled_by_default);
        assert_eq!(battery.category, Some(EntityCategory::Diagnostic));

        let lock = descriptors.iter().find(|d| d.key == "lock").unwrap();
        assert_eq!(lock.offer, Offer::Lock);
        let threshold = descriptors
            .iter()
            .find(|d| d.binding == EntityBinding::Settings(SettingsField::Lock))
            .unwrap();
        assert_eq!(threshold.range, Some((-32768, 32767)));
        assert_eq!(threshold.category, Some(EntityCategory::Config));
    }

    #[test]
    fn test_generic_lock_offers_only_the_lock() {
        let (facade, _, _) = facade(Some(Arc::new(GenericLock)));
        assert_eq!(facade.descriptors().len(), 1);
        assert_eq!(facade.descriptors()[0].binding, EntityBinding::Lock);
    }

    #[test]
    fn test_attach_registers_and_pushes_initial_state() {
        let (facade, _, sink) = facade(None);
        facade.attach();
        facade.attach();

        assert_eq!(lock(&sink.registered).len(), 14);
        let lock_state = sink.last(MAC).unwrap();
        assert!(!lock_state.available);
        assert!(matches!(lock_state.value, Some(EntityValue::Lock(_))));
        assert_eq!(sink.last("aa:bb:cc:dd:ee:ff_position").unwrap().value, None);
    }

    #[test]
    fn test_bus_events_flow_to_sink() {
        let (facade, _, sink) = facade(None);
        facade.attach();
        let bus = facade.session().bus();

        bus.dispatch(LockEvent::MechStatus {
            status: MechStatus {
                position: 42,
                low_battery: true,
                ..Default::default()
            },
        });
        assert_eq!(
            sink.last("aa:bb:cc:dd:ee:ff_position").unwrap().value,
            Some(EntityValue::Field(FieldValue::Int(42)))
        );
        assert_eq!(
            sink.last("aa:bb:cc:dd:ee:ff_low_battery").unwrap().value,
            Some(EntityValue::Field(FieldValue::Bool(true)))
        );

        bus.dispatch(LockEvent::Connection {
            state: ConnectionState::Connected,
        });
        let position = sink.last("aa:bb:cc:dd:ee:ff_position").unwrap();
        assert!(position.available);
        assert_eq!(position.value, Some(EntityValue::Field(FieldValue::Int(42))));
    }

    #[test]
    fn test_detach_removes_entities_and_handlers() {
        let (facade, _, sink) = facade(None);
        let bus_handlers = |f: &EntityFacade| f.session().bus().handler_count(EventKind::MechStatus);
        let before = bus_handlers(&facade);

        facade.attach();
        assert_eq!(bus_handlers(&facade), before + 1);
        facade.detach();
        facade.detach();

        assert_eq!(bus_handlers(&facade), before);
        assert_eq!(lock(&sink.removed).len(), 14);
        assert!(!facade.is_attached());
    }

    #[tokio::test]
    async fn test_set_number_rejects_out_of_range_before_adapter() {
        let (facade, client, _) = facade(None);
        let err = facade
            .set_number(SettingsField::AutoLockSeconds, 70_000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { max: 65535, .. }));
        let err = facade.set_number(SettingsField::Lock, -40_000).await.unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
        assert_eq!(client.apply_count(), 0);
    }

    #[tokio::test]
    async fn test_set_number_without_settings_is_unavailable() {
        let (facade, client, _) = facade(None);
        let err = facade.set_number(SettingsField::Lock, 10).await.unwrap_err();
        assert!(matches!(err, Error::UnavailableState(_)));
        assert_eq!(client.apply_count(), 0);
    }

    #[tokio::test]
    async fn test_generic_lock_has_no_numbers() {
        let (facade, _, _) = facade(Some(Arc::new(GenericLock)));
        let err = facade
            .execute(Command::SetAutolockDuration(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_rejected_number_surfaces_on_bus() {
        let (facade, client, _) = facade(None);
        let mut rx = facade.session().stream();

        facade
            .set_number(SettingsField::AutoLockSeconds, 70_000)
            .await
            .unwrap_err();
        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            LockEvent::CommandFailed {
                command: Command::SetAutolockDuration(65535),
                ref error,
            } if error.contains("70000")
        ));
        assert_eq!(client.apply_count(), 0);
    }

    #[tokio::test]
    async fn test_unoffered_number_surfaces_on_bus() {
        let (facade, _, _) = facade(Some(Arc::new(GenericLock)));
        let waiter = facade.session().bus().waiter(EventKind::CommandFailed);

        facade.set_number(SettingsField::Lock, 10).await.unwrap_err();

        let event = waiter.wait(std::time::Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            event,
            LockEvent::CommandFailed {
                command: Command::SetLockThreshold(10),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_lock_failure_surfaces_on_bus() {
        let (facade, _, _) = facade(None);
        let waiter = facade.session().bus().waiter(EventKind::CommandFailed);

        let err = facade.execute(Command::Lock).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        let event = waiter.wait(std::time::Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            event,
            LockEvent::CommandFailed {
                command: Command::Lock,
                ..
            }
        ));
    }
}
