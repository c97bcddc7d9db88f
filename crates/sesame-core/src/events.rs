//! Per-session event bus.
//!
//! The bus fans device-originated events out to handlers registered per
//! [`EventKind`]. Dispatch works on a snapshot of the handlers taken when it
//! starts, so handlers may subscribe or unsubscribe (themselves included)
//! while an event is being delivered without disturbing that delivery.
//!
//! A handler that returns an error or panics does not stop delivery to the
//! remaining handlers. The failure is recorded on the session's diagnostics
//! sink and re-published as a [`LockEvent::HandlerFailed`] event.
//!
//! Besides callbacks the bus offers one-shot waiters keyed by kind
//! ([`EventBus::waiter`]) and a broadcast view of every event
//! ([`EventBus::stream`]).

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

use sesame_types::{DeviceInfo, MechSettings, MechStatus};

use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::error::{Error, Result};
use crate::lock_state::DerivedLockState;
use crate::session::ConnectionState;

/// Kinds of events carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventKind {
    MechStatus,
    MechSettings,
    LockState,
    Connection,
    DeviceInfo,
    CommandFailed,
    HandlerFailed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::MechStatus => "mech_status",
            EventKind::MechSettings => "mech_settings",
            EventKind::LockState => "lock_state",
            EventKind::Connection => "connection",
            EventKind::DeviceInfo => "device_info",
            EventKind::CommandFailed => "command_failed",
            EventKind::HandlerFailed => "handler_failed",
        };
        f.write_str(s)
    }
}

/// A command accepted from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "value", rename_all = "snake_case")]
pub enum Command {
    Lock,
    Unlock,
    SetLockThreshold(i16),
    SetUnlockThreshold(i16),
    SetAutolockDuration(u16),
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Lock => write!(f, "lock"),
            Command::Unlock => write!(f, "unlock"),
            Command::SetLockThreshold(v) => write!(f, "set_lock_threshold({v})"),
            Command::SetUnlockThreshold(v) => write!(f, "set_unlock_threshold({v})"),
            Command::SetAutolockDuration(v) => write!(f, "set_autolock_duration({v})"),
        }
    }
}

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionToken(u64);

impl std::fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events delivered by the bus.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum LockEvent {
    /// The lock reported a new mechanical status.
    MechStatus { status: MechStatus },
    /// The lock reported new mechanical settings.
    MechSettings { settings: MechSettings },
    /// The derived lock state changed or was recomputed.
    LockState { state: DerivedLockState },
    /// The session's connection state changed.
    Connection { state: ConnectionState },
    /// Device metadata became available.
    DeviceInfo { info: DeviceInfo },
    /// A host command failed.
    CommandFailed { command: Command, error: String },
    /// An observer failed while handling an event.
    HandlerFailed {
        kind: EventKind,
        token: SubscriptionToken,
        message: String,
    },
}

impl LockEvent {
    /// The kind this event is dispatched under.
    pub fn kind(&self) -> EventKind {
        match self {
            LockEvent::MechStatus { .. } => EventKind::MechStatus,
            LockEvent::MechSettings { .. } => EventKind::MechSettings,
            LockEvent::LockState { .. } => EventKind::LockState,
            LockEvent::Connection { .. } => EventKind::Connection,
            LockEvent::DeviceInfo { .. } => EventKind::DeviceInfo,
            LockEvent::CommandFailed { .. } => EventKind::CommandFailed,
            LockEvent::HandlerFailed { .. } => EventKind::HandlerFailed,
        }
    }
}

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by event handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&LockEvent) -> HandlerResult + Send + Sync>;

struct Registration {
    token: SubscriptionToken,
    kind: EventKind,
    handler: Handler,
}

/// Sender for the broadcast view of the bus.
pub type EventSender = broadcast::Sender<LockEvent>;

/// Receiver for the broadcast view of the bus.
pub type EventReceiver = broadcast::Receiver<LockEvent>;

/// Typed publish/subscribe registry for one session.
pub struct EventBus {
    next_token: AtomicU64,
    handlers: Mutex<Vec<Registration>>,
    waiters: Mutex<HashMap<EventKind, Vec<oneshot::Sender<LockEvent>>>>,
    sender: EventSender,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &lock(&self.handlers).len())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EventBus {
    /// Create a bus whose broadcast view buffers `capacity` events.
    pub fn new(capacity: usize, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            next_token: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
            waiters: Mutex::new(HashMap::new()),
            sender,
            diagnostics,
        }
    }

    /// Register `handler` for events of `kind`.
    ///
    /// Handlers are called in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionToken
    where
        F: Fn(&LockEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        lock(&self.handlers).push(Registration {
            token,
            kind,
            handler: Arc::new(handler),
        });
        token
    }

    /// Remove a handler. Returns `false` if the token was already removed.
    ///
    /// A dispatch already in progress still delivers its event to the
    /// handler if it was registered when that dispatch started.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|r| r.token != token);
        handlers.len() != before
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        lock(&self.handlers).iter().filter(|r| r.kind == kind).count()
    }

    /// Register a one-shot waiter for the next event of `kind`.
    ///
    /// Registration happens immediately, so an event dispatched between this
    /// call and [`EventWaiter::wait`] is not missed.
    pub fn waiter(&self, kind: EventKind) -> EventWaiter {
        let (tx, rx) = oneshot::channel();
        let mut waiters = lock(&self.waiters);
        let slot = waiters.entry(kind).or_default();
        slot.retain(|tx| !tx.is_closed());
        slot.push(tx);
        EventWaiter { kind, rx }
    }

    /// Wait for the next event of `kind`, up to `timeout`.
    pub async fn wait_for(&self, kind: EventKind, timeout: Duration) -> Result<LockEvent> {
        self.waiter(kind).wait(timeout).await
    }

    /// Subscribe to a broadcast view of every dispatched event.
    pub fn stream(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Get the number of active stream receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Deliver `event` to every handler registered for its kind.
    ///
    /// The broadcast view receives the event before any handler runs, so
    /// events dispatched from inside a handler follow the one that caused
    /// them.
    pub fn dispatch(&self, event: LockEvent) {
        let kind = event.kind();
        // Ignore error if no receivers
        let _ = self.sender.send(event.clone());

        let snapshot: Vec<(SubscriptionToken, Handler)> = lock(&self.handlers)
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| (r.token, Arc::clone(&r.handler)))
            .collect();

        for (token, handler) in snapshot {
            let outcome = match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(message) = outcome {
                self.report_failure(kind, token, message);
            }
        }

        let waiters = lock(&self.waiters).remove(&kind).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(event.clone());
        }
    }

    /// Drop every pending waiter. Their `wait` calls return
    /// [`Error::Cancelled`].
    pub fn cancel_waiters(&self) {
        lock(&self.waiters).clear();
    }

    fn report_failure(&self, kind: EventKind, token: SubscriptionToken, message: String) {
        self.diagnostics.record(Diagnostic::HandlerFailed {
            kind,
            message: message.clone(),
        });
        // Failures while reporting a failure are only recorded, never re-published.
        if kind != EventKind::HandlerFailed {
            self.dispatch(LockEvent::HandlerFailed {
                kind,
                token,
                message,
            });
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

/// A pending one-shot wait for the next event of one kind.
#[derive(Debug)]
pub struct EventWaiter {
    kind: EventKind,
    rx: oneshot::Receiver<LockEvent>,
}

impl EventWaiter {
    /// The kind being waited for.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Resolve with the next matching event, or fail with
    /// [`Error::Timeout`] after `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<LockEvent> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::timeout(format!("wait_for({})", self.kind), timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::diagnostics::MemorySink;

    fn bus() -> (EventBus, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (EventBus::new(16, sink.clone()), sink)
    }

    fn status(battery: u16) -> LockEvent {
        LockEvent::MechStatus {
            status: MechStatus {
                battery,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let (bus, _) = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventKind::MechStatus, move |_| {
                seen.lock().unwrap().push(id);
                Ok(())
            });
        }
        bus.dispatch(status(1));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_dispatch_only_matching_kind() {
        let (bus, _) = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(EventKind::MechSettings, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.dispatch(status(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let (bus, _) = bus();
        let token = bus.subscribe(EventKind::MechStatus, |_| Ok(()));
        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));
        assert_eq!(bus.handler_count(EventKind::MechStatus), 0);
    }

    #[test]
    fn test_failing_handler_is_isolated_and_reported() {
        let (bus, sink) = bus();
        let delivered = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventKind::MechStatus, |_| Err("boom".into()));
        bus.subscribe(EventKind::MechStatus, |_| panic!("kaboom"));
        let d = Arc::clone(&delivered);
        bus.subscribe(EventKind::MechStatus, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let f = Arc::clone(&failures);
        bus.subscribe(EventKind::HandlerFailed, move |event| {
            if let LockEvent::HandlerFailed { message, .. } = event {
                f.lock().unwrap().push(message.clone());
            }
            Ok(())
        });

        bus.dispatch(status(1));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0], "boom");
        assert!(failures[1].contains("kaboom"));
        assert_eq!(sink.count(|d| matches!(d, Diagnostic::HandlerFailed { .. })), 2);
    }

    #[test]
    fn test_failing_failure_handler_does_not_recurse() {
        let (bus, sink) = bus();
        bus.subscribe(EventKind::MechStatus, |_| Err("first".into()));
        bus.subscribe(EventKind::HandlerFailed, |_| Err("second".into()));
        bus.dispatch(status(1));
        assert_eq!(sink.count(|d| matches!(d, Diagnostic::HandlerFailed { .. })), 2);
    }

    #[test]
    fn test_unsubscribe_during_dispatch_keeps_snapshot() {
        let (bus, _) = bus();
        let bus = Arc::new(bus);
        let count = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(Mutex::new(None));

        let b = Arc::clone(&bus);
        let s = Arc::clone(&second);
        bus.subscribe(EventKind::MechStatus, move |_| {
            if let Some(token) = *s.lock().unwrap() {
                b.unsubscribe(token);
            }
            Ok(())
        });
        let c = Arc::clone(&count);
        let token = bus.subscribe(EventKind::MechStatus, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        *second.lock().unwrap() = Some(token);

        // Removed by the first handler, but registered when dispatch began.
        bus.dispatch(status(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.dispatch(status(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_during_dispatch_applies_to_next_event() {
        let (bus, _) = bus();
        let bus = Arc::new(bus);
        let count = Arc::new(AtomicUsize::new(0));

        let b = Arc::clone(&bus);
        let c = Arc::clone(&count);
        bus.subscribe(EventKind::MechStatus, move |_| {
            let c = Arc::clone(&c);
            b.subscribe(EventKind::MechStatus, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        bus.dispatch(status(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.dispatch(status(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_resolves_on_next_event() {
        let (bus, _) = bus();
        let waiter = bus.waiter(EventKind::MechStatus);
        bus.dispatch(status(42));
        let event = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event, status(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_times_out() {
        let (bus, _) = bus();
        let err = bus
            .wait_for(EventKind::MechStatus, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.to_string().contains("mech_status"));
    }

    #[tokio::test]
    async fn test_cancelled_waiter() {
        let (bus, _) = bus();
        let waiter = bus.waiter(EventKind::MechSettings);
        bus.cancel_waiters();
        let err = waiter.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_stream_sees_every_event() {
        let (bus, _) = bus();
        let mut rx = bus.stream();
        assert_eq!(bus.receiver_count(), 1);
        bus.dispatch(status(1));
        bus.dispatch(LockEvent::CommandFailed {
            command: Command::Lock,
            error: "x".into(),
        });
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::MechStatus);
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::CommandFailed);
    }

    #[tokio::test]
    async fn test_stream_orders_cause_before_nested_events() {
        let (bus, _) = bus();
        let bus = Arc::new(bus);
        let mut rx = bus.stream();

        let b = Arc::clone(&bus);
        bus.subscribe(EventKind::MechStatus, move |_| {
            b.dispatch(LockEvent::CommandFailed {
                command: Command::Lock,
                error: "follow-up".into(),
            });
            Ok(())
        });
        bus.subscribe(EventKind::MechStatus, |_| Err("boom".into()));

        bus.dispatch(status(1));

        let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::MechStatus,
                EventKind::CommandFailed,
                EventKind::HandlerFailed,
            ]
        );
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&LockEvent::CommandFailed {
            command: Command::SetAutolockDuration(30),
            error: "Not connected to device".into(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"command_failed\""));
        assert!(json.contains("set_autolock_duration"));
    }
}
