//! Host collaborators that record what the engine hands them.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use ferry_core::{
    ClientEvent, ClientEventKind, ClientEventLog, LifetimeExtender, LifetimeToken, Notification,
    NotificationSink,
};

/// Client event log that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingClientEventLog {
    events: Mutex<Vec<ClientEvent>>,
}

impl RecordingClientEventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Events of one kind.
    pub fn events_of(&self, kind: ClientEventKind) -> Vec<ClientEvent> {
        self.events().into_iter().filter(|event| event.kind == kind).collect()
    }
}

#[async_trait]
impl ClientEventLog for RecordingClientEventLog {
    async fn record(&self, event: ClientEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Notification sink that keeps every notification.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    delivered: Mutex<Vec<Notification>>,
}

impl RecordingNotificationSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications delivered so far.
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().map(|delivered| delivered.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn deliver(&self, notification: Notification) {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(notification);
        }
    }
}

/// Lifetime extender that counts open extensions.
#[derive(Debug, Default)]
pub struct RecordingLifetimeExtender {
    begun: AtomicUsize,
    active: Arc<AtomicUsize>,
    reasons: Mutex<Vec<String>>,
}

impl RecordingLifetimeExtender {
    /// Creates an extender with no extensions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Extensions begun so far.
    pub fn begun(&self) -> usize {
        self.begun.load(Ordering::Acquire)
    }

    /// Extensions whose token is still alive.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Reasons passed to `begin`, in order.
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().map(|reasons| reasons.clone()).unwrap_or_default()
    }
}

impl LifetimeExtender for RecordingLifetimeExtender {
    fn begin(&self, reason: &str) -> LifetimeToken {
        self.begun.fetch_add(1, Ordering::AcqRel);
        self.active.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut reasons) = self.reasons.lock() {
            reasons.push(reason.to_owned());
        }

        let active = self.active.clone();
        LifetimeToken::new(move || {
            active.fetch_sub(1, Ordering::AcqRel);
        })
    }
}
