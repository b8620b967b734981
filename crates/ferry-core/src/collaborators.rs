//! Traits for the services the delivery engine talks to.
//!
//! The engine never presents UI or owns server configuration. It resolves
//! destinations, records diagnostics and hands notifications off through
//! these traits so hosts can plug in their own implementations.
//!
//! ```text
//!                         resolve(id)
//! ┌─────────────────────┐ ◀──────────── ┌─────────────────────┐
//! │ DestinationRegistry │               │                     │
//! └─────────────────────┘               │                     │
//! ┌─────────────────────┐   record()    │  DeliveryCoordinator│
//! │ ClientEventLog      │ ◀──────────── │                     │
//! └─────────────────────┘               │                     │
//! ┌─────────────────────┐   deliver()   │                     │
//! │ NotificationSink    │ ◀──────────── │                     │
//! └─────────────────────┘               └─────────────────────┘
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{Destination, DestinationId, Notification};

/// Resolves destination ids to connection parameters.
pub trait DestinationRegistry: Send + Sync + fmt::Debug {
    /// Returns the destination if it is currently known.
    fn resolve(&self, id: &DestinationId) -> Option<Destination>;
}

/// Registry backed by a fixed map, typically built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDestinationRegistry {
    destinations: HashMap<DestinationId, Destination>,
}

impl StaticDestinationRegistry {
    /// Creates a registry from a list of destinations.
    pub fn new(destinations: impl IntoIterator<Item = Destination>) -> Self {
        Self { destinations: destinations.into_iter().map(|d| (d.id.clone(), d)).collect() }
    }

    /// Returns the number of known destinations.
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

impl DestinationRegistry for StaticDestinationRegistry {
    fn resolve(&self, id: &DestinationId) -> Option<Destination> {
        self.destinations.get(id).cloned()
    }
}

/// Category of a client event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEventKind {
    /// A network request failed or returned a notable status.
    NetworkRequest,
    /// A notification was produced.
    Notification,
    /// A location update was processed.
    LocationUpdate,
}

/// Diagnostic record surfaced to the host's client event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    /// When the event happened.
    pub recorded_at: DateTime<Utc>,
    /// Event category.
    pub kind: ClientEventKind,
    /// Human readable text.
    pub text: String,
    /// Structured details.
    pub payload: Map<String, Value>,
}

impl ClientEvent {
    /// Creates an event with an empty payload.
    pub fn new(kind: ClientEventKind, text: impl Into<String>) -> Self {
        Self { recorded_at: Utc::now(), kind, text: text.into(), payload: Map::new() }
    }

    /// Adds a payload field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Receives diagnostic records.
///
/// Implementations must not block delivery; failures to record are the
/// implementation's own concern.
#[async_trait::async_trait]
pub trait ClientEventLog: Send + Sync + fmt::Debug {
    /// Records a client event.
    async fn record(&self, event: ClientEvent);
}

/// Event log that discards all events.
#[derive(Debug, Default)]
pub struct NoOpClientEventLog;

#[async_trait::async_trait]
impl ClientEventLog for NoOpClientEventLog {
    async fn record(&self, _event: ClientEvent) {}
}

/// Event log that forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingClientEventLog;

#[async_trait::async_trait]
impl ClientEventLog for TracingClientEventLog {
    async fn record(&self, event: ClientEvent) {
        let payload = serde_json::Value::Object(event.payload);
        tracing::info!(
            kind = ?event.kind,
            payload = %payload,
            "client event: {}",
            event.text
        );
    }
}

/// Forwards events to several logs concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastClientEventLog {
    logs: Vec<Arc<dyn ClientEventLog>>,
}

impl MulticastClientEventLog {
    /// Creates a multicast log with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, log: Arc<dyn ClientEventLog>) {
        self.logs.push(log);
    }

    /// Returns the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.logs.len()
    }
}

#[async_trait::async_trait]
impl ClientEventLog for MulticastClientEventLog {
    async fn record(&self, event: ClientEvent) {
        let records = self.logs.iter().map(|log| {
            let event = event.clone();
            async move { log.record(event).await }
        });
        futures::future::join_all(records).await;
    }
}

/// Presents notifications produced by response handlers.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync + fmt::Debug {
    /// Delivers a notification to the user.
    async fn deliver(&self, notification: Notification);
}

/// Sink that drops all notifications.
#[derive(Debug, Default)]
pub struct NoOpNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for NoOpNotificationSink {
    async fn deliver(&self, _notification: Notification) {}
}

/// Requests extra run time from the host while work is outstanding.
///
/// The returned token ends the extension when dropped. Extensions are best
/// effort and give no guarantee against the host suspending the process.
pub trait LifetimeExtender: Send + Sync + fmt::Debug {
    /// Begins an extension named `reason`.
    fn begin(&self, reason: &str) -> LifetimeToken;
}

/// Guard for an active lifetime extension.
#[must_use = "the extension ends as soon as the token is dropped"]
pub struct LifetimeToken {
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

impl LifetimeToken {
    /// A token that does nothing when dropped.
    pub fn noop() -> Self {
        Self { on_end: None }
    }

    /// A token that runs `on_end` when dropped.
    pub fn new(on_end: impl FnOnce() + Send + 'static) -> Self {
        Self { on_end: Some(Box::new(on_end)) }
    }
}

impl fmt::Debug for LifetimeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeToken").field("active", &self.on_end.is_some()).finish()
    }
}

impl Drop for LifetimeToken {
    fn drop(&mut self) {
        if let Some(on_end) = self.on_end.take() {
            on_end();
        }
    }
}

/// Extender for hosts with no notion of background execution.
#[derive(Debug, Default)]
pub struct NoOpLifetimeExtender;

impl LifetimeExtender for NoOpLifetimeExtender {
    fn begin(&self, _reason: &str) -> LifetimeToken {
        LifetimeToken::noop()
    }
}
