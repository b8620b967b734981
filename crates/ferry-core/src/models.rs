//! Domain models for webhook requests, destinations and transfers.
//!
//! Identifiers are newtypes so a destination id can never be passed where a
//! handler id is expected. Requests and destinations serialize to the same
//! JSON shapes used on the wire and in the transfer journal.

use std::{borrow::Cow, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque identifier of a remote automation server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub String);

impl DestinationId {
    /// Creates a destination id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DestinationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a registered response handler.
///
/// Built-in identifiers are available as associated constants so the handler
/// table can be declared without allocating.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(Cow<'static, str>);

impl HandlerId {
    /// Handler used when the caller does not care about the response.
    pub const UNHANDLED: Self = Self(Cow::Borrowed("unhandled"));

    /// Handler for location updates.
    pub const LOCATION_UPDATE: Self = Self(Cow::Borrowed("location_update"));

    /// Handler for service calls.
    pub const SERVICE_CALL: Self = Self(Cow::Borrowed("service_call"));

    /// Creates a handler id from a static string.
    pub const fn from_static(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }

    /// Creates a handler id from an owned string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(Cow::Owned(id.into()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a transport session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Creates a session id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a single transfer within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub Uuid);

impl TransferId {
    /// Creates a new random transfer id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TransferId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// In-memory key of a transfer. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    /// Session the transfer runs on.
    pub session_id: SessionId,
    /// Transfer within that session.
    pub transfer_id: TransferId,
}

impl TransferKey {
    /// Creates a key for a transfer on a session.
    pub fn new(session_id: SessionId, transfer_id: TransferId) -> Self {
        Self { session_id, transfer_id }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.transfer_id)
    }
}

/// A logical webhook request.
///
/// `local_metadata` travels with the request through the journal but is never
/// sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Webhook request type, e.g. `update_location`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Request payload.
    #[serde(rename = "data", default)]
    pub payload: Value,
    /// Data kept on the device for response handling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_metadata: Option<Map<String, Value>>,
}

impl Request {
    /// Creates a request without local metadata.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self { kind: kind.into(), payload, local_metadata: None }
    }

    /// Attaches local-only metadata.
    #[must_use]
    pub fn with_local_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.local_metadata = Some(metadata);
        self
    }
}

/// Connection parameters of a remote automation server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Destination identifier.
    pub id: DestinationId,
    /// Base URL of the server, e.g. `https://home.example.com`.
    pub base_url: String,
    /// Path of the webhook relative to the base URL.
    pub webhook_path: String,
    /// Optional shared secret used to seal request and response bodies.
    #[serde(default)]
    pub secret: Option<String>,
    /// Whether TLS certificates must be valid.
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

fn default_verify_tls() -> bool {
    true
}

impl Destination {
    /// Creates a destination without a secret.
    pub fn new(
        id: impl Into<DestinationId>,
        base_url: impl Into<String>,
        webhook_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            webhook_path: webhook_path.into(),
            secret: None,
            verify_tls: true,
        }
    }

    /// Sets the shared secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Returns the full webhook URL.
    pub fn webhook_url(&self) -> String {
        Self::join(&self.base_url, &self.webhook_path)
    }

    /// Returns the webhook URL against an alternate base URL.
    pub fn webhook_url_at(&self, base_url: &str) -> String {
        Self::join(base_url, &self.webhook_path)
    }

    fn join(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("webhook_path", &self.webhook_path)
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

/// Metadata attached to every correlated transfer.
///
/// Lets a completed transfer be traced back to its destination, request and
/// handler after the process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    /// Destination the request was sent to.
    pub server: DestinationId,
    /// The request as sent, including local metadata.
    pub request: Request,
    /// Handler that processes the response.
    pub identifier: HandlerId,
}

/// User-visible local notification produced by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Optional title.
    #[serde(default)]
    pub title: Option<String>,
    /// Body text.
    pub body: String,
    /// Arbitrary user info.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Notification {
    /// Creates a notification with only a body.
    pub fn new(body: impl Into<String>) -> Self {
        Self { title: None, body: body.into(), data: Map::new() }
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Side effect a handler wants applied after a response is decoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerResult {
    /// Notification to present, if any.
    pub notification: Option<Notification>,
}

impl HandlerResult {
    /// A result with no side effect.
    pub fn none() -> Self {
        Self::default()
    }

    /// A result presenting a notification.
    pub fn notify(notification: Notification) -> Self {
        Self { notification: Some(notification) }
    }
}

/// Schema version written with every journal entry.
pub const JOURNAL_VERSION: u32 = 1;

/// Persisted state of a durable transfer.
///
/// Written when the transfer is enqueued, updated after each failed attempt
/// and deleted once the transfer completes or is cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Schema version of this entry.
    pub version: u32,
    /// Durable transfer this entry belongs to.
    pub transfer_id: TransferId,
    /// Session that owns the transfer.
    pub session_id: SessionId,
    /// Encoded correlation record.
    pub correlation: String,
    /// Target URL.
    pub url: String,
    /// Encoded request body.
    pub body: Vec<u8>,
    /// Attempts made so far.
    pub attempts: u32,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the next attempt is due.
    pub next_attempt_at: DateTime<Utc>,
    /// When the transfer is abandoned.
    pub expires_at: DateTime<Utc>,
}

impl JournalEntry {
    /// Whether the resource timeout has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_serializes_with_wire_field_names() {
        let request = Request::new("update_location", json!({"gps": [1, 2]}));
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value, json!({"type": "update_location", "data": {"gps": [1, 2]}}));
    }

    #[test]
    fn request_local_metadata_round_trips() {
        let mut metadata = Map::new();
        metadata.insert("source".into(), json!("zone"));
        let request = Request::new("fire_event", json!({})).with_local_metadata(metadata);

        let text = serde_json::to_string(&request).unwrap();
        let back: Request = serde_json::from_str(&text).unwrap();

        assert_eq!(back, request);
    }

    #[test]
    fn webhook_url_joins_without_duplicate_slashes() {
        let destination = Destination::new("home", "https://example.com/", "/api/webhook/abc");
        assert_eq!(destination.webhook_url(), "https://example.com/api/webhook/abc");
        assert_eq!(
            destination.webhook_url_at("http://10.0.0.2:8123"),
            "http://10.0.0.2:8123/api/webhook/abc"
        );
    }

    #[test]
    fn destination_debug_masks_secret() {
        let destination = Destination::new("home", "https://example.com", "hook").with_secret("s3cr3t");
        let debug = format!("{destination:?}");

        assert!(!debug.contains("s3cr3t"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn handler_id_constants_compare_with_owned_ids() {
        assert_eq!(HandlerId::UNHANDLED, HandlerId::new("unhandled"));
        assert_ne!(HandlerId::LOCATION_UPDATE, HandlerId::SERVICE_CALL);
    }
}
