//! Test data builders for requests, destinations and journal entries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ferry_core::{
    CorrelationRecord, Destination, HandlerId, JournalEntry, Request, SessionId, TransferId,
    JOURNAL_VERSION,
};
use ferry_delivery::{codec, correlation, EncodingTarget};
use serde_json::{json, Map, Value};

/// Location report with the given coordinates.
pub fn location_update(latitude: f64, longitude: f64) -> Request {
    Request::new("update_location", json!({ "gps": [latitude, longitude], "gps_accuracy": 10 }))
}

/// Service call without a notification.
pub fn service_call(domain: &str, service: &str) -> Request {
    Request::new("call_service", json!({ "domain": domain, "service": service }))
}

/// Service call that presents a notification once handled.
pub fn service_call_with_notification(domain: &str, service: &str, body: &str) -> Request {
    let mut metadata = Map::new();
    metadata.insert(
        "notification".into(),
        json!({ "title": format!("{domain}.{service}"), "body": body }),
    );
    service_call(domain, service).with_local_metadata(metadata)
}

/// Destination on `base_url` with a webhook path derived from `id`.
pub fn destination(id: &str, base_url: &str) -> Destination {
    Destination::new(id, base_url, webhook_path(id))
}

/// Webhook path used for a destination id.
pub fn webhook_path(id: &str) -> String {
    format!("api/webhook/{id}")
}

/// Builder for journal entries, as a previous process would have written
/// them.
pub struct JournalEntryBuilder {
    session_id: SessionId,
    destination: Destination,
    handler_id: HandlerId,
    request: Request,
    attempts: u32,
    created_at: DateTime<Utc>,
    next_attempt_in: Duration,
    expires_in: Duration,
    version: u32,
    correlation: Option<String>,
}

impl JournalEntryBuilder {
    /// Creates a builder for a location update to `destination`.
    pub fn new(session_id: impl Into<String>, destination: Destination) -> Self {
        Self {
            session_id: SessionId::new(session_id),
            destination,
            handler_id: HandlerId::LOCATION_UPDATE,
            request: location_update(52.37, 4.89),
            attempts: 0,
            created_at: Utc::now(),
            next_attempt_in: Duration::ZERO,
            expires_in: Duration::from_secs(2 * 60 * 60),
            version: JOURNAL_VERSION,
            correlation: None,
        }
    }

    /// Sets the handler and request.
    #[must_use]
    pub fn request(mut self, handler_id: HandlerId, request: Request) -> Self {
        self.handler_id = handler_id;
        self.request = request;
        self
    }

    /// Sets the attempts already made.
    #[must_use]
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sets the creation time that the other times are relative to.
    #[must_use]
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Delays the next attempt.
    #[must_use]
    pub fn next_attempt_in(mut self, delay: Duration) -> Self {
        self.next_attempt_in = delay;
        self
    }

    /// Sets the resource timeout.
    #[must_use]
    pub fn expires_in(mut self, timeout: Duration) -> Self {
        self.expires_in = timeout;
        self
    }

    /// Writes an unsupported schema version.
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Overrides the encoded correlation blob.
    #[must_use]
    pub fn raw_correlation(mut self, blob: impl Into<String>) -> Self {
        self.correlation = Some(blob.into());
        self
    }

    /// Builds the entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be encoded.
    pub fn build(self) -> anyhow::Result<JournalEntry> {
        let correlation = match self.correlation {
            Some(blob) => blob,
            None => correlation::encode(&CorrelationRecord {
                server: self.destination.id.clone(),
                request: self.request.clone(),
                identifier: self.handler_id,
            })?,
        };
        let body = codec::encode(&self.request, &self.destination, EncodingTarget::Wire)?;

        Ok(JournalEntry {
            version: self.version,
            transfer_id: TransferId::new(),
            session_id: self.session_id,
            correlation,
            url: self.destination.webhook_url(),
            body: body.bytes.to_vec(),
            attempts: self.attempts,
            created_at: self.created_at,
            next_attempt_at: self.created_at + to_chrono(self.next_attempt_in),
            expires_at: self.created_at + to_chrono(self.expires_in),
        })
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}

/// Empty JSON object, the most common webhook response.
pub fn empty_object() -> Value {
    json!({})
}
