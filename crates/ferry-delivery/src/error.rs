//! Error types for webhook delivery operations.
//!
//! Every path a request can take (immediate, durable, fallback) converges on
//! `DeliveryError`, so callers never need to know which transport carried
//! their request. Variants are grouped by what the caller can do about
//! them: retry, give up, or ignore a supersession.

use std::fmt;

use ferry_core::{ClientEvent, ClientEventKind, CoreError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors produced while sending a webhook and processing its response.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level failure reported by the transport.
    #[error("transport error: {message}")]
    Transport {
        /// Transport error message
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// The server answered with a status of 400 or above.
    #[error("unacceptable status code {status_code}")]
    UnacceptableStatus {
        /// HTTP status code
        status_code: u16,
    },

    /// The response was sealed but no secret is configured.
    #[error("encrypted response received but no secret is configured")]
    MissingKey,

    /// The sealed payload was not valid base64.
    #[error("encrypted payload is not valid base64: {message}")]
    Base64 {
        /// Decoder error message
        message: String,
    },

    /// The sealed payload failed authentication.
    #[error("failed to open encrypted payload")]
    Decrypt,

    /// The response body was not valid JSON.
    #[error("invalid JSON response: {message}")]
    InvalidJson {
        /// Parser error message
        message: String,
    },

    /// The response did not have the shape the caller asked for.
    #[error("unexpected response: {message}")]
    UnexpectedResponse {
        /// Description of the mismatch
        message: String,
    },

    /// A send referenced a handler that was never registered.
    #[error("no response handler registered for '{handler_id}'")]
    UnregisteredHandler {
        /// Handler identifier that was requested
        handler_id: String,
    },

    /// Two factories were registered for the same handler.
    #[error("response handler '{handler_id}' registered more than once")]
    DuplicateHandler {
        /// Handler identifier registered twice
        handler_id: String,
    },

    /// A newer request for the same handler and destination superseded this
    /// one.
    #[error("request replaced by a newer request")]
    Replaced,

    /// The transfer was cancelled.
    #[error("transfer cancelled")]
    Cancelled,

    /// The destination of a transfer is no longer known.
    #[error("destination {destination_id} not found")]
    DestinationNotFound {
        /// Destination identifier that failed to resolve
        destination_id: String,
    },

    /// Persisted correlation metadata could not be decoded.
    #[error("failed to decode correlation record: {message}")]
    CorrelationDecode {
        /// Decoder error message
        message: String,
    },

    /// The correlation record exceeds the journal field limit.
    #[error("correlation record of {size} bytes exceeds limit of {limit} bytes")]
    CorrelationTooLarge {
        /// Encoded size in bytes
        size: usize,
        /// Maximum permitted size in bytes
        limit: usize,
    },

    /// The request could not be encoded.
    #[error("failed to encode request: {message}")]
    Encoding {
        /// Encoder error message
        message: String,
    },

    /// The transfer journal failed.
    #[error("journal error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Invalid engine or client configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// A durable transfer outlived its resource timeout.
    #[error("durable transfer abandoned after {elapsed_seconds}s")]
    ResourceTimeout {
        /// Seconds since the transfer was enqueued
        elapsed_seconds: u64,
    },

    /// The coordinator is shutting down.
    #[error("delivery shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a transport error from a message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an unacceptable status error.
    pub fn unacceptable_status(status_code: u16) -> Self {
        Self::UnacceptableStatus { status_code }
    }

    /// Creates a base64 error.
    pub fn base64(message: impl Into<String>) -> Self {
        Self::Base64 { message: message.into() }
    }

    /// Creates an invalid JSON error.
    pub fn invalid_json(message: impl Into<String>) -> Self {
        Self::InvalidJson { message: message.into() }
    }

    /// Creates an unexpected response error.
    pub fn unexpected_response(message: impl Into<String>) -> Self {
        Self::UnexpectedResponse { message: message.into() }
    }

    /// Creates an unregistered handler error.
    pub fn unregistered_handler(handler_id: impl Into<String>) -> Self {
        Self::UnregisteredHandler { handler_id: handler_id.into() }
    }

    /// Creates a destination not found error.
    pub fn destination_not_found(destination_id: impl Into<String>) -> Self {
        Self::DestinationNotFound { destination_id: destination_id.into() }
    }

    /// Creates a correlation decode error.
    pub fn correlation_decode(message: impl Into<String>) -> Self {
        Self::CorrelationDecode { message: message.into() }
    }

    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding { message: message.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether this error signals supersession or cancellation rather than a
    /// failure. Callers typically ignore these.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Replaced | Self::Cancelled)
    }

    /// Whether the server gave a real answer that the engine rejected.
    ///
    /// These are never retried on another transport: the request reached the
    /// server and the outcome would not change.
    pub fn is_definitive_rejection(&self) -> bool {
        matches!(
            self,
            Self::UnacceptableStatus { .. }
                | Self::MissingKey
                | Self::Base64 { .. }
                | Self::Decrypt
                | Self::InvalidJson { .. }
                | Self::UnexpectedResponse { .. }
        )
    }

    /// Whether a fresh attempt of the same request could succeed.
    ///
    /// Only transport-level failures qualify. Everything else is either a
    /// server answer, a programming error, or a local decision.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,

            Self::UnacceptableStatus { .. }
            | Self::MissingKey
            | Self::Base64 { .. }
            | Self::Decrypt
            | Self::InvalidJson { .. }
            | Self::UnexpectedResponse { .. }
            | Self::UnregisteredHandler { .. }
            | Self::DuplicateHandler { .. }
            | Self::Replaced
            | Self::Cancelled
            | Self::DestinationNotFound { .. }
            | Self::CorrelationDecode { .. }
            | Self::CorrelationTooLarge { .. }
            | Self::Encoding { .. }
            | Self::Storage { .. }
            | Self::Configuration { .. }
            | Self::ResourceTimeout { .. }
            | Self::ShutdownRequested
            | Self::Internal { .. } => false,
        }
    }

    /// Returns the HTTP status code carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::UnacceptableStatus { status_code } => Some(*status_code),
            _ => None,
        }
    }

    /// Describes this error as a network-request record for the client
    /// event log, tagged with its [`ErrorCategory`].
    pub fn client_event(&self, text: impl Into<String>) -> ClientEvent {
        let event = ClientEvent::new(ClientEventKind::NetworkRequest, text)
            .with("category", ErrorCategory::from(self).to_string())
            .with("error", self.to_string());
        match self.status_code() {
            Some(status_code) => event.with("status_code", status_code),
            None => event,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::storage(err.to_string())
    }
}

/// Category of delivery error for logs and client events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues.
    Transport,
    /// The server rejected the request.
    Server,
    /// Sealed envelope or body parsing failures.
    Envelope,
    /// Correlation metadata problems.
    Correlation,
    /// Misuse of the API detected before any I/O.
    Programming,
    /// Supersession or cancellation.
    Cancellation,
    /// Journal failures.
    Storage,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Transport { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::ResourceTimeout { .. } => Self::Transport,
            DeliveryError::UnacceptableStatus { .. } => Self::Server,
            DeliveryError::MissingKey
            | DeliveryError::Base64 { .. }
            | DeliveryError::Decrypt
            | DeliveryError::InvalidJson { .. }
            | DeliveryError::UnexpectedResponse { .. } => Self::Envelope,
            DeliveryError::DestinationNotFound { .. }
            | DeliveryError::CorrelationDecode { .. }
            | DeliveryError::CorrelationTooLarge { .. } => Self::Correlation,
            DeliveryError::UnregisteredHandler { .. }
            | DeliveryError::DuplicateHandler { .. }
            | DeliveryError::Encoding { .. } => Self::Programming,
            DeliveryError::Replaced | DeliveryError::Cancelled => Self::Cancellation,
            DeliveryError::Storage { .. } => Self::Storage,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::ShutdownRequested | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Server => write!(f, "server"),
            Self::Envelope => write!(f, "envelope"),
            Self::Correlation => write!(f, "correlation"),
            Self::Programming => write!(f, "programming"),
            Self::Cancellation => write!(f, "cancellation"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(DeliveryError::transport("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());

        assert!(!DeliveryError::unacceptable_status(503).is_retryable());
        assert!(!DeliveryError::Decrypt.is_retryable());
        assert!(!DeliveryError::Replaced.is_retryable());
        assert!(!DeliveryError::unregistered_handler("x").is_retryable());
        assert!(!DeliveryError::storage("disk full").is_retryable());
    }

    #[test]
    fn server_answers_are_definitive() {
        assert!(DeliveryError::unacceptable_status(404).is_definitive_rejection());
        assert!(DeliveryError::MissingKey.is_definitive_rejection());
        assert!(DeliveryError::invalid_json("eof").is_definitive_rejection());

        assert!(!DeliveryError::transport("reset").is_definitive_rejection());
        assert!(!DeliveryError::Cancelled.is_definitive_rejection());
    }

    #[test]
    fn replaced_and_cancelled_are_cancellation_kinds() {
        assert!(DeliveryError::Replaced.is_cancelled());
        assert!(DeliveryError::Cancelled.is_cancelled());
        assert!(!DeliveryError::unacceptable_status(410).is_cancelled());
    }

    #[test]
    fn status_code_extracted_only_from_status_errors() {
        assert_eq!(DeliveryError::unacceptable_status(410).status_code(), Some(410));
        assert_eq!(DeliveryError::timeout(5).status_code(), None);
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::transport("x")), ErrorCategory::Transport);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::unacceptable_status(500)),
            ErrorCategory::Server
        );
        assert_eq!(ErrorCategory::from(&DeliveryError::Decrypt), ErrorCategory::Envelope);
        assert_eq!(ErrorCategory::from(&DeliveryError::Replaced), ErrorCategory::Cancellation);
        assert_eq!(ErrorCategory::Envelope.to_string(), "envelope");
    }

    #[test]
    fn client_event_carries_category_and_status() {
        let event = DeliveryError::unacceptable_status(410).client_event("rejected");

        assert_eq!(event.kind, ClientEventKind::NetworkRequest);
        assert_eq!(event.payload["category"], "server");
        assert_eq!(event.payload["status_code"], 410);

        let event = DeliveryError::ResourceTimeout { elapsed_seconds: 7200 }.client_event("gave up");
        assert_eq!(event.payload["category"], "transport");
        assert!(!event.payload.contains_key("status_code"));
    }

    #[test]
    fn core_errors_become_storage_errors() {
        let err = DeliveryError::from(CoreError::NotFound("transfer".into()));
        assert!(matches!(err, DeliveryError::Storage { .. }));
    }

    #[test]
    fn error_display_format() {
        assert_eq!(
            DeliveryError::unacceptable_status(404).to_string(),
            "unacceptable status code 404"
        );
        assert_eq!(
            DeliveryError::CorrelationTooLarge { size: 5000, limit: 4096 }.to_string(),
            "correlation record of 5000 bytes exceeds limit of 4096 bytes"
        );
    }
}
