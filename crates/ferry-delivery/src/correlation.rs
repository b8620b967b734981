//! Correlation blobs attached to durable transfers.
//!
//! A blob is the standard base64 of the JSON form of a
//! [`CorrelationRecord`]. It is stored with the journal entry so a completed
//! transfer can be routed to its handler after a relaunch.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ferry_core::CorrelationRecord;

use crate::error::{DeliveryError, Result};

/// Upper bound on the encoded size of a correlation blob.
pub const MAX_CORRELATION_LEN: usize = 4096;

/// Encodes a correlation record.
///
/// # Errors
///
/// Returns `CorrelationTooLarge` when the blob would exceed
/// [`MAX_CORRELATION_LEN`]. The record is never truncated.
pub fn encode(record: &CorrelationRecord) -> Result<String> {
    let json = serde_json::to_vec(record).map_err(|e| DeliveryError::encoding(e.to_string()))?;
    let blob = STANDARD.encode(json);

    if blob.len() > MAX_CORRELATION_LEN {
        return Err(DeliveryError::CorrelationTooLarge {
            size: blob.len(),
            limit: MAX_CORRELATION_LEN,
        });
    }

    Ok(blob)
}

/// Decodes a correlation blob.
///
/// # Errors
///
/// Returns `CorrelationDecode` for empty, non-base64 or non-JSON input.
pub fn decode(blob: &str) -> Result<CorrelationRecord> {
    if blob.is_empty() {
        return Err(DeliveryError::correlation_decode("empty correlation"));
    }

    let json = STANDARD.decode(blob).map_err(|e| DeliveryError::correlation_decode(e.to_string()))?;

    serde_json::from_slice(&json).map_err(|e| DeliveryError::correlation_decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use ferry_core::{DestinationId, HandlerId, Request};
    use serde_json::json;

    use super::*;

    fn record() -> CorrelationRecord {
        let mut metadata = serde_json::Map::new();
        metadata.insert("notification".into(), json!({"body": "done"}));

        CorrelationRecord {
            server: DestinationId::new("home"),
            request: Request::new("call_service", json!({"domain": "light", "data": [1, {"x": null}]}))
                .with_local_metadata(metadata),
            identifier: HandlerId::SERVICE_CALL,
        }
    }

    #[test]
    fn round_trips_nested_payloads() {
        let original = record();

        let blob = encode(&original).unwrap();

        assert_eq!(decode(&blob).unwrap(), original);
    }

    #[test]
    fn wire_shape_uses_request_field_names() {
        let blob = encode(&record()).unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(blob).unwrap()).unwrap();

        assert_eq!(json["server"], "home");
        assert_eq!(json["identifier"], "service_call");
        assert_eq!(json["request"]["type"], "call_service");
        assert!(json["request"]["local_metadata"].is_object());
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut big = record();
        big.request.payload = json!({"blob": "x".repeat(MAX_CORRELATION_LEN)});

        let err = encode(&big).unwrap_err();

        assert!(matches!(err, DeliveryError::CorrelationTooLarge { limit, .. } if limit == MAX_CORRELATION_LEN));
    }

    #[test]
    fn malformed_blobs_fail_to_decode() {
        for blob in ["", "!!!not base64!!!", "bm90IGpzb24="] {
            assert!(
                matches!(decode(blob), Err(DeliveryError::CorrelationDecode { .. })),
                "blob {blob:?} should not decode"
            );
        }
    }
}
