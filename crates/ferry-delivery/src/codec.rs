//! Envelope codec for webhook request and response bodies.
//!
//! Outgoing requests are serialized with sorted keys. When the destination
//! has a shared secret the payload is sealed with XChaCha20-Poly1305 and sent
//! as `{type, encrypted: true, encrypted_data}`, where `encrypted_data` is the
//! base64 of `nonce ‖ ciphertext ‖ tag`. Responses are interpreted by status
//! code first and only then parsed, opening sealed envelopes on the way.
//!
//! | Status   | Result                              |
//! |----------|-------------------------------------|
//! | 204, 205 | [`ResponseBody::Void`]              |
//! | >= 400   | [`DeliveryError::UnacceptableStatus`] |
//! | other    | JSON, envelope-aware                |

use std::{fmt, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use ferry_core::{ClientEventLog, Destination, Request};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{DeliveryError, Result};

/// Length of the XChaCha20 nonce prefix.
pub const NONCE_LEN: usize = 24;

/// Length of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

/// Length of a symmetric key.
pub const KEY_LEN: usize = 32;

/// Field holding a sealed payload.
pub const ENCRYPTED_DATA_FIELD: &str = "encrypted_data";

/// Symmetric key derived from a destination secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Derives a key from a shared secret string.
    ///
    /// The UTF-8 bytes of the secret are truncated to 32 bytes and padded
    /// with zeros, matching how servers derive the key on their side.
    pub fn from_secret(secret: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        let bytes = secret.as_bytes();
        let len = bytes.len().min(KEY_LEN);
        key[..len].copy_from_slice(&bytes[..len]);
        Self(key)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Seals `plaintext` under a fresh random nonce.
    ///
    /// Returns `nonce ‖ ciphertext ‖ tag`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Encoding` if the cipher rejects the input.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| DeliveryError::encoding("failed to seal payload"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Opens a sealed `nonce ‖ ciphertext ‖ tag` blob.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Decrypt` if the blob is truncated or fails
    /// authentication.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(DeliveryError::Decrypt);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher.decrypt(XNonce::from_slice(nonce), ciphertext).map_err(|_| DeliveryError::Decrypt)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

/// Where an encoded request is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingTarget {
    /// Sent to the server. Local metadata is omitted.
    Wire,
    /// Persisted on the device. Local metadata is kept.
    Local,
}

/// An encoded request body.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBody {
    /// The JSON document.
    pub json: Value,
    /// The serialized bytes of `json`.
    pub bytes: Bytes,
}

/// Encodes a request for the given destination.
///
/// # Errors
///
/// Returns `DeliveryError::Encoding` if the payload cannot be serialized or
/// sealed.
pub fn encode(
    request: &Request,
    destination: &Destination,
    target: EncodingTarget,
) -> Result<EncodedBody> {
    let key = destination.secret.as_deref().map(SecretKey::from_secret);
    encode_with_key(request, key.as_ref(), target)
}

/// Encodes a request with an explicit key.
///
/// # Errors
///
/// Returns `DeliveryError::Encoding` if the payload cannot be serialized or
/// sealed.
pub fn encode_with_key(
    request: &Request,
    key: Option<&SecretKey>,
    target: EncodingTarget,
) -> Result<EncodedBody> {
    let mut body = Map::new();
    body.insert("type".to_string(), Value::String(request.kind.clone()));

    match key {
        Some(key) => {
            let plaintext = to_sorted_vec(&request.payload)?;
            let sealed = key.seal(&plaintext)?;
            body.insert("encrypted".to_string(), Value::Bool(true));
            body.insert(ENCRYPTED_DATA_FIELD.to_string(), Value::String(STANDARD.encode(sealed)));
        },
        None => {
            body.insert("data".to_string(), request.payload.clone());
        },
    }

    if target == EncodingTarget::Local {
        if let Some(metadata) = &request.local_metadata {
            body.insert("local_metadata".to_string(), Value::Object(metadata.clone()));
        }
    }

    let json = sorted(&Value::Object(body));
    let bytes = serde_json::to_vec(&json).map_err(|e| DeliveryError::encoding(e.to_string()))?;

    Ok(EncodedBody { json, bytes: Bytes::from(bytes) })
}

fn to_sorted_vec(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(&sorted(value)).map_err(|e| DeliveryError::encoding(e.to_string()))
}

/// Rebuilds `value` with every object's keys in lexicographic order,
/// regardless of the map implementation serde_json was built with.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        },
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// The server answered without content.
    Void,
    /// The server answered with a JSON value.
    Json(Value),
}

impl ResponseBody {
    /// Whether the response carried no content.
    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Returns the JSON value, if any.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Void => None,
            Self::Json(value) => Some(value),
        }
    }

    /// Converts into a JSON value, mapping `Void` to `null`.
    pub fn into_value(self) -> Value {
        match self {
            Self::Void => Value::Null,
            Self::Json(value) => value,
        }
    }

    /// Deserializes the body into `T`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::UnexpectedResponse` if the body does not have
    /// the shape of `T`.
    pub fn parse<T: DeserializeOwned>(self) -> Result<T> {
        let kind = std::any::type_name::<T>();
        serde_json::from_value(self.into_value())
            .map_err(|e| DeliveryError::unexpected_response(format!("expected {kind}: {e}")))
    }
}

/// Decodes a response body according to its status code.
///
/// # Errors
///
/// - `UnacceptableStatus` for status codes of 400 and above
/// - `InvalidJson` if the body (or opened envelope) is not JSON
/// - `MissingKey`, `Base64` or `Decrypt` for sealed envelopes that cannot be
///   opened
pub fn decode(body: &[u8], status_code: u16, key: Option<&SecretKey>) -> Result<ResponseBody> {
    if matches!(status_code, 204 | 205) {
        return Ok(ResponseBody::Void);
    }

    if status_code >= 400 {
        return Err(DeliveryError::unacceptable_status(status_code));
    }

    if body.is_empty() {
        return Ok(ResponseBody::Void);
    }

    let value: Value =
        serde_json::from_slice(body).map_err(|e| DeliveryError::invalid_json(e.to_string()))?;

    let Some(encrypted) = value.get(ENCRYPTED_DATA_FIELD).and_then(Value::as_str) else {
        return Ok(ResponseBody::Json(value));
    };

    let key = key.ok_or(DeliveryError::MissingKey)?;
    let sealed = STANDARD.decode(encrypted).map_err(|e| DeliveryError::base64(e.to_string()))?;
    let opened = key.open(&sealed)?;

    if opened.is_empty() {
        return Ok(ResponseBody::Void);
    }

    serde_json::from_slice(&opened)
        .map(ResponseBody::Json)
        .map_err(|e| DeliveryError::invalid_json(e.to_string()))
}

/// Response decoder that reports rejected responses to the client event log.
#[derive(Debug, Clone)]
pub struct ResponseCodec {
    event_log: Arc<dyn ClientEventLog>,
}

impl ResponseCodec {
    /// Creates a codec reporting to `event_log`.
    pub fn new(event_log: Arc<dyn ClientEventLog>) -> Self {
        Self { event_log }
    }

    /// Decodes a response from `destination`.
    ///
    /// # Errors
    ///
    /// See [`decode`].
    pub async fn decode(
        &self,
        destination: &Destination,
        status_code: u16,
        body: &[u8],
    ) -> Result<ResponseBody> {
        let key = destination.secret.as_deref().map(SecretKey::from_secret);
        let result = decode(body, status_code, key.as_ref());

        if let Err(error) = &result {
            if error.is_definitive_rejection() {
                tracing::warn!(
                    destination_id = %destination.id,
                    status_code,
                    error = %error,
                    "server response rejected"
                );
                let text = match error.status_code() {
                    Some(code) => format!("Webhook request rejected with status {code}"),
                    None => format!("Webhook response could not be read: {error}"),
                };
                self.event_log
                    .record(error.client_event(text).with("destination", destination.id.as_str()))
                    .await;
            }
        }

        result
    }
}
