//! HTTP client for webhook transfers with configurable timeouts.
//!
//! Posts encoded bodies and hands the response back as a stream of chunks so
//! the coordinator can buffer them per transfer. Transport failures are
//! categorized for the retry logic of the durable session.

use std::time::Duration;

use bytes::Bytes;
use ferry_core::TransferKey;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Configuration for the webhook client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for a single HTTP request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates. Destinations may opt out
    /// individually.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: format!("ferry/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// HTTP client shared by both transport sessions.
///
/// Cookies are never stored. Two connection pools are kept: one that
/// verifies certificates and one for destinations that opted out.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    insecure: reqwest::Client,
    config: ClientConfig,
}

/// A single POST of an encoded body.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Transfer this request belongs to.
    pub transfer: TransferKey,
    /// Webhook URL.
    pub url: String,
    /// Encoded JSON body.
    pub body: Bytes,
    /// Attempt number, 1-based.
    pub attempt_number: u32,
    /// Whether the destination requires valid certificates.
    pub verify_tls: bool,
}

/// A response whose body is still being received.
#[derive(Debug)]
pub struct InFlightResponse {
    response: reqwest::Response,
    timeout: Duration,
}

impl InFlightResponse {
    /// HTTP status code.
    pub fn status_code(&self) -> u16 {
        self.response.status().as_u16()
    }

    /// Returns the next body chunk, or `None` once the body is complete.
    ///
    /// # Errors
    ///
    /// Returns `Transport` or `Timeout` if the connection fails mid-body.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.response.chunk().await.map_err(|e| categorize(&e, self.timeout))
    }
}

impl DeliveryClient {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Self::build(&config, config.verify_tls)?;
        let insecure = Self::build(&config, false)?;

        Ok(Self { client, insecure, config })
    }

    /// Creates a new client with default configuration.
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    fn build(config: &ClientConfig, verify_tls: bool) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Posts a webhook body and waits for the response head.
    ///
    /// Any HTTP status counts as a response; interpreting it is the codec's
    /// job.
    ///
    /// # Errors
    ///
    /// - `Transport` for connection failures
    /// - `Timeout` when no response arrives in time
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<InFlightResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_transfer",
            session_id = %request.transfer.session_id,
            transfer_id = %request.transfer.transfer_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("sending webhook request");

            let client = if request.verify_tls { &self.client } else { &self.insecure };
            let result = client
                .post(&request.url)
                .header("content-type", "application/json")
                .body(request.body)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);
                    return Err(categorize(&e, self.config.timeout));
                },
            };

            let status_code = response.status().as_u16();
            tracing::debug!(
                status_code,
                duration_ms = start_time.elapsed().as_millis(),
                "received response"
            );

            Ok(InFlightResponse { response, timeout: self.config.timeout })
        }
        .instrument(span)
        .await
    }
}

fn categorize(error: &reqwest::Error, timeout: Duration) -> DeliveryError {
    if error.is_timeout() {
        return DeliveryError::timeout(timeout.as_secs());
    }
    if error.is_connect() {
        return DeliveryError::transport(format!("connection failed: {error}"));
    }
    DeliveryError::transport(error.to_string())
}
