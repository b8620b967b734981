//! HTTP mocking utilities for webhook testing.

use std::{net::TcpListener, time::Duration};

use bytes::Bytes;
use http::StatusCode;
use serde_json::Value;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer as WiremockServer, ResponseTemplate,
};

/// HTTP mock server standing in for a remote automation server.
pub struct MockServer {
    server: WiremockServer,
}

impl MockServer {
    /// Starts a new mock server on a random port.
    pub async fn start() -> Self {
        Self { server: WiremockServer::start().await }
    }

    /// Returns the base URL of the mock server.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Configures a webhook path to answer with a response.
    pub async fn mock_webhook(&self, webhook: MockWebhook) {
        let mut template = ResponseTemplate::new(webhook.status.as_u16());
        if !webhook.body.is_empty() {
            template = template.set_body_bytes(webhook.body.to_vec());
        }
        if let Some(delay) = webhook.delay {
            template = template.set_delay(delay);
        }

        let mut mock = Mock::given(method("POST")).and(path(webhook.path)).respond_with(template);
        if let Some(times) = webhook.times {
            mock = mock.up_to_n_times(times);
        }
        if let Some(priority) = webhook.priority {
            mock = mock.with_priority(priority);
        }
        mock.mount(&self.server).await;
    }

    /// Shorthand for a webhook answering 200 with a JSON body.
    pub async fn mock_json(&self, webhook_path: &str, body: &Value) {
        self.mock_webhook(MockWebhook::success(webhook_path).with_json(body)).await;
    }

    /// Shorthand for a webhook answering with a bare status code.
    pub async fn mock_status(&self, webhook_path: &str, status: StatusCode) {
        self.mock_webhook(MockWebhook::failure(webhook_path, status)).await;
    }

    /// Returns the bodies of all requests received, parsed as JSON. Bodies
    /// that are not JSON are returned as strings.
    pub async fn received_json(&self) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| {
                serde_json::from_slice(&request.body).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&request.body).into_owned())
                })
            })
            .collect()
    }

    /// Number of requests received.
    pub async fn request_count(&self) -> usize {
        self.server.received_requests().await.map_or(0, |requests| requests.len())
    }

    /// Asserts that exactly `expected` requests were received.
    pub async fn assert_request_count(&self, expected: usize) {
        let received = self.request_count().await;
        assert_eq!(received, expected, "Expected {expected} requests, received {received}");
    }

    /// Waits until at least `expected` requests arrived, polling for up to
    /// `timeout`. Returns whether the count was reached.
    pub async fn wait_for_requests(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.request_count().await >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.request_count().await >= expected
    }

    /// Clears mocks and recorded requests.
    pub async fn reset(&self) {
        self.server.reset().await;
    }
}

/// A base URL nothing listens on, for connection-refused scenarios.
pub fn unreachable_base_url() -> String {
    let port = TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map_or(9, |addr| addr.port());
    format!("http://127.0.0.1:{port}")
}

/// Configuration for a mocked webhook path.
#[derive(Debug, Clone)]
pub struct MockWebhook {
    /// Absolute request path, starting with `/`.
    pub path: String,
    /// Status code returned.
    pub status: StatusCode,
    /// Response body.
    pub body: Bytes,
    /// Delay before responding.
    pub delay: Option<Duration>,
    /// Stop matching after this many requests.
    pub times: Option<u64>,
    /// Wiremock priority, lower wins.
    pub priority: Option<u8>,
}

impl MockWebhook {
    /// A webhook answering 200 with an empty body.
    pub fn success(webhook_path: &str) -> Self {
        Self::failure(webhook_path, StatusCode::OK)
    }

    /// A webhook answering with `status` and an empty body.
    pub fn failure(webhook_path: &str, status: StatusCode) -> Self {
        Self {
            path: absolute(webhook_path),
            status,
            body: Bytes::new(),
            delay: None,
            times: None,
            priority: None,
        }
    }

    /// Sets a JSON body.
    #[must_use]
    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = Bytes::from(body.to_string());
        self
    }

    /// Sets a raw body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Delays the response, e.g. to trigger client timeouts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Only answers the first `times` matching requests.
    #[must_use]
    pub fn times(mut self, times: u64) -> Self {
        self.times = Some(times);
        self
    }

    /// Takes precedence over mocks with a larger priority value.
    #[must_use]
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

fn absolute(webhook_path: &str) -> String {
    format!("/{}", webhook_path.trim_start_matches('/'))
}
