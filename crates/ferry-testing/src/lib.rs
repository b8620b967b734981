//! Test infrastructure for deterministic delivery testing.
//!
//! Provides an HTTP mock standing in for automation servers, recording host
//! collaborators, a manually driven clock, an in-memory journal and fixture
//! builders. [`TestEnv`] wires them into a coordinator the same way a host
//! application would.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use ferry_core::{Destination, StaticDestinationRegistry};
use ferry_delivery::{
    storage::mock::MemoryTransferJournal, ClientConfig, CoordinatorConfig, DeliveryCoordinator,
    DeliveryCoordinatorBuilder, RetryPolicy, SessionConfig,
};

pub mod fixtures;
pub mod http;
pub mod property;
pub mod recording;

pub use ferry_core::{Clock, TestClock};
pub use fixtures::JournalEntryBuilder;
pub use http::{unreachable_base_url, MockServer, MockWebhook};
pub use recording::{RecordingClientEventLog, RecordingLifetimeExtender, RecordingNotificationSink};

/// Application identifier used by test coordinators.
pub const TEST_APP_IDENTIFIER: &str = "io.ferry.test";

/// Test environment for coordinator integration tests.
///
/// Every collaborator is shared with the coordinators it builds, so tests
/// can inspect what the engine did after the fact.
pub struct TestEnv {
    /// HTTP mock server for the remote automation server.
    pub http_mock: MockServer,
    /// Deterministic clock for retry scheduling.
    pub clock: TestClock,
    /// Journal shared by every coordinator built from this environment.
    pub journal: MemoryTransferJournal,
    /// Client events recorded by the engine.
    pub events: Arc<RecordingClientEventLog>,
    /// Notifications presented by handlers.
    pub notifications: Arc<RecordingNotificationSink>,
    /// Lifetime extensions requested by the engine.
    pub lifetime: Arc<RecordingLifetimeExtender>,
    destinations: Vec<Destination>,
}

impl TestEnv {
    /// Starts a mock server and creates fresh collaborators.
    pub async fn new() -> Self {
        Self {
            http_mock: MockServer::start().await,
            clock: TestClock::new(),
            journal: MemoryTransferJournal::new(),
            events: Arc::new(RecordingClientEventLog::new()),
            notifications: Arc::new(RecordingNotificationSink::new()),
            lifetime: Arc::new(RecordingLifetimeExtender::new()),
            destinations: Vec::new(),
        }
    }

    /// Creates a destination on the mock server and registers it for
    /// coordinators built afterwards.
    pub fn destination(&mut self, id: &str) -> Destination {
        let destination = fixtures::destination(id, &self.http_mock.url());
        self.register(destination.clone());
        destination
    }

    /// Creates a destination with a shared secret.
    pub fn sealed_destination(&mut self, id: &str, secret: &str) -> Destination {
        let destination = fixtures::destination(id, &self.http_mock.url()).with_secret(secret);
        self.register(destination.clone());
        destination
    }

    /// Registers a destination for resolution of restored transfers.
    pub fn register(&mut self, destination: Destination) {
        self.destinations.retain(|existing| existing.id != destination.id);
        self.destinations.push(destination);
    }

    /// Configuration with short timeouts and jitter-free retries.
    pub fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            session: SessionConfig {
                app_identifier: TEST_APP_IDENTIFIER.to_owned(),
                resource_timeout: Duration::from_secs(60 * 60),
                retry_policy: RetryPolicy {
                    max_attempts: 5,
                    base_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(30),
                    ..RetryPolicy::default()
                }
                .without_jitter(),
            },
            client: ClientConfig { timeout: Duration::from_secs(2), ..ClientConfig::default() },
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Builder wired to this environment's collaborators.
    pub fn coordinator_builder(&self) -> DeliveryCoordinatorBuilder {
        self.coordinator_builder_with(self.config())
    }

    /// Builder wired to this environment's collaborators with a custom
    /// configuration.
    pub fn coordinator_builder_with(&self, config: CoordinatorConfig) -> DeliveryCoordinatorBuilder {
        DeliveryCoordinator::builder(config)
            .destinations(Arc::new(StaticDestinationRegistry::new(self.destinations.clone())))
            .event_log(self.events.clone())
            .notifications(self.notifications.clone())
            .lifetime_extender(self.lifetime.clone())
            .journal(Arc::new(self.journal.clone()))
            .clock(Arc::new(self.clock.clone()))
    }

    /// Builds a coordinator with the built-in handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator cannot be built.
    pub fn coordinator(&self) -> anyhow::Result<DeliveryCoordinator> {
        Ok(self.coordinator_builder().build()?)
    }

    /// Identifier of the durable session of test coordinators.
    pub fn durable_session_id(&self) -> String {
        self.config().session.durable_session_id().as_str().to_owned()
    }
}
