//! Service bootstrap: journal, coordinator, relaunch resume.

use std::sync::Arc;

use anyhow::{Context, Result};
use ferry_core::{storage::Storage, StaticDestinationRegistry, TracingClientEventLog};
use ferry_delivery::{DeliveryCoordinator, SqliteTransferJournal};
use tracing::{info, warn};

use crate::config::Config;

/// A running delivery service.
pub struct App {
    /// The delivery coordinator.
    pub coordinator: DeliveryCoordinator,
    config: Config,
}

impl App {
    /// Opens the journal, starts the coordinator and resumes transfers left
    /// over from the previous run.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be opened or read, or the
    /// coordinator cannot be built.
    pub async fn start(config: Config) -> Result<Self> {
        let storage = Storage::connect(&config.database_url, config.database_max_connections)
            .await
            .context("Failed to open transfer journal")?;
        info!(database_url = %config.database_url_masked(), "Transfer journal opened");

        Self::start_with_storage(config, storage).await
    }

    /// Like [`start`](Self::start) over an already opened journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or the coordinator
    /// cannot be built.
    pub async fn start_with_storage(config: Config, storage: Storage) -> Result<Self> {
        let destinations = config.to_destinations();
        info!(destinations = destinations.len(), "Destinations loaded");

        let coordinator = DeliveryCoordinator::builder(config.to_coordinator_config())
            .destinations(Arc::new(StaticDestinationRegistry::new(destinations)))
            .event_log(Arc::new(TracingClientEventLog))
            .journal(Arc::new(SqliteTransferJournal::new(Arc::new(storage))))
            .durable_immediately(config.durable_immediately)
            .build()
            .context("Failed to build delivery coordinator")?;

        let resumed = coordinator.resume().await.context("Failed to resume journaled transfers")?;
        info!(
            resumed,
            durable_session_id = %coordinator.durable_session_id(),
            "Delivery coordinator ready"
        );

        Ok(Self { coordinator, config })
    }

    /// Checks that every configured destination answers. Returns how many
    /// did.
    pub async fn check_destinations(&self) -> usize {
        let mut reachable = 0;
        for destination in self.config.to_destinations() {
            match self.coordinator.send_test(&destination, &destination.base_url).await {
                Ok(()) => {
                    info!(destination_id = %destination.id, "Destination reachable");
                    reachable += 1;
                },
                Err(e) => {
                    warn!(destination_id = %destination.id, error = %e, "Destination unreachable");
                },
            }
        }
        reachable
    }

    /// Stops the coordinator. Durable transfers stay journaled.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator was already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.coordinator.shutdown().await.context("Failed to stop delivery coordinator")
    }
}
