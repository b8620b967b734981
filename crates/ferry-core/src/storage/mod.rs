//! Embedded journal storage for durable transfers.
//!
//! The journal lives in a local SQLite database so durable transfers can be
//! resumed after the process restarts. All SQL goes through the repositories
//! in this module.

use std::{str::FromStr, sync::Arc};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

pub mod transfers;

use crate::error::Result;

/// Container for repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for journaled durable transfers.
    pub transfers: Arc<transfers::Repository>,
}

impl Storage {
    /// Creates a storage instance over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        let pool = Arc::new(pool);
        Self { transfers: Arc::new(transfers::Repository::new(pool)) }
    }

    /// Opens (creating if needed) the database at `url` and applies the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the URL is invalid, the database
    /// cannot be opened, or the schema cannot be created.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let storage = Self::new(pool);
        storage.migrate().await?;
        Ok(storage)
    }

    /// Opens a private in-memory database. Used by tests and ephemeral
    /// deployments.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the schema cannot be created.
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory database.
        Self::connect("sqlite::memory:", 1).await
    }

    /// Creates tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if a statement fails.
    pub async fn migrate(&self) -> Result<()> {
        let pool = self.transfers.pool();

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS transfer_journal (
                transfer_id TEXT PRIMARY KEY NOT NULL,
                version INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                correlation TEXT NOT NULL CHECK (length(correlation) > 0),
                url TEXT NOT NULL,
                body BLOB NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                next_attempt_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            ",
        )
        .execute(&*pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_transfer_journal_session
            ON transfer_journal(session_id, created_at)
            ",
        )
        .execute(&*pool)
        .await?;

        Ok(())
    }

    /// Verifies the database answers queries.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.transfers.pool()).await?;
        Ok(())
    }

    /// Closes the underlying pool.
    pub async fn close(&self) {
        self.transfers.pool().close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_storage_is_healthy() {
        let storage = Storage::in_memory().await.unwrap();
        storage.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let storage = Storage::in_memory().await.unwrap();
        storage.migrate().await.unwrap();
        storage.migrate().await.unwrap();
    }
}
