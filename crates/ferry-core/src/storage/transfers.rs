//! Repository for journaled durable transfers.
//!
//! Each row is a versioned record keyed by the durable transfer id. Rows are
//! inserted at enqueue time, touched after failed attempts and deleted when
//! the transfer completes or is cancelled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{JournalEntry, SessionId, TransferId, JOURNAL_VERSION},
};

/// Repository for transfer journal operations.
pub struct Repository {
    pool: Arc<SqlitePool>,
}

#[derive(Debug, FromRow)]
struct JournalRow {
    transfer_id: String,
    version: i64,
    session_id: String,
    correlation: String,
    url: String,
    body: Vec<u8>,
    attempts: i64,
    created_at: DateTime<Utc>,
    next_attempt_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<JournalRow> for JournalEntry {
    type Error = CoreError;

    fn try_from(row: JournalRow) -> Result<Self> {
        let transfer_id = Uuid::parse_str(&row.transfer_id)
            .map_err(|e| CoreError::InvalidInput(format!("malformed transfer id: {e}")))?;

        Ok(Self {
            version: u32::try_from(row.version).unwrap_or(u32::MAX),
            transfer_id: TransferId(transfer_id),
            session_id: SessionId(row.session_id),
            correlation: row.correlation,
            url: row.url,
            body: row.body,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            created_at: row.created_at,
            next_attempt_at: row.next_attempt_at,
            expires_at: row.expires_at,
        })
    }
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<SqlitePool> {
        self.pool.clone()
    }

    /// Journals a new durable transfer.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the transfer id already
    /// exists or the correlation is empty.
    pub async fn insert(&self, entry: &JournalEntry) -> Result<()> {
        self.insert_impl(&*self.pool, entry).await
    }

    /// Journals a new durable transfer within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entry: &JournalEntry,
    ) -> Result<()> {
        self.insert_impl(&mut **tx, entry).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, entry: &JournalEntry) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r"
            INSERT INTO transfer_journal (
                transfer_id, version, session_id, correlation, url, body,
                attempts, created_at, next_attempt_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(entry.transfer_id.0.to_string())
        .bind(i64::from(entry.version))
        .bind(entry.session_id.as_str())
        .bind(&entry.correlation)
        .bind(&entry.url)
        .bind(&entry.body)
        .bind(i64::from(entry.attempts))
        .bind(entry.created_at)
        .bind(entry.next_attempt_at)
        .bind(entry.expires_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Finds a journaled transfer.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnsupportedVersion` if the row was written by a
    /// newer schema.
    pub async fn find(&self, transfer_id: TransferId) -> Result<Option<JournalEntry>> {
        let row = sqlx::query_as::<_, JournalRow>(
            r"
            SELECT transfer_id, version, session_id, correlation, url, body,
                   attempts, created_at, next_attempt_at, expires_at
            FROM transfer_journal
            WHERE transfer_id = ?
            ",
        )
        .bind(transfer_id.0.to_string())
        .fetch_optional(&*self.pool)
        .await?;

        row.map(Self::checked).transpose()
    }

    /// Lists the transfers owned by a session, oldest first.
    ///
    /// Rows that cannot be read by this build are returned as errors in
    /// place so callers can discard them individually.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<std::result::Result<JournalEntry, (TransferId, CoreError)>>> {
        let rows = sqlx::query_as::<_, JournalRow>(
            r"
            SELECT transfer_id, version, session_id, correlation, url, body,
                   attempts, created_at, next_attempt_at, expires_at
            FROM transfer_journal
            WHERE session_id = ?
            ORDER BY created_at ASC
            ",
        )
        .bind(session_id.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id = Uuid::parse_str(&row.transfer_id).map(TransferId).unwrap_or_default();
                Self::checked(row).map_err(|e| (id, e))
            })
            .collect())
    }

    /// Records a failed attempt and the time of the next one.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the transfer is not journaled.
    pub async fn record_attempt(
        &self,
        transfer_id: TransferId,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE transfer_journal
            SET attempts = ?, next_attempt_at = ?
            WHERE transfer_id = ?
            ",
        )
        .bind(i64::from(attempts))
        .bind(next_attempt_at)
        .bind(transfer_id.0.to_string())
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("transfer {transfer_id}")));
        }
        Ok(())
    }

    /// Deletes a journaled transfer. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, transfer_id: TransferId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transfer_journal WHERE transfer_id = ?")
            .bind(transfer_id.0.to_string())
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts journaled transfers for a session.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_session(&self, session_id: &SessionId) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM transfer_journal WHERE session_id = ?")
                .bind(session_id.as_str())
                .fetch_one(&*self.pool)
                .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn checked(row: JournalRow) -> Result<JournalEntry> {
        let entry = JournalEntry::try_from(row)?;
        if entry.version != JOURNAL_VERSION {
            return Err(CoreError::UnsupportedVersion {
                found: entry.version,
                expected: JOURNAL_VERSION,
            });
        }
        Ok(entry)
    }
}
