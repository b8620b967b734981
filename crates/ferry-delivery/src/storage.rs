//! Journal abstraction for durable transfers.
//!
//! The delivery engine persists durable transfers through the
//! [`TransferJournal`] trait. Production uses the SQLite repository in
//! `ferry_core::storage`; tests use the in-memory journal in [`mock`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use ferry_core::{
    error::{CoreError, Result},
    models::{JournalEntry, SessionId, TransferId},
};

/// A journal row as read back, or the id of a row that could not be read.
pub type LoadedEntry = std::result::Result<JournalEntry, (TransferId, CoreError)>;

/// Journal operations required by the durable session.
pub trait TransferJournal: Send + Sync + 'static {
    /// Journals a newly enqueued transfer.
    fn insert(&self, entry: JournalEntry) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Loads every transfer owned by a session, oldest first.
    ///
    /// Rows written by an incompatible schema are returned as errors so
    /// they can be discarded one by one.
    fn load_session(
        &self,
        session_id: SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LoadedEntry>>> + Send + '_>>;

    /// Records a failed attempt and when the next one is due.
    fn record_attempt(
        &self,
        transfer_id: TransferId,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Removes a transfer. Returns whether it was journaled.
    fn remove(
        &self,
        transfer_id: TransferId,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;
}

/// Journal backed by the SQLite transfer repository.
pub struct SqliteTransferJournal {
    storage: Arc<ferry_core::storage::Storage>,
}

impl SqliteTransferJournal {
    /// Creates a journal over an open storage handle.
    pub fn new(storage: Arc<ferry_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl TransferJournal for SqliteTransferJournal {
    fn insert(&self, entry: JournalEntry) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.transfers.insert(&entry).await })
    }

    fn load_session(
        &self,
        session_id: SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LoadedEntry>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.transfers.list_by_session(&session_id).await })
    }

    fn record_attempt(
        &self,
        transfer_id: TransferId,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.transfers.record_attempt(transfer_id, attempts, next_attempt_at).await
        })
    }

    fn remove(
        &self,
        transfer_id: TransferId,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.transfers.delete(transfer_id).await })
    }
}

pub mod mock {
    //! In-memory journal for tests.
    //!
    //! Keeps entries in a map and supports injecting a failure into the next
    //! insert to exercise enqueue errors.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use ferry_core::error::{CoreError, Result};
    use tokio::sync::RwLock;

    use super::{JournalEntry, LoadedEntry, SessionId, TransferId, TransferJournal};

    /// Journal storing entries in memory.
    #[derive(Clone, Default)]
    pub struct MemoryTransferJournal {
        entries: Arc<RwLock<HashMap<TransferId, JournalEntry>>>,
        insert_error: Arc<RwLock<Option<String>>>,
    }

    impl MemoryTransferJournal {
        /// Creates an empty journal.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds an entry directly, bypassing validation.
        pub async fn seed(&self, entry: JournalEntry) {
            self.entries.write().await.insert(entry.transfer_id, entry);
        }

        /// Fails the next insert with a database error.
        pub async fn inject_insert_error(&self, error: impl Into<String>) {
            *self.insert_error.write().await = Some(error.into());
        }

        /// Returns a journaled entry.
        pub async fn get(&self, transfer_id: TransferId) -> Option<JournalEntry> {
            self.entries.read().await.get(&transfer_id).cloned()
        }

        /// Returns every journaled entry.
        pub async fn entries(&self) -> Vec<JournalEntry> {
            self.entries.read().await.values().cloned().collect()
        }

        /// Number of journaled entries.
        pub async fn len(&self) -> usize {
            self.entries.read().await.len()
        }

        /// Whether the journal is empty.
        pub async fn is_empty(&self) -> bool {
            self.entries.read().await.is_empty()
        }
    }

    impl TransferJournal for MemoryTransferJournal {
        fn insert(
            &self,
            entry: JournalEntry,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let entries = self.entries.clone();
            let insert_error = self.insert_error.clone();
            Box::pin(async move {
                if let Some(error) = insert_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }
                if entry.correlation.is_empty() {
                    return Err(CoreError::ConstraintViolation("empty correlation".into()));
                }

                let mut entries = entries.write().await;
                if entries.contains_key(&entry.transfer_id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "transfer {} already journaled",
                        entry.transfer_id
                    )));
                }
                entries.insert(entry.transfer_id, entry);
                Ok(())
            })
        }

        fn load_session(
            &self,
            session_id: SessionId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<LoadedEntry>>> + Send + '_>> {
            let entries = self.entries.clone();
            Box::pin(async move {
                let mut owned: Vec<JournalEntry> = entries
                    .read()
                    .await
                    .values()
                    .filter(|e| e.session_id == session_id)
                    .cloned()
                    .collect();
                owned.sort_by_key(|e| e.created_at);

                Ok(owned
                    .into_iter()
                    .map(|e| {
                        if e.version == ferry_core::JOURNAL_VERSION {
                            Ok(e)
                        } else {
                            Err((e.transfer_id, CoreError::UnsupportedVersion {
                                found: e.version,
                                expected: ferry_core::JOURNAL_VERSION,
                            }))
                        }
                    })
                    .collect())
            })
        }

        fn record_attempt(
            &self,
            transfer_id: TransferId,
            attempts: u32,
            next_attempt_at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let entries = self.entries.clone();
            Box::pin(async move {
                let mut entries = entries.write().await;
                let entry = entries
                    .get_mut(&transfer_id)
                    .ok_or_else(|| CoreError::NotFound(format!("transfer {transfer_id}")))?;
                entry.attempts = attempts;
                entry.next_attempt_at = next_attempt_at;
                Ok(())
            })
        }

        fn remove(
            &self,
            transfer_id: TransferId,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            let entries = self.entries.clone();
            Box::pin(async move { Ok(entries.write().await.remove(&transfer_id).is_some()) })
        }
    }
}
