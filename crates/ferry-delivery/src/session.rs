//! Transport session registry.
//!
//! A session groups the transfers of one transport kind. Exactly one
//! immediate session and one durable session are current per process; older
//! durable sessions are restored from the journal when the host wakes the
//! process for them, and dropped once they drain.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use ferry_core::{SessionId, TransferId, TransferKey};
use tokio_util::sync::CancellationToken;

use crate::{
    error::DeliveryError,
    lifecycle::{EventGroup, FinishLatch, GroupWaiter},
    retry::RetryPolicy,
};

/// Identifier of the immediate session.
pub const IMMEDIATE_SESSION_ID: &str = "non-background";

/// Prefix of every durable session identifier.
pub const DURABLE_SESSION_PREFIX: &str = "webhook-";

/// Default ceiling on how long a durable transfer may stay outstanding.
pub const DEFAULT_RESOURCE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Transport kind of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// One attempt, results are lost if the process exits.
    Immediate,
    /// Journaled, retried and resumable across relaunches.
    Durable,
}

impl SessionKind {
    /// Infers the kind from a session identifier.
    pub fn of(session_id: &SessionId) -> Self {
        if session_id.as_str() == IMMEDIATE_SESSION_ID {
            Self::Immediate
        } else {
            Self::Durable
        }
    }
}

/// Settings shared by the sessions of one process.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Application identifier used to name the durable session.
    pub app_identifier: String,
    /// Ceiling after which a durable transfer is abandoned.
    pub resource_timeout: Duration,
    /// Backoff applied between durable attempts.
    pub retry_policy: RetryPolicy,
}

impl SessionConfig {
    /// Creates a configuration with default timeouts.
    pub fn new(app_identifier: impl Into<String>) -> Self {
        Self {
            app_identifier: app_identifier.into(),
            resource_timeout: DEFAULT_RESOURCE_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Identifier of this process's durable session.
    pub fn durable_session_id(&self) -> SessionId {
        SessionId::new(format!("{DURABLE_SESSION_PREFIX}{}", self.app_identifier))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new("ferry")
    }
}

/// Callback from a transfer task to the coordinator.
#[derive(Debug)]
pub enum SessionEvent {
    /// A chunk of response body arrived.
    DataReceived {
        /// Transfer the chunk belongs to.
        key: TransferKey,
        /// Body bytes.
        chunk: Bytes,
    },
    /// A durable attempt failed and will be retried. Buffered data is stale.
    AttemptFailed {
        /// Transfer that failed.
        key: TransferKey,
        /// Attempts made so far.
        attempts: u32,
        /// Why the attempt failed.
        error: DeliveryError,
    },
    /// A durable transfer was journaled.
    Enqueued {
        /// Transfer that was journaled.
        key: TransferKey,
    },
    /// A transfer finished with a status code or an error.
    Completed {
        /// Transfer that finished.
        key: TransferKey,
        /// HTTP status, or why no response was received.
        outcome: Result<u16, DeliveryError>,
    },
    /// A response handler invocation finished.
    InvocationFinished {
        /// Session whose event group the invocation belonged to.
        session_id: SessionId,
    },
}

/// A transfer that has not completed yet.
#[derive(Debug)]
pub struct OutstandingTransfer {
    /// Encoded correlation record. `None` for ephemeral transfers.
    pub correlation: Option<String>,
    cancel: CancellationToken,
    cancelled: bool,
}

impl OutstandingTransfer {
    /// Whether the transfer was cancelled and awaits its completion report.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// One transport session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    kind: SessionKind,
    transfers: HashMap<TransferId, OutstandingTransfer>,
    pub(crate) group: EventGroup<GroupWaiter>,
    pub(crate) latch: FinishLatch<()>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        let kind = SessionKind::of(&id);
        Self {
            id,
            kind,
            transfers: HashMap::new(),
            group: EventGroup::new(),
            latch: FinishLatch::new(),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Transport kind.
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Starts tracking a transfer.
    pub fn track(
        &mut self,
        transfer_id: TransferId,
        correlation: Option<String>,
        cancel: CancellationToken,
    ) {
        self.transfers
            .insert(transfer_id, OutstandingTransfer { correlation, cancel, cancelled: false });
    }

    /// Whether a transfer is tracked, cancelled or not.
    pub fn contains(&self, transfer_id: TransferId) -> bool {
        self.transfers.contains_key(&transfer_id)
    }

    /// Outstanding transfers that have not been cancelled, with their
    /// correlation blobs.
    pub fn tasks(&self) -> impl Iterator<Item = (TransferId, Option<&str>)> {
        self.transfers
            .iter()
            .filter(|(_, t)| !t.cancelled)
            .map(|(id, t)| (*id, t.correlation.as_deref()))
    }

    /// Cooperatively cancels a transfer. Returns whether it was running.
    ///
    /// The transfer stays tracked until its task reports completion.
    pub fn cancel(&mut self, transfer_id: TransferId) -> bool {
        match self.transfers.get_mut(&transfer_id) {
            Some(transfer) if !transfer.cancelled => {
                transfer.cancelled = true;
                transfer.cancel.cancel();
                true
            },
            _ => false,
        }
    }

    /// Stops tracking a completed transfer.
    pub fn finish(&mut self, transfer_id: TransferId) -> Option<OutstandingTransfer> {
        self.transfers.remove(&transfer_id)
    }

    /// Number of transfers still tracked.
    pub fn active(&self) -> usize {
        self.transfers.len()
    }
}

/// All sessions known to this process.
#[derive(Debug)]
pub struct SessionRegistry {
    current_immediate: SessionId,
    current_durable: SessionId,
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Creates a registry for the given configuration. Sessions are built
    /// lazily.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            current_immediate: SessionId::new(IMMEDIATE_SESSION_ID),
            current_durable: config.durable_session_id(),
            sessions: HashMap::new(),
        }
    }

    /// Identifier of the current session of `kind`.
    pub fn current(&self, kind: SessionKind) -> &SessionId {
        match kind {
            SessionKind::Immediate => &self.current_immediate,
            SessionKind::Durable => &self.current_durable,
        }
    }

    /// Whether `session_id` is one of the two current sessions.
    pub fn is_current(&self, session_id: &SessionId) -> bool {
        *session_id == self.current_immediate || *session_id == self.current_durable
    }

    /// Returns the session, constructing it on first use.
    pub fn session_for(&mut self, session_id: &SessionId) -> &mut Session {
        self.sessions.entry(session_id.clone()).or_insert_with(|| {
            tracing::debug!(session_id = %session_id, "creating transport session");
            Session::new(session_id.clone())
        })
    }

    /// Returns an existing session.
    pub fn get(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Returns an existing session mutably.
    pub fn get_mut(&mut self, session_id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }

    /// Drops a session from the registry.
    pub fn remove(&mut self, session_id: &SessionId) -> Option<Session> {
        let removed = self.sessions.remove(session_id);
        if removed.is_some() {
            tracing::debug!(session_id = %session_id, "removed transport session");
        }
        removed
    }

    /// Iterates over every known session.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_session_id_uses_app_identifier() {
        let config = SessionConfig::new("io.example.app");

        assert_eq!(config.durable_session_id().as_str(), "webhook-io.example.app");
        assert_eq!(SessionKind::of(&config.durable_session_id()), SessionKind::Durable);
        assert_eq!(SessionKind::of(&SessionId::new(IMMEDIATE_SESSION_ID)), SessionKind::Immediate);
    }

    #[test]
    fn sessions_are_created_once() {
        let mut registry = SessionRegistry::new(&SessionConfig::new("app"));
        let id = registry.current(SessionKind::Durable).clone();

        registry.session_for(&id).track(TransferId::new(), None, CancellationToken::new());
        registry.session_for(&id);

        assert_eq!(registry.get(&id).map(Session::active), Some(1));
        assert!(registry.is_current(&id));
        assert!(!registry.is_current(&SessionId::new("webhook-previous")));
    }

    #[test]
    fn cancelled_transfers_leave_task_list_but_stay_tracked() {
        let mut session = Session::new(SessionId::new("webhook-app"));
        let token = CancellationToken::new();
        let id = TransferId::new();
        session.track(id, Some("blob".into()), token.clone());

        assert!(session.cancel(id));
        assert!(!session.cancel(id));
        assert!(token.is_cancelled());
        assert_eq!(session.tasks().count(), 0);
        assert_eq!(session.active(), 1);

        assert!(session.finish(id).is_some());
        assert_eq!(session.active(), 0);
    }
}
