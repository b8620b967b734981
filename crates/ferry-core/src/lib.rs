//! Core domain models and collaborator traits.
//!
//! Provides the strongly-typed request, destination and correlation types
//! shared by the delivery engine, the traits through which the engine talks
//! to its host, and the SQLite-backed transfer journal.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod collaborators;
pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use collaborators::{
    ClientEvent, ClientEventKind, ClientEventLog, DestinationRegistry, LifetimeExtender,
    LifetimeToken, MulticastClientEventLog, NoOpClientEventLog, NoOpLifetimeExtender,
    NoOpNotificationSink, NotificationSink, StaticDestinationRegistry, TracingClientEventLog,
};
pub use error::{CoreError, Result};
pub use models::{
    CorrelationRecord, Destination, DestinationId, HandlerId, HandlerResult, JournalEntry,
    Notification, Request, SessionId, TransferId, TransferKey, JOURNAL_VERSION,
};
pub use time::{Clock, RealClock, TestClock};
