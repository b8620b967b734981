//! Webhook delivery engine with relaunch-safe correlation.
//!
//! This crate sends webhook requests to remote automation servers and routes
//! each response to the handler that asked for it, even when the response
//! arrives after the process has restarted.
//!
//! # Architecture
//!
//! Requests go through one of two transport sessions. The immediate session
//! performs a single POST and keeps nothing on disk. The durable session
//! journals every transfer together with a correlation record, retries
//! transport failures with exponential backoff, and is resumed from the
//! journal on the next launch.
//!
//! 1. **Encode** - the codec serializes the request, sealing it when the
//!    destination has a shared secret
//! 2. **Replace** - superseded outstanding transfers are cancelled
//! 3. **Transfer** - a spawned task posts the body and streams the response
//! 4. **Dispatch** - the coordinator decodes the response and invokes the
//!    registered handler
//!
//! # Key Features
//!
//! - **Sealed envelopes** - XChaCha20-Poly1305 with per-message nonces
//! - **Replacement policy** - handlers decide whether a newer request
//!   cancels an older one
//! - **Local retry queue** - durable transfers survive restarts
//! - **Single-task bookkeeping** - all maps live in one actor
//!
//! # Example
//!
//! ```no_run
//! use ferry_core::{Destination, HandlerId, Request};
//! use ferry_delivery::{CoordinatorConfig, DeliveryCoordinator, DeliveryError};
//! use serde_json::json;
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let coordinator = DeliveryCoordinator::builder(CoordinatorConfig::default()).build()?;
//! let home = Destination::new("home", "https://home.example.com", "api/webhook/abc123");
//!
//! coordinator
//!     .send(HandlerId::LOCATION_UPDATE, &home, Request::new("update_location", json!({"gps": [1, 2]})))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod coordinator;
pub mod correlation;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod retry;
pub mod session;
pub mod storage;
mod transfer;

pub use client::{ClientConfig, DeliveryClient};
pub use codec::{EncodedBody, EncodingTarget, ResponseBody, SecretKey};
pub use coordinator::{
    CoordinatorConfig, DeliveryCoordinator, DeliveryCoordinatorBuilder, DurableEligibility,
    TransferSnapshot,
};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use handler::{
    HandlerFactory, HandlerRegistry, HandlerRegistryBuilder, LocationUpdateResponse,
    ResponseHandler, ServiceCallResponse, UnhandledResponse,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use session::{SessionConfig, SessionKind};
pub use storage::{SqliteTransferJournal, TransferJournal};

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Default resource timeout of durable transfers in seconds.
pub const DEFAULT_RESOURCE_TIMEOUT_SECONDS: u64 = 7200;

/// Default time allowed for in-flight handlers on shutdown, in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;
