//! Ferry webhook delivery service.
//!
//! Wires the delivery engine to a SQLite journal and layered configuration.

pub mod app;
pub mod config;

pub use app::App;
pub use config::{Config, DestinationConfig};
