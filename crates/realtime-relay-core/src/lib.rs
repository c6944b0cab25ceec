//! Realtime Relay Core Library
//!
//! Shared functionality for relay components:
//! - Relay configuration model and validation
//! - Tracing subscriber initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::RelayConfig;
pub use error::{Error, Result};
