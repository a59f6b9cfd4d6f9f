#![allow(clippy::uninlined_format_args)]

//! Logging for skein services
//!
//! Sets up a global `tracing` subscriber from a [`LogConfig`]: level
//! (overridable through `RUST_LOG`), output format and destination.

pub mod logging;

pub use logging::*;

use thiserror::Error;

/// Telemetry error types
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Subscriber could not be installed
    #[error("Initialization error: {0}")]
    Init(String),

    /// Invalid logging setting
    #[error("Logging error: {0}")]
    Logging(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
