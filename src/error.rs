//! Error types for Slidecount.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Main error type for Slidecount operations.
#[derive(Error, Debug)]
pub enum SlidecountError {
    /// The caller asked about a window older than the one being tracked.
    #[error("Stale window: requested {requested}, latest tracked window is {latest}")]
    StaleWindow {
        requested: DateTime<Utc>,
        latest: DateTime<Utc>,
    },

    /// The window start is not aligned to the window length, or the
    /// previous window is not exactly one window before the current one.
    #[error("Misaligned window {requested} for window length {window_length:?}")]
    MisalignedWindow {
        requested: DateTime<Utc>,
        window_length: Duration,
    },

    /// A shared counter store could not be reached.
    #[error("Counter backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for SlidecountError {
    fn from(err: config::ConfigError) -> Self {
        SlidecountError::Config(err.to_string())
    }
}

/// Result type alias for Slidecount operations.
pub type Result<T> = std::result::Result<T, SlidecountError>;
