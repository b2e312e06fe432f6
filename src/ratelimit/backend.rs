//! Counter trait for abstracting local and shared-store implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;

/// Trait for windowed counter implementations.
///
/// This trait abstracts over the in-process `LocalCounter` and any counter
/// backed by a shared store, so the limiter works with either. Window
/// arguments are always wall-clock time truncated to the window length, and
/// `previous` is exactly one window before `current`.
///
/// A shared-store implementation must keep the same two-generation semantics
/// per key and report an unreachable store as
/// [`SlidecountError::BackendUnavailable`](crate::error::SlidecountError::BackendUnavailable)
/// rather than returning zero counts.
#[async_trait]
pub trait LimitCounter: Send + Sync {
    /// Called once by the limiter with its request limit and window length.
    fn configure(&self, request_limit: u64, window_length: Duration) -> Result<()>;

    /// Add `amount` to the count of `key` in `window`.
    async fn increment_by(&self, key: &str, window: DateTime<Utc>, amount: u64) -> Result<()>;

    /// Return `(current, previous)` counts for `key`.
    async fn get(
        &self,
        key: &str,
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> Result<(u64, u64)>;
}
