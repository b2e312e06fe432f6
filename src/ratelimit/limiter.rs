//! Sliding window admission decisions on top of a windowed counter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::LimitCounter;
use super::window::{length_nanos, WindowPair};
use crate::error::{Result, SlidecountError};

/// What to do with a request when the counter fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through.
    #[default]
    Allow,
    /// Treat the request as over the limit.
    Reject,
}

/// Configuration for a rate limit.
#[derive(Debug, Clone)]
pub struct LimitConfig {
    /// Maximum requests allowed per window
    pub request_limit: u64,
    /// Length of a window
    pub window_length: Duration,
    /// Decision taken when the counter returns an error
    pub on_counter_error: FailurePolicy,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// The request is within the limit and was counted
    Ok,
    /// The request exceeds the limit and was not counted
    OverLimit,
}

/// Status returned for a checked key.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    /// Decision for the request
    pub code: Code,
    /// The configured request limit
    pub limit: u64,
    /// Requests still allowed in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// Time left until `reset_at`
    pub duration_until_reset: Duration,
}

impl RateLimitStatus {
    /// Whether the request was let through.
    pub fn is_allowed(&self) -> bool {
        self.code == Code::Ok
    }

    /// Seconds a rejected client should wait, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.duration_until_reset.as_secs();
        if self.duration_until_reset.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Sliding window rate limiter.
///
/// The rate of a key is estimated from two fixed windows as
/// `current + previous * (1 - elapsed fraction of the current window)`.
/// The read and the increment of a check are two counter calls, so
/// concurrent checks on one key may admit slightly more than the limit.
pub struct RateLimiter<C: LimitCounter + ?Sized> {
    counter: Arc<C>,
    config: LimitConfig,
}

impl<C: LimitCounter + ?Sized> RateLimiter<C> {
    /// Create a rate limiter and configure `counter` with its limit and window.
    pub fn new(config: LimitConfig, counter: Arc<C>) -> Result<Self> {
        if config.request_limit == 0 {
            return Err(SlidecountError::Config(
                "request limit must be positive".to_string(),
            ));
        }
        length_nanos(config.window_length)?;
        counter.configure(config.request_limit, config.window_length)?;

        debug!(
            limit = config.request_limit,
            window_length = ?config.window_length,
            on_counter_error = ?config.on_counter_error,
            "Rate limiter initialized"
        );
        Ok(Self { counter, config })
    }

    /// Get the limit configuration.
    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    /// Get the underlying counter.
    pub fn counter(&self) -> &Arc<C> {
        &self.counter
    }

    /// Estimate the rate of `key` at `now` without counting a request.
    ///
    /// Returns whether the estimate is above the limit, and the estimate.
    pub async fn status(&self, key: &str, now: DateTime<Utc>) -> Result<(bool, f64)> {
        let pair = WindowPair::at(now, self.config.window_length)?;
        let rate = self.estimate(key, &pair, now).await?;
        Ok((rate > self.config.request_limit as f64, rate))
    }

    /// Check `hits` requests for `key` at `now`, counting them if allowed.
    ///
    /// A `hits` of zero is counted as one request.
    pub async fn check(&self, key: &str, hits: u64, now: DateTime<Utc>) -> Result<RateLimitStatus> {
        let hits = hits.max(1);
        let limit = self.config.request_limit;
        let pair = WindowPair::at(now, self.config.window_length)?;
        let reset_at = pair.reset_at(self.config.window_length)?;
        let duration_until_reset = (reset_at - now).to_std().unwrap_or(Duration::ZERO);

        let rate = self.estimate(key, &pair, now).await?.round() as u64;

        trace!(key = key, rate = rate, hits = hits, limit = limit, "Checking rate limit");

        if rate.saturating_add(hits) > limit {
            debug!(key = key, rate = rate, limit = limit, "Rate limit exceeded");
            return Ok(RateLimitStatus {
                code: Code::OverLimit,
                limit,
                remaining: limit.saturating_sub(rate),
                reset_at,
                duration_until_reset,
            });
        }

        self.counter.increment_by(key, pair.current, hits).await?;

        Ok(RateLimitStatus {
            code: Code::Ok,
            limit,
            remaining: limit - rate - hits,
            reset_at,
            duration_until_reset,
        })
    }

    /// Like [`check`](Self::check), but never fails: counter errors are
    /// resolved with the configured [`FailurePolicy`].
    pub async fn decide(&self, key: &str, hits: u64, now: DateTime<Utc>) -> RateLimitStatus {
        match self.check(key, hits, now).await {
            Ok(status) => status,
            Err(e) => {
                let code = match self.config.on_counter_error {
                    FailurePolicy::Allow => Code::Ok,
                    FailurePolicy::Reject => Code::OverLimit,
                };
                warn!(
                    key = key,
                    error = %e,
                    policy = ?self.config.on_counter_error,
                    "Counter failed, applying failure policy"
                );

                let window = self.config.window_length;
                let reset_at = WindowPair::at(now, window)
                    .and_then(|pair| pair.reset_at(window))
                    .unwrap_or(now);
                RateLimitStatus {
                    code,
                    limit: self.config.request_limit,
                    remaining: 0,
                    reset_at,
                    duration_until_reset: (reset_at - now).to_std().unwrap_or(Duration::ZERO),
                }
            }
        }
    }

    async fn estimate(&self, key: &str, pair: &WindowPair, now: DateTime<Utc>) -> Result<f64> {
        let (current, previous) = self.counter.get(key, pair.current, pair.previous).await?;
        let weight = 1.0 - pair.elapsed_fraction(now, self.config.window_length);
        Ok(previous as f64 * weight + current as f64)
    }
}
