//! Configuration management for Slidecount.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::{Result, SlidecountError};
use crate::ratelimit::{
    window_start, ExactKey, FailurePolicy, HashedKey, LimitConfig, LimitCounter, LocalCounter,
};

/// Prefix of environment variables overriding file settings,
/// e.g. `SLIDECOUNT__LIMITER__REQUEST_LIMIT=50`.
const ENV_PREFIX: &str = "SLIDECOUNT";

/// Main configuration for Slidecount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidecountConfig {
    /// Counter configuration
    #[serde(default)]
    pub counter: CounterConfig,

    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// How counters fingerprint keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintKind {
    /// 64-bit hash; distinct keys may collide
    #[default]
    Hashed,
    /// The key itself
    Exact,
}

/// Counter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Window length in milliseconds
    #[serde(default = "default_window_length_ms")]
    pub window_length_ms: u64,

    /// Key fingerprint strategy
    #[serde(default)]
    pub fingerprint: FingerprintKind,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            window_length_ms: default_window_length_ms(),
            fingerprint: FingerprintKind::default(),
        }
    }
}

fn default_window_length_ms() -> u64 {
    1000
}

impl CounterConfig {
    /// The window length as a `Duration`.
    pub fn window_length(&self) -> Duration {
        Duration::from_millis(self.window_length_ms)
    }

    /// Build an in-process counter anchored at the window containing `now`.
    pub fn build_local(&self, now: DateTime<Utc>) -> Result<Arc<dyn LimitCounter>> {
        let window_length = self.window_length();
        let anchor = window_start(now, window_length)?;
        let counter: Arc<dyn LimitCounter> = match self.fingerprint {
            FingerprintKind::Hashed => Arc::new(LocalCounter::with_fingerprint(
                window_length,
                anchor,
                HashedKey::new(),
            )?),
            FingerprintKind::Exact => Arc::new(LocalCounter::with_fingerprint(
                window_length,
                anchor,
                ExactKey,
            )?),
        };
        Ok(counter)
    }
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests allowed per window
    #[serde(default = "default_request_limit")]
    pub request_limit: u64,

    /// Decision taken when the counter fails
    #[serde(default)]
    pub on_counter_error: FailurePolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            request_limit: default_request_limit(),
            on_counter_error: FailurePolicy::default(),
        }
    }
}

fn default_request_limit() -> u64 {
    100
}

impl SlidecountConfig {
    /// Load configuration from a YAML file, with environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: SlidecountConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SlidecountConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SlidecountError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no counter or limiter can work with.
    pub fn validate(&self) -> Result<()> {
        if self.counter.window_length_ms == 0 {
            return Err(SlidecountError::Config(
                "counter.window_length_ms must be positive".to_string(),
            ));
        }
        if self.limiter.request_limit == 0 {
            return Err(SlidecountError::Config(
                "limiter.request_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The limit configuration for a `RateLimiter`.
    pub fn limit_config(&self) -> LimitConfig {
        LimitConfig {
            request_limit: self.limiter.request_limit,
            window_length: self.counter.window_length(),
            on_counter_error: self.limiter.on_counter_error,
        }
    }
}
