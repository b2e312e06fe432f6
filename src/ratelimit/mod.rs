//! Windowed request counting and rate limit decisions.

mod backend;
mod counter;
mod fingerprint;
mod key;
mod limiter;
mod window;

pub use backend::LimitCounter;
pub use counter::LocalCounter;
pub use fingerprint::{ExactKey, HashedKey, KeyFingerprint};
pub use key::{ip_key, LimitKey};
pub use limiter::{Code, FailurePolicy, LimitConfig, RateLimitStatus, RateLimiter};
pub use window::{is_aligned, window_start, TimeWindow, WindowPair};
