//! Window boundaries anchored at the Unix epoch.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SlidecountError};

/// Common window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

impl From<TimeWindow> for Duration {
    fn from(window: TimeWindow) -> Self {
        window.duration()
    }
}

impl FromStr for TimeWindow {
    type Err = SlidecountError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "second" => Ok(TimeWindow::Second),
            "minute" => Ok(TimeWindow::Minute),
            "hour" => Ok(TimeWindow::Hour),
            "day" => Ok(TimeWindow::Day),
            other => Err(SlidecountError::Config(format!(
                "unknown time window '{}', expected second, minute, hour or day",
                other
            ))),
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeWindow::Second => "second",
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        };
        f.write_str(name)
    }
}

/// Window length in nanoseconds, rejecting zero and lengths that overflow `i64`.
pub(crate) fn length_nanos(window_length: Duration) -> Result<i64> {
    let nanos = i64::try_from(window_length.as_nanos()).map_err(|_| {
        SlidecountError::Config(format!("window length {:?} is too large", window_length))
    })?;
    if nanos <= 0 {
        return Err(SlidecountError::Config(
            "window length must be positive".to_string(),
        ));
    }
    Ok(nanos)
}

fn timestamp_nanos(ts: DateTime<Utc>) -> Result<i64> {
    ts.timestamp_nanos_opt().ok_or_else(|| {
        SlidecountError::Config(format!("timestamp {} is out of range", ts))
    })
}

/// Truncate `now` down to the start of the window containing it.
pub fn window_start(now: DateTime<Utc>, window_length: Duration) -> Result<DateTime<Utc>> {
    let length = length_nanos(window_length)?;
    let nanos = timestamp_nanos(now)?;
    Ok(Utc.timestamp_nanos(nanos - nanos.rem_euclid(length)))
}

/// Whether `ts` falls exactly on a window boundary.
pub fn is_aligned(ts: DateTime<Utc>, window_length: Duration) -> bool {
    match (length_nanos(window_length), ts.timestamp_nanos_opt()) {
        (Ok(length), Some(nanos)) => nanos.rem_euclid(length) == 0,
        _ => false,
    }
}

/// The current window start and the one immediately before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPair {
    /// Start of the window containing the observed instant
    pub current: DateTime<Utc>,
    /// Start of the window before `current`
    pub previous: DateTime<Utc>,
}

fn shift(ts: DateTime<Utc>, delta: chrono::Duration) -> Result<DateTime<Utc>> {
    ts.checked_add_signed(delta).ok_or_else(|| {
        SlidecountError::Config(format!("timestamp {} shifted by {} is out of range", ts, delta))
    })
}

impl WindowPair {
    /// Compute the window pair containing `now`.
    pub fn at(now: DateTime<Utc>, window_length: Duration) -> Result<Self> {
        let current = window_start(now, window_length)?;
        let length = length_nanos(window_length)?;
        Ok(Self {
            current,
            previous: shift(current, -chrono::Duration::nanoseconds(length))?,
        })
    }

    /// The window pair for the current wall-clock time.
    pub fn now(window_length: Duration) -> Result<Self> {
        Self::at(Utc::now(), window_length)
    }

    /// Move both windows forward by `windows` window lengths.
    ///
    /// Windows only move forward; a negative count is rejected.
    pub fn advance(&self, windows: i32, window_length: Duration) -> Result<Self> {
        if windows < 0 {
            return Err(SlidecountError::Config(format!(
                "cannot advance by a negative number of windows ({})",
                windows
            )));
        }
        let step = chrono::Duration::nanoseconds(length_nanos(window_length)?)
            .checked_mul(windows)
            .ok_or_else(|| {
                SlidecountError::Config(format!(
                    "advancing {} windows of {:?} overflows",
                    windows, window_length
                ))
            })?;
        Ok(Self {
            current: shift(self.current, step)?,
            previous: shift(self.previous, step)?,
        })
    }

    /// When the current window ends.
    pub fn reset_at(&self, window_length: Duration) -> Result<DateTime<Utc>> {
        shift(self.current, chrono::Duration::nanoseconds(length_nanos(window_length)?))
    }

    /// Fraction of the current window that has elapsed at `now`, clamped to `[0, 1]`.
    pub fn elapsed_fraction(&self, now: DateTime<Utc>, window_length: Duration) -> f64 {
        let elapsed = (now - self.current)
            .to_std()
            .unwrap_or(Duration::ZERO);
        (elapsed.as_secs_f64() / window_length.as_secs_f64()).clamp(0.0, 1.0)
    }
}
