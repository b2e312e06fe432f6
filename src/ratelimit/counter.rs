//! In-process windowed counter.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::backend::LimitCounter;
use super::fingerprint::{HashedKey, KeyFingerprint};
use super::window::{is_aligned, length_nanos, window_start};
use crate::error::{Result, SlidecountError};

/// Counts for the latest window and the one before it.
///
/// `latest_window` is shared by every key: rotating it moves all keys at once.
struct Generations<K> {
    latest_window: DateTime<Utc>,
    latest: HashMap<K, u64>,
    previous: HashMap<K, u64>,
}

impl<K: Eq + Hash> Generations<K> {
    fn new(anchor: DateTime<Utc>) -> Self {
        Self {
            latest_window: anchor,
            latest: HashMap::new(),
            previous: HashMap::new(),
        }
    }

    /// Bring the generations up to `requested`, rotating at most once.
    fn advance_to(&mut self, requested: DateTime<Utc>, step: chrono::Duration) -> Result<()> {
        if requested == self.latest_window {
            return Ok(());
        }

        if requested < self.latest_window {
            return Err(SlidecountError::StaleWindow {
                requested,
                latest: self.latest_window,
            });
        }

        if self.latest_window.checked_add_signed(step) == Some(requested) {
            debug!(
                from = %self.latest_window,
                to = %requested,
                keys = self.latest.len(),
                "Rotating counter window"
            );
            self.previous = std::mem::take(&mut self.latest);
        } else {
            debug!(
                from = %self.latest_window,
                to = %requested,
                "Window gap exceeds one window, discarding all counts"
            );
            self.latest = HashMap::new();
            self.previous = HashMap::new();
        }
        self.latest_window = requested;
        Ok(())
    }
}

/// A two-generation sliding window counter kept in process memory.
///
/// Every operation first advances the shared window anchor and then touches
/// the counts, all under one lock, so a rotation is applied exactly once per
/// boundary and no caller observes a half-rotated state. Fingerprints are
/// computed before the lock is taken.
pub struct LocalCounter<F: KeyFingerprint = HashedKey> {
    /// Length of every window
    window_length: Duration,
    /// `window_length` as a chrono duration, for boundary arithmetic
    step: chrono::Duration,
    /// Key hashing strategy
    fingerprint: F,
    /// Shared anchor and counts
    generations: Mutex<Generations<F::Fingerprint>>,
}

impl LocalCounter<HashedKey> {
    /// Create a counter anchored at `anchor`, which must be a window boundary.
    pub fn new(window_length: Duration, anchor: DateTime<Utc>) -> Result<Self> {
        Self::with_fingerprint(window_length, anchor, HashedKey::new())
    }

    /// Create a counter anchored at the window containing the current time.
    pub fn starting_now(window_length: Duration) -> Result<Self> {
        let anchor = window_start(Utc::now(), window_length)?;
        Self::new(window_length, anchor)
    }
}

impl<F: KeyFingerprint> LocalCounter<F> {
    /// Create a counter with a specific fingerprint strategy.
    pub fn with_fingerprint(
        window_length: Duration,
        anchor: DateTime<Utc>,
        fingerprint: F,
    ) -> Result<Self> {
        let step = chrono::Duration::nanoseconds(length_nanos(window_length)?);
        if !is_aligned(anchor, window_length) {
            return Err(SlidecountError::MisalignedWindow {
                requested: anchor,
                window_length,
            });
        }

        debug!(
            window_length = ?window_length,
            anchor = %anchor,
            "Creating local window counter"
        );

        Ok(Self {
            window_length,
            step,
            fingerprint,
            generations: Mutex::new(Generations::new(anchor)),
        })
    }

    /// Add `amount` to the count of `key` in the window starting at `window`.
    pub fn increment_by(&self, key: &str, window: DateTime<Utc>, amount: u64) -> Result<()> {
        self.check_aligned(window)?;
        let fingerprint = self.fingerprint.fingerprint(key);

        {
            let mut generations = self.generations.lock();
            self.advance(&mut generations, window)?;
            let count = generations.latest.entry(fingerprint).or_insert(0);
            *count = count.saturating_add(amount);
        }

        trace!(key = key, window = %window, amount = amount, "Incremented counter");
        Ok(())
    }

    /// Read the counts of `key` for the `current` window and the `previous` one.
    ///
    /// Reading can rotate the windows if `current` is newer than anything seen so far.
    pub fn get(
        &self,
        key: &str,
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        self.check_aligned(current)?;
        if current - previous != self.step {
            warn!(
                current = %current,
                previous = %previous,
                "Previous window is not one window before the current one"
            );
            return Err(SlidecountError::MisalignedWindow {
                requested: previous,
                window_length: self.window_length,
            });
        }
        let fingerprint = self.fingerprint.fingerprint(key);

        let counts = {
            let mut generations = self.generations.lock();
            self.advance(&mut generations, current)?;
            (
                generations.latest.get(&fingerprint).copied().unwrap_or(0),
                generations.previous.get(&fingerprint).copied().unwrap_or(0),
            )
        };

        trace!(
            key = key,
            window = %current,
            current = counts.0,
            previous = counts.1,
            "Read counter"
        );
        Ok(counts)
    }

    /// Get the window length of this counter.
    pub fn window_length(&self) -> Duration {
        self.window_length
    }

    /// Start of the most recently observed window.
    pub fn latest_window(&self) -> DateTime<Utc> {
        self.generations.lock().latest_window
    }

    /// Number of distinct fingerprints in the latest and previous windows.
    pub fn tracked_keys(&self) -> (usize, usize) {
        let generations = self.generations.lock();
        (generations.latest.len(), generations.previous.len())
    }

    fn check_aligned(&self, window: DateTime<Utc>) -> Result<()> {
        if is_aligned(window, self.window_length) {
            return Ok(());
        }
        warn!(window = %window, window_length = ?self.window_length, "Rejecting misaligned window");
        Err(SlidecountError::MisalignedWindow {
            requested: window,
            window_length: self.window_length,
        })
    }

    fn advance(
        &self,
        generations: &mut Generations<F::Fingerprint>,
        window: DateTime<Utc>,
    ) -> Result<()> {
        generations.advance_to(window, self.step).map_err(|e| {
            warn!(error = %e, "Rejecting stale window");
            e
        })
    }
}

#[async_trait]
impl<F: KeyFingerprint> LimitCounter for LocalCounter<F> {
    fn configure(&self, request_limit: u64, window_length: Duration) -> Result<()> {
        if window_length != self.window_length {
            return Err(SlidecountError::Config(format!(
                "counter window length is {:?}, limiter asked for {:?}",
                self.window_length, window_length
            )));
        }
        debug!(request_limit = request_limit, window_length = ?window_length, "Counter configured");
        Ok(())
    }

    async fn increment_by(&self, key: &str, window: DateTime<Utc>, amount: u64) -> Result<()> {
        LocalCounter::increment_by(self, key, window, amount)
    }

    async fn get(
        &self,
        key: &str,
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        LocalCounter::get(self, key, current, previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::fingerprint::ExactKey;
    use crate::ratelimit::window::WindowPair;
    use chrono::TimeZone;
    use rand::Rng;
    use std::sync::Arc;
    use std::thread;

    const KEYS: usize = 1000;
    const WORKERS: usize = 8;

    fn anchor() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn second_counter() -> (LocalCounter, WindowPair) {
        let length = Duration::from_secs(1);
        let counter = LocalCounter::new(length, anchor()).unwrap();
        let pair = WindowPair::at(anchor(), length).unwrap();
        (counter, pair)
    }

    fn key(i: usize) -> String {
        format!("key:{}", i)
    }

    /// Run `f` for every key index, spread over several threads.
    fn for_all_keys<F>(f: F)
    where
        F: Fn(usize) + Sync,
    {
        thread::scope(|scope| {
            for worker in 0..WORKERS {
                let f = &f;
                scope.spawn(move || {
                    for i in (worker..KEYS).step_by(WORKERS) {
                        f(i);
                    }
                });
            }
        });
    }

    #[test]
    fn test_counter_starts_empty() {
        let (counter, pair) = second_counter();
        assert_eq!(counter.get("k", pair.current, pair.previous).unwrap(), (0, 0));
        assert_eq!(counter.tracked_keys(), (0, 0));
    }

    #[test]
    fn test_counter_rejects_bad_construction() {
        assert!(LocalCounter::new(Duration::ZERO, anchor()).is_err());

        let misaligned = anchor() + chrono::Duration::milliseconds(250);
        let err = LocalCounter::new(Duration::from_secs(1), misaligned).err().unwrap();
        assert!(matches!(err, SlidecountError::MisalignedWindow { .. }));
    }

    #[test]
    fn test_starting_now_is_aligned() {
        let counter = LocalCounter::starting_now(Duration::from_secs(60)).unwrap();
        assert!(is_aligned(counter.latest_window(), Duration::from_secs(60)));
    }

    #[test]
    fn test_increment_accumulates() {
        let (counter, pair) = second_counter();
        counter.increment_by("k", pair.current, 1).unwrap();
        counter.increment_by("k", pair.current, 99).unwrap();
        assert_eq!(counter.get("k", pair.current, pair.previous).unwrap(), (100, 0));
        assert_eq!(counter.get("other", pair.current, pair.previous).unwrap(), (0, 0));
    }

    #[test]
    fn test_rotation_single_step() {
        let (counter, pair) = second_counter();
        counter.increment_by("k", pair.current, 7).unwrap();

        let next = pair.advance(1, counter.window_length()).unwrap();
        assert_eq!(counter.get("k", next.current, next.previous).unwrap(), (0, 7));
        assert_eq!(counter.latest_window(), next.current);
        assert_eq!(counter.tracked_keys(), (0, 1));
    }

    #[test]
    fn test_rotation_gap_discards_history() {
        let (counter, pair) = second_counter();
        counter.increment_by("k", pair.current, 7).unwrap();

        let later = pair.advance(2, counter.window_length()).unwrap();
        assert_eq!(counter.get("k", later.current, later.previous).unwrap(), (0, 0));
        assert_eq!(counter.latest_window(), later.current);
        assert_eq!(counter.tracked_keys(), (0, 0));
    }

    #[test]
    fn test_same_window_is_noop() {
        let (counter, pair) = second_counter();
        counter.increment_by("k", pair.current, 3).unwrap();
        for _ in 0..5 {
            assert_eq!(counter.get("k", pair.current, pair.previous).unwrap(), (3, 0));
        }
        counter.increment_by("k", pair.current, 2).unwrap();
        assert_eq!(counter.get("k", pair.current, pair.previous).unwrap(), (5, 0));
        assert_eq!(counter.latest_window(), pair.current);
    }

    #[test]
    fn test_stale_window_rejected_without_change() {
        let (counter, pair) = second_counter();
        let next = pair.advance(1, counter.window_length()).unwrap();
        counter.increment_by("k", pair.current, 4).unwrap();
        counter.increment_by("k", next.current, 6).unwrap();

        let err = counter.increment_by("k", pair.current, 1).unwrap_err();
        assert!(matches!(err, SlidecountError::StaleWindow { .. }));
        let err = counter.get("k", pair.current, pair.previous).unwrap_err();
        assert!(matches!(err, SlidecountError::StaleWindow { .. }));

        assert_eq!(counter.latest_window(), next.current);
        assert_eq!(counter.get("k", next.current, next.previous).unwrap(), (6, 4));
    }

    #[test]
    fn test_misaligned_windows_rejected() {
        let (counter, pair) = second_counter();
        counter.increment_by("k", pair.current, 1).unwrap();

        let half = pair.current + chrono::Duration::milliseconds(500);
        assert!(matches!(
            counter.increment_by("k", half, 1).unwrap_err(),
            SlidecountError::MisalignedWindow { .. }
        ));
        assert!(matches!(
            counter.get("k", pair.current, pair.current).unwrap_err(),
            SlidecountError::MisalignedWindow { .. }
        ));
        assert_eq!(counter.get("k", pair.current, pair.previous).unwrap(), (1, 0));
    }

    #[test]
    fn test_exact_key_counter() {
        let counter =
            LocalCounter::with_fingerprint(Duration::from_secs(1), anchor(), ExactKey).unwrap();
        let pair = WindowPair::at(anchor(), Duration::from_secs(1)).unwrap();
        counter.increment_by("alice", pair.current, 2).unwrap();
        counter.increment_by("bob", pair.current, 5).unwrap();
        assert_eq!(counter.get("alice", pair.current, pair.previous).unwrap(), (2, 0));
        assert_eq!(counter.get("bob", pair.current, pair.previous).unwrap(), (5, 0));
    }

    #[test]
    fn test_concurrent_scenario() {
        struct Step {
            name: &'static str,
            advance: i32,
            incr_by: u64,
            curr: u64,
            prev: u64,
        }

        let steps = [
            Step { name: "t=0s: init", advance: 0, incr_by: 0, curr: 0, prev: 0 },
            Step { name: "t=0s: increment 1", advance: 0, incr_by: 1, curr: 1, prev: 0 },
            Step { name: "t=0s: increment by 99", advance: 0, incr_by: 99, curr: 100, prev: 0 },
            Step { name: "t=1s: move clock by 1s", advance: 1, incr_by: 0, curr: 0, prev: 100 },
            Step { name: "t=1s: increment by 20", advance: 0, incr_by: 20, curr: 20, prev: 100 },
            Step { name: "t=1s: increment by 20", advance: 0, incr_by: 20, curr: 40, prev: 100 },
            Step { name: "t=2s: move clock by 1s", advance: 1, incr_by: 0, curr: 0, prev: 40 },
            Step { name: "t=2s: incr++", advance: 0, incr_by: 1, curr: 1, prev: 40 },
            Step { name: "t=2s: incr+=9", advance: 0, incr_by: 9, curr: 10, prev: 40 },
            Step { name: "t=2s: incr+=20", advance: 0, incr_by: 20, curr: 30, prev: 40 },
            Step { name: "t=4s: move clock by 2s", advance: 2, incr_by: 0, curr: 0, prev: 0 },
        ];

        let (counter, mut pair) = second_counter();
        // Each key scales every step by its own factor, so keys never share a count.
        let mut rng = rand::thread_rng();
        let factors: Vec<u64> = (0..KEYS).map(|_| rng.gen_range(1..50)).collect();

        for step in &steps {
            if step.advance > 0 {
                pair = pair.advance(step.advance, counter.window_length()).unwrap();
            }

            if step.incr_by > 0 {
                for_all_keys(|i| {
                    counter
                        .increment_by(&key(i), pair.current, step.incr_by * factors[i])
                        .unwrap();
                });
            }

            for_all_keys(|i| {
                let (curr, prev) = counter.get(&key(i), pair.current, pair.previous).unwrap();
                assert_eq!(curr, step.curr * factors[i], "{}: {} current", step.name, key(i));
                assert_eq!(prev, step.prev * factors[i], "{}: {} previous", step.name, key(i));
            });
        }
    }

    #[test]
    fn test_concurrent_random_amounts_with_readers() {
        let (counter, pair) = second_counter();
        let mut rng = rand::thread_rng();
        let amounts: Vec<u64> = (0..KEYS).map(|_| rng.gen_range(1..100)).collect();
        let half = KEYS / 2;

        // Upper half is populated first and must stay stable while the lower half changes.
        for i in half..KEYS {
            counter.increment_by(&key(i), pair.current, amounts[i]).unwrap();
        }

        thread::scope(|scope| {
            for worker in 0..WORKERS {
                let counter = &counter;
                let amounts = &amounts;
                scope.spawn(move || {
                    for i in (worker..half).step_by(WORKERS) {
                        for _ in 0..3 {
                            counter.increment_by(&key(i), pair.current, amounts[i]).unwrap();
                        }
                    }
                });
                scope.spawn(move || {
                    for i in (half + worker..KEYS).step_by(WORKERS) {
                        let counts = counter.get(&key(i), pair.current, pair.previous).unwrap();
                        assert_eq!(counts, (amounts[i], 0), "{}", key(i));
                    }
                });
            }
        });

        for i in 0..half {
            let counts = counter.get(&key(i), pair.current, pair.previous).unwrap();
            assert_eq!(counts, (amounts[i] * 3, 0), "{}", key(i));
        }
    }

    #[test]
    fn test_concurrent_rotation_happens_once() {
        let (counter, pair) = second_counter();
        let counter = Arc::new(counter);
        for i in 0..KEYS {
            counter.increment_by(&key(i), pair.current, 5).unwrap();
        }

        let next = pair.advance(1, counter.window_length()).unwrap();
        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for i in (worker..KEYS).step_by(WORKERS) {
                        counter.increment_by(&key(i), next.current, 1).unwrap();
                        let (_, prev) = counter.get(&key(i), next.current, next.previous).unwrap();
                        assert_eq!(prev, 5);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.latest_window(), next.current);
        assert_eq!(counter.tracked_keys(), (KEYS, KEYS));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_through_trait() {
        let (counter, pair) = second_counter();
        let counter: Arc<dyn LimitCounter> = Arc::new(counter);

        let tasks: Vec<_> = (0..KEYS)
            .map(|i| {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    counter.increment_by("shared", pair.current, 2).await?;
                    counter.increment_by(&key(i), pair.current, 1).await
                })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            tokio_test::assert_ok!(result.unwrap());
        }

        let shared = counter.get("shared", pair.current, pair.previous).await;
        assert_eq!(tokio_test::assert_ok!(shared), (2 * KEYS as u64, 0));
        let single = counter.get(&key(17), pair.current, pair.previous).await;
        assert_eq!(tokio_test::assert_ok!(single), (1, 0));
    }

    #[tokio::test]
    async fn test_configure_checks_window_length() {
        let (counter, _) = second_counter();
        tokio_test::assert_ok!(counter.configure(100, Duration::from_secs(1)));
        tokio_test::assert_err!(counter.configure(100, Duration::from_secs(60)));
    }
}
