//! Clock abstractions used by the limiter and the maintenance sweeper.
//!
//! Bucket timestamps are fractional seconds. Buckets kept in a shared store are
//! read by several processes, so the default clock is wall-clock based; tests
//! drive time explicitly through [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in seconds.
    fn now_secs(&self) -> f64;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_secs(&self) -> f64 {
        (**self).now_secs()
    }
}

/// Wall clock: seconds since the Unix epoch.
///
/// Comparable across processes and hosts (modulo NTP skew), which is what the
/// shared store needs. Backward jumps are tolerated by the bucket arithmetic.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Notes: resets when the process restarts, so only use it with the local store.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock starting at `secs`.
    pub fn new(secs: f64) -> Self {
        Self { bits: Arc::new(AtomicU64::new(secs.to_bits())) }
    }

    /// Jump to an absolute time. Going backwards is allowed.
    pub fn set(&self, secs: f64) {
        self.bits.store(secs.to_bits(), Ordering::SeqCst);
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.advance_secs(by.as_secs_f64());
    }

    /// Move time forward by fractional seconds.
    pub fn advance_secs(&self, secs: f64) {
        let mut current = self.bits.load(Ordering::SeqCst);
        loop {
            let next = (f64::from_bits(current) + secs).to_bits();
            match self.bits.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
