//! Periodic eviction of idle buckets from the local store.
//!
//! The shared store expires keys itself; the local store keeps every key it has
//! ever seen until something removes it. The sweeper drops buckets whose last
//! refill is older than both `max_idle` and the TTL the bucket was written
//! with. The limiter never writes a TTL shorter than the policy's time to
//! refill completely, so an evicted bucket was already full.

use crate::clock::Clock;
use crate::rate_limit::StateStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default pause between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Default idle time after which a bucket is evicted.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(3600);

/// Evicts stale buckets on an interval.
#[derive(Debug)]
pub struct MaintenanceSweeper<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    max_idle: Duration,
    last_run: AtomicU64,
}

impl<S> MaintenanceSweeper<S>
where
    S: StateStore + 'static,
{
    /// Create a sweeper; the first sweep is due one `interval` from now.
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, interval: Duration, max_idle: Duration) -> Self {
        let now = clock.now_secs();
        Self { store, clock, interval, max_idle, last_run: AtomicU64::new(now.to_bits()) }
    }

    /// Pause between sweeps.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Idle time after which a bucket is evicted.
    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }

    /// Sweep immediately. Returns the number of evicted buckets.
    pub fn sweep_now(&self) -> usize {
        let now = self.clock.now_secs();
        self.last_run.store(now.to_bits(), Ordering::SeqCst);
        self.sweep_at(now)
    }

    fn sweep_at(&self, now: f64) -> usize {
        let evicted = self.store.evict_idle(now, self.max_idle);
        tracing::debug!(evicted, remaining = ?self.store.tracked_keys(), "maintenance sweep");
        evicted
    }

    /// Sweep if at least one interval has passed since the last sweep.
    ///
    /// Safe to call on every request: when nothing is due this is one atomic
    /// load, and concurrent callers race on a compare-exchange so only one of
    /// them sweeps.
    pub fn maybe_sweep(&self) -> Option<usize> {
        let now = self.clock.now_secs();
        let last_bits = self.last_run.load(Ordering::Acquire);
        let last = f64::from_bits(last_bits);
        // A clock that went backwards also counts as due, so a skewed
        // timestamp cannot postpone sweeping forever.
        if now - last < self.interval.as_secs_f64() && now >= last {
            return None;
        }
        self.last_run
            .compare_exchange(last_bits, now.to_bits(), Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(self.sweep_at(now))
    }

    /// Run sweeps on a tokio interval until the returned handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_now();
            }
        })
    }
}
