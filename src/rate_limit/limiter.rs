//! Token-bucket limiter over a pluggable [`StateStore`].
//!
//! The limiter holds no bucket state of its own. Per check it reads the clock,
//! hands the transition to the store, and turns the result into a
//! [`Decision`]. Store trouble of any kind (an error, a timeout, a backend
//! already known to be down) produces a fail-open decision instead of an error:
//! admission control must not take the protected service down with it.

use crate::bucket::Transition;
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, StoreError};
use crate::policy::{ChargeMode, Policy};
use crate::rate_limit::{BackendStatus, Decision, RateLimiter, StateStore};
use crate::sweeper::{MaintenanceSweeper, DEFAULT_MAX_IDLE, DEFAULT_SWEEP_INTERVAL};
use crate::telemetry::{emit_best_effort, AdmissionEvent, LogSink, TelemetrySink};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default deadline for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);
/// Default time-to-live written with every bucket. Policies that take longer
/// to refill completely get their refill time instead.
pub const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(3600);
/// Default pause before an unavailable backend is tried again.
pub const DEFAULT_RECHECK_AFTER: Duration = Duration::from_secs(5);

const STATUS_UNKNOWN: u8 = 0;
const STATUS_CONNECTED: u8 = 1;
const STATUS_UNAVAILABLE: u8 = 2;

impl BackendStatus {
    fn to_u8(self) -> u8 {
        match self {
            BackendStatus::Unknown => STATUS_UNKNOWN,
            BackendStatus::Connected => STATUS_CONNECTED,
            BackendStatus::Unavailable => STATUS_UNAVAILABLE,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATUS_CONNECTED => BackendStatus::Connected,
            STATUS_UNAVAILABLE => BackendStatus::Unavailable,
            _ => BackendStatus::Unknown,
        }
    }
}

/// What became of one window's check.
enum Outcome {
    Applied(Transition),
    FailedOpen,
}

/// Token-bucket limiter shared by every request-handling task.
pub struct Limiter<S, T = LogSink> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    sink: T,
    timeout: Duration,
    ttl: Duration,
    recheck_after: Duration,
    status: AtomicU8,
    unavailable_since: AtomicU64,
    sweeper: Option<MaintenanceSweeper<S>>,
}

impl<S, T> std::fmt::Debug for Limiter<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("timeout", &self.timeout)
            .field("ttl", &self.ttl)
            .field("recheck_after", &self.recheck_after)
            .field("status", &BackendStatus::from_u8(self.status.load(Ordering::Acquire)))
            .field("sweeper", &self.sweeper.is_some())
            .finish()
    }
}

impl<S> Limiter<S, LogSink>
where
    S: StateStore + 'static,
{
    /// Start building a limiter over `store`.
    pub fn builder(store: S) -> LimiterBuilder<S, LogSink> {
        LimiterBuilder::new(store)
    }
}

impl<S, T> Limiter<S, T>
where
    S: StateStore + 'static,
    T: TelemetrySink,
    T::Future: Send,
{
    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The attached sweeper, present for local stores unless disabled.
    pub fn sweeper(&self) -> Option<&MaintenanceSweeper<S>> {
        self.sweeper.as_ref()
    }

    /// Run the attached sweeper if it is due. Returns the eviction count.
    pub fn maybe_sweep(&self) -> Option<usize> {
        self.sweeper.as_ref().and_then(|s| s.maybe_sweep())
    }

    /// Backend status as last observed.
    pub fn status(&self) -> BackendStatus {
        BackendStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Ping the store and record the result. Call once at startup.
    pub async fn probe(&self) -> BackendStatus {
        match self.guarded(self.store.ping()).await {
            Ok(()) => self.mark_connected().await,
            Err(e) => {
                tracing::warn!(error = %e, "state store probe failed; admission will fail open");
                self.mark_unavailable().await;
            }
        }
        self.status()
    }

    /// Check one request (cost 1) against one policy.
    pub async fn check(&self, key: &str, policy: &Policy) -> Decision {
        self.check_with_cost(key, policy, 1).await
    }

    /// Check a weighted operation against one policy.
    pub async fn check_with_cost(&self, key: &str, policy: &Policy, cost: u32) -> Decision {
        let decision = match self.apply(key, policy, f64::from(cost)).await {
            Outcome::Applied(t) => decision_from(policy, &t),
            Outcome::FailedOpen => fail_open(policy),
        };
        self.record(key, &decision).await;
        decision
    }

    /// Evaluate every policy and fold the results; see [`ChargeMode`].
    pub async fn check_policies(&self, key: &str, policies: &[Policy], mode: ChargeMode) -> Decision {
        self.check_policies_with_cost(key, policies, mode, 1).await
    }

    /// Charge `cost` tokens against every policy and fold the results.
    pub async fn check_policies_with_cost(
        &self,
        key: &str,
        policies: &[Policy],
        mode: ChargeMode,
        cost: u32,
    ) -> Decision {
        if policies.is_empty() {
            return Decision::allowed(0, 0);
        }
        let cost = f64::from(cost);
        let decision = match mode {
            ChargeMode::All => self.charge_all(key, policies, cost).await,
            ChargeMode::OnAdmit => self.charge_on_admit(key, policies, cost).await,
        };
        self.record(key, &decision).await;
        decision
    }

    async fn charge_all(&self, key: &str, policies: &[Policy], cost: f64) -> Decision {
        let mut decisions = Vec::with_capacity(policies.len());
        for policy in policies {
            decisions.push(match self.apply(key, policy, cost).await {
                Outcome::Applied(t) => decision_from(policy, &t),
                Outcome::FailedOpen => fail_open(policy),
            });
        }
        Decision::combine(decisions).unwrap_or_else(|| Decision::allowed(0, 0))
    }

    async fn charge_on_admit(&self, key: &str, policies: &[Policy], cost: f64) -> Decision {
        // Zero-cost pass: advances every bucket to now without consuming, then
        // replays the charge locally to see who would deny.
        let mut previews = Vec::with_capacity(policies.len());
        for policy in policies {
            previews.push(match self.apply(key, policy, 0.0).await {
                Outcome::Applied(peek) => {
                    let state = peek.state;
                    decision_from(policy, &state.apply(state.last_refill, policy, cost))
                }
                Outcome::FailedOpen => fail_open(policy),
            });
        }
        if previews.iter().any(|d| !d.allowed) {
            return Decision::combine(previews).unwrap_or_else(|| Decision::allowed(0, 0));
        }
        // Another task may charge in between; that only makes this pass deny.
        self.charge_all(key, policies, cost).await
    }

    async fn apply(&self, key: &str, policy: &Policy, cost: f64) -> Outcome {
        if !self.backend_usable() {
            self.emit(AdmissionEvent::FailedOpen {
                key: key.to_string(),
                reason: "backend unavailable".to_string(),
            })
            .await;
            return Outcome::FailedOpen;
        }

        let now = self.clock.now_secs();
        let bucket_key = format!("{}:{}", key, policy.name());
        // Expiring a partly refilled bucket would hand out a fresh full one.
        let ttl = self.ttl.max(policy.time_to_full());
        match self.guarded(self.store.apply(&bucket_key, now, policy, cost, ttl)).await {
            Ok(transition) => {
                self.mark_connected().await;
                Outcome::Applied(transition)
            }
            Err(e) => {
                tracing::warn!(
                    key = %bucket_key,
                    policy = policy.name(),
                    error = %e,
                    "state store failed; admitting request"
                );
                self.mark_unavailable().await;
                self.emit(AdmissionEvent::FailedOpen { key: key.to_string(), reason: e.to_string() })
                    .await;
                Outcome::FailedOpen
            }
        }
    }

    async fn guarded<F, R>(&self, fut: F) -> Result<R, StoreError>
    where
        F: Future<Output = Result<R, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    fn backend_usable(&self) -> bool {
        if self.status() != BackendStatus::Unavailable {
            return true;
        }
        let since = f64::from_bits(self.unavailable_since.load(Ordering::Acquire));
        let waited = self.clock.now_secs() - since;
        // Past the recheck window the next call doubles as a probe.
        waited >= self.recheck_after.as_secs_f64() || waited < 0.0
    }

    async fn mark_connected(&self) {
        let prev = self.status.swap(STATUS_CONNECTED, Ordering::AcqRel);
        if prev != STATUS_CONNECTED {
            let from = BackendStatus::from_u8(prev);
            tracing::info!(from = ?from, "state store connected");
            self.emit(AdmissionEvent::BackendStatusChanged { from, to: BackendStatus::Connected })
                .await;
        }
    }

    async fn mark_unavailable(&self) {
        self.unavailable_since.store(self.clock.now_secs().to_bits(), Ordering::Release);
        let prev = self.status.swap(BackendStatus::Unavailable.to_u8(), Ordering::AcqRel);
        if prev != STATUS_UNAVAILABLE {
            let from = BackendStatus::from_u8(prev);
            tracing::warn!(
                from = ?from,
                recheck_after = ?self.recheck_after,
                "state store unavailable; failing open"
            );
            self.emit(AdmissionEvent::BackendStatusChanged { from, to: BackendStatus::Unavailable })
                .await;
        }
    }

    async fn record(&self, key: &str, decision: &Decision) {
        if decision.failed_open {
            return;
        }
        let event = if decision.allowed {
            AdmissionEvent::Admitted { key: key.to_string(), remaining: decision.remaining }
        } else {
            AdmissionEvent::Rejected {
                key: key.to_string(),
                policy: decision.policy.clone().unwrap_or_default(),
                retry_after: decision.retry_after.unwrap_or(0),
            }
        };
        self.emit(event).await;
    }

    async fn emit(&self, event: AdmissionEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

#[async_trait::async_trait]
impl<S, T> RateLimiter for Limiter<S, T>
where
    S: StateStore + 'static,
    T: TelemetrySink,
    T::Future: Send,
{
    async fn check_all_with_cost(
        &self,
        key: &str,
        policies: &[Policy],
        mode: ChargeMode,
        cost: u32,
    ) -> Decision {
        self.check_policies_with_cost(key, policies, mode, cost).await
    }

    async fn maintain(&self) {
        if let Some(evicted) = self.maybe_sweep() {
            if evicted > 0 {
                self.emit(AdmissionEvent::Swept { evicted }).await;
            }
        }
    }
}

fn decision_from(policy: &Policy, t: &Transition) -> Decision {
    let capacity = policy.capacity() as u64;
    let remaining = t.tokens().floor() as u64;
    let decision = match t.retry_after {
        None => Decision::allowed(capacity, remaining),
        Some(wait) => Decision::denied(capacity, remaining, wait),
    };
    decision.with_policy(policy.name())
}

fn fail_open(policy: &Policy) -> Decision {
    Decision::fail_open(policy.capacity() as u64).with_policy(policy.name())
}

/// Builder for [`Limiter`].
pub struct LimiterBuilder<S, T = LogSink> {
    store: S,
    clock: Arc<dyn Clock>,
    sink: T,
    timeout: Duration,
    ttl: Duration,
    recheck_after: Duration,
    sweep: Option<(Duration, Duration)>,
}

impl<S> LimiterBuilder<S, LogSink>
where
    S: StateStore + 'static,
{
    /// Builder with defaults: system clock, 50 ms store deadline, 1 h TTL,
    /// 5 s recheck, sweeping every 5 min for buckets idle over 1 h, and events
    /// logged through [`LogSink`].
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            sink: LogSink,
            timeout: DEFAULT_STORE_TIMEOUT,
            ttl: DEFAULT_BUCKET_TTL,
            recheck_after: DEFAULT_RECHECK_AFTER,
            sweep: Some((DEFAULT_SWEEP_INTERVAL, DEFAULT_MAX_IDLE)),
        }
    }
}

impl<S, T> LimiterBuilder<S, T>
where
    S: StateStore + 'static,
    T: TelemetrySink,
    T::Future: Send,
{
    /// Use a custom clock (tests use [`ManualClock`](crate::clock::ManualClock)).
    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Deadline for each store call. Must be > 0.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Time-to-live written with each bucket. Must be > 0.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// How long to skip an unavailable backend before trying it again.
    pub fn recheck_after(mut self, recheck_after: Duration) -> Self {
        self.recheck_after = recheck_after;
        self
    }

    /// Sweep local stores every `interval`, evicting buckets idle for `max_idle`.
    pub fn sweep(mut self, interval: Duration, max_idle: Duration) -> Self {
        self.sweep = Some((interval, max_idle));
        self
    }

    /// Never sweep (e.g. when running the sweeper as a separate task).
    pub fn without_sweeper(mut self) -> Self {
        self.sweep = None;
        self
    }

    /// Send telemetry to `sink` instead of the log ([`NullSink`](crate::telemetry::NullSink)
    /// discards it).
    pub fn sink<T2>(self, sink: T2) -> LimiterBuilder<S, T2>
    where
        T2: TelemetrySink,
        T2::Future: Send,
    {
        LimiterBuilder {
            store: self.store,
            clock: self.clock,
            sink,
            timeout: self.timeout,
            ttl: self.ttl,
            recheck_after: self.recheck_after,
            sweep: self.sweep,
        }
    }

    /// Build the limiter, validating durations.
    pub fn build(self) -> Result<Limiter<S, T>, ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "timeout" });
        }
        if self.ttl.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "ttl" });
        }
        let store = Arc::new(self.store);
        let sweeper = match self.sweep {
            Some((interval, max_idle)) if store.is_local() => {
                if interval.is_zero() {
                    return Err(ConfigError::ZeroDuration { field: "sweep_interval" });
                }
                if max_idle.is_zero() {
                    return Err(ConfigError::ZeroDuration { field: "max_idle" });
                }
                Some(MaintenanceSweeper::new(store.clone(), self.clock.clone(), interval, max_idle))
            }
            _ => None,
        };
        Ok(Limiter {
            store,
            clock: self.clock,
            sink: self.sink,
            timeout: self.timeout,
            ttl: self.ttl,
            recheck_after: self.recheck_after,
            status: AtomicU8::new(STATUS_UNKNOWN),
            unavailable_since: AtomicU64::new(0f64.to_bits()),
            sweeper,
        })
    }
}
