//! Rate limiting primitives.
//!
//! This module provides the building blocks for admission control:
//! - [`RateLimiter`]: The core trait the middleware asks for decisions.
//! - [`Limiter`]: Token-bucket implementation over any [`StateStore`].
//! - [`AdmissionLayer`]: Tower middleware that enforces the limit on HTTP requests.
//! - [`Decision`]: The result of a rate limit check.
//!
//! # Architecture
//!
//! The system is designed to be modular:
//! - **Middleware**: `AdmissionLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should resolve a key and ask a `RateLimiter`.
//! - **Logic**: `Limiter` runs the bucket arithmetic from [`crate::bucket`] and owns the
//!   fail-open policy.
//! - **Storage**: `StateStore` (in `store` module) holds bucket state, either in-process
//!   ([`LocalStore`]) or in a shared backend such as Redis.

use crate::policy::{ChargeMode, Policy};

pub mod limiter;
pub mod middleware;
pub mod store;

pub use limiter::{Limiter, LimiterBuilder};
pub use middleware::{AdmissionLayer, AdmissionService};
pub use store::{LocalStore, StateStore};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Capacity of the reported window. Useful for `X-RateLimit-Limit`.
    pub capacity: u64,
    /// Whole tokens left after this decision. Useful for `X-RateLimit-Remaining`.
    pub remaining: u64,
    /// Seconds until a retry can succeed; only set when denied.
    pub retry_after: Option<u64>,
    /// Window the figures above describe.
    pub policy: Option<String>,
    /// Set when the store failed and the request was let through unchecked.
    pub failed_open: bool,
}

impl Decision {
    /// Admission with headroom `remaining` out of `capacity`.
    pub fn allowed(capacity: u64, remaining: u64) -> Self {
        Self { allowed: true, capacity, remaining, retry_after: None, policy: None, failed_open: false }
    }

    /// Denial asking the caller to wait `retry_after` seconds.
    pub fn denied(capacity: u64, remaining: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            capacity,
            remaining,
            retry_after: Some(retry_after),
            policy: None,
            failed_open: false,
        }
    }

    /// Admission granted because the backend could not be consulted.
    pub fn fail_open(capacity: u64) -> Self {
        Self { failed_open: true, ..Self::allowed(capacity, capacity) }
    }

    /// Tag the decision with the window it describes.
    pub fn with_policy(mut self, name: impl Into<String>) -> Self {
        self.policy = Some(name.into());
        self
    }

    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Fold per-window decisions into one: denied if any window denies.
    ///
    /// The reported window is the denying one with the longest wait, or when
    /// everything admitted, the one with the fewest tokens left. `failed_open`
    /// survives only on an admission; a denial from a window that was checked
    /// is a real rejection.
    pub fn combine(decisions: Vec<Decision>) -> Option<Decision> {
        let mut worst: Option<Decision> = None;
        for d in decisions {
            worst = Some(match worst {
                None => d,
                Some(w) => {
                    let replace = match (w.allowed, d.allowed) {
                        (true, false) => true,
                        (false, true) => false,
                        (false, false) => d.retry_after > w.retry_after,
                        (true, true) => d.remaining < w.remaining,
                    };
                    let failed_open = w.failed_open || d.failed_open;
                    let mut chosen = if replace { d } else { w };
                    chosen.failed_open = chosen.allowed && failed_open;
                    chosen
                }
            });
        }
        worst
    }
}

/// Status of the backing store as last observed by the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    /// Not yet probed or used.
    Unknown,
    /// Last interaction succeeded.
    Connected,
    /// Last interaction failed; checks fail open until the next recheck.
    Unavailable,
}

/// Core interface for rate limiting logic.
///
/// This trait decouples the middleware from the limiter's storage and clock, and
/// lets tests drop in scripted limiters.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check `key` against every policy and fold the results.
    ///
    /// Must never fail: backend problems yield a fail-open decision.
    async fn check_all(&self, key: &str, policies: &[Policy], mode: ChargeMode) -> Decision {
        self.check_all_with_cost(key, policies, mode, 1).await
    }

    /// Like [`check_all`](RateLimiter::check_all) for an operation worth `cost` tokens.
    async fn check_all_with_cost(
        &self,
        key: &str,
        policies: &[Policy],
        mode: ChargeMode,
        cost: u32,
    ) -> Decision;

    /// Periodic housekeeping hook, called after each check. Implementations must
    /// keep this cheap when no work is due.
    async fn maintain(&self) {}
}
