//! Token bucket state and its refill-then-consume transition.
//!
//! This is the only place tokens are computed. Stores persist [`BucketState`]
//! and call [`BucketState::apply`]; nothing else mutates `tokens`.

use crate::policy::Policy;

/// Absorbs floating error so that waiting exactly `retry_after` admits.
const EPSILON: f64 = 1e-9;

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens available as of `last_refill`.
    pub tokens: f64,
    /// Instant (seconds) at which `tokens` was last valid.
    pub last_refill: f64,
}

/// Outcome of running one transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// State to persist. Written whether or not the request was admitted.
    pub state: BucketState,
    /// Whether `cost` tokens were consumed.
    pub allowed: bool,
    /// Seconds until `cost` tokens will be available; `None` when allowed.
    pub retry_after: Option<u64>,
}

impl Transition {
    /// Tokens left after the decision.
    pub fn tokens(&self) -> f64 {
        self.state.tokens
    }
}

impl BucketState {
    /// A full bucket observed for the first time at `now`.
    pub fn full(policy: &Policy, now: f64) -> Self {
        Self { tokens: policy.capacity(), last_refill: now }
    }

    /// Advance the bucket to `now`, then try to take `cost` tokens.
    ///
    /// A backward clock jump counts as zero elapsed time. Denials do not consume
    /// but still move `last_refill` forward, so the refill that happened up to
    /// `now` is banked and not granted twice.
    pub fn apply(self, now: f64, policy: &Policy, cost: f64) -> Transition {
        let capacity = policy.capacity();
        let elapsed = (now - self.last_refill).max(0.0);
        let refilled = (self.tokens.max(0.0) + policy.tokens_for(elapsed)).min(capacity);

        if cost <= refilled + EPSILON {
            let tokens = (refilled - cost).clamp(0.0, capacity);
            return Transition {
                state: BucketState { tokens, last_refill: now.max(self.last_refill) },
                allowed: true,
                retry_after: None,
            };
        }

        let missing = cost - refilled;
        let wait = (policy.secs_for(missing) - EPSILON).ceil().max(1.0);
        Transition {
            state: BucketState { tokens: refilled, last_refill: now.max(self.last_refill) },
            allowed: false,
            retry_after: Some(wait as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn one_per_minute() -> Policy {
        Policy::new("m", 1, 1.0, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn burst_then_deny() {
        let policy = Policy::per_second("s", 3).unwrap();
        let mut state = BucketState::full(&policy, 0.0);
        for _ in 0..3 {
            let t = state.apply(0.0, &policy, 1.0);
            assert!(t.allowed);
            state = t.state;
        }
        let t = state.apply(0.0, &policy, 1.0);
        assert!(!t.allowed);
        assert_eq!(t.tokens(), 0.0);
    }

    #[test]
    fn one_per_minute_scenario() {
        let policy = one_per_minute();
        let first = BucketState::full(&policy, 0.0).apply(0.0, &policy, 1.0);
        assert!(first.allowed);
        assert_eq!(first.tokens(), 0.0);

        let second = first.state.apply(0.0, &policy, 1.0);
        assert!(!second.allowed);
        assert_eq!(second.retry_after, Some(60));

        let third = second.state.apply(60.0, &policy, 1.0);
        assert!(third.allowed);
        assert_eq!(third.tokens(), 0.0);
    }

    #[test]
    fn refill_caps_at_capacity() {
        let policy = Policy::per_second("s", 5).unwrap();
        let state = BucketState { tokens: 0.0, last_refill: 0.0 };
        let t = state.apply(1_000.0, &policy, 0.0);
        assert_eq!(t.tokens(), 5.0);
    }

    #[test]
    fn backward_clock_grants_nothing() {
        let policy = Policy::per_second("s", 5).unwrap();
        let state = BucketState { tokens: 1.0, last_refill: 100.0 };
        let t = state.apply(50.0, &policy, 0.0);
        assert_eq!(t.tokens(), 1.0);
        assert_eq!(t.state.last_refill, 100.0);
    }

    #[test]
    fn denial_banks_elapsed_refill() {
        let policy = Policy::new("h", 1, 1.0, Duration::from_secs(10)).unwrap();
        let state = BucketState { tokens: 0.0, last_refill: 0.0 };
        let denied = state.apply(4.0, &policy, 1.0);
        assert!(!denied.allowed);
        assert!((denied.tokens() - 0.4).abs() < 1e-12);
        assert_eq!(denied.retry_after, Some(6));
        let later = denied.state.apply(10.0, &policy, 1.0);
        assert!(later.allowed);
    }

    #[test]
    fn fractional_rate_retry_after_rounds_up() {
        // 30 per minute: one token every two seconds.
        let policy = Policy::per_minute("m", 30).unwrap();
        let state = BucketState { tokens: 0.25, last_refill: 0.0 };
        let t = state.apply(0.0, &policy, 1.0);
        assert_eq!(t.retry_after, Some(2));
        assert!(t.state.apply(2.0, &policy, 1.0).allowed);
    }

    #[test]
    fn weighted_cost_above_capacity_is_denied() {
        let policy = Policy::per_second("s", 2).unwrap();
        let t = BucketState::full(&policy, 0.0).apply(0.0, &policy, 5.0);
        assert!(!t.allowed);
        assert_eq!(t.tokens(), 2.0);
        assert_eq!(t.retry_after, Some(2));
    }
}
