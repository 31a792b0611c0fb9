//! Rate limit policies: how big a bucket is and how fast it refills.
//!
//! Policies are configuration, not state. They are handed to the limiter on
//! every check and are never stored alongside a bucket.

use crate::error::PolicyError;
use std::collections::HashSet;
use std::time::Duration;

/// A validated `(capacity, refill rate)` pair with a name.
///
/// The refill rate is kept as `refill_tokens` per `refill_period` rather than a
/// pre-divided float so that waiting a whole period refills an exact number of
/// tokens ("30 per minute" refills exactly 30 after 60 seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    name: String,
    capacity: f64,
    refill_tokens: f64,
    refill_period: Duration,
}

impl Policy {
    /// Create a policy with validation.
    pub fn new(
        name: impl Into<String>,
        capacity: u32,
        refill_tokens: f64,
        refill_period: Duration,
    ) -> Result<Self, PolicyError> {
        let policy = Self {
            name: name.into(),
            capacity: f64::from(capacity),
            refill_tokens,
            refill_period,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// `capacity` tokens, refilling `capacity` every second.
    pub fn per_second(name: impl Into<String>, capacity: u32) -> Result<Self, PolicyError> {
        Self::new(name, capacity, f64::from(capacity), Duration::from_secs(1))
    }

    /// `capacity` tokens, refilling `capacity` every minute.
    pub fn per_minute(name: impl Into<String>, capacity: u32) -> Result<Self, PolicyError> {
        Self::new(name, capacity, f64::from(capacity), Duration::from_secs(60))
    }

    /// `capacity` tokens, refilling `capacity` every hour.
    pub fn per_hour(name: impl Into<String>, capacity: u32) -> Result<Self, PolicyError> {
        Self::new(name, capacity, f64::from(capacity), Duration::from_secs(3600))
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::EmptyName);
        }
        // Bucket keys are `{key}:{name}`; a separator in the name could alias
        // another key's bucket.
        if self.name.contains(':') {
            return Err(PolicyError::InvalidName(self.name.clone()));
        }
        if self.capacity < 1.0 {
            return Err(PolicyError::InvalidCapacity { provided: self.capacity });
        }
        if !(self.refill_tokens.is_finite() && self.refill_tokens > 0.0) {
            return Err(PolicyError::InvalidRefillTokens { provided: self.refill_tokens });
        }
        if self.refill_period.is_zero() || self.refill_period == Duration::MAX {
            return Err(PolicyError::InvalidRefillPeriod(self.refill_period));
        }
        Ok(())
    }

    /// Name used to suffix bucket keys.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum tokens the bucket holds.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per refill period.
    pub fn refill_tokens(&self) -> f64 {
        self.refill_tokens
    }

    /// Length of one refill period.
    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    /// Tokens per second.
    pub fn rate_per_sec(&self) -> f64 {
        self.refill_tokens / self.refill_period.as_secs_f64()
    }

    /// Tokens accrued over `elapsed` seconds.
    pub fn tokens_for(&self, elapsed_secs: f64) -> f64 {
        elapsed_secs * self.refill_tokens / self.refill_period.as_secs_f64()
    }

    /// Seconds needed to accrue `tokens`.
    pub fn secs_for(&self, tokens: f64) -> f64 {
        tokens * self.refill_period.as_secs_f64() / self.refill_tokens
    }

    /// Time for an empty bucket to refill completely.
    ///
    /// A bucket idle for at least this long is indistinguishable from a new
    /// one, so state may be dropped after it and no sooner.
    pub fn time_to_full(&self) -> Duration {
        Duration::try_from_secs_f64(self.secs_for(self.capacity).ceil()).unwrap_or(Duration::MAX)
    }
}


/// Check a set of policies applied together: non-empty names, no duplicates.
pub fn validate_set(policies: &[Policy]) -> Result<(), PolicyError> {
    let mut seen = HashSet::new();
    for policy in policies {
        if !seen.insert(policy.name()) {
            return Err(PolicyError::DuplicateName(policy.name().to_string()));
        }
    }
    Ok(())
}

/// What happens to the windows that admitted a request another window denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeMode {
    /// Every window is charged on every check, even when another denies. A
    /// caller over the long window keeps draining the short one.
    #[default]
    All,
    /// Windows are only charged when the request is admitted overall.
    OnAdmit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_minute_rate() {
        let p = Policy::per_minute("burst", 30).unwrap();
        assert_eq!(p.capacity(), 30.0);
        assert!((p.rate_per_sec() - 0.5).abs() < 1e-12);
        assert_eq!(p.tokens_for(60.0), 30.0);
        assert_eq!(p.secs_for(1.0), 2.0);
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = Policy::per_second("x", 0).unwrap_err();
        assert_eq!(err, PolicyError::InvalidCapacity { provided: 0.0 });
    }

    #[test]
    fn rejects_bad_refill() {
        assert!(matches!(
            Policy::new("x", 1, 0.0, Duration::from_secs(1)),
            Err(PolicyError::InvalidRefillTokens { .. })
        ));
        assert!(matches!(
            Policy::new("x", 1, f64::NAN, Duration::from_secs(1)),
            Err(PolicyError::InvalidRefillTokens { .. })
        ));
        assert!(matches!(
            Policy::new("x", 1, 1.0, Duration::ZERO),
            Err(PolicyError::InvalidRefillPeriod(_))
        ));
    }

    #[test]
    fn rejects_blank_name() {
        assert_eq!(Policy::per_second("  ", 1).unwrap_err(), PolicyError::EmptyName);
    }

    #[test]
    fn rejects_separator_in_name() {
        assert_eq!(
            Policy::per_hour("h:x", 1).unwrap_err(),
            PolicyError::InvalidName("h:x".into())
        );
    }

    #[test]
    fn time_to_full_covers_partial_refill() {
        let day = Policy::new("day", 100, 100.0, Duration::from_secs(86_400)).unwrap();
        assert_eq!(day.time_to_full(), Duration::from_secs(86_400));
        let slow = Policy::new("slow", 10, 1.0, Duration::from_secs(60)).unwrap();
        assert_eq!(slow.time_to_full(), Duration::from_secs(600));
        assert_eq!(Policy::per_second("s", 5).unwrap().time_to_full(), Duration::from_secs(1));
    }

    #[test]
    fn set_rejects_duplicates() {
        let a = Policy::per_second("w", 1).unwrap();
        let b = Policy::per_hour("w", 10).unwrap();
        assert_eq!(validate_set(&[a, b]), Err(PolicyError::DuplicateName("w".into())));
    }
}
