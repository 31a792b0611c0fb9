//! Error types for admission control.
//!
//! Rejections are not errors: a denied request is a [`Decision`](crate::Decision).
//! The types here cover configuration problems, which are fatal at startup, and
//! state store failures, which the limiter swallows and turns into fail-open
//! decisions.

use std::time::Duration;

/// Errors produced when validating a [`Policy`](crate::Policy).
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    /// Capacity must be at least one token.
    #[error("capacity must be >= 1 (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: f64,
    },
    /// Tokens added per refill period must be > 0.
    #[error("refill tokens must be > 0 (got {provided})")]
    InvalidRefillTokens {
        /// Value provided by caller.
        provided: f64,
    },
    /// Refill period must be non-zero and finite.
    #[error("refill period must be > 0 (got {0:?})")]
    InvalidRefillPeriod(Duration),
    /// Policy names key the per-window buckets and cannot be blank.
    #[error("policy name must not be empty")]
    EmptyName,
    /// Policy names may not contain the `:` key separator.
    #[error("policy name '{0}' must not contain ':'")]
    InvalidName(String),
    /// Two policies in one set share a name and would share a bucket.
    #[error("duplicate policy name '{0}'")]
    DuplicateName(String),
}

/// Failures talking to a [`StateStore`](crate::StateStore).
///
/// None of these reach callers of the limiter; they are logged and converted to
/// a fail-open decision.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached (connection refused, not yet connected).
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    /// The store call did not complete within the configured deadline.
    #[error("state store call timed out after {0:?}")]
    Timeout(Duration),
    /// The backend answered with a record we could not interpret.
    #[error("malformed bucket record for '{key}': {reason}")]
    Malformed {
        /// Bucket key that held the bad record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Any other backend-specific failure.
    #[error("state store error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap an arbitrary backend error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }

    /// Check if this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

/// Errors raised while loading or validating [`AdmissionConfig`](crate::config::AdmissionConfig).
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration was not valid JSON for the expected shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A policy entry failed validation.
    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),
    /// A duration field was zero where a positive value is required.
    #[error("{field} must be > 0")]
    ZeroDuration {
        /// Name of the offending field.
        field: &'static str,
    },
    /// The default key must be usable as a bucket key.
    #[error("default_key must not be empty")]
    EmptyDefaultKey,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn policy_error_display_includes_value() {
        let err = PolicyError::InvalidCapacity { provided: 0.0 };
        let msg = err.to_string();
        assert!(msg.contains("capacity"));
        assert!(msg.contains('0'));
    }

    #[test]
    fn store_error_backend_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = StoreError::backend(io);
        assert!(err.source().is_some());
        assert!(err.to_string().contains("refused"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_predicate() {
        let err = StoreError::Timeout(Duration::from_millis(50));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("50ms"));
    }

    #[test]
    fn config_error_wraps_policy_error() {
        let err: ConfigError = PolicyError::EmptyName.into();
        assert!(matches!(err, ConfigError::Policy(PolicyError::EmptyName)));
        assert!(err.to_string().contains("name"));
    }
}
