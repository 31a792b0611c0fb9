//! Declarative configuration for the admission stack.
//!
//! `AdmissionConfig` is deserialized from JSON, validated once, and then turned
//! into the runtime pieces: a policy list, a [`KeyResolver`], and a
//! [`LimiterBuilder`]. The policy list lives behind a [`PolicyHandle`] so it can
//! be replaced while requests are in flight.
//!
//! ```rust
//! use turnstile::config::AdmissionConfig;
//!
//! let config = AdmissionConfig::from_json_str(r#"{
//!     "policies": [
//!         { "name": "burst", "capacity": 10, "period_secs": 1 },
//!         { "name": "hourly", "capacity": 500, "period_secs": 3600 }
//!     ],
//!     "key": { "strategy": "tenant" }
//! }"#).unwrap();
//!
//! assert_eq!(config.policies().unwrap().len(), 2);
//! ```

use crate::error::{ConfigError, PolicyError};
use crate::key::{KeyResolver, KeyStrategy, DEFAULT_FORWARDED_HEADER, DEFAULT_IDENTITY_HEADER, DEFAULT_KEY};
use crate::policy::{validate_set, ChargeMode, Policy};
use crate::rate_limit::{LimiterBuilder, StateStore};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Paths that bypass admission control unless configured otherwise.
pub const DEFAULT_EXEMPT_PATHS: &[&str] = &["/health", "/healthz", "/docs", "/openapi.json"];

/// Top-level admission configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Windows applied to every non-exempt request.
    pub policies: Vec<PolicyConfig>,
    /// Whether admitting windows are charged when another window denies.
    pub charge_mode: ChargeMode,
    /// Key resolution.
    pub key: KeyConfig,
    /// Paths that bypass admission control.
    pub exempt_paths: Vec<String>,
    /// Store call settings.
    pub store: StoreConfig,
    /// Local store maintenance.
    pub sweeper: SweeperConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            policies: Vec::new(),
            charge_mode: ChargeMode::default(),
            key: KeyConfig::default(),
            exempt_paths: DEFAULT_EXEMPT_PATHS.iter().map(|p| p.to_string()).collect(),
            store: StoreConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

/// One window. `refill_tokens` defaults to `capacity`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub name: String,
    pub capacity: u32,
    #[serde(default)]
    pub refill_tokens: Option<f64>,
    pub period_secs: u64,
}

impl PolicyConfig {
    /// Build the validated [`Policy`].
    pub fn to_policy(&self) -> Result<Policy, PolicyError> {
        let tokens = self.refill_tokens.unwrap_or_else(|| f64::from(self.capacity));
        Policy::new(self.name.clone(), self.capacity, tokens, Duration::from_secs(self.period_secs))
    }
}

/// How requests map to keys. `null` for a header disables that source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyConfig {
    pub strategy: KeyStrategy,
    pub identity_header: Option<String>,
    pub forwarded_header: Option<String>,
    pub default_key: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            strategy: KeyStrategy::default(),
            identity_header: Some(DEFAULT_IDENTITY_HEADER.to_string()),
            forwarded_header: Some(DEFAULT_FORWARDED_HEADER.to_string()),
            default_key: DEFAULT_KEY.to_string(),
        }
    }
}

/// Store call settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Deadline per store call, in milliseconds.
    pub timeout_ms: u64,
    /// Bucket time-to-live, in seconds.
    pub ttl_secs: u64,
    /// Pause before an unavailable store is retried, in seconds.
    pub recheck_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { timeout_ms: 50, ttl_secs: 3600, recheck_secs: 5 }
    }
}

/// Sweeper settings; only used with the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_idle_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 300, max_idle_secs: 3600 }
    }
}

impl AdmissionConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check every field that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policies()?;
        if self.key.default_key.trim().is_empty() {
            return Err(ConfigError::EmptyDefaultKey);
        }
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration { field: "store.timeout_ms" });
        }
        if self.store.ttl_secs == 0 {
            return Err(ConfigError::ZeroDuration { field: "store.ttl_secs" });
        }
        if self.sweeper.enabled {
            if self.sweeper.interval_secs == 0 {
                return Err(ConfigError::ZeroDuration { field: "sweeper.interval_secs" });
            }
            if self.sweeper.max_idle_secs == 0 {
                return Err(ConfigError::ZeroDuration { field: "sweeper.max_idle_secs" });
            }
        }
        Ok(())
    }

    /// The validated policy list.
    pub fn policies(&self) -> Result<Vec<Policy>, PolicyError> {
        let policies = self.policies.iter().map(PolicyConfig::to_policy).collect::<Result<Vec<_>, _>>()?;
        validate_set(&policies)?;
        Ok(policies)
    }

    /// The configured key resolver.
    pub fn resolver(&self) -> KeyResolver {
        KeyResolver::new(self.key.strategy)
            .identity_header(self.key.identity_header.clone())
            .forwarded_header(self.key.forwarded_header.clone())
            .default_key(self.key.default_key.clone())
    }

    /// A limiter builder over `store` carrying the store and sweeper settings.
    pub fn limiter_builder<S>(&self, store: S) -> LimiterBuilder<S>
    where
        S: StateStore + 'static,
    {
        let builder = LimiterBuilder::new(store)
            .timeout(Duration::from_millis(self.store.timeout_ms))
            .ttl(Duration::from_secs(self.store.ttl_secs))
            .recheck_after(Duration::from_secs(self.store.recheck_secs));
        if self.sweeper.enabled {
            builder.sweep(
                Duration::from_secs(self.sweeper.interval_secs),
                Duration::from_secs(self.sweeper.max_idle_secs),
            )
        } else {
            builder.without_sweeper()
        }
    }
}

/// Live-swappable policy list shared by every clone of the admission layer.
///
/// Reads are lock-free snapshots; a replacement is seen by the next request.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    inner: Arc<ArcSwap<Vec<Policy>>>,
}

impl PolicyHandle {
    /// Handle over a validated policy set.
    pub fn new(policies: Vec<Policy>) -> Result<Self, PolicyError> {
        validate_set(&policies)?;
        Ok(Self { inner: Arc::new(ArcSwap::from_pointee(policies)) })
    }

    /// Snapshot of the current policies.
    pub fn get(&self) -> Arc<Vec<Policy>> {
        self.inner.load_full()
    }

    /// Replace the policy set. The old set stays in place on error.
    pub fn replace(&self, policies: Vec<Policy>) -> Result<(), PolicyError> {
        validate_set(&policies)?;
        self.inner.store(Arc::new(policies));
        tracing::info!(count = self.inner.load().len(), "rate limit policies replaced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = AdmissionConfig::from_json_str("{}").unwrap();
        assert_eq!(config, AdmissionConfig::default());
        assert!(config.exempt_paths.iter().any(|p| p == "/healthz"));
        assert_eq!(config.charge_mode, ChargeMode::All);
    }

    #[test]
    fn refill_tokens_defaults_to_capacity() {
        let config = AdmissionConfig::from_json_str(
            r#"{ "policies": [
                { "name": "m", "capacity": 30, "period_secs": 60 },
                { "name": "slow", "capacity": 1, "refill_tokens": 1.0, "period_secs": 60 }
            ] }"#,
        )
        .unwrap();
        let policies = config.policies().unwrap();
        assert_eq!(policies[0].refill_tokens(), 30.0);
        assert_eq!(policies[1].refill_period(), Duration::from_secs(60));
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let zero = r#"{ "policies": [{ "name": "m", "capacity": 0, "period_secs": 60 }] }"#;
        assert!(matches!(
            AdmissionConfig::from_json_str(zero),
            Err(ConfigError::Policy(PolicyError::InvalidCapacity { .. }))
        ));
        let dup = r#"{ "policies": [
            { "name": "m", "capacity": 1, "period_secs": 60 },
            { "name": "m", "capacity": 2, "period_secs": 1 }
        ] }"#;
        assert!(matches!(
            AdmissionConfig::from_json_str(dup),
            Err(ConfigError::Policy(PolicyError::DuplicateName(_)))
        ));
    }

    #[test]
    fn unknown_fields_and_zero_durations_fail() {
        assert!(matches!(AdmissionConfig::from_json_str(r#"{ "polices": [] }"#), Err(ConfigError::Parse(_))));
        assert!(matches!(
            AdmissionConfig::from_json_str(r#"{ "store": { "timeout_ms": 0 } }"#),
            Err(ConfigError::ZeroDuration { field: "store.timeout_ms" })
        ));
        assert!(matches!(
            AdmissionConfig::from_json_str(r#"{ "key": { "default_key": " " } }"#),
            Err(ConfigError::EmptyDefaultKey)
        ));
        // A disabled sweeper may carry zeros.
        assert!(AdmissionConfig::from_json_str(r#"{ "sweeper": { "enabled": false, "interval_secs": 0 } }"#).is_ok());
    }

    #[test]
    fn null_header_disables_source() {
        let config = AdmissionConfig::from_json_str(
            r#"{ "key": { "strategy": "client_address", "forwarded_header": null } }"#,
        )
        .unwrap();
        let resolver = config.resolver();
        assert_eq!(resolver.strategy(), KeyStrategy::ClientAddress);
        let req = http::Request::builder().header("x-forwarded-for", "192.0.2.1").body(()).unwrap();
        assert_eq!(resolver.resolve(&req), "public");
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            AdmissionConfig::from_path("/nonexistent/turnstile.json"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn policy_handle_replaces_atomically() {
        let handle = PolicyHandle::new(vec![Policy::per_second("s", 1).unwrap()]).unwrap();
        let before = handle.get();
        handle.replace(vec![Policy::per_minute("m", 5).unwrap()]).unwrap();
        assert_eq!(before[0].name(), "s");
        assert_eq!(handle.get()[0].name(), "m");

        let dup = vec![Policy::per_second("x", 1).unwrap(), Policy::per_hour("x", 1).unwrap()];
        assert!(handle.replace(dup).is_err());
        assert_eq!(handle.get()[0].name(), "m");
    }
}
