//! Convenient re-exports for common turnstile types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::{AdmissionConfig, PolicyHandle},
    key::{ClientAddr, KeyResolver, KeyStrategy, TenantId},
    policy::{ChargeMode, Policy},
    rate_limit::{AdmissionLayer, BackendStatus, Decision, Limiter, LocalStore, RateLimiter, StateStore},
    telemetry::{AdmissionEvent, LogSink, MemorySink, TelemetrySink},
    ConfigError, PolicyError, StoreError,
};
