#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # turnstile
//!
//! Token-bucket admission control for multi-tenant HTTP services, as a tower
//! middleware.
//!
//! ## Features
//!
//! - **Token buckets** with exact whole-period refills and weighted costs
//! - **Multiple windows** per request (e.g. a burst limit plus an hourly quota)
//! - **Pluggable state** in-process ([`LocalStore`]) or shared across
//!   processes (the `turnstile-redis` crate)
//! - **Fail open**: store errors and timeouts admit traffic instead of blocking it
//! - **Key resolution** by tenant, client identity header, or client address
//! - **Live policy updates** without rebuilding the service stack
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use turnstile::{AdmissionLayer, Limiter, LocalStore, Policy, PolicyHandle};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = Arc::new(Limiter::builder(LocalStore::new()).build().unwrap());
//!     let policies = PolicyHandle::new(vec![
//!         Policy::per_second("burst", 10).unwrap(),
//!         Policy::per_hour("hourly", 1000).unwrap(),
//!     ])
//!     .unwrap();
//!
//!     let svc = AdmissionLayer::new(limiter, policies).layer(service_fn(|_req: http::Request<()>| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(String::from("ok")))
//!     }));
//!
//!     let response = svc.oneshot(http::Request::new(())).await.unwrap();
//!     assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
//! }
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod policy;
pub mod prelude;
pub mod rate_limit;
pub mod sweeper;
pub mod telemetry;

// Re-exports
pub use bucket::{BucketState, Transition};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{AdmissionConfig, PolicyHandle};
pub use error::{ConfigError, PolicyError, StoreError};
pub use key::{ClientAddr, KeyResolver, KeyStrategy, RequestContext, TenantId};
pub use policy::{ChargeMode, Policy};
pub use rate_limit::{
    AdmissionLayer, AdmissionService, BackendStatus, Decision, Limiter, LimiterBuilder, LocalStore,
    RateLimiter, StateStore,
};
pub use sweeper::MaintenanceSweeper;
