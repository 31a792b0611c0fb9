//! Telemetry for admission control.
//!
//! The limiter and the sweeper emit structured [`AdmissionEvent`]s. Events flow
//! through `TelemetrySink` implementations which can log, aggregate, or forward
//! them to external systems.
//!
//! # Event Types
//!
//! - **Admitted** / **Rejected**: one per checked request
//! - **FailedOpen**: the state store failed and the request was let through
//! - **BackendStatusChanged**: the store went up or down
//! - **Swept**: idle buckets were evicted from the local store
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<AdmissionEvent>` for composability.

pub mod events;
pub mod sinks;

pub use events::AdmissionEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
