use super::events::AdmissionEvent;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// A telemetry sink that consumes admission events.
///
/// Any cloneable `tower::Service<AdmissionEvent>` can be a sink, so sinks
/// compose with ordinary tower combinators.
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Admission runs on the request path: a sink that is not ready or fails simply
/// loses the event.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate. The limiter's
/// default sink.
///
/// Rejections are logged at INFO, the rest at DEBUG: the limiter already logs
/// store failures and status changes itself, and a busy service should not log
/// every admitted request by default.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        match &event {
            AdmissionEvent::Rejected { .. } => {
                tracing::info!(kind = event.kind(), event = %event, "admission_event");
            }
            _ => tracing::debug!(kind = event.kind(), event = %event, "admission_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Useful for testing and debugging. Oldest events are evicted once the
/// capacity is reached.
///
/// # Example
///
/// ```rust
/// use turnstile::telemetry::{AdmissionEvent, MemorySink};
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut sink = MemorySink::new();
/// let event = AdmissionEvent::Swept { evicted: 3 };
///
/// sink.call(event.clone()).await.unwrap();
///
/// assert_eq!(sink.events(), vec![event]);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AdmissionEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.lock().clone()
    }

    /// Number of stored events of the given [`AdmissionEvent::kind`].
    pub fn count(&self, kind: &str) -> usize {
        self.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Clears all stored events.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Returns the number of events stored.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no events are stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let sink = MemorySink::with_capacity(2);
        for evicted in 0..3 {
            emit_best_effort(sink.clone(), AdmissionEvent::Swept { evicted }).await;
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events()[0], AdmissionEvent::Swept { evicted: 1 });
    }

    #[tokio::test]
    async fn memory_sink_counts_by_kind() {
        let sink = MemorySink::new();
        emit_best_effort(sink.clone(), AdmissionEvent::Admitted { key: "a".into(), remaining: 1 })
            .await;
        emit_best_effort(sink.clone(), AdmissionEvent::Swept { evicted: 0 }).await;
        assert_eq!(sink.count("admitted"), 1);
        assert_eq!(sink.count("rejected"), 0);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_events() {
        emit_best_effort(NullSink, AdmissionEvent::Swept { evicted: 1 }).await;
        emit_best_effort(
            LogSink,
            AdmissionEvent::FailedOpen { key: "public".into(), reason: "down".into() },
        )
        .await;
    }
}
