use crate::rate_limit::BackendStatus;
use std::fmt;

/// Events emitted while admitting requests.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionEvent {
    /// A request passed every policy.
    Admitted {
        /// Resolved admission key.
        key: String,
        /// Tokens left in the most constrained window.
        remaining: u64,
    },
    /// A request was denied by at least one policy.
    Rejected {
        /// Resolved admission key.
        key: String,
        /// Name of the window that denied with the longest wait.
        policy: String,
        /// Seconds the caller was told to wait.
        retry_after: u64,
    },
    /// The state store failed and the request was admitted without a check.
    FailedOpen {
        /// Resolved admission key.
        key: String,
        /// Rendered store error, or why the store was skipped.
        reason: String,
    },
    /// The limiter's view of the backend changed.
    BackendStatusChanged {
        /// Previous status.
        from: BackendStatus,
        /// New status.
        to: BackendStatus,
    },
    /// The maintenance sweeper evicted idle buckets.
    Swept {
        /// Number of buckets removed.
        evicted: usize,
    },
}

impl AdmissionEvent {
    /// Short machine-friendly name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionEvent::Admitted { .. } => "admitted",
            AdmissionEvent::Rejected { .. } => "rejected",
            AdmissionEvent::FailedOpen { .. } => "failed_open",
            AdmissionEvent::BackendStatusChanged { .. } => "backend_status_changed",
            AdmissionEvent::Swept { .. } => "swept",
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Admitted { key, remaining } => {
                write!(f, "Admitted(key={}, remaining={})", key, remaining)
            }
            AdmissionEvent::Rejected { key, policy, retry_after } => {
                write!(f, "Rejected(key={}, policy={}, retry_after={}s)", key, policy, retry_after)
            }
            AdmissionEvent::FailedOpen { key, reason } => {
                write!(f, "FailedOpen(key={}, reason={})", key, reason)
            }
            AdmissionEvent::BackendStatusChanged { from, to } => {
                write!(f, "BackendStatusChanged({:?} -> {:?})", from, to)
            }
            AdmissionEvent::Swept { evicted } => write!(f, "Swept(evicted={})", evicted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let e = AdmissionEvent::Rejected { key: "tenant:a".into(), policy: "burst".into(), retry_after: 3 };
        assert_eq!(e.to_string(), "Rejected(key=tenant:a, policy=burst, retry_after=3s)");
        assert_eq!(e.kind(), "rejected");

        let s = AdmissionEvent::BackendStatusChanged {
            from: BackendStatus::Connected,
            to: BackendStatus::Unavailable,
        };
        assert_eq!(s.to_string(), "BackendStatusChanged(Connected -> Unavailable)");
    }
}
