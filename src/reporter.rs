use crate::{
    error::{DataError, ErrorKind, RetryPolicy, Severity},
    event::{EventBus, PipelineEvent},
};
use bounded_vec_deque::BoundedVecDeque;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{error, warn};

/// Recent errors retained per reporting module for diagnostics.
pub const MAX_RECENT_PER_MODULE: usize = 1000;

/// Structured view of a reported [`DataError`].
#[derive(Clone, Debug)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub module: String,
    pub message: String,
    pub time: DateTime<Utc>,
    pub retryable: bool,
}

/// Central error reporter shared by every pipeline component.
///
/// Applies the per-severity policy (FATAL escalates on the event bus, RECOVERABLE is
/// retried by the caller per [`RetryPolicy`], WARNING is logged) and keeps a bounded
/// ring of recent reports per module.
#[derive(Debug)]
pub struct ErrorReporter {
    bus: EventBus,
    policy: RetryPolicy,
    recent: Mutex<HashMap<String, BoundedVecDeque<ErrorReport>>>,
}

impl ErrorReporter {
    pub fn new(bus: EventBus) -> Self {
        Self::with_policy(bus, RetryPolicy::default())
    }

    pub fn with_policy(bus: EventBus, policy: RetryPolicy) -> Self {
        Self {
            bus,
            policy,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Retry policy callers apply to RECOVERABLE failures.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Record `error` against `module`, log it at the level its severity implies, and
    /// escalate FATAL errors on the event bus. Returns the severity so callers can
    /// branch on it.
    pub fn report(&self, module: &str, err: &DataError) -> Severity {
        let report = ErrorReport {
            kind: err.kind(),
            severity: err.severity(),
            module: module.to_owned(),
            message: err.to_string(),
            time: Utc::now(),
            retryable: err.is_retryable(),
        };

        match report.severity {
            Severity::Fatal => {
                error!(module, kind = ?report.kind, %err, "fatal pipeline error");
                self.bus.publish(PipelineEvent::ErrorEscalated {
                    module: report.module.clone(),
                    kind: report.kind,
                    severity: report.severity,
                    message: report.message.clone(),
                    time: report.time,
                });
            }
            Severity::Recoverable => {
                warn!(module, kind = ?report.kind, %err, "recoverable pipeline error");
            }
            Severity::Warning => {
                warn!(module, kind = ?report.kind, %err, "pipeline warning");
            }
        }

        let severity = report.severity;
        self.recent
            .lock()
            .entry(module.to_owned())
            .or_insert_with(|| BoundedVecDeque::new(MAX_RECENT_PER_MODULE))
            .push_back(report);

        severity
    }

    /// Announce that `module` recovered after `attempts` bounded retries.
    pub fn recovered(&self, module: &str, attempts: u32) {
        self.bus.publish(PipelineEvent::ErrorRecovered {
            module: module.to_owned(),
            attempts,
            time: Utc::now(),
        });
    }

    /// Recent reports for `module`, oldest first.
    pub fn recent(&self, module: &str) -> Vec<ErrorReport> {
        self.recent
            .lock()
            .get(module)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total errors currently retained for `module`.
    pub fn recent_len(&self, module: &str) -> usize {
        self.recent
            .lock()
            .get(module)
            .map(|ring| ring.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_returns_severity_and_retains_recent() {
        let reporter = ErrorReporter::new(EventBus::new(8));

        let severity = reporter.report(
            "collector-0",
            &DataError::Transport("connection reset".to_owned()),
        );

        assert_eq!(Severity::Recoverable, severity);
        let recent = reporter.recent("collector-0");
        assert_eq!(1, recent.len());
        assert_eq!(ErrorKind::Network, recent[0].kind);
        assert!(recent[0].retryable);
    }

    #[test]
    fn test_recent_ring_is_bounded_per_module() {
        let reporter = ErrorReporter::new(EventBus::new(8));

        for _ in 0..(MAX_RECENT_PER_MODULE + 10) {
            reporter.report("processor", &DataError::Storage("refused".to_owned()));
        }
        reporter.report("other", &DataError::Storage("refused".to_owned()));

        assert_eq!(MAX_RECENT_PER_MODULE, reporter.recent_len("processor"));
        assert_eq!(1, reporter.recent_len("other"));
    }

    #[tokio::test]
    async fn test_fatal_errors_escalate_on_the_bus() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let reporter = ErrorReporter::new(bus);

        let severity = reporter.report("config", &DataError::Config("store.host missing".to_owned()));
        assert_eq!(Severity::Fatal, severity);

        match rx.recv().await.unwrap() {
            PipelineEvent::ErrorEscalated { module, kind, .. } => {
                assert_eq!("config", module);
                assert_eq!(ErrorKind::Validation, kind);
            }
            other => panic!("expected escalation, received {}", other.topic()),
        }
    }
}
