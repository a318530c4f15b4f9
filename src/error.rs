use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Classifies the pipeline subsystem a [`DataError`] originated from. Orthogonal to
/// [`Severity`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Transport, DNS, handshake & heartbeat failures.
    Network,
    /// Parsing, state machine & buffer plumbing failures.
    Process,
    /// Store pipeline & backup file failures.
    Storage,
    /// Malformed or rule-breaking input.
    Validation,
    /// Bounded-buffer overflow.
    Memory,
    /// Any suspension-point deadline exceeded.
    Timeout,
}

/// How a [`DataError`] should be treated by the component that observes it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// No retry; the reporting component transitions to its error state and the failure
    /// propagates to its supervisor.
    Fatal,
    /// Absorbed after bounded retries per [`RetryPolicy`].
    Recoverable,
    /// Logged; no state change.
    Warning,
}

/// All failures surfaced at `marketflow` component boundaries.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("handshake with {url} failed: {reason}")]
    Handshake { url: String, reason: String },

    #[error("{operation} exceeded its deadline of {timeout_ms}ms")]
    Deadline {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("heartbeat missed: no pong within {pong_within_ms}ms")]
    HeartbeatMissed { pong_within_ms: u64 },

    #[error("failed to deserialise frame: {reason}; payload: {payload}")]
    Deserialise { payload: String, reason: String },

    #[error("subscribe actioning failed: {0}")]
    Subscribe(String),

    #[error("subscribe request for {requested} streams exceeds per-connection limit of {limit}")]
    TooManyStreams { requested: usize, limit: usize },

    #[error("illegal collector transition {from} -> {to}")]
    InvalidState { from: &'static str, to: &'static str },

    #[error("record for {symbol} rejected: {side} levels out of order")]
    InvalidOrder { symbol: String, side: &'static str },

    #[error("record for {symbol} rejected: timestamp {skew_ms}ms ahead of local clock")]
    FutureTimestamp { symbol: String, skew_ms: i64 },

    #[error("record rejected: {0}")]
    InvalidRecord(String),

    #[error("buffer {id} is full")]
    BufferFull { id: String },

    #[error("buffer {id} is closed")]
    BufferClosed { id: String },

    #[error("buffer {id} flush abandoned after {attempts} sink attempts: {reason}")]
    FlushAbandoned {
        id: String,
        attempts: u32,
        reason: String,
    },

    #[error("store pipeline failure: {0}")]
    Storage(String),

    #[error("backup file failure: {0}")]
    Backup(String),

    #[error("configuration invalid: {0}")]
    Config(String),

    #[error("channel to {consumer} closed")]
    ChannelClosed { consumer: &'static str },
}

impl DataError {
    /// [`ErrorKind`] this error is reported under.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DataError::Transport(_)
            | DataError::Handshake { .. }
            | DataError::Subscribe(_)
            | DataError::HeartbeatMissed { .. } => ErrorKind::Network,
            DataError::Deadline { .. } => ErrorKind::Timeout,
            DataError::Deserialise { .. }
            | DataError::InvalidState { .. }
            | DataError::ChannelClosed { .. }
            | DataError::BufferClosed { .. }
            | DataError::FlushAbandoned { .. } => ErrorKind::Process,
            DataError::TooManyStreams { .. }
            | DataError::InvalidOrder { .. }
            | DataError::FutureTimestamp { .. }
            | DataError::InvalidRecord(_)
            | DataError::Config(_) => ErrorKind::Validation,
            DataError::BufferFull { .. } => ErrorKind::Memory,
            DataError::Storage(_) | DataError::Backup(_) => ErrorKind::Storage,
        }
    }

    /// [`Severity`] driving the observing component's reaction.
    pub fn severity(&self) -> Severity {
        match self {
            DataError::Config(_) | DataError::ChannelClosed { .. } => Severity::Fatal,
            DataError::Transport(_)
            | DataError::Handshake { .. }
            | DataError::Deadline { .. }
            | DataError::HeartbeatMissed { .. }
            | DataError::Deserialise { .. }
            | DataError::Subscribe(_)
            | DataError::InvalidOrder { .. }
            | DataError::FutureTimestamp { .. }
            | DataError::InvalidRecord(_)
            | DataError::Storage(_)
            | DataError::Backup(_) => Severity::Recoverable,
            DataError::TooManyStreams { .. }
            | DataError::InvalidState { .. }
            | DataError::BufferFull { .. }
            | DataError::BufferClosed { .. }
            | DataError::FlushAbandoned { .. } => Severity::Warning,
        }
    }

    /// Whether retrying the failed operation can succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataError::Transport(_)
                | DataError::Handshake { .. }
                | DataError::Deadline { .. }
                | DataError::HeartbeatMissed { .. }
                | DataError::Subscribe(_)
                | DataError::Storage(_)
                | DataError::Backup(_)
        )
    }
}

/// Bounded exponential backoff: `delay(k) = min(base * 2^(k - 1), cap)` for attempt `k >= 1`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Backoff delay preceding attempt `k` (1-indexed). Attempt 1 waits the base delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.saturating_mul(2u32.saturating_pow(exponent));
        std::cmp::min(scaled, self.max_delay)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_delay_law() {
        struct TestCase {
            input_attempt: u32,
            expected: Duration,
        }

        let policy = RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_millis(10000));

        let cases = vec![
            TestCase {
                // TC0: first attempt waits the base delay
                input_attempt: 1,
                expected: Duration::from_millis(1000),
            },
            TestCase {
                // TC1: second attempt doubles
                input_attempt: 2,
                expected: Duration::from_millis(2000),
            },
            TestCase {
                // TC2: fourth attempt still below cap
                input_attempt: 4,
                expected: Duration::from_millis(8000),
            },
            TestCase {
                // TC3: fifth attempt clamps to cap
                input_attempt: 5,
                expected: Duration::from_millis(10000),
            },
            TestCase {
                // TC4: far beyond the cap stays clamped
                input_attempt: 30,
                expected: Duration::from_millis(10000),
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = policy.delay(test.input_attempt);
            assert_eq!(test.expected, actual, "TC{} failed", index);
        }
    }

    #[test]
    fn test_error_kind_and_severity_mapping() {
        struct TestCase {
            input: DataError,
            expected_kind: ErrorKind,
            expected_severity: Severity,
        }

        let cases = vec![
            TestCase {
                // TC0: transport failures are recoverable network errors
                input: DataError::Transport("connection reset".to_owned()),
                expected_kind: ErrorKind::Network,
                expected_severity: Severity::Recoverable,
            },
            TestCase {
                // TC1: deadlines map to the timeout kind
                input: DataError::Deadline {
                    operation: "handshake",
                    timeout_ms: 5000,
                },
                expected_kind: ErrorKind::Timeout,
                expected_severity: Severity::Recoverable,
            },
            TestCase {
                // TC2: buffer overflow is a memory warning absorbed by the drop policy
                input: DataError::BufferFull {
                    id: "collector-0".to_owned(),
                },
                expected_kind: ErrorKind::Memory,
                expected_severity: Severity::Warning,
            },
            TestCase {
                // TC3: mis-sorted levels are recoverable validation errors
                input: DataError::InvalidOrder {
                    symbol: "BTC-USDT".to_owned(),
                    side: "bids",
                },
                expected_kind: ErrorKind::Validation,
                expected_severity: Severity::Recoverable,
            },
            TestCase {
                // TC4: missing configuration is fatal
                input: DataError::Config("store.host is required".to_owned()),
                expected_kind: ErrorKind::Validation,
                expected_severity: Severity::Fatal,
            },
            TestCase {
                // TC5: store pipeline failures are retryable storage errors
                input: DataError::Storage("pipeline refused".to_owned()),
                expected_kind: ErrorKind::Storage,
                expected_severity: Severity::Recoverable,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            assert_eq!(test.expected_kind, test.input.kind(), "TC{} failed", index);
            assert_eq!(
                test.expected_severity,
                test.input.severity(),
                "TC{} failed",
                index
            );
        }
    }

    #[test]
    fn test_validation_rejects_are_not_retryable() {
        // Recoverable severity (absorbed by the reporting component) does not imply
        // the operation itself is worth repeating.
        let rejected = DataError::InvalidOrder {
            symbol: "BTC-USDT".to_owned(),
            side: "asks",
        };
        assert_eq!(Severity::Recoverable, rejected.severity());
        assert!(!rejected.is_retryable());
    }
}
