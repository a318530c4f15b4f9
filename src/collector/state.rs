use serde::{Deserialize, Serialize};

/// Connection lifecycle state of a [`Collector`](super::Collector).
///
/// Only the transitions returned by [`CollectorState::can_transition_to`] are legal;
/// everything else fails with [`DataError::InvalidState`](crate::error::DataError).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectorState {
    Initial,
    Connecting,
    Connected,
    Subscribing,
    Running,
    Reconnecting,
    /// Streaming path exceeded its reconnect budget; data is polled over REST.
    Fallback,
    Stopping,
    Stopped,
    Error,
}

impl CollectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorState::Initial => "INITIAL",
            CollectorState::Connecting => "CONNECTING",
            CollectorState::Connected => "CONNECTED",
            CollectorState::Subscribing => "SUBSCRIBING",
            CollectorState::Running => "RUNNING",
            CollectorState::Reconnecting => "RECONNECTING",
            CollectorState::Fallback => "FALLBACK",
            CollectorState::Stopping => "STOPPING",
            CollectorState::Stopped => "STOPPED",
            CollectorState::Error => "ERROR",
        }
    }

    /// STOPPED is the only terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CollectorState::Stopped)
    }

    /// Legality table for the collector lifecycle.
    pub fn can_transition_to(&self, next: CollectorState) -> bool {
        use CollectorState::*;

        match (self, next) {
            (Initial, Connecting | Stopped) => true,
            (Connecting, Connected | Reconnecting | Error | Stopping) => true,
            (Connected, Subscribing | Reconnecting | Error | Stopping) => true,
            (Subscribing, Running | Reconnecting | Error | Stopping) => true,
            (Running, Reconnecting | Error | Stopping) => true,
            (Reconnecting, Connecting | Fallback | Error | Stopping) => true,
            (Fallback, Connecting | Error | Stopping) => true,
            (Stopping, Stopped | Error) => true,
            (Error, Connecting | Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CollectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
