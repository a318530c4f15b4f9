use crate::{
    collector::state::CollectorState,
    error::{ErrorKind, Severity},
    model::OrderBookSnapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default fan-out capacity of the [`EventBus`]. Consumers lagging beyond this many
/// events drop the oldest (overflow is drop-and-count, never blocking the producer).
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Collector state transition payload, emitted after the state update takes effect.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct StateChange {
    pub id: String,
    pub prev: CollectorState,
    pub next: CollectorState,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub reason: String,
}

/// Tagged events published on the shared [`EventBus`]. Consumers filter by variant.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineEvent {
    StateChange(StateChange),
    ErrorEscalated {
        module: String,
        kind: ErrorKind,
        severity: Severity,
        message: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        time: DateTime<Utc>,
    },
    ErrorRecovered {
        module: String,
        attempts: u32,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        time: DateTime<Utc>,
    },
    ConnectionFailed {
        id: String,
        attempt: u32,
        reason: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        time: DateTime<Utc>,
    },
    BufferFlushed {
        id: String,
        count: usize,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        time: DateTime<Utc>,
    },
    BufferFull {
        id: String,
        dropped: u64,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        time: DateTime<Utc>,
    },
    BufferError {
        id: String,
        reason: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        time: DateTime<Utc>,
    },
    MarketData(OrderBookSnapshot),
}

impl PipelineEvent {
    /// Stable topic string for consumers that filter before deserialising payloads.
    pub fn topic(&self) -> &'static str {
        match self {
            PipelineEvent::StateChange(_) => "SYSTEM.STATE_CHANGE",
            PipelineEvent::ErrorEscalated { .. } => "SYSTEM.ERROR_ESCALATED",
            PipelineEvent::ErrorRecovered { .. } => "SYSTEM.ERROR_RECOVERED",
            PipelineEvent::ConnectionFailed { .. } => "SYSTEM.CONNECTION_FAILED",
            PipelineEvent::BufferFlushed { .. } => "BUFFER.FLUSHED",
            PipelineEvent::BufferFull { .. } => "BUFFER.FULL",
            PipelineEvent::BufferError { .. } => "BUFFER.ERROR",
            PipelineEvent::MarketData(_) => "MARKET_DATA",
        }
    }
}

/// Shared broadcast bus for [`PipelineEvent`]s.
///
/// Publication is fire-and-forget: `publish` never suspends and never fails the
/// producer. Events published with no live subscriber, and events a lagging subscriber
/// misses, are counted as dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    dropped: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// `Stream` view over the bus for consumers composing with stream combinators.
    pub fn stream(&self) -> BroadcastStream<PipelineEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Events published with no subscriber to deliver to.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
