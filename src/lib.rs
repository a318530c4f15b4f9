#![warn(rust_2018_idioms)]

//! # Marketflow
//! Normalised real-time market data ingestion for leading cryptocurrency exchanges.
//! For a configured set of exchanges & symbols, `marketflow` maintains long-lived
//! WebSocket order book streams, normalises heterogeneous exchange frames into one
//! canonical record shape, buffers records in bounded per-connection ring buffers, and
//! persists them in micro-batches to Redis with per-key TTLs.
//!
//! ## Architecture
//! Data flows exchange socket -> [`Collector`](collector::Collector) parsing ->
//! [`RingBuffer`](buffer::RingBuffer) -> [`Processor`](processor::Processor) batch ->
//! key/value store. Control flows from the
//! [`Coordinator`](coordinator::Coordinator), which shards a symbol list into
//! per-connection groups and drives one collector per group; collectors own their
//! connection state machine and publish every transition on the
//! [`EventBus`](event::EventBus).
//!
//! All exchange-specific knowledge lives behind the pure
//! [`ExchangeAdapter`](exchange::ExchangeAdapter) trait, keeping the collector
//! exchange-agnostic and unit-testable with a scripted adapter. Transport and storage
//! sit behind [`Connector`](protocol::Connector) / [`RestClient`](protocol::RestClient)
//! and [`RecordStore`](processor::store::RecordStore) seams for the same reason.
//!
//! Delivery is at-least-once with a bounded drop policy under sustained overload: a
//! full buffer drops the newest record rather than blocking the socket read loop, and
//! batches the store keeps refusing are persisted to a disk backup file and replayed.
//!
//! ## Example
//! ```no_run
//! use marketflow::{config::Config, pipeline::Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), marketflow::error::DataError> {
//!     let config = Config::load("marketflow.toml")?;
//!     let pipeline = Pipeline::from_config(config)?;
//!
//!     pipeline.start().await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     pipeline.stop().await;
//!     Ok(())
//! }
//! ```

/// Bounded ring buffer with threshold- and timer-driven flushing.
pub mod buffer;

/// Connection-owning collector: state machine, subscriptions, heartbeat, reconnect &
/// REST fallback.
pub mod collector;

/// Configuration bundle: TOML loading, environment overrides & validation.
pub mod config;

/// Per-exchange collector group management.
pub mod coordinator;

/// Error taxonomy & retry policies.
pub mod error;

/// Shared pipeline event bus.
pub mod event;

/// Exchange adapter contract & reference implementations.
pub mod exchange;

/// Best-effort metric sinks.
pub mod metric;

/// Canonical records & subscription state.
pub mod model;

/// Configuration-to-running-pipeline assembly.
pub mod pipeline;

/// Record validation, batching & persistence.
pub mod processor;

/// Transport seams: WebSocket & REST.
pub mod protocol;

/// Central error reporter with bounded per-module diagnostics.
pub mod reporter;

/// Watch-channel shutdown plumbing.
pub mod shutdown;

pub use crate::{
    buffer::{BufferConfig, PushOutcome, RingBuffer},
    collector::{state::CollectorState, Collector, CollectorPolicy},
    config::Config,
    coordinator::Coordinator,
    error::{DataError, ErrorKind, Severity},
    event::{EventBus, PipelineEvent},
    exchange::{ExchangeAdapter, ParsedFrame},
    model::{ExchangeId, Level, MarketType, OrderBookSnapshot, ProcessedRecord, Symbol},
    pipeline::Pipeline,
    processor::Processor,
};
