use crate::{
    buffer::{BufferConfig, FlushSink, RingBuffer},
    config::ProcessorSection,
    error::{DataError, RetryPolicy},
    event::{EventBus, PipelineEvent},
    metric::{Metric, MetricSink},
    model::{ExchangeId, OrderBookSnapshot, ProcessedRecord},
    reporter::ErrorReporter,
    shutdown::ShutdownSignal,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time};
use tracing::{debug, info, warn};

/// Disk backup for batches the store refused.
pub mod backup;
/// Key/value store seam & implementations.
pub mod store;

use backup::BackupFile;
use store::RecordStore;

/// Backoff retries after a failed pipeline write, each preceded by its 100/200/400ms
/// tier, before the chunk is persisted to the backup file.
const STORE_RETRIES: u32 = 3;

/// Deadline applied to each individual store attempt.
const STORE_ATTEMPT_DEADLINE: Duration = Duration::from_secs(5);

/// Flushes completing faster than this grow the adaptive batch target.
const FAST_FLUSH: Duration = Duration::from_millis(50);

const TARGET_GROWTH: f64 = 1.2;
const TARGET_DECAY: f64 = 0.8;
const TARGET_FLOOR: usize = 10;

/// Point-in-time processor counters.
#[derive(Clone, Debug)]
pub struct ProcessorMetrics {
    pub id: String,
    pub batches_processed: u64,
    pub records_processed: u64,
    pub dropped_invalid: u64,
    pub backup_batches: u64,
    pub backup_drained: u64,
    pub batch_target: usize,
    /// Rolling average pipeline write duration in milliseconds.
    pub avg_batch_ms: f64,
    pub buffer: crate::buffer::BufferMetrics,
}

#[derive(Debug, Default)]
struct RollingAverage {
    avg_ms: f64,
    samples: u64,
}

impl RollingAverage {
    fn observe(&mut self, elapsed: Duration) {
        self.samples += 1;
        let value = elapsed.as_secs_f64() * 1000.0;
        self.avg_ms += (value - self.avg_ms) / self.samples as f64;
    }
}

/// Drains flushed snapshots into the store in adaptive, retriable pipeline chunks.
///
/// A chunk the store still refuses after [`STORE_RETRIES`] backoff retries is appended
/// to the backup file instead of being lost; the next successful pipeline drains the
/// backup back into the store and unlinks it.
struct StoreSink {
    id: String,
    store: Arc<dyn RecordStore>,
    backup: BackupFile,
    reporter: Arc<ErrorReporter>,
    batch_target: AtomicUsize,
    max_target: usize,
    batches_processed: AtomicU64,
    records_processed: AtomicU64,
    backup_batches: AtomicU64,
    backup_drained: AtomicU64,
    timing: Mutex<RollingAverage>,
}

impl StoreSink {
    /// Single pipeline write: an initial try plus [`STORE_RETRIES`] retries, each
    /// preceded by its backoff tier (100, 200, then 400ms) and bounded by the
    /// per-attempt deadline.
    async fn write_chunk(&self, chunk: &[ProcessedRecord]) -> Result<Duration, DataError> {
        let retry = RetryPolicy::new(
            STORE_RETRIES,
            Duration::from_millis(100),
            Duration::from_millis(400),
        );
        let mut last_error = DataError::Storage("no attempt made".to_owned());

        for failures in 0..=STORE_RETRIES {
            if failures > 0 {
                time::sleep(retry.delay(failures)).await;
            }

            let started = time::Instant::now();
            match time::timeout(STORE_ATTEMPT_DEADLINE, self.store.write_batch(chunk)).await {
                Ok(Ok(())) => {
                    if failures > 0 {
                        self.reporter.recovered(&self.id, failures);
                    }
                    return Ok(started.elapsed());
                }
                Ok(Err(error)) => last_error = error,
                Err(_) => {
                    last_error = DataError::Deadline {
                        operation: "store write",
                        timeout_ms: STORE_ATTEMPT_DEADLINE.as_millis() as u64,
                    }
                }
            }

            self.reporter.report(&self.id, &last_error);
        }

        Err(last_error)
    }

    fn grow_target(&self) {
        let current = self.batch_target.load(Ordering::Relaxed);
        let grown = ((current as f64 * TARGET_GROWTH) as usize).max(current + 1);
        self.batch_target
            .store(grown.min(self.max_target), Ordering::Relaxed);
    }

    fn shrink_target(&self) {
        let current = self.batch_target.load(Ordering::Relaxed);
        let shrunk = (current as f64 * TARGET_DECAY) as usize;
        self.batch_target
            .store(shrunk.max(TARGET_FLOOR), Ordering::Relaxed);
    }

    /// Replay every backed-up batch into the store, unlinking the file when all of it
    /// landed.
    async fn drain_backup(&self) -> Result<(), DataError> {
        if !self.backup.exists().await {
            return Ok(());
        }

        let batches = self.backup.read_batches().await?;
        let count = batches.len();
        for batch in &batches {
            self.write_chunk(batch).await?;
            self.records_processed
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.batches_processed.fetch_add(1, Ordering::Relaxed);
        }

        self.backup.remove().await?;
        self.backup_drained
            .fetch_add(count as u64, Ordering::Relaxed);
        info!(id = %self.id, batches = count, "backup file drained into store");
        Ok(())
    }
}

#[async_trait]
impl FlushSink<ProcessedRecord> for StoreSink {
    async fn flush(&self, items: Vec<ProcessedRecord>) -> Result<(), DataError> {
        let mut index = 0;

        while index < items.len() {
            let target = self.batch_target.load(Ordering::Relaxed).max(1);
            let end = (index + target).min(items.len());
            let chunk = &items[index..end];

            match self.write_chunk(chunk).await {
                Ok(elapsed) => {
                    self.batches_processed.fetch_add(1, Ordering::Relaxed);
                    self.records_processed
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    self.timing.lock().observe(elapsed);
                    if elapsed < FAST_FLUSH {
                        self.grow_target();
                    }
                    // A healthy pipeline is the signal to replay earlier failures.
                    if let Err(error) = self.drain_backup().await {
                        self.reporter.report(&self.id, &error);
                    }
                }
                Err(error) => {
                    self.shrink_target();
                    warn!(id = %self.id, count = chunk.len(), %error, "pipeline failed, persisting chunk to backup");
                    // The backup write is the last line of defence: only its failure
                    // makes the flush fail (and the buffer retry).
                    self.backup.append_batch(chunk).await?;
                    self.backup_batches.fetch_add(1, Ordering::Relaxed);
                }
            }

            index = end;
        }

        Ok(())
    }
}

/// Consumes canonical records, validates them, stamps them as [`ProcessedRecord`]s and
/// persists them in micro-batches with per-key TTLs.
pub struct Processor {
    id: String,
    config: ProcessorSection,
    buffer: Arc<RingBuffer<ProcessedRecord>>,
    sink: Arc<StoreSink>,
    dropped_invalid: AtomicU64,
    reporter: Arc<ErrorReporter>,
    metric_sink: Arc<dyn MetricSink>,
    bus: EventBus,
    shutdown: ShutdownSignal,
}

impl Processor {
    pub fn new(
        id: impl Into<String>,
        config: ProcessorSection,
        store: Arc<dyn RecordStore>,
        bus: EventBus,
        reporter: Arc<ErrorReporter>,
        metric_sink: Arc<dyn MetricSink>,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        let id = id.into();
        let sink = Arc::new(StoreSink {
            id: id.clone(),
            store,
            backup: BackupFile::new(&config.backup_path),
            reporter: Arc::clone(&reporter),
            batch_target: AtomicUsize::new(config.batch_size.max(1)),
            max_target: config.max_buffer_size.max(1),
            batches_processed: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
            backup_batches: AtomicU64::new(0),
            backup_drained: AtomicU64::new(0),
            timing: Mutex::new(RollingAverage::default()),
        });

        let buffer = RingBuffer::new(
            format!("{id}-buffer"),
            BufferConfig {
                max_size: config.max_buffer_size.max(1),
                flush_threshold: batch_threshold_percent(config.batch_size, config.max_buffer_size),
                flush_interval: (config.batch_interval_ms > 0)
                    .then(|| Duration::from_millis(config.batch_interval_ms)),
            },
            Arc::clone(&sink) as Arc<dyn FlushSink<ProcessedRecord>>,
            bus.clone(),
        );

        Arc::new(Self {
            id,
            config,
            buffer,
            sink,
            dropped_invalid: AtomicU64::new(0),
            reporter,
            metric_sink,
            bus,
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Validate and buffer one incoming record. Rejects are counted and reported, and
    /// never enter the buffer.
    pub async fn process(&self, snapshot: OrderBookSnapshot) {
        if let Err(error) = self.validate(&snapshot) {
            self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            self.reporter.report(&self.id, &error);
            return;
        }

        let record = ProcessedRecord::new(snapshot, self.id.clone(), Utc::now());
        self.buffer.push(record).await;
    }

    fn validate(&self, snapshot: &OrderBookSnapshot) -> Result<(), DataError> {
        let now = Utc::now();
        snapshot.validate(now)?;

        if self.config.max_data_age_ms > 0 {
            let age_ms = now.timestamp_millis() - snapshot.timestamp_ms();
            if age_ms > self.config.max_data_age_ms as i64 {
                return Err(DataError::InvalidRecord(format!(
                    "record for {} is {age_ms}ms old, exceeding the {}ms age limit",
                    snapshot.symbol, self.config.max_data_age_ms
                )));
            }
        }
        Ok(())
    }

    /// Drain a record intake channel until it closes or shutdown is signalled, then
    /// flush what remains and dispose the buffer.
    pub async fn run(self: Arc<Self>, mut intake: mpsc::Receiver<OrderBookSnapshot>) {
        info!(id = %self.id, "processor intake running");
        let mut shutdown = self.shutdown.clone();
        let mut housekeeping = time::interval(Duration::from_secs(1));
        housekeeping.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                reason = shutdown.recv() => {
                    info!(id = %self.id, %reason, "processor draining for shutdown");
                    break;
                }
                record = intake.recv() => match record {
                    Some(record) => self.process(record).await,
                    None => break,
                },
                _ = housekeeping.tick() => self.emit_metrics(),
            }
        }

        let _ = self.buffer.flush().await;
        self.buffer.dispose().await;
        info!(id = %self.id, "processor intake stopped");
    }

    /// Alternative intake: subscribe to `MARKET_DATA` events on the bus, optionally
    /// filtered to one exchange.
    pub async fn run_from_bus(self: Arc<Self>, exchange: Option<ExchangeId>) {
        info!(id = %self.id, ?exchange, "processor bus intake running");
        let mut events = self.bus.subscribe();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                reason = shutdown.recv() => {
                    info!(id = %self.id, %reason, "processor draining for shutdown");
                    break;
                }
                event = events.recv() => match event {
                    Ok(PipelineEvent::MarketData(record)) => {
                        if exchange
                            .as_ref()
                            .map(|wanted| wanted == &record.exchange)
                            .unwrap_or(true)
                        {
                            self.process(record).await;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(id = %self.id, missed, "processor lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        let _ = self.buffer.flush().await;
        self.buffer.dispose().await;
        info!(id = %self.id, "processor bus intake stopped");
    }

    /// Force a drain of everything currently buffered.
    pub async fn flush(&self) -> Result<(), DataError> {
        self.buffer.flush().await
    }

    pub fn metrics(&self) -> ProcessorMetrics {
        ProcessorMetrics {
            id: self.id.clone(),
            batches_processed: self.sink.batches_processed.load(Ordering::Relaxed),
            records_processed: self.sink.records_processed.load(Ordering::Relaxed),
            dropped_invalid: self.dropped_invalid.load(Ordering::Relaxed),
            backup_batches: self.sink.backup_batches.load(Ordering::Relaxed),
            backup_drained: self.sink.backup_drained.load(Ordering::Relaxed),
            batch_target: self.sink.batch_target.load(Ordering::Relaxed),
            avg_batch_ms: self.sink.timing.lock().avg_ms,
            buffer: self.buffer.metrics(),
        }
    }

    fn emit_metrics(&self) {
        let metrics = self.metrics();
        self.metric_sink.record(
            Metric::new("processor_records_processed", metrics.records_processed as f64)
                .with_label("processor", self.id.clone()),
        );
        self.metric_sink.record(
            Metric::new("processor_dropped_invalid", metrics.dropped_invalid as f64)
                .with_label("processor", self.id.clone()),
        );
        self.metric_sink.record(
            Metric::new("processor_batch_target", metrics.batch_target as f64)
                .with_label("processor", self.id.clone()),
        );
    }
}

fn batch_threshold_percent(batch_size: usize, max_buffer_size: usize) -> f64 {
    if max_buffer_size == 0 {
        return 100.0;
    }
    (batch_size as f64 * 100.0 / max_buffer_size as f64).clamp(1.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{datetime_from_epoch_ms, Level, MarketType, Symbol};
    use rust_decimal_macros::dec;
    use store::MemoryStore;

    fn snapshot(timestamp_ms: i64, bids: Vec<Level>, asks: Vec<Level>) -> OrderBookSnapshot {
        OrderBookSnapshot {
            exchange: ExchangeId::new("binance"),
            market: MarketType::Spot,
            symbol: Symbol::new("BTC-USDT"),
            ticker: "BTCUSDT".to_owned(),
            time: datetime_from_epoch_ms(timestamp_ms),
            bids,
            asks,
        }
    }

    fn valid_snapshot() -> OrderBookSnapshot {
        snapshot(
            Utc::now().timestamp_millis(),
            vec![Level::new(dec!(100.00), dec!(1)), Level::new(dec!(99.50), dec!(2))],
            vec![Level::new(dec!(100.10), dec!(1)), Level::new(dec!(100.20), dec!(3))],
        )
    }

    fn processor(store: Arc<MemoryStore>, config: ProcessorSection) -> Arc<Processor> {
        let bus = EventBus::new(64);
        let reporter = Arc::new(ErrorReporter::new(bus.clone()));
        let (_, listener) = crate::shutdown::shutdown_channel();
        Processor::new(
            "processor-1",
            config,
            store,
            bus,
            reporter,
            Arc::new(crate::metric::NullMetricSink),
            listener,
        )
    }

    fn test_config(backup_dir: &tempfile::TempDir) -> ProcessorSection {
        ProcessorSection {
            batch_size: 10,
            batch_interval_ms: 0,
            max_buffer_size: 100,
            max_data_age_ms: 0,
            backup_path: backup_dir
                .path()
                .join("failed_batches.ndjson")
                .to_string_lossy()
                .into_owned(),
        }
    }

    #[tokio::test]
    async fn test_valid_records_are_stored_with_both_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let processor = processor(Arc::clone(&store), test_config(&dir));

        processor.process(valid_snapshot()).await;
        processor.flush().await.unwrap();

        let metrics = processor.metrics();
        assert_eq!(1, metrics.records_processed);
        assert_eq!(1, metrics.batches_processed);
        assert_eq!(1, store.market_keys().len());
        assert!(store.get("bookTicker:binance:spot:BTC-USDT").is_some());
    }

    #[tokio::test]
    async fn test_mis_sorted_bids_are_rejected_not_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let processor = processor(Arc::clone(&store), test_config(&dir));

        // Bids ascending: violates the strictly-descending invariant.
        processor
            .process(snapshot(
                Utc::now().timestamp_millis(),
                vec![Level::new(dec!(99.50), dec!(2)), Level::new(dec!(100.00), dec!(1))],
                vec![Level::new(dec!(100.10), dec!(1))],
            ))
            .await;
        processor.flush().await.unwrap();

        let metrics = processor.metrics();
        assert_eq!(1, metrics.dropped_invalid);
        assert_eq!(0, metrics.records_processed);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_future_timestamp_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let processor = processor(Arc::clone(&store), test_config(&dir));

        processor
            .process(snapshot(
                Utc::now().timestamp_millis() + 10_000,
                vec![Level::new(dec!(100.00), dec!(1))],
                vec![],
            ))
            .await;

        assert_eq!(1, processor.metrics().dropped_invalid);
    }

    #[tokio::test]
    async fn test_backup_round_trip_after_exhausted_store_retries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let processor = processor(Arc::clone(&store), test_config(&dir));
        let backup = BackupFile::new(dir.path().join("failed_batches.ndjson"));

        // First batch: the initial try and every backoff retry refused -> batch lands
        // in the backup file.
        store.refuse_next(STORE_RETRIES + 1);
        let first = valid_snapshot();
        processor.process(first.clone()).await;
        processor.flush().await.unwrap();

        assert!(backup.exists().await);
        assert!(store.is_empty());
        assert_eq!(1, processor.metrics().backup_batches);

        // Second batch succeeds and drains the backup: both batches land exactly once.
        let second = snapshot(
            first.timestamp_ms() + 1,
            vec![Level::new(dec!(101.00), dec!(1))],
            vec![],
        );
        processor.process(second).await;
        processor.flush().await.unwrap();

        assert!(!backup.exists().await, "backup file not unlinked");
        assert_eq!(2, store.market_keys().len());
        let metrics = processor.metrics();
        assert_eq!(1, metrics.backup_drained);
        assert_eq!(2, metrics.records_processed);
    }

    #[tokio::test]
    async fn test_adaptive_batch_target_shrinks_on_failure_and_grows_when_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut config = test_config(&dir);
        config.batch_size = 50;
        let processor = processor(Arc::clone(&store), config);

        // Failure path: target decays by 0.8.
        store.refuse_next(STORE_RETRIES + 1);
        processor.process(valid_snapshot()).await;
        processor.flush().await.unwrap();
        assert_eq!(40, processor.metrics().batch_target);

        // Fast success path: target grows by 1.2 (memory store flushes are instant).
        processor
            .process(snapshot(
                Utc::now().timestamp_millis(),
                vec![Level::new(dec!(100.00), dec!(1))],
                vec![],
            ))
            .await;
        processor.flush().await.unwrap();
        assert_eq!(48, processor.metrics().batch_target);
    }

    #[test]
    fn test_batch_threshold_percent_clamps() {
        assert_eq!(10.0, batch_threshold_percent(10, 100));
        assert_eq!(100.0, batch_threshold_percent(200, 100));
        assert_eq!(1.0, batch_threshold_percent(0, 100));
    }
}
