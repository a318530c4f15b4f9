use crate::{
    error::DataError,
    event::{EventBus, PipelineEvent},
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

/// Attempts the flush sink is given per flush before the batch is discarded.
const FLUSH_SINK_ATTEMPTS: u32 = 3;

/// Buffer sizing & flush cadence.
#[derive(Clone, Debug)]
pub struct BufferConfig {
    /// Capacity `N`; pushes beyond it are dropped, never queued.
    pub max_size: usize,
    /// Fill percentage at which an immediate flush is scheduled ahead of the timer.
    /// Compared with `>=` against the fill ratio a new arrival finds.
    pub flush_threshold: f64,
    /// Periodic flush cadence; `None` disables the timer.
    pub flush_interval: Option<Duration>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            flush_threshold: 80.0,
            flush_interval: Some(Duration::from_millis(1000)),
        }
    }
}

/// Outcome of a [`RingBuffer::push`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PushOutcome {
    Accepted,
    /// Buffer was at capacity; the incoming item was discarded and a synchronous
    /// flush triggered.
    DroppedFull,
    /// Buffer was disposed.
    Closed,
}

/// Receives flushed batches. Backpressure lives here: the buffer hands over a snapshot
/// and retries the sink a bounded number of times, never across ticks.
#[async_trait]
pub trait FlushSink<T>: Send + Sync {
    async fn flush(&self, items: Vec<T>) -> Result<(), DataError>;
}

/// Point-in-time view of the buffer counters. `size` and `utilization_rate` move both
/// ways; everything else is monotonic.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferMetrics {
    pub size: usize,
    pub max_size: usize,
    pub total_items: u64,
    pub dropped_items: u64,
    pub flush_count: u64,
    /// Milliseconds since epoch of the last successful flush, if any.
    pub last_flush_ms: Option<i64>,
    pub utilization_rate: f64,
}

/// [`FlushSink`] forwarding flushed items in order onto a bounded channel, typically
/// the processor's record intake.
#[derive(Debug)]
pub struct ChannelSink<T> {
    tx: mpsc::Sender<T>,
}

impl<T> ChannelSink<T> {
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<T> FlushSink<T> for ChannelSink<T>
where
    T: Send + Sync + 'static,
{
    async fn flush(&self, items: Vec<T>) -> Result<(), DataError> {
        for item in items {
            self.tx
                .send(item)
                .await
                .map_err(|_| DataError::ChannelClosed {
                    consumer: "record intake",
                })?;
        }
        Ok(())
    }
}

/// Fixed-capacity FIFO slots addressed with modular head/tail indices.
#[derive(Debug)]
struct Slots<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    count: usize,
}

impl<T> Slots<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    fn store(&mut self, item: T) {
        debug_assert!(self.count < self.slots.len());
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.slots.len();
        self.count += 1;
    }

    /// Drain every buffered item in FIFO order, clearing the slot references.
    fn drain_all(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.count);
        while self.count > 0 {
            if let Some(item) = self.slots[self.head].take() {
                items.push(item);
            }
            self.head = (self.head + 1) % self.slots.len();
            self.count -= 1;
        }
        items
    }
}

/// Bounded FIFO with threshold- and timer-driven flushing into a [`FlushSink`].
///
/// `push` and `flush` are mutually exclusive over the slot state; the sink itself is
/// invoked outside the slot lock so producers are never blocked on downstream RTT.
pub struct RingBuffer<T> {
    id: String,
    config: BufferConfig,
    sink: Arc<dyn FlushSink<T>>,
    bus: EventBus,
    slots: Mutex<Slots<T>>,
    /// Serialises whole flush cycles (snapshot + sink attempts).
    flush_gate: tokio::sync::Mutex<()>,
    flush_notify: Notify,
    disposed: AtomicBool,
    total_items: AtomicU64,
    dropped_items: AtomicU64,
    flush_count: AtomicU64,
    last_flush_ms: AtomicI64,
    teardown: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> RingBuffer<T>
where
    T: Clone + Send + 'static,
{
    /// Construct the buffer and start its flush task (periodic timer + threshold
    /// wake-ups).
    pub fn new(
        id: impl Into<String>,
        config: BufferConfig,
        sink: Arc<dyn FlushSink<T>>,
        bus: EventBus,
    ) -> Arc<Self> {
        assert!(config.max_size > 0, "buffer capacity must be positive");
        assert!(
            config.flush_threshold > 0.0 && config.flush_threshold <= 100.0,
            "flush threshold must be within (0, 100]"
        );

        let buffer = Arc::new(Self {
            id: id.into(),
            slots: Mutex::new(Slots::with_capacity(config.max_size)),
            config,
            sink,
            bus,
            flush_gate: tokio::sync::Mutex::new(()),
            flush_notify: Notify::new(),
            disposed: AtomicBool::new(false),
            total_items: AtomicU64::new(0),
            dropped_items: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            last_flush_ms: AtomicI64::new(0),
            teardown: Mutex::new(Vec::new()),
            flush_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::run_flush_task(Arc::clone(&buffer)));
        *buffer.flush_task.lock() = Some(task);
        buffer
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.slots.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Register an action to run exactly once when the buffer is disposed.
    pub fn on_dispose(&self, action: Box<dyn FnOnce() + Send>) {
        self.teardown.lock().push(action);
    }

    /// Append `item` at the tail.
    ///
    /// A full buffer drops the incoming item (never the oldest), counts it, emits
    /// `BUFFER.FULL` and flushes synchronously. Reaching the flush threshold schedules
    /// an immediate flush on the flush task instead, so the push itself stays
    /// non-suspending.
    pub async fn push(&self, item: T) -> PushOutcome {
        if self.is_disposed() {
            return PushOutcome::Closed;
        }

        enum Trigger {
            None,
            Threshold,
            Full,
        }

        let trigger = {
            let mut slots = self.slots.lock();
            if slots.count == self.config.max_size {
                self.dropped_items.fetch_add(1, Ordering::SeqCst);
                Trigger::Full
            } else {
                let fill_before = slots.count as f64 * 100.0 / self.config.max_size as f64;
                slots.store(item);
                self.total_items.fetch_add(1, Ordering::SeqCst);
                if fill_before >= self.config.flush_threshold {
                    Trigger::Threshold
                } else {
                    Trigger::None
                }
            }
        };

        match trigger {
            Trigger::None => PushOutcome::Accepted,
            Trigger::Threshold => {
                self.flush_notify.notify_one();
                PushOutcome::Accepted
            }
            Trigger::Full => {
                warn!(
                    buffer = %self.id,
                    dropped = self.dropped_items.load(Ordering::SeqCst),
                    "buffer full, dropping newest item"
                );
                self.bus.publish(PipelineEvent::BufferFull {
                    id: self.id.clone(),
                    dropped: self.dropped_items.load(Ordering::SeqCst),
                    time: Utc::now(),
                });
                let _ = self.flush().await;
                PushOutcome::DroppedFull
            }
        }
    }

    /// Snapshot every buffered item, empty the buffer, and hand the snapshot to the
    /// sink with up to [`FLUSH_SINK_ATTEMPTS`] attempts. A batch the sink never accepts
    /// is discarded with a `BUFFER.ERROR` event. Flushing an empty buffer is a no-op.
    pub async fn flush(&self) -> Result<(), DataError> {
        let _gate = self.flush_gate.lock().await;

        let items = self.slots.lock().drain_all();
        if items.is_empty() {
            return Ok(());
        }
        let count = items.len();

        let mut last_error = String::new();
        for attempt in 1..=FLUSH_SINK_ATTEMPTS {
            match self.sink.flush(items.clone()).await {
                Ok(()) => {
                    self.flush_count.fetch_add(1, Ordering::SeqCst);
                    self.last_flush_ms
                        .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
                    self.bus.publish(PipelineEvent::BufferFlushed {
                        id: self.id.clone(),
                        count,
                        time: Utc::now(),
                    });
                    return Ok(());
                }
                Err(error) => {
                    debug!(buffer = %self.id, attempt, %error, "flush sink attempt failed");
                    last_error = error.to_string();
                }
            }
        }

        let abandoned = DataError::FlushAbandoned {
            id: self.id.clone(),
            attempts: FLUSH_SINK_ATTEMPTS,
            reason: last_error.clone(),
        };
        warn!(buffer = %self.id, count, %abandoned, "discarding batch after exhausted sink attempts");
        self.bus.publish(PipelineEvent::BufferError {
            id: self.id.clone(),
            reason: last_error,
            time: Utc::now(),
        });
        Err(abandoned)
    }

    /// Cancel the flush task and run every registered teardown action exactly once.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.flush_task.lock().take() {
            task.abort();
        }
        let actions = std::mem::take(&mut *self.teardown.lock());
        for action in actions {
            action();
        }
    }

    pub fn metrics(&self) -> BufferMetrics {
        let size = self.len();
        let last_flush_ms = self.last_flush_ms.load(Ordering::SeqCst);
        BufferMetrics {
            size,
            max_size: self.config.max_size,
            total_items: self.total_items.load(Ordering::SeqCst),
            dropped_items: self.dropped_items.load(Ordering::SeqCst),
            flush_count: self.flush_count.load(Ordering::SeqCst),
            last_flush_ms: (last_flush_ms > 0).then_some(last_flush_ms),
            utilization_rate: size as f64 * 100.0 / self.config.max_size as f64,
        }
    }

    /// Timer- and threshold-driven flush loop, cancelled by `dispose`.
    async fn run_flush_task(buffer: Arc<Self>) {
        let mut interval = buffer.config.flush_interval.map(|period| {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            interval
        });

        loop {
            match interval.as_mut() {
                Some(timer) => {
                    tokio::select! {
                        _ = buffer.flush_notify.notified() => {}
                        _ = timer.tick() => {
                            if buffer.is_empty() {
                                continue;
                            }
                        }
                    }
                }
                None => buffer.flush_notify.notified().await,
            }

            let _ = buffer.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    /// Sink recording every flushed batch.
    #[derive(Default)]
    struct CollectSink {
        batches: SyncMutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl FlushSink<u32> for CollectSink {
        async fn flush(&self, items: Vec<u32>) -> Result<(), DataError> {
            self.batches.lock().push(items);
            Ok(())
        }
    }

    /// Sink failing the first `failures` attempts.
    struct FlakySink {
        failures: AtomicU64,
        batches: SyncMutex<Vec<Vec<u32>>>,
    }

    impl FlakySink {
        fn failing(failures: u64) -> Self {
            Self {
                failures: AtomicU64::new(failures),
                batches: SyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FlushSink<u32> for FlakySink {
        async fn flush(&self, items: Vec<u32>) -> Result<(), DataError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(DataError::Storage("sink refused".to_owned()));
            }
            self.batches.lock().push(items);
            Ok(())
        }
    }

    fn config(max_size: usize, threshold: f64, interval: Option<Duration>) -> BufferConfig {
        BufferConfig {
            max_size,
            flush_threshold: threshold,
            flush_interval: interval,
        }
    }

    #[tokio::test]
    async fn test_threshold_flush_fires_on_arrival_after_reaching_threshold() {
        // {N=4, threshold=75%, no timer}: three pushes buffer quietly, the fourth
        // finds the buffer at 75% and triggers the flush.
        let sink = Arc::new(CollectSink::default());
        let buffer = RingBuffer::new(
            "test",
            config(4, 75.0, None),
            Arc::clone(&sink) as Arc<dyn FlushSink<u32>>,
            EventBus::new(8),
        );

        for item in [1, 2, 3] {
            assert_eq!(PushOutcome::Accepted, buffer.push(item).await);
        }
        tokio::task::yield_now().await;
        assert_eq!(0, buffer.metrics().flush_count);
        assert_eq!(3, buffer.len());

        assert_eq!(PushOutcome::Accepted, buffer.push(4).await);
        // The scheduled flush runs on the buffer's flush task.
        time::timeout(Duration::from_secs(1), async {
            while buffer.metrics().flush_count == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("threshold flush never ran");

        assert_eq!(0, buffer.len());
        assert_eq!(1, buffer.metrics().flush_count);
        assert_eq!(vec![vec![1, 2, 3, 4]], sink.batches.lock().clone());
        buffer.dispose().await;
    }

    #[tokio::test]
    async fn test_full_buffer_drops_newest_and_flushes_synchronously() {
        let sink = Arc::new(CollectSink::default());
        let buffer = RingBuffer::new(
            "test",
            config(2, 100.0, None),
            Arc::clone(&sink) as Arc<dyn FlushSink<u32>>,
            EventBus::new(8),
        );

        assert_eq!(PushOutcome::Accepted, buffer.push(1).await);
        assert_eq!(PushOutcome::Accepted, buffer.push(2).await);
        assert_eq!(PushOutcome::DroppedFull, buffer.push(3).await);

        let metrics = buffer.metrics();
        assert_eq!(0, metrics.size);
        assert_eq!(2, metrics.total_items);
        assert_eq!(1, metrics.dropped_items);
        assert_eq!(1, metrics.flush_count);
        // The dropped item is not stored.
        assert_eq!(vec![vec![1, 2]], sink.batches.lock().clone());
        buffer.dispose().await;
    }

    #[tokio::test]
    async fn test_buffer_bounds_invariant_under_push_storm() {
        let sink = Arc::new(CollectSink::default());
        let buffer = RingBuffer::new(
            "test",
            // Threshold 100% + pre-arrival comparison means only the full path drains.
            config(8, 100.0, None),
            Arc::clone(&sink) as Arc<dyn FlushSink<u32>>,
            EventBus::new(8),
        );

        let mut accepted = 0u64;
        let mut dropped = 0u64;
        for item in 0..50 {
            match buffer.push(item).await {
                PushOutcome::Accepted => accepted += 1,
                PushOutcome::DroppedFull => dropped += 1,
                PushOutcome::Closed => unreachable!(),
            }
            assert!(buffer.len() <= 8, "count exceeded capacity");
        }

        let metrics = buffer.metrics();
        assert_eq!(accepted, metrics.total_items);
        assert_eq!(dropped, metrics.dropped_items);
        assert_eq!(50, accepted + dropped);
        buffer.dispose().await;
    }

    #[tokio::test]
    async fn test_timer_flush_drains_non_empty_buffer() {
        let sink = Arc::new(CollectSink::default());
        let buffer = RingBuffer::new(
            "test",
            config(16, 100.0, Some(Duration::from_millis(20))),
            Arc::clone(&sink) as Arc<dyn FlushSink<u32>>,
            EventBus::new(8),
        );

        buffer.push(7).await;
        time::timeout(Duration::from_secs(1), async {
            while buffer.metrics().flush_count == 0 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timer flush never ran");

        assert_eq!(vec![vec![7]], sink.batches.lock().clone());
        buffer.dispose().await;
    }

    #[tokio::test]
    async fn test_flush_retries_sink_then_succeeds() {
        let sink = Arc::new(FlakySink::failing(2));
        let buffer = RingBuffer::new(
            "test",
            config(8, 100.0, None),
            Arc::clone(&sink) as Arc<dyn FlushSink<u32>>,
            EventBus::new(8),
        );

        buffer.push(1).await;
        buffer.flush().await.expect("third sink attempt succeeds");

        assert_eq!(vec![vec![1]], sink.batches.lock().clone());
        buffer.dispose().await;
    }

    #[tokio::test]
    async fn test_flush_discards_batch_after_exhausted_attempts() {
        let bus = EventBus::new(8);
        let mut events = bus.subscribe();
        let sink = Arc::new(FlakySink::failing(u64::MAX));
        let buffer = RingBuffer::new(
            "test",
            config(8, 100.0, None),
            Arc::clone(&sink) as Arc<dyn FlushSink<u32>>,
            bus,
        );

        buffer.push(1).await;
        assert!(buffer.flush().await.is_err());

        // Batch is gone; the buffer does not retry across ticks.
        assert!(buffer.is_empty());
        buffer.flush().await.expect("empty flush is a no-op");

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PipelineEvent::BufferError { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error, "BUFFER.ERROR event not emitted");
        buffer.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_closes_pushes() {
        let sink = Arc::new(CollectSink::default());
        let buffer = RingBuffer::new(
            "test",
            config(4, 100.0, Some(Duration::from_millis(10))),
            Arc::clone(&sink) as Arc<dyn FlushSink<u32>>,
            EventBus::new(8),
        );

        let ran = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ran);
        buffer.on_dispose(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        buffer.dispose().await;
        buffer.dispose().await;

        assert_eq!(1, ran.load(Ordering::SeqCst), "teardown ran more than once");
        assert_eq!(PushOutcome::Closed, buffer.push(1).await);
    }
}
