use crate::{
    buffer::{ChannelSink, FlushSink, RingBuffer},
    collector::{state::CollectorState, Collector, CollectorMetrics, CollectorPolicy},
    config::BufferSection,
    error::DataError,
    event::{EventBus, PipelineEvent},
    exchange::ExchangeAdapter,
    metric::MetricSink,
    model::{OrderBookSnapshot, Symbol},
    protocol::{Connector, RestClient},
    reporter::ErrorReporter,
    shutdown::ShutdownSignal,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Duration, Instant},
};
use tracing::{error, info, warn};

/// Minimum pause between restart attempts of the same collector, so a wedged adapter
/// cannot hot-loop restarts.
const MIN_RESTART_INTERVAL: Duration = Duration::from_secs(1);

/// Aggregated view over every collector the coordinator manages.
#[derive(Clone, Debug)]
pub struct CoordinatorMetrics {
    pub exchange: String,
    pub total_connectors: usize,
    /// Collectors currently RUNNING.
    pub active_connectors: usize,
    pub total_messages: u64,
    pub collectors: Vec<CollectorMetrics>,
}

struct CollectorSlot {
    collector: Arc<Collector>,
    last_restart: Option<Instant>,
}

/// Shards an exchange's symbol list into per-connection groups and manages one
/// [`Collector`] per group: parallel start with error aggregation, best-effort stop,
/// and paced restarts of collectors that end in ERROR.
pub struct Coordinator {
    exchange: String,
    groups: Vec<Vec<Symbol>>,
    adapter: Arc<dyn ExchangeAdapter>,
    connector: Arc<dyn Connector>,
    rest: Arc<dyn RestClient>,
    policy: CollectorPolicy,
    buffer: BufferSection,
    intake_tx: mpsc::Sender<OrderBookSnapshot>,
    bus: EventBus,
    reporter: Arc<ErrorReporter>,
    metric_sink: Arc<dyn MetricSink>,
    shutdown: ShutdownSignal,
    slots: Mutex<Vec<CollectorSlot>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: impl Into<String>,
        symbols: Vec<Symbol>,
        stream_limit: usize,
        adapter: Arc<dyn ExchangeAdapter>,
        connector: Arc<dyn Connector>,
        rest: Arc<dyn RestClient>,
        policy: CollectorPolicy,
        buffer: BufferSection,
        intake_tx: mpsc::Sender<OrderBookSnapshot>,
        bus: EventBus,
        reporter: Arc<ErrorReporter>,
        metric_sink: Arc<dyn MetricSink>,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            exchange: exchange.into(),
            groups: shard_symbols(symbols, stream_limit),
            adapter,
            connector,
            rest,
            policy,
            buffer,
            intake_tx,
            bus,
            reporter,
            metric_sink,
            shutdown,
            slots: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Symbol groups in declaration order, each within the per-connection limit.
    pub fn groups(&self) -> &[Vec<Symbol>] {
        &self.groups
    }

    fn collector_id(&self, index: usize) -> String {
        format!("{}-{}", self.exchange, index)
    }

    fn build_collector(&self, index: usize) -> Arc<Collector> {
        let id = self.collector_id(index);
        let buffer = RingBuffer::new(
            format!("{id}-buffer"),
            self.buffer.buffer_config(),
            Arc::new(ChannelSink::new(self.intake_tx.clone()))
                as Arc<dyn FlushSink<OrderBookSnapshot>>,
            self.bus.clone(),
        );
        Collector::new(
            id,
            self.groups[index].clone(),
            Arc::clone(&self.adapter),
            Arc::clone(&self.connector),
            Arc::clone(&self.rest),
            self.policy.clone(),
            buffer,
            self.bus.clone(),
            Arc::clone(&self.reporter),
            Arc::clone(&self.metric_sink),
            self.shutdown.clone(),
        )
    }

    /// Create and start one collector per group, in parallel. Any start failure stops
    /// every collector (including the ones that started) and aborts with the first
    /// error.
    pub async fn start(self: &Arc<Self>) -> Result<(), DataError> {
        let collectors: Vec<Arc<Collector>> = (0..self.groups.len())
            .map(|index| self.build_collector(index))
            .collect();

        {
            let mut slots = self.slots.lock();
            *slots = collectors
                .iter()
                .map(|collector| CollectorSlot {
                    collector: Arc::clone(collector),
                    last_restart: None,
                })
                .collect();
        }

        info!(
            exchange = %self.exchange,
            connectors = collectors.len(),
            "starting collector group"
        );

        let outcomes = join_all(collectors.iter().map(|collector| collector.start())).await;
        let mut first_error = None;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            if let Err(err) = outcome {
                error!(
                    exchange = %self.exchange,
                    collector = %self.collector_id(index),
                    %err,
                    "collector failed to start"
                );
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        if let Some(err) = first_error {
            // Abort: tear everything down, including collectors that did start.
            join_all(collectors.iter().map(|collector| collector.stop())).await;
            return Err(err);
        }

        let supervisor = tokio::spawn(Arc::clone(self).supervise());
        *self.supervisor.lock() = Some(supervisor);
        Ok(())
    }

    /// Best-effort stop of every collector; failures are logged, never propagated.
    pub async fn stop(&self) {
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }

        let collectors: Vec<Arc<Collector>> = self
            .slots
            .lock()
            .iter()
            .map(|slot| Arc::clone(&slot.collector))
            .collect();

        join_all(collectors.iter().map(|collector| collector.stop())).await;
        info!(exchange = %self.exchange, "collector group stopped");
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        let collectors: Vec<CollectorMetrics> = self
            .slots
            .lock()
            .iter()
            .map(|slot| slot.collector.metrics())
            .collect();

        CoordinatorMetrics {
            exchange: self.exchange.clone(),
            total_connectors: self.groups.len(),
            active_connectors: collectors
                .iter()
                .filter(|metrics| metrics.state == CollectorState::Running)
                .count(),
            total_messages: collectors.iter().map(|metrics| metrics.messages_total).sum(),
            collectors,
        }
    }

    /// Watch the event bus for collectors of this group ending in ERROR and restart
    /// them, paced at [`MIN_RESTART_INTERVAL`] per collector.
    async fn supervise(self: Arc<Self>) {
        let mut events = self.bus.subscribe();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Ok(PipelineEvent::StateChange(change)) if change.next == CollectorState::Error => {
                        if let Some(index) = self.slot_index_of(&change.id) {
                            self.restart_collector(index).await;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(exchange = %self.exchange, missed, "supervisor lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    fn slot_index_of(&self, collector_id: &str) -> Option<usize> {
        (0..self.groups.len()).find(|index| self.collector_id(*index) == collector_id)
    }

    /// Stop the failed collector, build a fresh one for the same group and start it.
    /// Attempts against the same slot are spaced at least [`MIN_RESTART_INTERVAL`]
    /// apart.
    async fn restart_collector(self: &Arc<Self>, index: usize) {
        let pause = {
            let slots = self.slots.lock();
            slots
                .get(index)
                .and_then(|slot| slot.last_restart)
                .and_then(|last| MIN_RESTART_INTERVAL.checked_sub(last.elapsed()))
        };
        if let Some(pause) = pause {
            time::sleep(pause).await;
        }

        let old = match self.slots.lock().get(index) {
            Some(slot) => Arc::clone(&slot.collector),
            None => return,
        };
        old.stop().await;

        let replacement = self.build_collector(index);
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(index) {
                slot.collector = Arc::clone(&replacement);
                slot.last_restart = Some(Instant::now());
            }
        }

        info!(
            exchange = %self.exchange,
            collector = %self.collector_id(index),
            "restarting collector after terminal error"
        );
        if let Err(err) = replacement.start().await {
            // The failed start lands the replacement in ERROR, which re-enters this
            // path via the bus on the next event, still paced per collector.
            error!(
                exchange = %self.exchange,
                collector = %self.collector_id(index),
                %err,
                "collector restart failed"
            );
        }
    }
}

/// Chunk `symbols` in declaration order into groups of at most `stream_limit`.
fn shard_symbols(symbols: Vec<Symbol>, stream_limit: usize) -> Vec<Vec<Symbol>> {
    let limit = stream_limit.max(1);
    symbols
        .chunks(limit)
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_symbols_chunks_in_declaration_order() {
        struct TestCase {
            input_symbols: Vec<&'static str>,
            input_limit: usize,
            expected: Vec<Vec<&'static str>>,
        }

        let cases = vec![
            TestCase {
                // TC0: last group smaller
                input_symbols: vec!["A", "B", "C"],
                input_limit: 2,
                expected: vec![vec!["A", "B"], vec!["C"]],
            },
            TestCase {
                // TC1: exact multiple
                input_symbols: vec!["A", "B", "C", "D"],
                input_limit: 2,
                expected: vec![vec!["A", "B"], vec!["C", "D"]],
            },
            TestCase {
                // TC2: limit larger than the list
                input_symbols: vec!["A"],
                input_limit: 10,
                expected: vec![vec!["A"]],
            },
            TestCase {
                // TC3: zero limit treated as one stream per connection
                input_symbols: vec!["A", "B"],
                input_limit: 0,
                expected: vec![vec!["A"], vec!["B"]],
            },
            TestCase {
                // TC4: empty list yields no groups
                input_symbols: vec![],
                input_limit: 3,
                expected: vec![],
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = shard_symbols(
                test.input_symbols.into_iter().map(Symbol::new).collect(),
                test.input_limit,
            );
            let expected: Vec<Vec<Symbol>> = test
                .expected
                .into_iter()
                .map(|group| group.into_iter().map(Symbol::new).collect())
                .collect();
            assert_eq!(expected, actual, "TC{} failed", index);
        }
    }
}
