use crate::{
    config::{Config, ExchangeConfig},
    coordinator::{Coordinator, CoordinatorMetrics},
    error::DataError,
    event::EventBus,
    exchange::{binance::Binance, ConnectionParams, ExchangeAdapter},
    metric::{MetricSink, NullMetricSink},
    model::{OrderBookSnapshot, Symbol},
    processor::{store::RecordStore, Processor, ProcessorMetrics},
    protocol::{Connector, HttpRestClient, RestClient, WsConnector},
    reporter::ErrorReporter,
    shutdown::{shutdown_channel, ShutdownHandle, ShutdownReason},
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::info;

/// Capacity of the collector -> processor record intake channel.
const INTAKE_CAPACITY: usize = 1024;

/// Aggregated health view backing the host's status endpoint.
#[derive(Clone, Debug)]
pub struct PipelineStatus {
    pub coordinators: Vec<CoordinatorMetrics>,
    pub processor: ProcessorMetrics,
    pub bus_dropped: u64,
}

/// Wires one configuration bundle into a running pipeline: a [`Coordinator`] per
/// configured exchange, one shared [`Processor`], and the shutdown channel the host
/// triggers from its signal handler.
pub struct Pipeline {
    bus: EventBus,
    coordinators: Vec<Arc<Coordinator>>,
    processor: Arc<Processor>,
    intake_rx: Mutex<Option<mpsc::Receiver<OrderBookSnapshot>>>,
    processor_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: ShutdownHandle,
}

impl Pipeline {
    /// Assemble a pipeline from `config` against the production store, transport and
    /// REST client.
    pub fn from_config(config: Config) -> Result<Self, DataError> {
        let store = crate::processor::store::RedisStore::connect(&config.store)?;
        Self::with_collaborators(
            config,
            Arc::new(store),
            Arc::new(WsConnector),
            Arc::new(HttpRestClient::new()),
            Arc::new(NullMetricSink),
        )
    }

    /// Assemble a pipeline with explicit collaborators. Tests inject fakes here.
    pub fn with_collaborators(
        config: Config,
        store: Arc<dyn RecordStore>,
        connector: Arc<dyn Connector>,
        rest: Arc<dyn RestClient>,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Result<Self, DataError> {
        config.validate()?;

        let bus = EventBus::default();
        let (shutdown, listener) = shutdown_channel();
        let reporter = Arc::new(ErrorReporter::new(bus.clone()));
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);

        let processor = Processor::new(
            "processor-0",
            config.processor.clone(),
            store,
            bus.clone(),
            Arc::clone(&reporter),
            Arc::clone(&metric_sink),
            listener.clone(),
        );

        let mut coordinators = Vec::with_capacity(config.exchanges.len());
        for exchange in &config.exchanges {
            let adapter = build_adapter(exchange)?;
            let symbols: Vec<Symbol> = exchange.symbols.iter().map(Symbol::new).collect();
            coordinators.push(Coordinator::new(
                exchange.name.clone(),
                symbols,
                exchange.stream_limit_per_connection,
                adapter,
                Arc::clone(&connector),
                Arc::clone(&rest),
                config.collector.policy(),
                config.buffer.clone(),
                intake_tx.clone(),
                bus.clone(),
                Arc::clone(&reporter),
                Arc::clone(&metric_sink),
                listener.clone(),
            ));
        }

        Ok(Self {
            bus,
            coordinators,
            processor,
            intake_rx: Mutex::new(Some(intake_rx)),
            processor_task: Mutex::new(None),
            shutdown,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn coordinators(&self) -> &[Arc<Coordinator>] {
        &self.coordinators
    }

    /// Start the processor intake and every coordinator. Any coordinator failure stops
    /// whatever already started and aborts with the first error.
    pub async fn start(&self) -> Result<(), DataError> {
        let intake_rx = self
            .intake_rx
            .lock()
            .take()
            .ok_or(DataError::ChannelClosed {
                consumer: "record intake",
            })?;
        *self.processor_task.lock() = Some(tokio::spawn(Arc::clone(&self.processor).run(intake_rx)));

        let outcomes = join_all(
            self.coordinators
                .iter()
                .map(|coordinator| coordinator.start()),
        )
        .await;

        if let Some(err) = outcomes.into_iter().find_map(Result::err) {
            // A failed launch is an escalated failure, not a host-requested exit.
            self.shutdown.shutdown(ShutdownReason::Fatal {
                module: "coordinator".to_owned(),
            });
            self.stop().await;
            return Err(err);
        }

        info!(exchanges = self.coordinators.len(), "pipeline running");
        Ok(())
    }

    /// Request shutdown with an explicit reason, eg/ when the host decides a FATAL
    /// escalation on the bus is unrecoverable. The first reason requested wins.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        self.shutdown.shutdown(reason);
    }

    /// Graceful shutdown: signal every task, stop the coordinators, then wait for the
    /// processor to drain its buffer. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.shutdown(ShutdownReason::HostSignal);

        join_all(
            self.coordinators
                .iter()
                .map(|coordinator| coordinator.stop()),
        )
        .await;

        let task = self.processor_task.lock().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(10), task).await;
        }
        info!("pipeline stopped");
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            coordinators: self
                .coordinators
                .iter()
                .map(|coordinator| coordinator.metrics())
                .collect(),
            processor: self.processor.metrics(),
            bus_dropped: self.bus.dropped(),
        }
    }
}

/// Resolve the adapter for a configured exchange, overriding its endpoint & heartbeat
/// defaults with whatever the configuration pins down.
fn build_adapter(config: &ExchangeConfig) -> Result<Arc<dyn ExchangeAdapter>, DataError> {
    let base = match config.name.as_str() {
        "binance" => Binance::spot(),
        "binance_futures_usd" => Binance::futures_usd(),
        unsupported => {
            return Err(DataError::Config(format!(
                "unsupported exchange: {unsupported}"
            )))
        }
    };

    let defaults = base.params();
    let params = ConnectionParams {
        ws_url: if config.ws_url.is_empty() {
            defaults.ws_url
        } else {
            config.ws_url.clone()
        },
        rest_url: if config.rest_url.is_empty() {
            defaults.rest_url
        } else {
            config.rest_url.clone()
        },
        ping_every: config
            .ping_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.ping_every),
        pong_within: config
            .pong_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.pong_within),
        max_streams_per_connection: config.stream_limit_per_connection,
        ..defaults
    };

    Ok(Arc::new(base.with_params(params)))
}
