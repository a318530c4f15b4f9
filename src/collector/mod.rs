use crate::{
    buffer::RingBuffer,
    error::{DataError, RetryPolicy},
    event::{EventBus, PipelineEvent, StateChange},
    exchange::{ConnectionParams, ExchangeAdapter, ParsedFrame},
    metric::{Metric, MetricSink},
    model::{
        subscription::{SubscriptionMap, SubscriptionState},
        OrderBookSnapshot, Symbol, MAX_FUTURE_SKEW_MS,
    },
    protocol::{Connection, Connector, Frame, RestClient},
    reporter::ErrorReporter,
    shutdown::ShutdownSignal,
};
use chrono::Utc;
use parking_lot::Mutex;
use self::state::CollectorState;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info, warn};

/// Collector lifecycle states & the transition legality table.
pub mod state;

/// Fingerprints remembered across the WebSocket/REST seam before the window resets.
const DEDUP_WINDOW_CAPACITY: usize = 10_000;

/// Housekeeping cadence: ACK deadlines, pong deadline & metric emission.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(500);

/// Reconnect & fallback pacing for one collector.
#[derive(Clone, Debug)]
pub struct CollectorPolicy {
    pub max_reconnect_attempts: u32,
    /// Backoff base: delay before reconnect attempt `k` is
    /// `min(reconnect_interval * 2^(k-1), max_reconnect_backoff)`.
    pub reconnect_interval: Duration,
    pub max_reconnect_backoff: Duration,
    pub rest_interval: Duration,
    pub max_rest_backoff: Duration,
}

impl Default for CollectorPolicy {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_interval: Duration::from_millis(5000),
            max_reconnect_backoff: Duration::from_millis(30000),
            rest_interval: Duration::from_millis(5000),
            max_rest_backoff: Duration::from_millis(30000),
        }
    }
}

impl CollectorPolicy {
    fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_reconnect_attempts,
            self.reconnect_interval,
            self.max_reconnect_backoff,
        )
    }

    fn rest_policy(&self) -> RetryPolicy {
        RetryPolicy::new(u32::MAX, self.rest_interval, self.max_rest_backoff)
    }
}

/// Monotonic collector counters. Snapshots are taken via [`Collector::metrics`].
#[derive(Debug, Default)]
pub struct CollectorCounters {
    pub messages_total: AtomicU64,
    pub records_enqueued: AtomicU64,
    pub records_rejected: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub unexpected_symbols: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub rest_polls: AtomicU64,
}

/// Point-in-time collector health view.
#[derive(Clone, Debug)]
pub struct CollectorMetrics {
    pub id: String,
    pub state: CollectorState,
    pub messages_total: u64,
    pub records_enqueued: u64,
    pub records_rejected: u64,
    pub duplicates_dropped: u64,
    pub unexpected_symbols: u64,
    pub parse_errors: u64,
    pub reconnects: u64,
    pub rest_polls: u64,
    pub buffer: crate::buffer::BufferMetrics,
}

/// Sliding set of `(symbol, timestamp)` record fingerprints. When the window fills it
/// is cleared entirely rather than evicted piecemeal.
#[derive(Debug)]
struct DedupWindow {
    seen: HashSet<(Symbol, i64)>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            capacity,
        }
    }

    /// Returns `false` when the fingerprint was already present (a duplicate).
    fn admit(&mut self, fingerprint: (Symbol, i64)) -> bool {
        if self.seen.len() >= self.capacity {
            self.seen.clear();
        }
        self.seen.insert(fingerprint)
    }
}

enum Command {
    Subscribe(Vec<Symbol>, oneshot::Sender<Result<(), DataError>>),
    Unsubscribe(Vec<Symbol>, oneshot::Sender<Result<(), DataError>>),
    Stop(oneshot::Sender<()>),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum RequestKind {
    Subscribe,
    Unsubscribe,
}

struct PendingRequest {
    kind: RequestKind,
    symbols: Vec<Symbol>,
    deadline: Instant,
}

/// How a streaming session ended.
enum SessionEnd {
    /// External stop (command or shutdown signal).
    Stop(Option<oneshot::Sender<()>>),
    /// Connection closed or became unusable; the reconnect policy applies.
    Disconnected(String),
}

/// Outcome of the fallback polling loop.
enum FallbackEnd {
    Stop(Option<oneshot::Sender<()>>),
    /// Streaming path probed healthy; carries the freshly established connection.
    Recovered(Box<dyn Connection>),
}

struct StateCell {
    current: CollectorState,
}

/// Owns one streaming connection and the subscription set for one group of symbols.
///
/// A single task drives the whole lifecycle: dialling, subscription actioning, the
/// socket read loop, heartbeating, reconnect backoff and REST fallback. Parsed records
/// flow into the collector's [`RingBuffer`]; state transitions are published on the
/// event bus after they take effect.
pub struct Collector {
    id: String,
    adapter: Arc<dyn ExchangeAdapter>,
    connector: Arc<dyn Connector>,
    rest: Arc<dyn RestClient>,
    policy: CollectorPolicy,
    buffer: Arc<RingBuffer<OrderBookSnapshot>>,
    subscriptions: Mutex<SubscriptionMap>,
    symbols: Vec<Symbol>,
    state: Mutex<StateCell>,
    bus: EventBus,
    reporter: Arc<ErrorReporter>,
    metric_sink: Arc<dyn MetricSink>,
    counters: CollectorCounters,
    dedup: Mutex<DedupWindow>,
    request_seq: AtomicU64,
    command_tx: Mutex<Option<mpsc::Sender<Command>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: ShutdownSignal,
}

impl Collector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        symbols: Vec<Symbol>,
        adapter: Arc<dyn ExchangeAdapter>,
        connector: Arc<dyn Connector>,
        rest: Arc<dyn RestClient>,
        policy: CollectorPolicy,
        buffer: Arc<RingBuffer<OrderBookSnapshot>>,
        bus: EventBus,
        reporter: Arc<ErrorReporter>,
        metric_sink: Arc<dyn MetricSink>,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            adapter,
            connector,
            rest,
            policy,
            buffer,
            subscriptions: Mutex::new(SubscriptionMap::new()),
            symbols,
            state: Mutex::new(StateCell {
                current: CollectorState::Initial,
            }),
            bus,
            reporter,
            metric_sink,
            counters: CollectorCounters::default(),
            dedup: Mutex::new(DedupWindow::new(DEDUP_WINDOW_CAPACITY)),
            request_seq: AtomicU64::new(0),
            command_tx: Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> CollectorState {
        self.state.lock().current
    }

    pub fn metrics(&self) -> CollectorMetrics {
        CollectorMetrics {
            id: self.id.clone(),
            state: self.state(),
            messages_total: self.counters.messages_total.load(Ordering::Relaxed),
            records_enqueued: self.counters.records_enqueued.load(Ordering::Relaxed),
            records_rejected: self.counters.records_rejected.load(Ordering::Relaxed),
            duplicates_dropped: self.counters.duplicates_dropped.load(Ordering::Relaxed),
            unexpected_symbols: self.counters.unexpected_symbols.load(Ordering::Relaxed),
            parse_errors: self.counters.parse_errors.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            rest_polls: self.counters.rest_polls.load(Ordering::Relaxed),
            buffer: self.buffer.metrics(),
        }
    }

    /// Move the state machine to `next`, failing on transitions outside the legality
    /// table. The `SYSTEM.STATE_CHANGE` event is emitted after the update takes effect.
    fn transition(&self, next: CollectorState, reason: &str) -> Result<(), DataError> {
        let prev = {
            let mut cell = self.state.lock();
            if !cell.current.can_transition_to(next) {
                return Err(DataError::InvalidState {
                    from: cell.current.as_str(),
                    to: next.as_str(),
                });
            }
            let prev = cell.current;
            cell.current = next;
            prev
        };

        info!(id = %self.id, %prev, %next, reason, "collector state transition");
        self.bus.publish(PipelineEvent::StateChange(StateChange {
            id: self.id.clone(),
            prev,
            next,
            time: Utc::now(),
            reason: reason.to_owned(),
        }));
        Ok(())
    }

    /// Start the collector's driver task.
    ///
    /// Resolves once the first connection attempt settles: `Ok` when the socket opened,
    /// `Err` when the very first dial failed (subsequent failures are retried by the
    /// reconnect policy instead of surfacing here).
    pub async fn start(self: &Arc<Self>) -> Result<(), DataError> {
        {
            let state = self.state();
            if state != CollectorState::Initial {
                return Err(DataError::InvalidState {
                    from: state.as_str(),
                    to: CollectorState::Connecting.as_str(),
                });
            }
        }

        self.subscriptions
            .lock()
            .seed(self.symbols.iter(), Utc::now());

        let (command_tx, command_rx) = mpsc::channel(32);
        *self.command_tx.lock() = Some(command_tx);

        let (started_tx, started_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(self).run(command_rx, started_tx));
        *self.task.lock().await = Some(task);

        match started_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(DataError::ChannelClosed {
                consumer: "collector driver",
            }),
        }
    }

    /// Stop the collector: cancel timers, close the socket, flush & dispose the buffer
    /// and end in STOPPED. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        let command_tx = self.command_tx.lock().clone();
        if let Some(tx) = command_tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(Command::Stop(done_tx)).await.is_ok() {
                let _ = time::timeout(Duration::from_secs(5), done_rx).await;
            }
        }

        if let Some(mut task) = self.task.lock().await.take() {
            if time::timeout(Duration::from_secs(5), &mut task).await.is_err() {
                warn!(id = %self.id, "collector driver did not stop in time");
                task.abort();
            }
        }

        // Driver already stopped (or never ran): settle the terminal state directly.
        if !self.state().is_terminal() {
            self.halt(&self.stop_reason()).await;
        }
    }

    /// Reason stamped on the final STOPPING/STOPPED transitions: the pipeline-wide
    /// shutdown reason when one was requested, a plain external stop otherwise.
    fn stop_reason(&self) -> String {
        self.shutdown
            .reason()
            .map(|reason| format!("shutdown: {reason}"))
            .unwrap_or_else(|| "external stop".to_owned())
    }

    /// Request additional symbol subscriptions. Allowed only while RUNNING.
    pub async fn subscribe(&self, symbols: Vec<Symbol>) -> Result<(), DataError> {
        self.send_symbol_command(symbols, RequestKind::Subscribe)
            .await
    }

    /// Request symbol unsubscriptions. Allowed only while RUNNING.
    pub async fn unsubscribe(&self, symbols: Vec<Symbol>) -> Result<(), DataError> {
        self.send_symbol_command(symbols, RequestKind::Unsubscribe)
            .await
    }

    async fn send_symbol_command(
        &self,
        symbols: Vec<Symbol>,
        kind: RequestKind,
    ) -> Result<(), DataError> {
        let state = self.state();
        if state != CollectorState::Running {
            return Err(DataError::Subscribe(format!(
                "subscription changes require RUNNING, collector is {state}"
            )));
        }

        let tx = self
            .command_tx
            .lock()
            .clone()
            .ok_or(DataError::ChannelClosed {
                consumer: "collector driver",
            })?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = match kind {
            RequestKind::Subscribe => Command::Subscribe(symbols, reply_tx),
            RequestKind::Unsubscribe => Command::Unsubscribe(symbols, reply_tx),
        };
        tx.send(command)
            .await
            .map_err(|_| DataError::ChannelClosed {
                consumer: "collector driver",
            })?;
        reply_rx.await.map_err(|_| DataError::ChannelClosed {
            consumer: "collector driver",
        })?
    }

    fn next_request_id(&self) -> u64 {
        self.request_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Driver task: the full connect -> subscribe -> stream -> reconnect/fallback
    /// lifecycle, ending only on stop or fatal error.
    async fn run(
        self: Arc<Self>,
        mut command_rx: mpsc::Receiver<Command>,
        started_tx: oneshot::Sender<Result<(), DataError>>,
    ) {
        let params = self.adapter.params();
        let mut shutdown = self.shutdown.clone();
        let mut started_tx = Some(started_tx);
        let mut consecutive_failures: u32 = 0;
        let mut pre_connected: Option<Box<dyn Connection>> = None;
        let reconnect = self.policy.reconnect_policy();

        'lifecycle: loop {
            if self.transition(CollectorState::Connecting, "dialing exchange").is_err() {
                break;
            }

            let connection = match pre_connected.take() {
                Some(connection) => connection,
                None => {
                    match self.dial(&params, &mut shutdown).await {
                        Ok(Some(connection)) => connection,
                        // Shutdown observed mid-dial.
                        Ok(None) => {
                            self.halt(&self.stop_reason()).await;
                            break;
                        }
                        Err(error) => {
                            consecutive_failures += 1;
                            self.report_connection_failure(&error, consecutive_failures);
                            if let Some(tx) = started_tx.take() {
                                // First-ever dial failed: surface to start() and end.
                                let _ = self.transition(CollectorState::Error, "initial connect failed");
                                let _ = tx.send(Err(error));
                                break;
                            }
                            if self
                                .transition(CollectorState::Reconnecting, "dial failed")
                                .is_err()
                            {
                                break;
                            }
                            match self
                                .back_off_or_fall_back(
                                    &reconnect,
                                    consecutive_failures,
                                    &mut command_rx,
                                    &mut shutdown,
                                )
                                .await
                            {
                                BackoffOutcome::Retry => continue 'lifecycle,
                                BackoffOutcome::Recovered(connection) => {
                                    pre_connected = Some(connection);
                                    consecutive_failures = 0;
                                    continue 'lifecycle;
                                }
                                BackoffOutcome::Stop(done) => {
                                    self.halt(&self.stop_reason()).await;
                                    if let Some(done) = done {
                                        let _ = done.send(());
                                    }
                                    break;
                                }
                            }
                        }
                    }
                }
            };

            // Socket open: reconnect counter resets, pending subscriptions re-issue.
            consecutive_failures = 0;
            if started_tx.is_none() {
                self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            if self.transition(CollectorState::Connected, "socket open").is_err() {
                break;
            }
            if let Some(tx) = started_tx.take() {
                let _ = tx.send(Ok(()));
            }

            let session_end = self
                .drive_session(connection, &params, &mut command_rx, &mut shutdown)
                .await;

            match session_end {
                SessionEnd::Stop(done) => {
                    self.halt(&self.stop_reason()).await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    break;
                }
                SessionEnd::Disconnected(reason) => {
                    if shutdown.is_shutdown() {
                        self.halt(&self.stop_reason()).await;
                        break;
                    }
                    consecutive_failures += 1;
                    if self
                        .transition(CollectorState::Reconnecting, &reason)
                        .is_err()
                    {
                        break;
                    }
                    match self
                        .back_off_or_fall_back(
                            &reconnect,
                            consecutive_failures,
                            &mut command_rx,
                            &mut shutdown,
                        )
                        .await
                    {
                        BackoffOutcome::Retry => continue 'lifecycle,
                        BackoffOutcome::Recovered(connection) => {
                            pre_connected = Some(connection);
                            consecutive_failures = 0;
                            continue 'lifecycle;
                        }
                        BackoffOutcome::Stop(done) => {
                            self.halt(&self.stop_reason()).await;
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Dial with the handshake deadline, watching for shutdown.
    async fn dial(
        &self,
        params: &ConnectionParams,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Option<Box<dyn Connection>>, DataError> {
        tokio::select! {
            _ = shutdown.recv() => Ok(None),
            result = time::timeout(params.handshake_timeout, self.connector.connect(params)) => {
                match result {
                    Ok(Ok(connection)) => Ok(Some(connection)),
                    Ok(Err(error)) => Err(error),
                    Err(_) => Err(DataError::Deadline {
                        operation: "handshake",
                        timeout_ms: params.handshake_timeout.as_millis() as u64,
                    }),
                }
            }
        }
    }

    fn report_connection_failure(&self, error: &DataError, attempt: u32) {
        self.reporter.report(&self.id, error);
        self.bus.publish(PipelineEvent::ConnectionFailed {
            id: self.id.clone(),
            attempt,
            reason: error.to_string(),
            time: Utc::now(),
        });
    }

    /// One established session: subscribe, then stream until stop or disconnect.
    async fn drive_session(
        &self,
        mut connection: Box<dyn Connection>,
        params: &ConnectionParams,
        command_rx: &mut mpsc::Receiver<Command>,
        shutdown: &mut ShutdownSignal,
    ) -> SessionEnd {
        let mut pending_requests: HashMap<u64, PendingRequest> = HashMap::new();

        // Restore the SUBSCRIBED/PENDING union: either the initial symbol set or
        // whatever survived the previous session.
        let restore = self.subscriptions.lock().rearm_for_reconnect(Utc::now());
        if restore.is_empty() {
            if self
                .transition(CollectorState::Subscribing, "no subscriptions to action")
                .and_then(|_| self.transition(CollectorState::Running, "nothing outstanding"))
                .is_err()
            {
                return SessionEnd::Disconnected("state machine refused".to_owned());
            }
        } else {
            let request_id = self.next_request_id();
            let frame = match self.adapter.build_subscribe(&restore, request_id) {
                Ok(frame) => frame,
                Err(error) => {
                    self.reporter.report(&self.id, &error);
                    return SessionEnd::Disconnected(error.to_string());
                }
            };
            if let Err(error) = connection.send_text(frame).await {
                self.reporter.report(&self.id, &error);
                return SessionEnd::Disconnected(error.to_string());
            }
            if self
                .transition(CollectorState::Subscribing, "subscribe frame sent")
                .is_err()
            {
                return SessionEnd::Disconnected("state machine refused".to_owned());
            }
            pending_requests.insert(
                request_id,
                PendingRequest {
                    kind: RequestKind::Subscribe,
                    symbols: restore,
                    deadline: Instant::now() + params.handshake_timeout,
                },
            );
        }

        let mut ping_timer = time::interval_at(
            Instant::now() + params.ping_every,
            params.ping_every,
        );
        ping_timer.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut housekeeping = time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut awaiting_pong_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    connection.close().await;
                    return SessionEnd::Stop(None);
                }

                command = command_rx.recv() => match command {
                    Some(Command::Stop(done)) => {
                        connection.close().await;
                        return SessionEnd::Stop(Some(done));
                    }
                    Some(Command::Subscribe(symbols, reply)) => {
                        let result = self
                            .action_symbol_request(
                                &mut connection,
                                &mut pending_requests,
                                symbols,
                                RequestKind::Subscribe,
                                params,
                            )
                            .await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Unsubscribe(symbols, reply)) => {
                        let result = self
                            .action_symbol_request(
                                &mut connection,
                                &mut pending_requests,
                                symbols,
                                RequestKind::Unsubscribe,
                                params,
                            )
                            .await;
                        let _ = reply.send(result);
                    }
                    None => {
                        connection.close().await;
                        return SessionEnd::Stop(None);
                    }
                },

                frame = connection.next_frame() => match frame {
                    None => return SessionEnd::Disconnected("stream ended".to_owned()),
                    Some(Ok(Frame::Closed(reason))) => {
                        let reason = reason.unwrap_or_else(|| "close frame".to_owned());
                        self.reporter
                            .report(&self.id, &DataError::Transport(reason.clone()));
                        return SessionEnd::Disconnected(reason);
                    }
                    Some(Ok(Frame::Pong)) => {
                        awaiting_pong_since = None;
                    }
                    Some(Ok(Frame::Text(text))) => {
                        if self.on_frame(&text, &mut pending_requests).await {
                            awaiting_pong_since = None;
                        }
                    }
                    Some(Err(error)) => {
                        self.reporter.report(&self.id, &error);
                        return SessionEnd::Disconnected(error.to_string());
                    }
                },

                _ = ping_timer.tick() => {
                    if let Err(error) = connection.ping().await {
                        self.reporter.report(&self.id, &error);
                        return SessionEnd::Disconnected(error.to_string());
                    }
                    if awaiting_pong_since.is_none() {
                        awaiting_pong_since = Some(Instant::now());
                    }
                }

                _ = housekeeping.tick() => {
                    if let Some(since) = awaiting_pong_since {
                        if since.elapsed() > params.pong_within {
                            let error = DataError::HeartbeatMissed {
                                pong_within_ms: params.pong_within.as_millis() as u64,
                            };
                            self.reporter.report(&self.id, &error);
                            connection.close().await;
                            return SessionEnd::Disconnected(error.to_string());
                        }
                    }
                    self.expire_pending_requests(&mut pending_requests);
                    self.emit_metrics();
                }
            }
        }
    }

    /// Issue a subscribe/unsubscribe frame for `symbols` and track the outstanding
    /// request. Subscription map updates precede the wire send.
    async fn action_symbol_request(
        &self,
        connection: &mut Box<dyn Connection>,
        pending_requests: &mut HashMap<u64, PendingRequest>,
        symbols: Vec<Symbol>,
        kind: RequestKind,
        params: &ConnectionParams,
    ) -> Result<(), DataError> {
        let now = Utc::now();
        let request_id = self.next_request_id();
        let frame = match kind {
            RequestKind::Subscribe => {
                self.subscriptions.lock().mark_pending(symbols.iter(), now);
                self.adapter.build_subscribe(&symbols, request_id)?
            }
            RequestKind::Unsubscribe => {
                let mut subscriptions = self.subscriptions.lock();
                for symbol in &symbols {
                    if let Some(entry) = subscriptions.get_mut(symbol) {
                        entry.mark(SubscriptionState::Unsubscribed, now);
                    }
                }
                self.adapter.build_unsubscribe(&symbols, request_id)?
            }
        };

        connection.send_text(frame).await?;
        pending_requests.insert(
            request_id,
            PendingRequest {
                kind,
                symbols,
                deadline: Instant::now() + params.handshake_timeout,
            },
        );
        Ok(())
    }

    /// Outstanding requests past their ACK deadline mark their symbols FAILED.
    fn expire_pending_requests(&self, pending_requests: &mut HashMap<u64, PendingRequest>) {
        let now = Instant::now();
        let expired: Vec<u64> = pending_requests
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for request_id in expired {
            if let Some(request) = pending_requests.remove(&request_id) {
                let error = DataError::Subscribe(format!(
                    "no ACK for request {request_id} within deadline"
                ));
                self.reporter.report(&self.id, &error);
                let mut subscriptions = self.subscriptions.lock();
                let now = Utc::now();
                for symbol in request.symbols {
                    if let Some(entry) = subscriptions.get_mut(&symbol) {
                        entry.mark(SubscriptionState::Failed, now);
                    }
                }
            }
        }
    }

    /// Parse one raw frame and apply its effect. Returns `true` for application-level
    /// pongs so the caller can clear its heartbeat deadline.
    async fn on_frame(&self, text: &str, pending_requests: &mut HashMap<u64, PendingRequest>) -> bool {
        self.counters.messages_total.fetch_add(1, Ordering::Relaxed);

        match self.adapter.parse_frame(text) {
            ParsedFrame::OrderBook(record) => {
                self.admit_record(record, true).await;
                false
            }
            ParsedFrame::SubscriptionAck {
                request_id,
                symbols,
                ok,
            } => {
                self.resolve_ack(request_id, symbols, ok, pending_requests);
                false
            }
            ParsedFrame::SubscriptionList(symbols) => {
                debug!(id = %self.id, ?symbols, "exchange reported active subscriptions");
                false
            }
            ParsedFrame::Pong => true,
            ParsedFrame::Ignored => false,
            ParsedFrame::Error(reason) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                self.reporter.report(
                    &self.id,
                    &DataError::Deserialise {
                        payload: text.chars().take(256).collect(),
                        reason,
                    },
                );
                false
            }
        }
    }

    fn resolve_ack(
        &self,
        request_id: u64,
        ack_symbols: Vec<Symbol>,
        ok: bool,
        pending_requests: &mut HashMap<u64, PendingRequest>,
    ) {
        let Some(request) = pending_requests.remove(&request_id) else {
            debug!(id = %self.id, request_id, "ACK for unknown request");
            return;
        };

        // An ACK without an explicit symbol list covers the whole request.
        let symbols = if ack_symbols.is_empty() {
            request.symbols
        } else {
            ack_symbols
        };

        let now = Utc::now();
        {
            let mut subscriptions = self.subscriptions.lock();
            for symbol in &symbols {
                match (request.kind, ok) {
                    (RequestKind::Subscribe, true) => {
                        if let Some(entry) = subscriptions.get_mut(symbol) {
                            entry.mark(SubscriptionState::Subscribed, now);
                        }
                    }
                    (RequestKind::Subscribe, false) => {
                        if let Some(entry) = subscriptions.get_mut(symbol) {
                            entry.mark(SubscriptionState::Failed, now);
                        }
                    }
                    // Acknowledged unsubscriptions destroy their entries.
                    (RequestKind::Unsubscribe, true) => {
                        subscriptions.remove(symbol);
                    }
                    (RequestKind::Unsubscribe, false) => {}
                }
            }
        }

        if !ok {
            self.reporter.report(
                &self.id,
                &DataError::Subscribe(format!("exchange refused request {request_id}")),
            );
            return;
        }

        // First successful subscribe ACK of a session moves SUBSCRIBING -> RUNNING.
        if request.kind == RequestKind::Subscribe && self.state() == CollectorState::Subscribing {
            let _ = self.transition(CollectorState::Running, "subscriptions acknowledged");
        }
    }

    /// Admit one parsed record: future-timestamp guard, subscription gate (streamed
    /// frames only), dedup window, then the ring buffer. The push happens inline so
    /// intake order equals enqueue order. Admitted records are also announced as
    /// `MARKET_DATA` on the bus.
    async fn admit_record(&self, record: OrderBookSnapshot, require_subscribed: bool) {
        let skew_ms = record.timestamp_ms() - Utc::now().timestamp_millis();
        if skew_ms > MAX_FUTURE_SKEW_MS {
            self.counters.records_rejected.fetch_add(1, Ordering::Relaxed);
            self.reporter.report(
                &self.id,
                &DataError::FutureTimestamp {
                    symbol: record.symbol.to_string(),
                    skew_ms,
                },
            );
            return;
        }

        if require_subscribed && !self.subscriptions.lock().is_subscribed(&record.symbol) {
            self.counters
                .unexpected_symbols
                .fetch_add(1, Ordering::Relaxed);
            debug!(id = %self.id, symbol = %record.symbol, "dropping record for unexpected symbol");
            return;
        }

        if !self.dedup.lock().admit(record.fingerprint()) {
            self.counters
                .duplicates_dropped
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.counters.records_enqueued.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(PipelineEvent::MarketData(record.clone()));

        if self.buffer.push(record).await == crate::buffer::PushOutcome::Closed {
            debug!(id = %self.id, "record dropped: buffer closed");
        }
    }

    /// Reconnect pacing after the streaming path failed `failures` consecutive times.
    /// Within budget: sleep the backoff and retry. Budget exhausted: enter FALLBACK.
    async fn back_off_or_fall_back(
        &self,
        reconnect: &RetryPolicy,
        failures: u32,
        command_rx: &mut mpsc::Receiver<Command>,
        shutdown: &mut ShutdownSignal,
    ) -> BackoffOutcome {
        if failures < reconnect.max_attempts {
            let delay = reconnect.delay(failures);
            debug!(id = %self.id, failures, ?delay, "backing off before reconnect");
            tokio::select! {
                _ = shutdown.recv() => BackoffOutcome::Stop(None),
                command = command_rx.recv() => match command {
                    Some(Command::Stop(done)) => BackoffOutcome::Stop(Some(done)),
                    Some(Command::Subscribe(_, reply)) | Some(Command::Unsubscribe(_, reply)) => {
                        let _ = reply.send(Err(DataError::Subscribe(
                            "subscription changes require RUNNING".to_owned(),
                        )));
                        BackoffOutcome::Retry
                    }
                    None => BackoffOutcome::Stop(None),
                },
                _ = time::sleep(delay) => BackoffOutcome::Retry,
            }
        } else {
            match self.run_fallback(command_rx, shutdown).await {
                FallbackEnd::Stop(done) => BackoffOutcome::Stop(done),
                FallbackEnd::Recovered(connection) => BackoffOutcome::Recovered(connection),
            }
        }
    }

    /// FALLBACK: poll depth snapshots over REST at `rest_interval` (with its own
    /// exponential backoff on failure) while probing the streaming path each cycle.
    /// A successful probe ends the fallback and hands the new connection back.
    async fn run_fallback(
        &self,
        command_rx: &mut mpsc::Receiver<Command>,
        shutdown: &mut ShutdownSignal,
    ) -> FallbackEnd {
        if self
            .transition(CollectorState::Fallback, "reconnect budget exhausted")
            .is_err()
        {
            return FallbackEnd::Stop(None);
        }

        let params = self.adapter.params();
        let rest_policy = self.policy.rest_policy();
        let mut poll_failures: u32 = 0;

        loop {
            // Probe the streaming path first so recovery stops polling within a cycle.
            if let Ok(Ok(connection)) =
                time::timeout(params.handshake_timeout, self.connector.connect(&params)).await
            {
                info!(id = %self.id, "streaming path recovered, leaving fallback");
                return FallbackEnd::Recovered(connection);
            }

            match self.poll_rest_once().await {
                Ok(()) => poll_failures = 0,
                Err(error) => {
                    poll_failures = poll_failures.saturating_add(1);
                    self.reporter.report(&self.id, &error);
                }
            }

            let delay = if poll_failures == 0 {
                self.policy.rest_interval
            } else {
                rest_policy.delay(poll_failures)
            };

            tokio::select! {
                _ = shutdown.recv() => return FallbackEnd::Stop(None),
                command = command_rx.recv() => match command {
                    Some(Command::Stop(done)) => return FallbackEnd::Stop(Some(done)),
                    Some(Command::Subscribe(_, reply)) | Some(Command::Unsubscribe(_, reply)) => {
                        let _ = reply.send(Err(DataError::Subscribe(
                            "subscription changes require RUNNING".to_owned(),
                        )));
                    }
                    None => return FallbackEnd::Stop(None),
                },
                _ = time::sleep(delay) => {}
            }
        }
    }

    /// Fetch one REST depth snapshot per owned symbol and hydrate the buffer with the
    /// results, identically to streamed frames (minus the subscription gate, which REST
    /// satisfies by construction).
    async fn poll_rest_once(&self) -> Result<(), DataError> {
        let symbols: Vec<Symbol> = {
            let subscriptions = self.subscriptions.lock();
            let mut symbols = subscriptions.in_state(SubscriptionState::Subscribed);
            symbols.extend(subscriptions.in_state(SubscriptionState::Pending));
            symbols
        };

        let mut last_error = None;
        for symbol in symbols {
            let url = self.adapter.rest_snapshot_url(&symbol);
            match self.rest.get_text(&url).await {
                Ok(body) => {
                    self.counters.rest_polls.fetch_add(1, Ordering::Relaxed);
                    match self.adapter.parse_rest_snapshot(&symbol, &body, Utc::now()) {
                        Ok(record) => self.admit_record(record, false).await,
                        Err(error) => {
                            self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                            last_error = Some(error);
                        }
                    }
                }
                Err(error) => last_error = Some(error),
            }
        }

        match last_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Final stop sequence: STOPPING, flush & dispose the buffer, STOPPED.
    async fn halt(&self, reason: &str) {
        let _ = self.transition(CollectorState::Stopping, reason);
        let _ = self.buffer.flush().await;
        self.buffer.dispose().await;
        let _ = self.transition(CollectorState::Stopped, reason);
        *self.command_tx.lock() = None;
    }

    fn emit_metrics(&self) {
        let buffer = self.buffer.metrics();
        self.metric_sink.record(
            Metric::new("collector_messages_total", self.counters.messages_total.load(Ordering::Relaxed) as f64)
                .with_label("collector", self.id.clone()),
        );
        self.metric_sink.record(
            Metric::new("collector_buffer_size", buffer.size as f64)
                .with_label("collector", self.id.clone()),
        );
        self.metric_sink.record(
            Metric::new("collector_buffer_dropped", buffer.dropped_items as f64)
                .with_label("collector", self.id.clone()),
        );
    }
}

enum BackoffOutcome {
    Retry,
    Recovered(Box<dyn Connection>),
    Stop(Option<oneshot::Sender<()>>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_window_drops_duplicates_and_resets_when_full() {
        let mut window = DedupWindow::new(3);
        let fp = |symbol: &str, ts: i64| (Symbol::new(symbol), ts);

        assert!(window.admit(fp("BTC-USDT", 1)));
        assert!(!window.admit(fp("BTC-USDT", 1)), "duplicate admitted");
        assert!(window.admit(fp("BTC-USDT", 2)));
        assert!(window.admit(fp("ETH-USDT", 1)));

        // Window is full: the next admit clears it entirely, so a previously seen
        // fingerprint passes again.
        assert!(window.admit(fp("BTC-USDT", 1)));
        assert!(window.admit(fp("BTC-USDT", 2)));
    }

    #[test]
    fn test_collector_policy_backoff_uses_reconnect_interval_base() {
        let policy = CollectorPolicy {
            max_reconnect_attempts: 4,
            reconnect_interval: Duration::from_millis(1000),
            max_reconnect_backoff: Duration::from_millis(10000),
            ..CollectorPolicy::default()
        };
        let reconnect = policy.reconnect_policy();

        assert_eq!(Duration::from_millis(1000), reconnect.delay(1));
        assert_eq!(Duration::from_millis(2000), reconnect.delay(2));
        assert_eq!(Duration::from_millis(4000), reconnect.delay(3));
        assert_eq!(Duration::from_millis(8000), reconnect.delay(4));
        assert_eq!(Duration::from_millis(10000), reconnect.delay(5));
    }
}
