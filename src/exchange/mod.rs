use crate::{
    error::DataError,
    model::{ExchangeId, MarketType, OrderBookSnapshot, Symbol},
};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Binance adapter: combined-stream depth frames over spot & futures endpoints.
pub mod binance;

/// Connection parameters an adapter provides for its exchange.
#[derive(Clone, Debug)]
pub struct ConnectionParams {
    pub ws_url: String,
    pub rest_url: String,
    /// Heartbeat ping cadence.
    pub ping_every: Duration,
    /// Deadline for a pong after a ping; a miss is treated as a dead connection.
    pub pong_within: Duration,
    pub max_streams_per_connection: usize,
    pub max_reconnect_attempts: u32,
    pub handshake_timeout: Duration,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            rest_url: String::new(),
            ping_every: Duration::from_secs(30),
            pong_within: Duration::from_secs(10),
            max_streams_per_connection: 200,
            max_reconnect_attempts: 5,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of parsing one raw exchange frame. Parsing is total: malformed input maps to
/// [`ParsedFrame::Error`], never an out-of-band failure.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedFrame {
    /// Exchange acknowledged (or refused) a subscribe/unsubscribe request. An empty
    /// `symbols` list means the ACK covers every symbol of the identified request.
    SubscriptionAck {
        request_id: u64,
        symbols: Vec<Symbol>,
        ok: bool,
    },
    /// Exchange reported the currently subscribed streams.
    SubscriptionList(Vec<Symbol>),
    /// One normalised order book snapshot.
    OrderBook(OrderBookSnapshot),
    /// Application-level heartbeat response.
    Pong,
    /// Valid frame carrying nothing the pipeline consumes.
    Ignored,
    /// Malformed frame.
    Error(String),
}

/// Pure, stateless translator isolating all exchange-specific knowledge: symbol
/// mapping, subscribe frame construction, frame parsing and connection parameters.
///
/// Implementations hold configuration constants only and perform no I/O, which keeps
/// the collector state machine exchange-agnostic and testable with a scripted adapter.
pub trait ExchangeAdapter: Send + Sync {
    fn exchange_id(&self) -> ExchangeId;

    fn market_type(&self) -> MarketType;

    /// Exchange-native ticker -> canonical symbol, for tickers the adapter supports.
    fn normalize_symbol(&self, raw: &str) -> Option<Symbol>;

    /// Canonical symbol -> exchange-native ticker. Round-trip law:
    /// `normalize_symbol(&denormalize(s)) == Some(s)` for every supported symbol.
    fn denormalize(&self, symbol: &Symbol) -> String;

    /// Subscribe frame for `symbols`, delivered verbatim to the socket. Fails with
    /// [`DataError::TooManyStreams`] past the per-connection stream limit.
    fn build_subscribe(&self, symbols: &[Symbol], request_id: u64) -> Result<String, DataError>;

    fn build_unsubscribe(&self, symbols: &[Symbol], request_id: u64) -> Result<String, DataError>;

    /// Frame requesting the exchange's view of the active subscriptions.
    fn build_list(&self, request_id: u64) -> String;

    fn parse_frame(&self, frame: &str) -> ParsedFrame;

    fn params(&self) -> ConnectionParams;

    /// REST depth-snapshot URL polled for `symbol` while the collector is in fallback.
    fn rest_snapshot_url(&self, symbol: &Symbol) -> String;

    /// Parse a REST depth-snapshot body into the same canonical record streamed frames
    /// produce. `now` stamps bodies whose wire format carries no event time.
    fn parse_rest_snapshot(
        &self,
        symbol: &Symbol,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<OrderBookSnapshot, DataError>;
}
