use crate::error::DataError;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

/// Subscription state machine for the symbols a collector owns.
pub mod subscription;

/// Maximum tolerated clock skew before an incoming record's event timestamp is rejected
/// as coming from the future.
pub const MAX_FUTURE_SKEW_MS: i64 = 5_000;

/// Unique identifier for an exchange, as configured (eg/ "binance").
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new<S>(id: S) -> Self
    where
        S: Into<String>,
    {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S> From<S> for ExchangeId
where
    S: Into<String>,
{
    fn from(id: S) -> Self {
        Self::new(id)
    }
}

impl Display for ExchangeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Market a symbol trades on.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    Futures,
}

impl Display for MarketType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketType::Spot => write!(f, "spot"),
            MarketType::Futures => write!(f, "futures"),
        }
    }
}

/// Canonical `BASE-QUOTE` symbol (eg/ `BTC-USDT`) used by every non-adapter component.
/// Adapters translate to and from the exchange-native ticker.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new<S>(symbol: S) -> Self
    where
        S: Into<String>,
    {
        Self(symbol.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base asset of the pair, if the symbol is well-formed.
    pub fn base(&self) -> Option<&str> {
        self.0.split_once('-').map(|(base, _)| base)
    }

    /// Quote asset of the pair, if the symbol is well-formed.
    pub fn quote(&self) -> Option<&str> {
        self.0.split_once('-').map(|(_, quote)| quote)
    }
}

impl<S> From<S> for Symbol
where
    S: Into<String>,
{
    fn from(symbol: S) -> Self {
        Self::new(symbol)
    }
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single price level of an order book side. Prices and quantities are carried as
/// [`Decimal`] so that 18-digit wire mantissas survive normalisation intact.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug, Deserialize, Serialize)]
pub struct Level {
    pub price: Decimal,
    pub qty: Decimal,
}

impl Level {
    pub fn new(price: Decimal, qty: Decimal) -> Self {
        Self { price, qty }
    }
}

impl From<(Decimal, Decimal)> for Level {
    fn from((price, qty): (Decimal, Decimal)) -> Self {
        Self::new(price, qty)
    }
}

/// Normalised order book snapshot: the canonical record every adapter parses into and
/// every downstream component consumes.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct OrderBookSnapshot {
    pub exchange: ExchangeId,
    pub market: MarketType,
    pub symbol: Symbol,
    /// Exchange-native ticker the snapshot arrived under (eg/ `BTCUSDT`).
    pub ticker: String,
    /// Event time reported by the exchange.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl OrderBookSnapshot {
    /// Event time as milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> i64 {
        self.time.timestamp_millis()
    }

    /// Identity of this snapshot across the WebSocket/REST seam, used for deduplication.
    pub fn fingerprint(&self) -> (Symbol, i64) {
        (self.symbol.clone(), self.timestamp_ms())
    }

    /// Check every canonical record invariant: positive event time, no future timestamp
    /// beyond [`MAX_FUTURE_SKEW_MS`], strictly descending bids, strictly ascending asks,
    /// non-negative prices and quantities, and at least one populated side.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), DataError> {
        if self.exchange.as_str().is_empty() {
            return Err(DataError::InvalidRecord("empty exchange id".to_owned()));
        }
        if self.symbol.as_str().is_empty() {
            return Err(DataError::InvalidRecord("empty symbol".to_owned()));
        }
        if self.timestamp_ms() <= 0 {
            return Err(DataError::InvalidRecord(format!(
                "non-positive timestamp for {}",
                self.symbol
            )));
        }
        if self.bids.is_empty() && self.asks.is_empty() {
            return Err(DataError::InvalidRecord(format!(
                "empty payload for {}",
                self.symbol
            )));
        }

        let skew_ms = self.timestamp_ms() - now.timestamp_millis();
        if skew_ms > MAX_FUTURE_SKEW_MS {
            return Err(DataError::FutureTimestamp {
                symbol: self.symbol.to_string(),
                skew_ms,
            });
        }

        if !is_strictly_descending(&self.bids) || self.bids.iter().any(level_is_negative) {
            return Err(DataError::InvalidOrder {
                symbol: self.symbol.to_string(),
                side: "bids",
            });
        }
        if !is_strictly_ascending(&self.asks) || self.asks.iter().any(level_is_negative) {
            return Err(DataError::InvalidOrder {
                symbol: self.symbol.to_string(),
                side: "asks",
            });
        }

        Ok(())
    }
}

fn level_is_negative(level: &Level) -> bool {
    level.price.is_sign_negative() || level.qty.is_sign_negative()
}

fn is_strictly_descending(levels: &[Level]) -> bool {
    levels.windows(2).all(|pair| pair[0].price > pair[1].price)
}

fn is_strictly_ascending(levels: &[Level]) -> bool {
    levels.windows(2).all(|pair| pair[0].price < pair[1].price)
}

/// [`OrderBookSnapshot`] stamped by the processor that accepted it. JSON-encoded as the
/// key/value store value.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct ProcessedRecord {
    #[serde(flatten)]
    pub snapshot: OrderBookSnapshot,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub processed_at: DateTime<Utc>,
    pub processor_id: String,
}

impl ProcessedRecord {
    pub fn new(snapshot: OrderBookSnapshot, processor_id: String, processed_at: DateTime<Utc>) -> Self {
        Self {
            snapshot,
            processed_at,
            processor_id,
        }
    }

    /// Primary store key: `market:{exchange}:{symbol}:{timestamp_ms}`.
    pub fn store_key(&self) -> String {
        format!(
            "market:{}:{}:{}",
            self.snapshot.exchange,
            self.snapshot.symbol,
            self.snapshot.timestamp_ms()
        )
    }

    /// Secondary latest-snapshot key: `bookTicker:{exchange}:{market}:{symbol}`.
    pub fn ticker_key(&self) -> String {
        format!(
            "bookTicker:{}:{}:{}",
            self.snapshot.exchange, self.snapshot.market, self.snapshot.symbol
        )
    }
}

/// Construct a `DateTime<Utc>` from milliseconds since the Unix epoch, saturating on
/// out-of-range input.
pub fn datetime_from_epoch_ms(epoch_ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(epoch_ms) {
        chrono::LocalResult::Single(time) => time,
        _ => Utc.timestamp_millis_opt(0).unwrap(),
    }
}
