use crate::{
    error::DataError,
    exchange::{ConnectionParams, ExchangeAdapter, ParsedFrame},
    model::{datetime_from_epoch_ms, ExchangeId, Level, MarketType, OrderBookSnapshot, Symbol},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Quote assets recognised when splitting a native ticker into `BASE-QUOTE`, longest
/// first so `FDUSD` wins over `USD`-suffixed guesses.
const QUOTE_ASSETS: &[&str] = &[
    "FDUSD", "USDT", "USDC", "TUSD", "BUSD", "BTC", "ETH", "BNB", "EUR", "TRY", "DAI",
];

/// Depth channel suffix subscribed for every symbol.
const DEPTH_CHANNEL: &str = "depth20@100ms";

/// `Binance` adapter covering the spot and USD-margined futures markets.
///
/// Frames follow the combined-stream wire format:
/// `{"stream":"btcusdt@depth20@100ms","data":{"s":"BTCUSDT","E":1700000000000,"b":[["100.00","1"]],"a":[["100.10","1"]]}}`
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#partial-book-depth-streams>
#[derive(Clone, Debug)]
pub struct Binance {
    market: MarketType,
    params: ConnectionParams,
}

impl Binance {
    /// Adapter for the spot market with the public endpoint defaults.
    pub fn spot() -> Self {
        Self {
            market: MarketType::Spot,
            params: ConnectionParams {
                ws_url: "wss://stream.binance.com:9443/stream".to_owned(),
                rest_url: "https://api.binance.com".to_owned(),
                max_streams_per_connection: 200,
                ..ConnectionParams::default()
            },
        }
    }

    /// Adapter for the USD-margined futures market.
    pub fn futures_usd() -> Self {
        Self {
            market: MarketType::Futures,
            params: ConnectionParams {
                ws_url: "wss://fstream.binance.com/stream".to_owned(),
                rest_url: "https://fapi.binance.com".to_owned(),
                max_streams_per_connection: 200,
                ..ConnectionParams::default()
            },
        }
    }

    /// Override the endpoint & heartbeat parameters, eg/ from configuration.
    pub fn with_params(mut self, params: ConnectionParams) -> Self {
        self.params = params;
        self
    }

    fn stream_name(&self, symbol: &Symbol) -> String {
        format!("{}@{}", self.denormalize(symbol).to_lowercase(), DEPTH_CHANNEL)
    }

    /// Ticker embedded in a stream name (`btcusdt@depth20@100ms` -> `btcusdt`).
    fn ticker_of_stream(stream: &str) -> &str {
        stream.split('@').next().unwrap_or(stream)
    }

    /// Canonical symbol for a native ticker, falling back to the raw ticker so the
    /// collector's subscription gate decides what to do with unknown streams.
    fn symbol_or_raw(&self, ticker: &str) -> Symbol {
        self.normalize_symbol(ticker)
            .unwrap_or_else(|| Symbol::new(ticker))
    }
}

/// `Binance` WebSocket payloads the adapter understands.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum BinanceMessage {
    Combined(BinanceCombinedFrame),
    Response(BinanceResponse),
}

/// Combined-stream envelope around a depth snapshot.
#[derive(Clone, Debug, Deserialize)]
struct BinanceCombinedFrame {
    #[allow(dead_code)]
    stream: String,
    data: BinanceDepth,
}

/// Partial book depth snapshot.
#[derive(Clone, Debug, Deserialize)]
struct BinanceDepth {
    #[serde(alias = "s")]
    ticker: String,
    #[serde(alias = "E")]
    time: i64,
    #[serde(alias = "b")]
    bids: Vec<BinanceLevel>,
    #[serde(alias = "a")]
    asks: Vec<BinanceLevel>,
}

/// Price level as `["price","qty"]` decimal strings.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
struct BinanceLevel(Decimal, Decimal);

impl From<BinanceLevel> for Level {
    fn from(level: BinanceLevel) -> Self {
        Level::new(level.0, level.1)
    }
}

/// Request/response message for SUBSCRIBE, UNSUBSCRIBE & LIST_SUBSCRIPTIONS.
///
/// A `null` result acknowledges the identified request; an array result carries the
/// active subscription list; an `error` object refuses the request.
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#live-subscribing-unsubscribing-to-streams>
#[derive(Clone, Debug, Deserialize)]
struct BinanceResponse {
    id: u64,
    #[serde(default)]
    result: Option<Vec<String>>,
    #[serde(default)]
    error: Option<BinanceResponseError>,
}

#[derive(Clone, Debug, Deserialize)]
struct BinanceResponseError {
    #[allow(dead_code)]
    code: i64,
    #[allow(dead_code)]
    msg: String,
}

#[derive(Serialize)]
struct BinanceRequest<'a> {
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a [String]>,
    id: u64,
}

impl ExchangeAdapter for Binance {
    fn exchange_id(&self) -> ExchangeId {
        match self.market {
            MarketType::Spot => ExchangeId::new("binance"),
            MarketType::Futures => ExchangeId::new("binance_futures_usd"),
        }
    }

    fn market_type(&self) -> MarketType {
        self.market
    }

    fn normalize_symbol(&self, raw: &str) -> Option<Symbol> {
        let ticker = raw.to_uppercase();
        QUOTE_ASSETS.iter().find_map(|quote| {
            ticker
                .strip_suffix(quote)
                .filter(|base| !base.is_empty())
                .map(|base| Symbol::new(format!("{base}-{quote}")))
        })
    }

    fn denormalize(&self, symbol: &Symbol) -> String {
        symbol.as_str().replace('-', "")
    }

    fn build_subscribe(&self, symbols: &[Symbol], request_id: u64) -> Result<String, DataError> {
        if symbols.len() > self.params.max_streams_per_connection {
            return Err(DataError::TooManyStreams {
                requested: symbols.len(),
                limit: self.params.max_streams_per_connection,
            });
        }

        let streams: Vec<String> = symbols.iter().map(|s| self.stream_name(s)).collect();
        serde_json::to_string(&BinanceRequest {
            method: "SUBSCRIBE",
            params: Some(&streams),
            id: request_id,
        })
        .map_err(|err| DataError::Subscribe(err.to_string()))
    }

    fn build_unsubscribe(&self, symbols: &[Symbol], request_id: u64) -> Result<String, DataError> {
        let streams: Vec<String> = symbols.iter().map(|s| self.stream_name(s)).collect();
        serde_json::to_string(&BinanceRequest {
            method: "UNSUBSCRIBE",
            params: Some(&streams),
            id: request_id,
        })
        .map_err(|err| DataError::Subscribe(err.to_string()))
    }

    fn build_list(&self, request_id: u64) -> String {
        serde_json::to_string(&BinanceRequest {
            method: "LIST_SUBSCRIPTIONS",
            params: None,
            id: request_id,
        })
        .unwrap_or_else(|_| String::new())
    }

    fn parse_frame(&self, frame: &str) -> ParsedFrame {
        let message = match serde_json::from_str::<BinanceMessage>(frame) {
            Ok(message) => message,
            Err(_) => {
                // Valid JSON that matches no known payload is ignorable noise;
                // anything else is malformed.
                return match serde_json::from_str::<serde_json::Value>(frame) {
                    Ok(_) => ParsedFrame::Ignored,
                    Err(err) => ParsedFrame::Error(err.to_string()),
                };
            }
        };

        match message {
            BinanceMessage::Combined(BinanceCombinedFrame { data, .. }) => {
                ParsedFrame::OrderBook(OrderBookSnapshot {
                    exchange: self.exchange_id(),
                    market: self.market,
                    symbol: self.symbol_or_raw(&data.ticker),
                    ticker: data.ticker,
                    time: datetime_from_epoch_ms(data.time),
                    bids: data.bids.into_iter().map(Level::from).collect(),
                    asks: data.asks.into_iter().map(Level::from).collect(),
                })
            }
            BinanceMessage::Response(response) => {
                if response.error.is_some() {
                    ParsedFrame::SubscriptionAck {
                        request_id: response.id,
                        symbols: vec![],
                        ok: false,
                    }
                } else {
                    match response.result {
                        None => ParsedFrame::SubscriptionAck {
                            request_id: response.id,
                            symbols: vec![],
                            ok: true,
                        },
                        Some(streams) => ParsedFrame::SubscriptionList(
                            streams
                                .iter()
                                .map(|stream| self.symbol_or_raw(Self::ticker_of_stream(stream)))
                                .collect(),
                        ),
                    }
                }
            }
        }
    }

    fn params(&self) -> ConnectionParams {
        self.params.clone()
    }

    fn rest_snapshot_url(&self, symbol: &Symbol) -> String {
        let path = match self.market {
            MarketType::Spot => "/api/v3/depth",
            MarketType::Futures => "/fapi/v1/depth",
        };
        format!(
            "{}{}?symbol={}&limit=20",
            self.params.rest_url,
            path,
            self.denormalize(symbol)
        )
    }

    fn parse_rest_snapshot(
        &self,
        symbol: &Symbol,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<OrderBookSnapshot, DataError> {
        #[derive(Deserialize)]
        struct BinanceRestDepth {
            #[allow(dead_code)]
            #[serde(rename = "lastUpdateId")]
            last_update_id: u64,
            bids: Vec<BinanceLevel>,
            asks: Vec<BinanceLevel>,
        }

        let depth: BinanceRestDepth =
            serde_json::from_str(body).map_err(|err| DataError::Deserialise {
                payload: body.to_owned(),
                reason: err.to_string(),
            })?;

        Ok(OrderBookSnapshot {
            exchange: self.exchange_id(),
            market: self.market,
            symbol: symbol.clone(),
            ticker: self.denormalize(symbol),
            time: now,
            bids: depth.bids.into_iter().map(Level::from).collect(),
            asks: depth.asks.into_iter().map(Level::from).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_round_trip_law() {
        struct TestCase {
            input_ticker: &'static str,
            expected: Option<&'static str>,
        }

        let adapter = Binance::spot();

        let cases = vec![
            TestCase {
                // TC0: plain USDT pair
                input_ticker: "BTCUSDT",
                expected: Some("BTC-USDT"),
            },
            TestCase {
                // TC1: lowercase wire ticker
                input_ticker: "ethbtc",
                expected: Some("ETH-BTC"),
            },
            TestCase {
                // TC2: longest quote wins
                input_ticker: "BTCFDUSD",
                expected: Some("BTC-FDUSD"),
            },
            TestCase {
                // TC3: bare quote asset has no base
                input_ticker: "USDT",
                expected: None,
            },
            TestCase {
                // TC4: unknown quote unsupported
                input_ticker: "BTCXYZ",
                expected: None,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = adapter.normalize_symbol(test.input_ticker);
            assert_eq!(
                test.expected.map(Symbol::new),
                actual,
                "TC{} failed",
                index
            );

            // Round-trip law for every supported symbol.
            if let Some(symbol) = actual {
                assert_eq!(
                    test.input_ticker.to_uppercase(),
                    adapter.denormalize(&symbol),
                    "TC{} round-trip failed",
                    index
                );
            }
        }
    }

    #[test]
    fn test_build_subscribe_frame() {
        let adapter = Binance::spot();
        let frame = adapter
            .build_subscribe(&[Symbol::new("BTC-USDT"), Symbol::new("ETH-USDT")], 7)
            .unwrap();

        assert_eq!(
            r#"{"method":"SUBSCRIBE","params":["btcusdt@depth20@100ms","ethusdt@depth20@100ms"],"id":7}"#,
            frame
        );
    }

    #[test]
    fn test_build_subscribe_enforces_stream_limit() {
        let adapter = Binance::spot().with_params(ConnectionParams {
            max_streams_per_connection: 1,
            ..Binance::spot().params()
        });

        let result = adapter.build_subscribe(&[Symbol::new("BTC-USDT"), Symbol::new("ETH-USDT")], 1);

        assert!(matches!(
            result,
            Err(DataError::TooManyStreams {
                requested: 2,
                limit: 1
            })
        ));
    }

    #[test]
    fn test_parse_frame_variants() {
        struct TestCase {
            name: &'static str,
            input: &'static str,
            expected: ParsedFrame,
        }

        let adapter = Binance::spot();

        let cases = vec![
            TestCase {
                name: "TC0: depth snapshot",
                input: r#"{"stream":"btcusdt@depth20@100ms","data":{"s":"BTCUSDT","E":1700000000000,"b":[["100.00","1"],["99.50","2"]],"a":[["100.10","1"],["100.20","3"]]}}"#,
                expected: ParsedFrame::OrderBook(OrderBookSnapshot {
                    exchange: ExchangeId::new("binance"),
                    market: MarketType::Spot,
                    symbol: Symbol::new("BTC-USDT"),
                    ticker: "BTCUSDT".to_owned(),
                    time: datetime_from_epoch_ms(1_700_000_000_000),
                    bids: vec![
                        Level::new(dec!(100.00), dec!(1)),
                        Level::new(dec!(99.50), dec!(2)),
                    ],
                    asks: vec![
                        Level::new(dec!(100.10), dec!(1)),
                        Level::new(dec!(100.20), dec!(3)),
                    ],
                }),
            },
            TestCase {
                name: "TC1: successful subscribe ACK",
                input: r#"{"result":null,"id":3}"#,
                expected: ParsedFrame::SubscriptionAck {
                    request_id: 3,
                    symbols: vec![],
                    ok: true,
                },
            },
            TestCase {
                name: "TC2: refused request",
                input: r#"{"error":{"code":2,"msg":"Invalid request"},"id":4}"#,
                expected: ParsedFrame::SubscriptionAck {
                    request_id: 4,
                    symbols: vec![],
                    ok: false,
                },
            },
            TestCase {
                name: "TC3: subscription list",
                input: r#"{"result":["btcusdt@depth20@100ms","ethusdt@depth20@100ms"],"id":5}"#,
                expected: ParsedFrame::SubscriptionList(vec![
                    Symbol::new("BTC-USDT"),
                    Symbol::new("ETH-USDT"),
                ]),
            },
            TestCase {
                name: "TC4: unknown-but-valid payload ignored",
                input: r#"{"e":"24hrTicker","s":"BTCUSDT"}"#,
                expected: ParsedFrame::Ignored,
            },
        ];

        for test in cases {
            let actual = adapter.parse_frame(test.input);
            assert_eq!(test.expected, actual, "{} failed", test.name);
        }
    }

    #[test]
    fn test_parse_frame_malformed_is_error_not_panic() {
        let adapter = Binance::spot();
        assert!(matches!(
            adapter.parse_frame("{not json"),
            ParsedFrame::Error(_)
        ));
    }

    #[test]
    fn test_parse_rest_snapshot() {
        let adapter = Binance::spot();
        let now = datetime_from_epoch_ms(1_700_000_001_000);

        let snapshot = adapter
            .parse_rest_snapshot(
                &Symbol::new("BTC-USDT"),
                r#"{"lastUpdateId":42,"bids":[["100.00","1"]],"asks":[["100.10","2"]]}"#,
                now,
            )
            .unwrap();

        assert_eq!(Symbol::new("BTC-USDT"), snapshot.symbol);
        assert_eq!(now, snapshot.time);
        assert_eq!(vec![Level::new(dec!(100.00), dec!(1))], snapshot.bids);
        assert_eq!(
            "https://api.binance.com/api/v3/depth?symbol=BTCUSDT&limit=20",
            adapter.rest_snapshot_url(&Symbol::new("BTC-USDT"))
        );
    }
}
