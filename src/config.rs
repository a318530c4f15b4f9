use crate::{
    buffer::BufferConfig,
    collector::CollectorPolicy,
    error::DataError,
    model::MarketType,
};
use serde::Deserialize;
use std::{path::Path, time::Duration};

/// Environment variables prefixed with this override file entries, case-insensitively,
/// with `__` separating path segments (eg/ `MARKETFLOW_STORE__HOST`).
pub const ENV_PREFIX: &str = "MARKETFLOW_";

/// Whole configuration bundle for one pipeline process.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
    pub store: StoreConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub buffer: BufferSection,
    #[serde(default)]
    pub processor: ProcessorSection,
}

/// One exchange to collect from.
#[derive(Clone, Debug, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(default = "default_market_type", alias = "marketType")]
    pub market_type: MarketType,
    #[serde(default, alias = "wsUrl")]
    pub ws_url: String,
    #[serde(default, alias = "restUrl")]
    pub rest_url: String,
    #[serde(default = "default_stream_limit", alias = "streamLimitPerConnection")]
    pub stream_limit_per_connection: usize,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default, alias = "pingInterval")]
    pub ping_interval_ms: Option<u64>,
    #[serde(default, alias = "pongTimeout")]
    pub pong_timeout_ms: Option<u64>,
}

fn default_market_type() -> MarketType {
    MarketType::Spot
}

fn default_stream_limit() -> usize {
    1
}

/// Key/value store endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: Option<i64>,
}

/// Collector reconnect & fallback pacing.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_backoff_ms: u64,
    pub rest_interval_ms: u64,
    pub max_rest_backoff_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 5000,
            max_reconnect_backoff_ms: 30000,
            rest_interval_ms: 5000,
            max_rest_backoff_ms: 30000,
        }
    }
}

impl CollectorConfig {
    pub fn policy(&self) -> CollectorPolicy {
        CollectorPolicy {
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_reconnect_backoff: Duration::from_millis(self.max_reconnect_backoff_ms),
            rest_interval: Duration::from_millis(self.rest_interval_ms),
            max_rest_backoff: Duration::from_millis(self.max_rest_backoff_ms),
        }
    }
}

/// Collector ring buffer sizing.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BufferSection {
    pub max_size: usize,
    /// Percent fill at which an immediate flush is scheduled.
    pub flush_threshold: f64,
    pub flush_interval_ms: u64,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            max_size: 1000,
            flush_threshold: 80.0,
            flush_interval_ms: 1000,
        }
    }
}

impl BufferSection {
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            max_size: self.max_size,
            flush_threshold: self.flush_threshold,
            flush_interval: (self.flush_interval_ms > 0)
                .then(|| Duration::from_millis(self.flush_interval_ms)),
        }
    }
}

/// Processor batching, staleness & backup options.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProcessorSection {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub max_buffer_size: usize,
    pub max_data_age_ms: u64,
    pub backup_path: String,
}

impl Default for ProcessorSection {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_interval_ms: 1000,
            max_buffer_size: 5000,
            max_data_age_ms: 300_000,
            backup_path: "failed_batches.ndjson".to_owned(),
        }
    }
}

impl Config {
    /// Parse a TOML configuration document.
    pub fn from_toml_str(contents: &str) -> Result<Self, DataError> {
        toml::from_str(contents).map_err(|err| DataError::Config(err.to_string()))
    }

    /// Load a TOML file, apply process environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DataError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|err| DataError::Config(format!("{}: {err}", path.as_ref().display())))?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Apply `MARKETFLOW_`-prefixed environment overrides. Keys are matched
    /// case-insensitively by path, `__` separating segments.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let lowered = key.to_lowercase();
            let Some(path) = lowered.strip_prefix(&ENV_PREFIX.to_lowercase()) else {
                continue;
            };

            match path {
                "store__host" => self.store.host = value,
                "store__port" => {
                    if let Ok(port) = value.parse() {
                        self.store.port = port;
                    }
                }
                "store__password" => self.store.password = Some(value),
                "store__db" => self.store.db = value.parse().ok(),
                "collector__max_reconnect_attempts" => {
                    if let Ok(parsed) = value.parse() {
                        self.collector.max_reconnect_attempts = parsed;
                    }
                }
                "collector__reconnect_interval_ms" => {
                    if let Ok(parsed) = value.parse() {
                        self.collector.reconnect_interval_ms = parsed;
                    }
                }
                "collector__max_reconnect_backoff_ms" => {
                    if let Ok(parsed) = value.parse() {
                        self.collector.max_reconnect_backoff_ms = parsed;
                    }
                }
                "collector__rest_interval_ms" => {
                    if let Ok(parsed) = value.parse() {
                        self.collector.rest_interval_ms = parsed;
                    }
                }
                "collector__max_rest_backoff_ms" => {
                    if let Ok(parsed) = value.parse() {
                        self.collector.max_rest_backoff_ms = parsed;
                    }
                }
                "buffer__max_size" => {
                    if let Ok(parsed) = value.parse() {
                        self.buffer.max_size = parsed;
                    }
                }
                "buffer__flush_threshold" => {
                    if let Ok(parsed) = value.parse() {
                        self.buffer.flush_threshold = parsed;
                    }
                }
                "buffer__flush_interval_ms" => {
                    if let Ok(parsed) = value.parse() {
                        self.buffer.flush_interval_ms = parsed;
                    }
                }
                "processor__batch_size" => {
                    if let Ok(parsed) = value.parse() {
                        self.processor.batch_size = parsed;
                    }
                }
                "processor__batch_interval_ms" => {
                    if let Ok(parsed) = value.parse() {
                        self.processor.batch_interval_ms = parsed;
                    }
                }
                "processor__max_buffer_size" => {
                    if let Ok(parsed) = value.parse() {
                        self.processor.max_buffer_size = parsed;
                    }
                }
                "processor__max_data_age_ms" => {
                    if let Ok(parsed) = value.parse() {
                        self.processor.max_data_age_ms = parsed;
                    }
                }
                "processor__backup_path" => self.processor.backup_path = value,
                _ => {}
            }
        }
    }

    /// Reject bundles missing required fields. Called once at startup; failures are
    /// fatal.
    pub fn validate(&self) -> Result<(), DataError> {
        if self.store.host.is_empty() {
            return Err(DataError::Config("store.host is required".to_owned()));
        }
        if self.store.port == 0 {
            return Err(DataError::Config("store.port is required".to_owned()));
        }
        if self.exchanges.is_empty() {
            return Err(DataError::Config(
                "at least one exchange is required".to_owned(),
            ));
        }
        for exchange in &self.exchanges {
            if exchange.name.is_empty() {
                return Err(DataError::Config("exchange.name is required".to_owned()));
            }
            if exchange.stream_limit_per_connection < 1 {
                return Err(DataError::Config(format!(
                    "exchange {}: stream_limit_per_connection must be >= 1",
                    exchange.name
                )));
            }
            if exchange.symbols.is_empty() {
                return Err(DataError::Config(format!(
                    "exchange {}: at least one symbol is required",
                    exchange.name
                )));
            }
            // Endpoints are optional (adapter defaults apply), but a present one must
            // at least parse as a URL.
            for endpoint in [&exchange.ws_url, &exchange.rest_url] {
                if !endpoint.is_empty() && url::Url::parse(endpoint).is_err() {
                    return Err(DataError::Config(format!(
                        "exchange {}: invalid endpoint url {endpoint}",
                        exchange.name
                    )));
                }
            }
        }
        if self.buffer.max_size == 0 {
            return Err(DataError::Config("buffer.max_size must be > 0".to_owned()));
        }
        if !(0.0..=100.0).contains(&self.buffer.flush_threshold)
            || self.buffer.flush_threshold == 0.0
        {
            return Err(DataError::Config(
                "buffer.flush_threshold must be within (0, 100]".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [[exchanges]]
        name = "binance"
        market_type = "spot"
        ws_url = "wss://stream.binance.com:9443/stream"
        rest_url = "https://api.binance.com"
        stream_limit_per_connection = 2
        symbols = ["BTC-USDT", "ETH-USDT", "SOL-USDT"]

        [store]
        host = "localhost"
        port = 6379

        [collector]
        max_reconnect_attempts = 3

        [buffer]
        max_size = 500

        [processor]
        batch_size = 25
    "#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::from_toml_str(EXAMPLE).unwrap();

        assert_eq!(1, config.exchanges.len());
        assert_eq!(2, config.exchanges[0].stream_limit_per_connection);
        assert_eq!(3, config.exchanges[0].symbols.len());
        // Overridden field.
        assert_eq!(3, config.collector.max_reconnect_attempts);
        // Defaulted siblings.
        assert_eq!(5000, config.collector.reconnect_interval_ms);
        assert_eq!(500, config.buffer.max_size);
        assert_eq!(80.0, config.buffer.flush_threshold);
        assert_eq!(25, config.processor.batch_size);
        assert_eq!("failed_batches.ndjson", config.processor.backup_path);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides_are_case_insensitive_by_path() {
        let mut config = Config::from_toml_str(EXAMPLE).unwrap();

        config.apply_env_overrides(vec![
            ("MARKETFLOW_STORE__HOST".to_owned(), "redis.internal".to_owned()),
            ("marketflow_store__port".to_owned(), "6380".to_owned()),
            (
                "Marketflow_Collector__Reconnect_Interval_Ms".to_owned(),
                "1234".to_owned(),
            ),
            // Unknown paths and foreign variables are ignored.
            ("MARKETFLOW_STORE__UNKNOWN".to_owned(), "x".to_owned()),
            ("PATH".to_owned(), "/usr/bin".to_owned()),
        ]);

        assert_eq!("redis.internal", config.store.host);
        assert_eq!(6380, config.store.port);
        assert_eq!(1234, config.collector.reconnect_interval_ms);
    }

    #[test]
    fn test_validate_rejects_missing_required_fields() {
        struct TestCase {
            name: &'static str,
            mutate: fn(&mut Config),
        }

        let cases = vec![
            TestCase {
                name: "TC0: empty store host",
                mutate: |config| config.store.host.clear(),
            },
            TestCase {
                name: "TC1: no exchanges",
                mutate: |config| config.exchanges.clear(),
            },
            TestCase {
                name: "TC2: zero stream limit",
                mutate: |config| config.exchanges[0].stream_limit_per_connection = 0,
            },
            TestCase {
                name: "TC3: no symbols",
                mutate: |config| config.exchanges[0].symbols.clear(),
            },
            TestCase {
                name: "TC4: zero buffer capacity",
                mutate: |config| config.buffer.max_size = 0,
            },
            TestCase {
                name: "TC5: unparseable endpoint url",
                mutate: |config| config.exchanges[0].ws_url = "not a url".to_owned(),
            },
        ];

        for test in cases {
            let mut config = Config::from_toml_str(EXAMPLE).unwrap();
            (test.mutate)(&mut config);
            let result = config.validate();
            assert!(
                matches!(result, Err(DataError::Config(_))),
                "{} failed",
                test.name
            );
        }
    }

    #[test]
    fn test_buffer_section_zero_interval_disables_timer() {
        let section = BufferSection {
            flush_interval_ms: 0,
            ..BufferSection::default()
        };
        assert!(section.buffer_config().flush_interval.is_none());
    }
}
