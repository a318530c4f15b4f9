use crate::{config::StoreConfig, error::DataError, model::ProcessedRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
};

/// TTL of primary `market:` keys.
pub const RECORD_TTL_SECS: i64 = 86_400;

/// TTL of secondary `bookTicker:` latest-snapshot keys.
pub const TICKER_TTL_SECS: i64 = 3_600;

/// Storage interface the processor drains batches into.
///
/// A batch is written transactionally: either every record of the batch lands (with
/// its TTLs) or the call fails as a whole. Implementations must be safe under
/// concurrent pipelining.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn write_batch(&self, records: &[ProcessedRecord]) -> Result<(), DataError>;
}

/// Redis backed store used in production. Each record becomes `SET key json` +
/// `EXPIRE key 86400` on its `market:` key, plus the `bookTicker:` latest-snapshot key
/// with its shorter TTL, all inside one atomic pipeline.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn connect(config: &StoreConfig) -> Result<Self, DataError> {
        let auth = config
            .password
            .as_deref()
            .map(|password| format!(":{password}@"))
            .unwrap_or_default();
        let url = format!(
            "redis://{}{}:{}/{}",
            auth,
            config.host,
            config.port,
            config.db.unwrap_or(0)
        );
        Ok(Self {
            client: redis::Client::open(url).map_err(|err| DataError::Storage(err.to_string()))?,
        })
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn write_batch(&self, records: &[ProcessedRecord]) -> Result<(), DataError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut connection = self
            .client
            .get_async_connection()
            .await
            .map_err(|err| DataError::Storage(err.to_string()))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in records {
            let value = serde_json::to_string(record)
                .map_err(|err| DataError::Storage(err.to_string()))?;
            let key = record.store_key();
            pipe.set(&key, &value).ignore();
            pipe.expire(&key, RECORD_TTL_SECS).ignore();

            let ticker_key = record.ticker_key();
            pipe.set(&ticker_key, &value).ignore();
            pipe.expire(&ticker_key, TICKER_TTL_SECS).ignore();
        }

        pipe.query_async::<_, ()>(&mut connection)
            .await
            .map_err(|err| DataError::Storage(err.to_string()))
    }
}

/// In-memory [`RecordStore`] used for testing. Optionally refuses the next `n` batches
/// to exercise the retry and backup paths.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    refuse_next: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `write_batch` calls fail with a storage error.
    pub fn refuse_next(&self, n: u32) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Keys under the primary `market:` prefix, ie/ excluding latest-snapshot keys.
    pub fn market_keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .keys()
            .filter(|key| key.starts_with("market:"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn write_batch(&self, records: &[ProcessedRecord]) -> Result<(), DataError> {
        if self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DataError::Storage("store refused batch".to_owned()));
        }

        let mut entries = self.entries.lock();
        for record in records {
            let value = serde_json::to_string(record)
                .map_err(|err| DataError::Storage(err.to_string()))?;
            entries.insert(record.store_key(), value.clone());
            entries.insert(record.ticker_key(), value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        datetime_from_epoch_ms, ExchangeId, Level, MarketType, OrderBookSnapshot, Symbol,
    };
    use rust_decimal_macros::dec;

    fn record(timestamp_ms: i64) -> ProcessedRecord {
        ProcessedRecord::new(
            OrderBookSnapshot {
                exchange: ExchangeId::new("binance"),
                market: MarketType::Spot,
                symbol: Symbol::new("BTC-USDT"),
                ticker: "BTCUSDT".to_owned(),
                time: datetime_from_epoch_ms(timestamp_ms),
                bids: vec![Level::new(dec!(100), dec!(1))],
                asks: vec![],
            },
            "processor-1".to_owned(),
            datetime_from_epoch_ms(timestamp_ms),
        )
    }

    #[tokio::test]
    async fn test_memory_store_writes_primary_and_ticker_keys() {
        let store = MemoryStore::new();

        store
            .write_batch(&[record(1_700_000_000_000), record(1_700_000_000_100)])
            .await
            .unwrap();

        assert_eq!(2, store.market_keys().len());
        assert!(store.get("market:binance:BTC-USDT:1700000000000").is_some());
        // The latest snapshot key is overwritten by the later record.
        let ticker = store.get("bookTicker:binance:spot:BTC-USDT").unwrap();
        assert!(ticker.contains("1700000000100"));
    }

    #[tokio::test]
    async fn test_memory_store_refusals_then_recovers() {
        let store = MemoryStore::new();
        store.refuse_next(2);

        assert!(store.write_batch(&[record(1)]).await.is_err());
        assert!(store.write_batch(&[record(1)]).await.is_err());
        store.write_batch(&[record(1)]).await.unwrap();
        assert_eq!(1, store.market_keys().len());
    }
}
