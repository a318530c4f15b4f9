use crate::{error::DataError, model::ProcessedRecord};
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use tracing::info;

/// Disk backup for batches the store refused after exhausted retries.
///
/// Each failed batch is appended as one JSON array per line (append then fsync), so a
/// crash mid-write loses at most the batch being written. The file is drained back into
/// the store and unlinked on the next successful pipeline.
#[derive(Clone, Debug)]
pub struct BackupFile {
    path: PathBuf,
}

impl BackupFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Append one failed batch, fsyncing before returning.
    pub async fn append_batch(&self, records: &[ProcessedRecord]) -> Result<(), DataError> {
        if records.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|err| DataError::Backup(err.to_string()))?;
            }
        }

        let mut line =
            serde_json::to_string(records).map_err(|err| DataError::Backup(err.to_string()))?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| DataError::Backup(err.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| DataError::Backup(err.to_string()))?;
        file.sync_all()
            .await
            .map_err(|err| DataError::Backup(err.to_string()))?;

        info!(path = %self.path.display(), count = records.len(), "batch persisted to backup file");
        Ok(())
    }

    /// Read every backed-up batch, oldest first. Corrupt lines are skipped rather than
    /// poisoning the whole drain.
    pub async fn read_batches(&self) -> Result<Vec<Vec<ProcessedRecord>>, DataError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(DataError::Backup(err.to_string())),
        };

        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Vec<ProcessedRecord>>(line).ok())
            .collect())
    }

    /// Unlink the backup file. Missing file is fine.
    pub async fn remove(&self) -> Result<(), DataError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DataError::Backup(err.to_string())),
        }
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
                asks: vec![Level::new(dec!(101), dec!(1))],
            },
            "processor-1".to_owned(),
            datetime_from_epoch_ms(timestamp_ms + 5),
        )
    }

    #[tokio::test]
    async fn test_append_read_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backup = BackupFile::new(dir.path().join("failed_batches.ndjson"));

        assert!(!backup.exists().await);
        assert!(backup.read_batches().await.unwrap().is_empty());

        let first = vec![record(1), record(2)];
        let second = vec![record(3)];
        backup.append_batch(&first).await.unwrap();
        backup.append_batch(&second).await.unwrap();

        let batches = backup.read_batches().await.unwrap();
        assert_eq!(vec![first, second], batches);

        backup.remove().await.unwrap();
        assert!(!backup.exists().await);
        // Removing a missing file stays Ok.
        backup.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_batches.ndjson");
        let backup = BackupFile::new(&path);

        backup.append_batch(&[record(1)]).await.unwrap();
        // Simulate a torn write.
        let mut contents = fs::read_to_string(&path).await.unwrap();
        contents.push_str("[{\"truncated\":\n");
        fs::write(&path, contents).await.unwrap();
        backup.append_batch(&[record(2)]).await.unwrap();

        let batches = backup.read_batches().await.unwrap();
        assert_eq!(2, batches.len());
    }
}
