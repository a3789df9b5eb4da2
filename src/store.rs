// ===============================
// src/store.rs
// ===============================
//
// Audit persistence: closed trades and reconciliation records.
//
// - MemoryStore : default, lives as long as the process
// - JsonlStore  : append-only `trades.jsonl` / `reconciliations.jsonl` under
//                 DATA_DIR, read back on demand (restart keeps the sequence)
//
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex as AsyncMutex,
};
use tracing::warn;

use crate::domain::{ReconciliationRecord, Trade};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError>;
    async fn save_reconciliation_history(&self, rec: &ReconciliationRecord) -> Result<(), StoreError>;
    async fn get_latest_reconciliation_history(&self, symbol: &str) -> Result<Option<ReconciliationRecord>, StoreError>;
    async fn get_reconciliation_count(&self, symbol: &str) -> Result<u64, StoreError>;
    async fn get_trades(&self, symbol: &str) -> Result<Vec<Trade>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    trades: Mutex<Vec<Trade>>,
    reconciliations: Mutex<Vec<ReconciliationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        self.trades.lock().push(trade.clone());
        Ok(())
    }

    async fn save_reconciliation_history(&self, rec: &ReconciliationRecord) -> Result<(), StoreError> {
        self.reconciliations.lock().push(rec.clone());
        Ok(())
    }

    async fn get_latest_reconciliation_history(&self, symbol: &str) -> Result<Option<ReconciliationRecord>, StoreError> {
        Ok(self.reconciliations.lock().iter().rev().find(|r| r.symbol == symbol).cloned())
    }

    async fn get_reconciliation_count(&self, symbol: &str) -> Result<u64, StoreError> {
        Ok(self.reconciliations.lock().iter().filter(|r| r.symbol == symbol).count() as u64)
    }

    async fn get_trades(&self, symbol: &str) -> Result<Vec<Trade>, StoreError> {
        Ok(self.trades.lock().iter().filter(|t| t.symbol == symbol).cloned().collect())
    }
}

const TRADES_FILE: &str = "trades.jsonl";
const RECONCILIATIONS_FILE: &str = "reconciliations.jsonl";

pub struct JsonlStore {
    dir: PathBuf,
    /// serializes appends so lines never interleave
    write: AsyncMutex<()>,
}

impl JsonlStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir, write: AsyncMutex::new(()) })
    }

    async fn append<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let _guard = self.write.lock().await;
        let mut f = OpenOptions::new().create(true).append(true).open(self.dir.join(file)).await?;
        f.write_all(&line).await?;
        f.flush().await?;
        Ok(())
    }

    /// Skips lines that fail to decode (e.g. a torn last write).
    async fn read_all<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, StoreError> {
        let path = self.dir.join(file);
        let text = match fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(v) => out.push(v),
                Err(e) => warn!(?e, path = %path.display(), line = n + 1, "store: skipping undecodable line"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for JsonlStore {
    async fn save_trade(&self, trade: &Trade) -> Result<(), StoreError> { self.append(TRADES_FILE, trade).await }

    async fn save_reconciliation_history(&self, rec: &ReconciliationRecord) -> Result<(), StoreError> {
        self.append(RECONCILIATIONS_FILE, rec).await
    }

    async fn get_latest_reconciliation_history(&self, symbol: &str) -> Result<Option<ReconciliationRecord>, StoreError> {
        let all: Vec<ReconciliationRecord> = self.read_all(RECONCILIATIONS_FILE).await?;
        Ok(all.into_iter().rev().find(|r| r.symbol == symbol))
    }

    async fn get_reconciliation_count(&self, symbol: &str) -> Result<u64, StoreError> {
        let all: Vec<ReconciliationRecord> = self.read_all(RECONCILIATIONS_FILE).await?;
        Ok(all.iter().filter(|r| r.symbol == symbol).count() as u64)
    }

    async fn get_trades(&self, symbol: &str) -> Result<Vec<Trade>, StoreError> {
        let all: Vec<Trade> = self.read_all(TRADES_FILE).await?;
        Ok(all.into_iter().filter(|t| t.symbol == symbol).collect())
    }
}
