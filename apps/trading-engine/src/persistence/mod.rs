//! Durable state for crash recovery.
//!
//! The engine owns four small durable artifacts: the sequence-generator
//! checkpoint, the zombie-asset blacklist, the account-ledger snapshot, and
//! the kill-switch marker (owned by [`crate::state::KillSwitch`]). The first
//! three are JSON documents managed here, written with an atomic replace
//! (write to a temp file, then rename) so a crash mid-write never corrupts
//! the previous good copy.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::{Order, Position};

/// File name of the sequence-generator checkpoint.
pub const SEQUENCE_CHECKPOINT_FILE: &str = "sequence_checkpoint.json";

/// File name of the zombie-asset blacklist.
pub const ZOMBIE_BLACKLIST_FILE: &str = "zombie_blacklist.json";

/// File name of the account-ledger snapshot.
pub const LEDGER_SNAPSHOT_FILE: &str = "ledger_snapshot.json";

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem error.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Affected file path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// JSON-on-disk store for the engine's durable artifacts.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| PersistenceError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Directory holding the store's files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `value` to `name` atomically (temp file + rename).
    pub async fn save_json<T: Serialize>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), PersistenceError> {
        let path = self.root.join(name);
        let tmp = self.root.join(format!("{name}.tmp"));
        let bytes = serde_json::to_vec_pretty(value)?;

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| PersistenceError::Io {
                path: tmp.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| PersistenceError::Io {
                path: path.display().to_string(),
                source,
            })?;

        debug!(file = %path.display(), bytes = bytes.len(), "Persisted state file");
        Ok(())
    }

    /// Load `name`, returning `None` when the file does not exist yet.
    pub async fn load_json<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, PersistenceError> {
        let path = self.root.join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Durable high-watermark of the sequence generator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SequenceCheckpoint {
    /// No value at or below this watermark will be issued after a restart.
    pub watermark: u64,
}

/// Serializable snapshot of the account ledger.
///
/// Written periodically and on shutdown; loaded at startup so the engine can
/// resume without synchronously re-querying every exchange. Reconciliation
/// then repairs whatever drifted while the process was down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// All tracked orders across accounts.
    pub orders: Vec<Order>,
    /// All tracked positions across accounts.
    pub positions: Vec<Position>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, ExchangeId, OrderSide};
    use rust_decimal_macros::dec;

    fn make_store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_missing_file_loads_none() {
        let (_dir, store) = make_store();
        let loaded: Option<SequenceCheckpoint> =
            store.load_json(SEQUENCE_CHECKPOINT_FILE).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let (_dir, store) = make_store();
        store
            .save_json(SEQUENCE_CHECKPOINT_FILE, &SequenceCheckpoint { watermark: 420 })
            .await
            .unwrap();

        let loaded: SequenceCheckpoint = store
            .load_json(SEQUENCE_CHECKPOINT_FILE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.watermark, 420);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_previous_copy() {
        let (_dir, store) = make_store();
        for watermark in [1_u64, 2, 3] {
            store
                .save_json(SEQUENCE_CHECKPOINT_FILE, &SequenceCheckpoint { watermark })
                .await
                .unwrap();
        }
        let loaded: SequenceCheckpoint = store
            .load_json(SEQUENCE_CHECKPOINT_FILE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.watermark, 3);
        // No temp file left behind after the rename.
        assert!(!store.root().join(format!("{SEQUENCE_CHECKPOINT_FILE}.tmp")).exists());
    }

    #[tokio::test]
    async fn test_ledger_snapshot_roundtrip() {
        let (_dir, store) = make_store();
        let snapshot = LedgerSnapshot {
            saved_at: Utc::now(),
            orders: vec![crate::models::Order::entry(
                AccountId::new("a1"),
                ExchangeId::new("paper"),
                "BTCUSDT",
                OrderSide::Buy,
                dec!(50000),
                dec!(0.01),
                dec!(500),
            )],
            positions: vec![Position::adopted(
                AccountId::new("a1"),
                ExchangeId::new("paper"),
                "ETHUSDT",
                OrderSide::Buy,
                dec!(2500),
                dec!(0.4),
            )],
        };
        store.save_json(LEDGER_SNAPSHOT_FILE, &snapshot).await.unwrap();

        let loaded: LedgerSnapshot = store
            .load_json(LEDGER_SNAPSHOT_FILE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.orders.len(), 1);
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.orders[0].symbol, "BTCUSDT");
    }
}
