//! Persistent zombie-asset blacklist.
//!
//! Symbols land here when price or metadata lookup fails during
//! reconciliation. The blacklist is durable so a restart does not re-fail
//! the same unsupported symbol every cycle; entries leave only through
//! operator action or a later successful lookup.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{info, warn};

use crate::models::ZombieAsset;
use crate::persistence::{FileStore, PersistenceError, ZOMBIE_BLACKLIST_FILE};

/// Durable symbol quarantine.
pub struct ZombieBlacklist {
    entries: RwLock<HashMap<String, ZombieAsset>>,
    store: FileStore,
}

impl ZombieBlacklist {
    /// Load the blacklist from its durable file (empty when absent).
    pub async fn load(store: FileStore) -> Result<Self, PersistenceError> {
        let entries: HashMap<String, ZombieAsset> = store
            .load_json(ZOMBIE_BLACKLIST_FILE)
            .await?
            .unwrap_or_default();
        if !entries.is_empty() {
            info!(count = entries.len(), "Loaded zombie-asset blacklist");
        }
        Ok(Self {
            entries: RwLock::new(entries),
            store,
        })
    }

    /// Whether `symbol` is quarantined.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        match self.entries.read() {
            Ok(entries) => entries.contains_key(symbol),
            Err(poisoned) => poisoned.into_inner().contains_key(symbol),
        }
    }

    /// All quarantined symbols.
    pub fn entries(&self) -> Vec<ZombieAsset> {
        match self.entries.read() {
            Ok(entries) => entries.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    /// Quarantine `symbol` and persist the blacklist.
    pub async fn quarantine(&self, symbol: &str, reason: &str) {
        {
            let mut entries = match self.entries.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries.insert(symbol.to_string(), ZombieAsset::new(symbol, reason));
        }
        warn!(symbol, reason, "Symbol quarantined as zombie asset");
        self.persist().await;
    }

    /// Remove `symbol` from quarantine and persist. Returns whether the
    /// symbol was present.
    pub async fn clear(&self, symbol: &str, reason: &str) -> bool {
        let removed = {
            let mut entries = match self.entries.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries.remove(symbol).is_some()
        };
        if removed {
            info!(symbol, reason, "Symbol released from zombie blacklist");
            self.persist().await;
        }
        removed
    }

    async fn persist(&self) {
        let snapshot = {
            match self.entries.read() {
                Ok(entries) => entries.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        };
        if let Err(e) = self.store.save_json(ZOMBIE_BLACKLIST_FILE, &snapshot).await {
            warn!(error = %e, "Failed to persist zombie blacklist");
        }
    }
}
