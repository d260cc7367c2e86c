//! Ledger integrity thresholds.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Thresholds for the ledger's integrity checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Fraction of account balance held in open-order reservations above
    /// which capital is considered fragmented.
    #[serde(default = "default_fragmentation_threshold")]
    pub fragmentation_warn_fraction: Decimal,
    /// Age in seconds after which an open order counts as stale.
    #[serde(default = "default_stale_age")]
    pub stale_order_max_age_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            fragmentation_warn_fraction: default_fragmentation_threshold(),
            stale_order_max_age_secs: default_stale_age(),
        }
    }
}

const fn default_fragmentation_threshold() -> Decimal {
    // 30%
    Decimal::from_parts(30, 0, 0, false, 2)
}

const fn default_stale_age() -> u64 {
    900
}
