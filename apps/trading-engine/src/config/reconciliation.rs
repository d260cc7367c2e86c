//! Reconciliation configuration.

use serde::{Deserialize, Serialize};

/// Settings for position adoption at startup and on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Run reconciliation automatically at startup.
    #[serde(default = "default_on_startup")]
    pub on_startup: bool,
    /// Smallest exchange-reported quantity worth adopting; anything below
    /// is treated as dust and reported as failed.
    #[serde(default = "default_min_quantity")]
    pub min_adoptable_quantity: rust_decimal::Decimal,
    /// Orders younger than this are excluded from the resting-order diff;
    /// they may simply not have propagated to both sides yet.
    #[serde(default = "default_order_protection_window")]
    pub order_protection_window_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            on_startup: default_on_startup(),
            min_adoptable_quantity: default_min_quantity(),
            order_protection_window_secs: default_order_protection_window(),
        }
    }
}

const fn default_on_startup() -> bool {
    true
}

const fn default_min_quantity() -> rust_decimal::Decimal {
    // 1e-8, one satoshi-equivalent
    rust_decimal::Decimal::from_parts(1, 0, 0, false, 8)
}

const fn default_order_protection_window() -> u64 {
    60
}
