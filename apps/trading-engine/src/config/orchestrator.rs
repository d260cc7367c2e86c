//! Orchestrator scheduling configuration.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Settings for the per-(account, exchange) execution tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Seconds between decision cycles for each pair.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Seconds a pair task sleeps after an unhandled cycle error before
    /// resuming.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Minimum balance for a pair to be eligible to run.
    #[serde(default = "default_min_balance")]
    pub min_balance: Decimal,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            error_backoff_secs: default_error_backoff(),
            min_balance: default_min_balance(),
        }
    }
}

const fn default_cycle_interval() -> u64 {
    30
}

const fn default_error_backoff() -> u64 {
    15
}

const fn default_min_balance() -> Decimal {
    Decimal::from_parts(10, 0, 0, false, 0)
}
