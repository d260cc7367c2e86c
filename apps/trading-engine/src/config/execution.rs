//! Execution gateway configuration.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Settings governing order placement and fill validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum tolerated adverse slippage as a fraction of the expected
    /// price. Entries filled worse than this are unwound immediately.
    #[serde(default = "default_max_slippage")]
    pub max_slippage_fraction: Decimal,
    /// Safety margin added on top of reported balance when checking whether
    /// a new reservation fits, as a fraction of the balance.
    #[serde(default = "default_reserve_margin")]
    pub reserve_safety_margin: Decimal,
    /// Timeout applied to each exchange call, in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Attempts per order send. Each retry obtains a fresh sequence value;
    /// a sequence is never reused.
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_slippage_fraction: default_max_slippage(),
            reserve_safety_margin: default_reserve_margin(),
            call_timeout_secs: default_call_timeout(),
            send_attempts: default_send_attempts(),
        }
    }
}

const fn default_max_slippage() -> Decimal {
    // 0.5%
    Decimal::from_parts(5, 0, 0, false, 3)
}

const fn default_reserve_margin() -> Decimal {
    // 2%
    Decimal::from_parts(2, 0, 0, false, 2)
}

const fn default_call_timeout() -> u64 {
    10
}

const fn default_send_attempts() -> u32 {
    3
}
