//! Exit enforcement configuration.

use serde::{Deserialize, Serialize};

/// Settings for the background enforcement loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Seconds between enforcement cycles.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Maximum open positions per exchange connection. Excess positions are
    /// force-exited smallest-first.
    #[serde(default = "default_max_positions")]
    pub max_open_positions: usize,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_open_positions: default_max_positions(),
        }
    }
}

const fn default_interval() -> u64 {
    60
}

const fn default_max_positions() -> usize {
    8
}
