//! Configuration for the trading engine.
//!
//! One file per concern, each a serde-deserializable struct with field
//! defaults, collected into the root [`Config`]. Loading layers an optional
//! TOML file under `ARMADA_`-prefixed environment variables, so any value can
//! be overridden per deployment:
//!
//! ```rust,ignore
//! use trading_engine::config::Config;
//!
//! // Load from armada.toml (if present) + environment
//! let config = Config::load(None)?;
//!
//! // Load from a custom path
//! let config = Config::load(Some("deploy/armada.toml"))?;
//! ```

mod accounts;
mod enforcement;
mod execution;
mod ledger;
mod orchestrator;
mod reconciliation;
mod sequencer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use accounts::AccountConfig;
pub use enforcement::EnforcementConfig;
pub use execution::ExecutionConfig;
pub use ledger::LedgerConfig;
pub use orchestrator::OrchestratorConfig;
pub use reconciliation::ReconcileConfig;
pub use sequencer::SequencerConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or parse configuration sources.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Trading accounts and their exchange connections.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Sequence generator settings.
    #[serde(default)]
    pub sequencer: SequencerConfig,
    /// Order execution and slippage settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Ledger integrity thresholds.
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Background enforcement settings.
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    /// Reconciliation settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Orchestrator scheduling settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Directory for durable state files (checkpoint, blacklist, snapshot).
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Seconds between ledger snapshots.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
    /// Path of the kill-switch marker file.
    #[serde(default = "default_kill_switch_path")]
    pub kill_switch_path: String,
    /// Log filter directive (overridden by `RUST_LOG`).
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            sequencer: SequencerConfig::default(),
            execution: ExecutionConfig::default(),
            ledger: LedgerConfig::default(),
            enforcement: EnforcementConfig::default(),
            reconcile: ReconcileConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            state_dir: default_state_dir(),
            snapshot_interval_secs: default_snapshot_interval(),
            kill_switch_path: default_kill_switch_path(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (default `armada.toml`, optional)
    /// layered under `ARMADA_*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = path.unwrap_or("armada.toml");
        let loaded: Self = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("ARMADA").separator("__"))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for account in &self.accounts {
            if account.exchanges.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "account '{}' has no exchange connections",
                    account.id
                )));
            }
        }
        if self.execution.max_slippage_fraction <= rust_decimal::Decimal::ZERO {
            return Err(ConfigError::Validation(
                "execution.max_slippage_fraction must be positive".to_string(),
            ));
        }
        if self.enforcement.max_open_positions == 0 {
            return Err(ConfigError::Validation(
                "enforcement.max_open_positions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_state_dir() -> String {
    "state".to_string()
}

const fn default_snapshot_interval() -> u64 {
    60
}

fn default_kill_switch_path() -> String {
    "state/kill_switch.json".to_string()
}

fn default_log_filter() -> String {
    "info,trading_engine=debug".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.state_dir, "state");
    }

    #[test]
    fn test_validation_rejects_bad_slippage() {
        let mut config = Config::default();
        config.execution.max_slippage_fraction = dec!(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_account_without_exchanges() {
        let mut config = Config::default();
        config.accounts.push(AccountConfig {
            id: "lonely".to_string(),
            role: crate::models::AccountRole::User,
            exchanges: vec![],
        });
        assert!(config.validate().is_err());
    }
}
