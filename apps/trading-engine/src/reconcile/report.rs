//! Reconciliation outcome reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AccountId, ExchangeId, Position};

/// Why a reported position could not be adopted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdoptionFailureReason {
    /// Price lookup failed.
    PriceUnavailable,
    /// The venue reported no usable quantity.
    QuantityUnavailable,
    /// The symbol is malformed or not supported.
    UnsupportedSymbol,
}

/// One position the reconciler could not bring under management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdoptionFailure {
    /// Affected symbol.
    pub symbol: String,
    /// Failure classification.
    pub reason: AdoptionFailureReason,
    /// Free-form detail for the log line.
    pub detail: String,
}

/// Which side of the order diff an orphan fell out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrphanKind {
    /// The venue holds a resting order the ledger does not know.
    UnknownOnVenue,
    /// The ledger holds an open order the venue no longer reports.
    MissingOnVenue,
}

impl std::fmt::Display for OrphanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOnVenue => write!(f, "UNKNOWN_ON_VENUE"),
            Self::MissingOnVenue => write!(f, "MISSING_ON_VENUE"),
        }
    }
}

/// A resting order found on exactly one side of the ledger/venue diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanOrder {
    /// Diff side.
    pub kind: OrphanKind,
    /// Venue order id.
    pub order_id: String,
    /// Affected symbol.
    pub symbol: String,
    /// Order age in seconds when detected.
    pub age_secs: u64,
}

/// Outcome of one reconciliation pass for one (account, exchange) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Reconciled account.
    pub account: AccountId,
    /// Reconciled exchange connection.
    pub exchange: ExchangeId,
    /// Positions adopted this pass.
    pub adopted: Vec<Position>,
    /// Positions that could not be adopted.
    pub failed: Vec<AdoptionFailure>,
    /// Positions already under management (no-ops).
    pub already_tracked: usize,
    /// Symbols skipped because they are quarantined.
    pub skipped_quarantined: Vec<String>,
    /// Resting orders on exactly one side of the ledger/venue diff.
    pub orphan_orders: Vec<OrphanOrder>,
    /// When the pass started.
    pub started_at: DateTime<Utc>,
}

impl ReconciliationReport {
    /// Start an empty report for a pass beginning now.
    #[must_use]
    pub fn begin(account: AccountId, exchange: ExchangeId) -> Self {
        Self {
            account,
            exchange,
            adopted: Vec::new(),
            failed: Vec::new(),
            already_tracked: 0,
            skipped_quarantined: Vec::new(),
            orphan_orders: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// True when nothing failed, nothing is quarantined, and the order diff
    /// came back empty.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.skipped_quarantined.is_empty()
            && self.orphan_orders.is_empty()
    }

    /// One-line summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "adopted={} failed={} already_tracked={} quarantined={} orphans={}",
            self.adopted.len(),
            self.failed.len(),
            self.already_tracked,
            self.skipped_quarantined.len(),
            self.orphan_orders.len()
        )
    }
}
