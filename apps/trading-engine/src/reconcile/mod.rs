//! Startup and on-demand position reconciliation.
//!
//! After any restart (or whenever an operator asks), the reconciler diffs
//! exchange-reported positions against the ledger. Every reported position
//! ends up either under management again (adopted, with the current market
//! price as its synthetic entry so P&L starts at zero) or explicitly
//! quarantined in the zombie-asset blacklist. Nothing is silently orphaned;
//! that property is what makes the engine crash-safe.
//!
//! Adoption is at-most-once per (account, symbol): re-running reconciliation
//! on an unchanged exchange position set is a no-op.

mod blacklist;
mod report;

pub use blacklist::ZombieBlacklist;
pub use report::{
    AdoptionFailure, AdoptionFailureReason, OrphanKind, OrphanOrder, ReconciliationReport,
};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::exchange::{ExchangeAdapter, ExchangeError, RetryPolicy, with_retry};
use crate::ledger::AccountLedger;
use crate::models::{AccountId, ExchangeId, OrderStatus, Position};

/// Diffs exchange positions against the ledger and adopts or quarantines
/// each discrepancy.
pub struct PositionReconciler {
    ledger: Arc<AccountLedger>,
    blacklist: Arc<ZombieBlacklist>,
    retry: RetryPolicy,
    config: ReconcileConfig,
}

impl PositionReconciler {
    /// Create a reconciler over `ledger` and `blacklist`.
    #[must_use]
    pub fn new(
        ledger: Arc<AccountLedger>,
        blacklist: Arc<ZombieBlacklist>,
        retry: RetryPolicy,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            ledger,
            blacklist,
            retry,
            config,
        }
    }

    /// Reconcile one (account, exchange) pair.
    ///
    /// Fails only when the venue cannot report positions at all; per-symbol
    /// problems are captured in the report, not the error.
    pub async fn reconcile(
        &self,
        account: &AccountId,
        exchange_id: &ExchangeId,
        exchange: &dyn ExchangeAdapter,
    ) -> Result<ReconciliationReport, ExchangeError> {
        let mut report = ReconciliationReport::begin(account.clone(), exchange_id.clone());

        let reported = with_retry(&self.retry, "get_positions", || {
            exchange.get_positions(account)
        })
        .await?;

        info!(
            account = %account,
            exchange = %exchange_id,
            reported = reported.len(),
            "Reconciliation started"
        );

        for raw in reported {
            if raw.symbol.trim().is_empty() {
                warn!(account = %account, "Venue reported a position with an empty symbol");
                report.failed.push(AdoptionFailure {
                    symbol: raw.symbol.clone(),
                    reason: AdoptionFailureReason::UnsupportedSymbol,
                    detail: "empty symbol".to_string(),
                });
                continue;
            }

            if self.blacklist.contains(&raw.symbol) {
                warn!(
                    account = %account,
                    symbol = %raw.symbol,
                    "Skipping quarantined symbol"
                );
                report.skipped_quarantined.push(raw.symbol.clone());
                continue;
            }

            if self.ledger.has_position(account, &raw.symbol) {
                report.already_tracked += 1;
                continue;
            }

            let Some(quantity) = raw.quantity else {
                self.blacklist
                    .quarantine(&raw.symbol, "quantity unavailable")
                    .await;
                report.failed.push(AdoptionFailure {
                    symbol: raw.symbol.clone(),
                    reason: AdoptionFailureReason::QuantityUnavailable,
                    detail: "venue reported no quantity".to_string(),
                });
                continue;
            };
            if quantity < self.config.min_adoptable_quantity {
                // Dust: reported, never quarantined, so a growing position
                // becomes adoptable later without operator action.
                report.failed.push(AdoptionFailure {
                    symbol: raw.symbol.clone(),
                    reason: AdoptionFailureReason::QuantityUnavailable,
                    detail: format!("dust quantity {quantity}"),
                });
                continue;
            }

            let price = match with_retry(&self.retry, "get_price", || {
                exchange.get_price(&raw.symbol)
            })
            .await
            {
                Ok(price) => price,
                Err(e) => {
                    let reason = match &e {
                        ExchangeError::UnsupportedSymbol(_) => {
                            AdoptionFailureReason::UnsupportedSymbol
                        }
                        _ => AdoptionFailureReason::PriceUnavailable,
                    };
                    self.blacklist.quarantine(&raw.symbol, &e.to_string()).await;
                    warn!(
                        account = %account,
                        symbol = %raw.symbol,
                        error = %e,
                        "Position adoption failed"
                    );
                    report.failed.push(AdoptionFailure {
                        symbol: raw.symbol.clone(),
                        reason,
                        detail: e.to_string(),
                    });
                    continue;
                }
            };

            let position = Position::adopted(
                account.clone(),
                exchange_id.clone(),
                raw.symbol.clone(),
                raw.side,
                price,
                quantity,
            );
            if self.ledger.track_position(position.clone()) {
                info!(
                    account = %account,
                    symbol = %raw.symbol,
                    quantity = %quantity,
                    mark_price = %price,
                    "Adopted exchange position"
                );
                report.adopted.push(position);
            } else {
                report.already_tracked += 1;
            }
        }

        self.diff_resting_orders(account, exchange, &mut report).await;

        info!(
            account = %account,
            exchange = %exchange_id,
            summary = %report.summary(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Diff resting orders both ways between the venue and the ledger.
    ///
    /// Orders the venue holds that the ledger does not know are reported
    /// for operator action. Ledger orders the venue no longer reports are
    /// cancelled locally so their reservation stops holding capital. Orders
    /// younger than the protection window are left alone; they may simply
    /// not have propagated yet.
    async fn diff_resting_orders(
        &self,
        account: &AccountId,
        exchange: &dyn ExchangeAdapter,
        report: &mut ReconciliationReport,
    ) {
        let venue_orders = match with_retry(&self.retry, "get_open_orders", || {
            exchange.get_open_orders(account)
        })
        .await
        {
            Ok(orders) => orders,
            Err(e) => {
                warn!(
                    account = %account,
                    error = %e,
                    "Open-order listing unavailable; order diff skipped"
                );
                return;
            }
        };

        let now = Utc::now();
        let local_open = self.ledger.open_orders(account);
        let local_venue_ids: HashSet<&str> = local_open
            .iter()
            .filter_map(|o| o.venue_order_id.as_deref())
            .collect();

        for raw in &venue_orders {
            if local_venue_ids.contains(raw.order_id.as_str()) {
                continue;
            }
            let age_secs = (now - raw.created_at).num_seconds().max(0) as u64;
            if age_secs < self.config.order_protection_window_secs {
                debug!(
                    account = %account,
                    order_id = %raw.order_id,
                    age_secs,
                    "Unknown venue order inside protection window; skipped"
                );
                continue;
            }
            warn!(
                account = %account,
                order_id = %raw.order_id,
                symbol = %raw.symbol,
                age_secs,
                "Venue holds an order the ledger does not know"
            );
            report.orphan_orders.push(OrphanOrder {
                kind: OrphanKind::UnknownOnVenue,
                order_id: raw.order_id.clone(),
                symbol: raw.symbol.clone(),
                age_secs,
            });
        }

        let venue_ids: HashSet<&str> = venue_orders.iter().map(|o| o.order_id.as_str()).collect();
        for order in &local_open {
            let Some(venue_id) = order.venue_order_id.as_deref() else {
                continue;
            };
            if venue_ids.contains(venue_id) {
                continue;
            }
            let age_secs = order.age(now).num_seconds().max(0) as u64;
            if age_secs < self.config.order_protection_window_secs {
                continue;
            }
            // The venue no longer knows the order; its reservation would
            // hold capital forever.
            self.ledger
                .mark_closed(&order.order_id, account, OrderStatus::Cancelled);
            warn!(
                account = %account,
                order_id = %order.order_id,
                symbol = %order.symbol,
                age_secs,
                "Ledger order missing on venue; cancelled locally"
            );
            report.orphan_orders.push(OrphanOrder {
                kind: OrphanKind::MissingOnVenue,
                order_id: venue_id.to_string(),
                symbol: order.symbol.clone(),
                age_secs,
            });
        }
    }

    /// Operator action: retry quarantined symbols and release those whose
    /// price lookup now succeeds. Returns the released symbols.
    pub async fn retry_quarantined(&self, exchange: &dyn ExchangeAdapter) -> Vec<String> {
        let mut released = Vec::new();
        for zombie in self.blacklist.entries() {
            match exchange.get_price(&zombie.symbol).await {
                Ok(price) => {
                    self.blacklist
                        .clear(&zombie.symbol, "price lookup recovered")
                        .await;
                    info!(symbol = %zombie.symbol, price = %price, "Zombie symbol recovered");
                    released.push(zombie.symbol);
                }
                Err(e) => {
                    warn!(symbol = %zombie.symbol, error = %e, "Zombie symbol still failing");
                }
            }
        }
        released
    }

    /// The blacklist this reconciler records into.
    #[must_use]
    pub fn blacklist(&self) -> &Arc<ZombieBlacklist> {
        &self.blacklist
    }
}

/// Unrealized P&L of `position` at `mark` (quote currency, positive = gain).
#[must_use]
pub fn unrealized_pnl(position: &Position, mark: Decimal) -> Decimal {
    let diff = mark - position.entry_price;
    let signed = match position.side {
        crate::models::OrderSide::Buy => diff,
        crate::models::OrderSide::Sell => -diff,
    };
    signed * position.quantity
}
