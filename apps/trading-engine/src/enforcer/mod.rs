//! Background enforcement of exit invariants.
//!
//! The enforcer is a separately scheduled, independently failing loop. It
//! does not trust the primary decision loop to be healthy: whatever state
//! that loop is in (throwing, hanging, mid-restart), the enforcer keeps
//! re-asserting the invariants that protect capital:
//!
//! - position count per connection stays at or under the configured cap;
//!   excess positions are force-exited smallest-value-first
//! - accounts flagged for forced unwind have every position routed through
//!   exit regardless of P&L
//! - stale open orders are cancelled
//! - integrity violations with no safe automatic remedy (double
//!   reservation, fragmentation) are loudly reported for operator action
//!
//! Every step is contained: one account's failure never stops the sweep,
//! and a failed cycle never stops the loop.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{EnforcementConfig, LedgerConfig};
use crate::exchange::ExchangeAdapter;
use crate::gateway::ExecutionGateway;
use crate::models::AccountId;

/// Independently scheduled exit enforcement task.
pub struct ExitEnforcer<E: ExchangeAdapter + ?Sized> {
    gateway: Arc<ExecutionGateway<E>>,
    accounts: Vec<AccountId>,
    config: EnforcementConfig,
    ledger_config: LedgerConfig,
    /// Accounts flagged for forced unwind, with the operator's reason.
    forced_unwind: RwLock<HashMap<AccountId, String>>,
}

impl<E: ExchangeAdapter + ?Sized> ExitEnforcer<E> {
    /// Create an enforcer sweeping `accounts` through `gateway`.
    #[must_use]
    pub fn new(
        gateway: Arc<ExecutionGateway<E>>,
        accounts: Vec<AccountId>,
        config: EnforcementConfig,
        ledger_config: LedgerConfig,
    ) -> Self {
        Self {
            gateway,
            accounts,
            config,
            ledger_config,
            forced_unwind: RwLock::new(HashMap::new()),
        }
    }

    /// Flag `account` for forced unwind: every open position is routed
    /// through exit regardless of P&L until the flag is cleared.
    pub fn set_forced_unwind(&self, account: &AccountId, reason: &str) {
        warn!(account = %account, reason, "Forced unwind enabled");
        let mut flags = match self.forced_unwind.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        flags.insert(account.clone(), reason.to_string());
    }

    /// Clear the forced-unwind flag. Returns whether it was set.
    pub fn clear_forced_unwind(&self, account: &AccountId, reason: &str) -> bool {
        let removed = {
            let mut flags = match self.forced_unwind.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            flags.remove(account).is_some()
        };
        if removed {
            info!(account = %account, reason, "Forced unwind cleared");
        }
        removed
    }

    /// Whether `account` is currently flagged.
    #[must_use]
    pub fn is_forced_unwind(&self, account: &AccountId) -> bool {
        match self.forced_unwind.read() {
            Ok(flags) => flags.contains_key(account),
            Err(poisoned) => poisoned.into_inner().contains_key(account),
        }
    }

    /// Run the enforcement loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval_secs,
            max_open_positions = self.config.max_open_positions,
            "Exit enforcer started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("Exit enforcer shutting down");
                    break;
                }
            }
        }
    }

    /// One full enforcement sweep over all accounts.
    pub async fn run_cycle(&self) {
        for account in &self.accounts {
            self.enforce_account(account).await;
        }
    }

    async fn enforce_account(&self, account: &AccountId) {
        let ledger = Arc::clone(self.gateway.ledger());
        let positions = ledger.positions(account);

        if self.is_forced_unwind(account) {
            for position in &positions {
                match self
                    .gateway
                    .submit_exit(account, &position.symbol, None, true)
                    .await
                {
                    Ok(fill) => info!(
                        account = %account,
                        symbol = %position.symbol,
                        price = %fill.price,
                        "Forced unwind exit filled"
                    ),
                    Err(e) => error!(
                        account = %account,
                        symbol = %position.symbol,
                        error = %e,
                        "Forced unwind exit failed"
                    ),
                }
            }
        } else if positions.len() > self.config.max_open_positions {
            // Cap overage: shed the smallest-value positions first so the
            // cheapest risk leaves and the book converges with the fewest
            // exits.
            let excess = positions.len() - self.config.max_open_positions;
            let mut by_size = positions.clone();
            by_size.sort_by(|a, b| a.size_in_quote_currency.cmp(&b.size_in_quote_currency));

            error!(
                account = %account,
                open = positions.len(),
                cap = self.config.max_open_positions,
                shedding = excess,
                "Position cap exceeded"
            );

            for position in by_size.iter().take(excess) {
                match self
                    .gateway
                    .submit_exit(account, &position.symbol, None, true)
                    .await
                {
                    Ok(_) => info!(
                        account = %account,
                        symbol = %position.symbol,
                        size_quote = %position.size_in_quote_currency,
                        "Excess position closed"
                    ),
                    Err(e) => error!(
                        account = %account,
                        symbol = %position.symbol,
                        error = %e,
                        "Excess position exit failed"
                    ),
                }
            }
        }

        // Stale order sweep: cancel resting orders past their max age.
        let stale = ledger.stale_orders(
            account,
            Duration::from_secs(self.ledger_config.stale_order_max_age_secs),
        );
        for order in stale {
            match self.gateway.cancel_order(account, &order.order_id).await {
                Ok(_) => warn!(
                    account = %account,
                    order_id = %order.order_id,
                    symbol = %order.symbol,
                    "Stale order cancelled"
                ),
                Err(e) => error!(
                    account = %account,
                    order_id = %order.order_id,
                    symbol = %order.symbol,
                    error = %e,
                    "Stale order cancel failed"
                ),
            }
        }

        // Integrity checks: report-only, no safe automatic remedy.
        for position in &ledger.positions(account) {
            let (violated, explanation) =
                ledger.check_double_reservation(&position.position_id, account);
            if violated {
                error!(
                    account = %account,
                    symbol = %position.symbol,
                    %explanation,
                    "DOUBLE RESERVATION detected"
                );
            }
        }
        match self.gateway.balance(account).await {
            Ok(balance) => {
                let (fragmented, explanation) = ledger.detect_fragmentation(
                    account,
                    balance,
                    self.ledger_config.fragmentation_warn_fraction,
                );
                if fragmented {
                    warn!(account = %account, %explanation, "Capital fragmentation detected");
                }
            }
            Err(e) => warn!(
                account = %account,
                error = %e,
                "Balance unavailable; fragmentation check skipped"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, SequencerConfig};
    use crate::exchange::{PaperExchange, RetryPolicy};
    use crate::ledger::AccountLedger;
    use crate::models::{ExchangeId, OrderSide, Position};
    use crate::persistence::FileStore;
    use crate::sequencer::SequenceGenerator;
    use crate::state::{KillSwitch, TradingStateMachine};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Fixture {
        _dir: tempfile::TempDir,
        venue: Arc<PaperExchange>,
        ledger: Arc<AccountLedger>,
        enforcer: Arc<ExitEnforcer<PaperExchange>>,
    }

    async fn make_fixture(max_open_positions: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state")).unwrap();
        let sequencer = Arc::new(
            SequenceGenerator::load(
                SequencerConfig {
                    warmup_secs: 0,
                    ..Default::default()
                },
                store,
            )
            .await
            .unwrap(),
        );
        let ledger = Arc::new(AccountLedger::new());
        let state = Arc::new(TradingStateMachine::new(KillSwitch::new(
            dir.path().join("kill_switch.json"),
        )));

        let venue = Arc::new(PaperExchange::new());
        let gateway = Arc::new(ExecutionGateway::new(
            Arc::clone(&venue),
            ExchangeId::new("paper"),
            sequencer,
            Arc::clone(&ledger),
            state,
            RetryPolicy::none(),
            ExecutionConfig::default(),
        ));
        let enforcer = Arc::new(ExitEnforcer::new(
            gateway,
            vec![account()],
            EnforcementConfig {
                interval_secs: 1,
                max_open_positions,
            },
            LedgerConfig::default(),
        ));
        Fixture {
            _dir: dir,
            venue,
            ledger,
            enforcer,
        }
    }

    fn account() -> AccountId {
        AccountId::new("a1")
    }

    fn seed(f: &Fixture, symbol: &str, quantity: Decimal, mark: Decimal) {
        f.venue.set_mark(symbol, mark);
        f.venue.seed_position(&account(), symbol, OrderSide::Buy, quantity);
        f.ledger.track_position(Position::adopted(
            account(),
            ExchangeId::new("paper"),
            symbol,
            OrderSide::Buy,
            mark,
            quantity,
        ));
    }

    #[tokio::test]
    async fn test_cap_overage_sheds_smallest_first() {
        let f = make_fixture(2).await;
        seed(&f, "BTCUSDT", dec!(1), dec!(50000)); // 50k
        seed(&f, "ETHUSDT", dec!(1), dec!(2500)); // 2.5k
        seed(&f, "DOGEUSDT", dec!(100), dec!(0.1)); // 10

        f.enforcer.run_cycle().await;

        let remaining = f.ledger.positions(&account());
        assert_eq!(remaining.len(), 2);
        // The smallest-value position is the one that got shed.
        assert!(remaining.iter().all(|p| p.symbol != "DOGEUSDT"));
    }

    #[tokio::test]
    async fn test_under_cap_is_untouched() {
        let f = make_fixture(5).await;
        seed(&f, "BTCUSDT", dec!(1), dec!(50000));

        f.enforcer.run_cycle().await;
        assert_eq!(f.ledger.positions(&account()).len(), 1);
    }

    #[tokio::test]
    async fn test_forced_unwind_closes_everything() {
        let f = make_fixture(10).await;
        seed(&f, "BTCUSDT", dec!(1), dec!(50000));
        seed(&f, "ETHUSDT", dec!(2), dec!(2500));

        f.enforcer.set_forced_unwind(&account(), "operator de-risking");
        assert!(f.enforcer.is_forced_unwind(&account()));

        f.enforcer.run_cycle().await;
        assert!(f.ledger.positions(&account()).is_empty());
        assert!(f.venue.get_positions(&account()).await.unwrap().is_empty());

        assert!(f.enforcer.clear_forced_unwind(&account(), "done"));
        assert!(!f.enforcer.clear_forced_unwind(&account(), "again"));
    }

    #[tokio::test]
    async fn test_stale_orders_cancelled() {
        let f = make_fixture(10).await;
        let mut order = crate::models::Order::entry(
            account(),
            ExchangeId::new("paper"),
            "BTCUSDT",
            OrderSide::Buy,
            dec!(90),
            dec!(1),
            dec!(90),
        );
        order.status = crate::models::OrderStatus::Open;
        order.created_at = chrono::Utc::now() - chrono::Duration::hours(3);
        let order_id = order.order_id.clone();
        f.ledger.add_order(order);

        f.enforcer.run_cycle().await;

        assert_eq!(
            f.ledger.get_order(&account(), &order_id).unwrap().status,
            crate::models::OrderStatus::Cancelled
        );
        assert_eq!(f.ledger.reserved_capital(&account()), dec!(0));
    }

    #[tokio::test]
    async fn test_cycle_survives_exchange_failure() {
        let f = make_fixture(1).await;
        // Two positions over a cap of one, but the venue cannot price the
        // symbol, so the exit fails. The cycle must finish anyway.
        f.ledger.track_position(Position::adopted(
            account(),
            ExchangeId::new("paper"),
            "GHOST",
            OrderSide::Buy,
            dec!(10),
            dec!(1),
        ));
        f.ledger.track_position(Position::adopted(
            account(),
            ExchangeId::new("paper"),
            "PHANTOM",
            OrderSide::Buy,
            dec!(20),
            dec!(1),
        ));

        f.enforcer.run_cycle().await;

        // Exits failed (no marks on the venue), positions still tracked.
        assert_eq!(f.ledger.positions(&account()).len(), 2);
    }
}
