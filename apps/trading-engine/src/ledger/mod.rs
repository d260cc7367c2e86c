//! Per-account order, reservation, and position tracking.
//!
//! The ledger is the single place the engine mutates account state. Every
//! account gets its own critical section (one mutex per account book behind
//! a registry lock), so two accounts never block each other and all readers
//! of one account observe a per-account-linearizable view.
//!
//! Besides bookkeeping, the ledger carries the execution-integrity checks:
//! double reservation (two orders on one position both holding capital),
//! fragmentation (too much balance locked in open-order reservations), and
//! stale orders. Violations are reported to callers; the enforcement loop
//! and operators decide what to do with them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{AccountId, Order, OrderId, OrderStatus, Position, PositionId};
use crate::persistence::LedgerSnapshot;

/// Aggregate per-account counters for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStats {
    /// Orders currently holding reservations.
    pub open_orders: usize,
    /// Orders filled over the ledger's lifetime.
    pub filled_orders: usize,
    /// Orders cancelled or rejected.
    pub closed_orders: usize,
    /// Positions under management.
    pub open_positions: usize,
    /// Capital held by open-order reservations.
    pub reserved_capital: Decimal,
    /// Age in seconds of the oldest open order, if any.
    pub oldest_open_order_age_secs: Option<i64>,
}

/// One account's books: orders, positions, and the reservation total.
#[derive(Debug, Default)]
struct AccountBook {
    orders: HashMap<OrderId, Order>,
    /// Positions keyed by symbol; at most one per symbol per account.
    positions: HashMap<String, Position>,
    reserved_capital: Decimal,
}

impl AccountBook {
    fn release_reservation(&mut self, order: &Order) {
        if order.is_entry() && order.reserved_capital > Decimal::ZERO {
            self.reserved_capital -= order.reserved_capital;
            if self.reserved_capital < Decimal::ZERO {
                // Accounting defect rather than a real negative balance.
                warn!(
                    account = %order.account_id,
                    order_id = %order.order_id,
                    "Reservation release drove total negative; clamping to zero"
                );
                self.reserved_capital = Decimal::ZERO;
            }
        }
    }
}

/// Per-account, per-asset record of orders, reservations, and positions.
#[derive(Debug, Default)]
pub struct AccountLedger {
    books: RwLock<HashMap<AccountId, Arc<Mutex<AccountBook>>>>,
}

impl AccountLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the book for `account`.
    fn book(&self, account: &AccountId) -> Arc<Mutex<AccountBook>> {
        if let Ok(books) = self.books.read() {
            if let Some(book) = books.get(account) {
                return Arc::clone(book);
            }
        }
        let mut books = match self.books.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(books.entry(account.clone()).or_default())
    }

    fn locked<T>(&self, account: &AccountId, f: impl FnOnce(&mut AccountBook) -> T) -> T {
        let book = self.book(account);
        let mut guard = match book.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Register an order.
    ///
    /// Entries (orders with no parent position) increase the account's
    /// reserved capital by `order.reserved_capital`; orders attached to a
    /// position never reserve again.
    pub fn add_order(&self, order: Order) {
        self.locked(&order.account_id.clone(), |book| {
            if book.orders.contains_key(&order.order_id) {
                warn!(
                    account = %order.account_id,
                    order_id = %order.order_id,
                    "Duplicate order registration ignored"
                );
                return;
            }
            if order.is_entry() && order.status.holds_reservation() {
                book.reserved_capital += order.reserved_capital;
            }
            debug!(
                account = %order.account_id,
                order_id = %order.order_id,
                symbol = %order.symbol,
                reserved = %order.reserved_capital,
                "Order registered"
            );
            book.orders.insert(order.order_id.clone(), order);
        });
    }

    /// Transition an order to filled, releasing its reservation.
    ///
    /// Idempotent: a second call for the same order is a no-op returning
    /// `false`, as is a call for an unknown order.
    pub fn mark_filled(&self, order_id: &OrderId, account: &AccountId) -> bool {
        self.locked(account, |book| {
            let Some(order) = book.orders.get(order_id) else {
                return false;
            };
            if !order.status.holds_reservation() {
                return false;
            }
            let order = order.clone();
            book.release_reservation(&order);
            if let Some(stored) = book.orders.get_mut(order_id) {
                stored.status = OrderStatus::Filled;
            }
            true
        })
    }

    /// Record the realized fill price and mark the order filled.
    pub fn record_fill(&self, order_id: &OrderId, account: &AccountId, price: Decimal) -> bool {
        self.locked(account, |book| {
            if let Some(order) = book.orders.get_mut(order_id) {
                order.filled_price = Some(price);
            }
        });
        self.mark_filled(order_id, account)
    }

    /// Transition an order to cancelled (or rejected), releasing its
    /// reservation. Idempotent like [`Self::mark_filled`].
    pub fn mark_closed(&self, order_id: &OrderId, account: &AccountId, status: OrderStatus) -> bool {
        debug_assert!(status.is_terminal());
        self.locked(account, |book| {
            let Some(order) = book.orders.get(order_id) else {
                return false;
            };
            if !order.status.holds_reservation() {
                return false;
            }
            let order = order.clone();
            book.release_reservation(&order);
            if let Some(stored) = book.orders.get_mut(order_id) {
                stored.status = status;
            }
            true
        })
    }

    /// Whether a new reservation of `amount` fits inside `balance` plus the
    /// safety margin, given what the account already has reserved.
    pub fn can_reserve(
        &self,
        account: &AccountId,
        amount: Decimal,
        balance: Decimal,
        safety_margin: Decimal,
    ) -> bool {
        self.locked(account, |book| {
            book.reserved_capital + amount <= balance * (Decimal::ONE + safety_margin)
        })
    }

    /// Detect two or more orders on one position independently holding
    /// capital.
    ///
    /// Returns `(true, explanation)` when the invariant is violated. The
    /// capital for a position is reserved exactly once, by its entry order;
    /// attached stop/target/exit orders must carry a zero reservation.
    pub fn check_double_reservation(
        &self,
        position_id: &PositionId,
        account: &AccountId,
    ) -> (bool, String) {
        self.locked(account, |book| {
            let entry_order_id = book
                .positions
                .values()
                .find(|p| &p.position_id == position_id)
                .and_then(|p| p.entry_order_id.clone());

            let reserving: Vec<&Order> = book
                .orders
                .values()
                .filter(|o| {
                    o.parent_position_id.as_ref() == Some(position_id)
                        || entry_order_id.as_ref() == Some(&o.order_id)
                })
                .filter(|o| {
                    o.reserved_capital > Decimal::ZERO
                        && !matches!(o.status, OrderStatus::Cancelled | OrderStatus::Rejected)
                })
                .collect();

            if reserving.len() > 1 {
                let detail: Vec<String> = reserving
                    .iter()
                    .map(|o| format!("{} holds {}", o.order_id, o.reserved_capital))
                    .collect();
                (
                    true,
                    format!(
                        "position {position_id} has {} orders holding capital: {}",
                        reserving.len(),
                        detail.join(", ")
                    ),
                )
            } else {
                (
                    false,
                    format!("position {position_id} reserves capital at most once"),
                )
            }
        })
    }

    /// Detect capital fragmentation: too much of the balance locked in
    /// open-order reservations, usually many small stuck orders.
    pub fn detect_fragmentation(
        &self,
        account: &AccountId,
        account_balance: Decimal,
        warn_threshold_fraction: Decimal,
    ) -> (bool, String) {
        self.locked(account, |book| {
            let held = book.reserved_capital;
            let limit = account_balance * warn_threshold_fraction;
            if held > limit {
                let open = book
                    .orders
                    .values()
                    .filter(|o| o.status.holds_reservation())
                    .count();
                (
                    true,
                    format!(
                        "{held} of {account_balance} held across {open} open orders \
                         (threshold {warn_threshold_fraction})"
                    ),
                )
            } else {
                (false, format!("{held} held of {account_balance} balance"))
            }
        })
    }

    /// Open orders older than `max_age`.
    pub fn stale_orders(&self, account: &AccountId, max_age: Duration) -> Vec<Order> {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        self.locked(account, |book| {
            book.orders
                .values()
                .filter(|o| o.status.holds_reservation() && o.age(now) > max_age)
                .cloned()
                .collect()
        })
    }

    /// Identify (and with `force`, locally cancel) open orders older than
    /// `max_age`. Returns the number of stale orders found. Safe to call
    /// repeatedly; exchange-side cancellation is the enforcer's job.
    pub fn cleanup_stale(&self, account: &AccountId, max_age: Duration, force: bool) -> usize {
        let stale = self.stale_orders(account, max_age);
        for order in &stale {
            warn!(
                account = %account,
                order_id = %order.order_id,
                symbol = %order.symbol,
                age_secs = order.age(Utc::now()).num_seconds(),
                force,
                "Stale open order"
            );
            if force {
                self.mark_closed(&order.order_id, account, OrderStatus::Cancelled);
            }
        }
        stale.len()
    }

    /// Aggregate counters for `account`.
    pub fn get_account_stats(&self, account: &AccountId) -> AccountStats {
        let now = Utc::now();
        self.locked(account, |book| {
            let open: Vec<&Order> = book
                .orders
                .values()
                .filter(|o| o.status.holds_reservation())
                .collect();
            AccountStats {
                open_orders: open.len(),
                filled_orders: book
                    .orders
                    .values()
                    .filter(|o| o.status == OrderStatus::Filled)
                    .count(),
                closed_orders: book
                    .orders
                    .values()
                    .filter(|o| matches!(o.status, OrderStatus::Cancelled | OrderStatus::Rejected))
                    .count(),
                open_positions: book.positions.len(),
                reserved_capital: book.reserved_capital,
                oldest_open_order_age_secs: open
                    .iter()
                    .map(|o| o.age(now).num_seconds())
                    .max(),
            }
        })
    }

    /// Total capital currently reserved for `account`.
    pub fn reserved_capital(&self, account: &AccountId) -> Decimal {
        self.locked(account, |book| book.reserved_capital)
    }

    /// Fetch one order.
    pub fn get_order(&self, account: &AccountId, order_id: &OrderId) -> Option<Order> {
        self.locked(account, |book| book.orders.get(order_id).cloned())
    }

    /// All orders currently holding reservations for `account`.
    pub fn open_orders(&self, account: &AccountId) -> Vec<Order> {
        self.locked(account, |book| {
            book.orders
                .values()
                .filter(|o| o.status.holds_reservation())
                .cloned()
                .collect()
        })
    }

    /// Start tracking a position. Returns `false` (and leaves the existing
    /// record untouched) when the account already holds the symbol.
    pub fn track_position(&self, position: Position) -> bool {
        self.locked(&position.account_id.clone(), |book| {
            if book.positions.contains_key(&position.symbol) {
                return false;
            }
            debug!(
                account = %position.account_id,
                symbol = %position.symbol,
                source = ?position.source,
                size_quote = %position.size_in_quote_currency,
                "Position tracked"
            );
            book.positions.insert(position.symbol.clone(), position);
            true
        })
    }

    /// Whether the account already holds `symbol`.
    pub fn has_position(&self, account: &AccountId, symbol: &str) -> bool {
        self.locked(account, |book| book.positions.contains_key(symbol))
    }

    /// Stop tracking `symbol`, returning the removed position.
    pub fn remove_position(&self, account: &AccountId, symbol: &str) -> Option<Position> {
        self.locked(account, |book| book.positions.remove(symbol))
    }

    /// Reduce a position by `quantity`; removes it entirely when the
    /// remaining quantity would be zero or negative. Returns the state
    /// before reduction.
    pub fn reduce_position(
        &self,
        account: &AccountId,
        symbol: &str,
        quantity: Decimal,
    ) -> Option<Position> {
        self.locked(account, |book| {
            let position = book.positions.get(symbol)?.clone();
            if quantity >= position.quantity {
                book.positions.remove(symbol);
            } else if let Some(p) = book.positions.get_mut(symbol) {
                p.quantity -= quantity;
                p.size_in_quote_currency = p.entry_price * p.quantity;
            }
            Some(position)
        })
    }

    /// All positions under management for `account`.
    pub fn positions(&self, account: &AccountId) -> Vec<Position> {
        self.locked(account, |book| book.positions.values().cloned().collect())
    }

    /// Accounts with any recorded state.
    pub fn accounts(&self) -> Vec<AccountId> {
        match self.books.read() {
            Ok(books) => books.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Serialize all books for persistence.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut orders = Vec::new();
        let mut positions = Vec::new();
        for account in self.accounts() {
            self.locked(&account, |book| {
                orders.extend(book.orders.values().cloned());
                positions.extend(book.positions.values().cloned());
            });
        }
        LedgerSnapshot {
            saved_at: Utc::now(),
            orders,
            positions,
        }
    }

    /// Rebuild the ledger from a snapshot, recomputing reservation totals
    /// from the open entry orders it contains.
    pub fn restore(&self, snapshot: LedgerSnapshot) {
        for order in snapshot.orders {
            self.add_order(order);
        }
        for position in snapshot.positions {
            self.track_position(position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExchangeId, OrderSide};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn account() -> AccountId {
        AccountId::new("a1")
    }

    fn make_entry(symbol: &str, reserved: Decimal) -> Order {
        Order::entry(
            account(),
            ExchangeId::new("paper"),
            symbol,
            OrderSide::Buy,
            dec!(100),
            dec!(1),
            reserved,
        )
    }

    #[test]
    fn test_entry_reservation_lifecycle() {
        let ledger = AccountLedger::new();
        let order = make_entry("BTCUSDT", dec!(100));
        let order_id = order.order_id.clone();

        ledger.add_order(order);
        assert_eq!(ledger.reserved_capital(&account()), dec!(100));

        assert!(ledger.mark_filled(&order_id, &account()));
        assert_eq!(ledger.reserved_capital(&account()), dec!(0));

        // Second call is a no-op.
        assert!(!ledger.mark_filled(&order_id, &account()));
        assert_eq!(ledger.reserved_capital(&account()), dec!(0));
    }

    #[test]
    fn test_mark_filled_unknown_order_is_noop() {
        let ledger = AccountLedger::new();
        assert!(!ledger.mark_filled(&OrderId::generate(), &account()));
    }

    #[test]
    fn test_exit_orders_do_not_reserve() {
        let ledger = AccountLedger::new();
        let exit = Order::exit(
            account(),
            ExchangeId::new("paper"),
            "BTCUSDT",
            OrderSide::Sell,
            dec!(100),
            dec!(1),
            PositionId::generate(),
        );
        ledger.add_order(exit);
        assert_eq!(ledger.reserved_capital(&account()), dec!(0));
    }

    #[test]
    fn test_no_double_reservation_for_well_formed_position() {
        let ledger = AccountLedger::new();
        let entry = make_entry("BTCUSDT", dec!(100));
        let entry_id = entry.order_id.clone();
        ledger.add_order(entry);

        let position = Position::opened(
            account(),
            ExchangeId::new("paper"),
            "BTCUSDT",
            OrderSide::Buy,
            dec!(100),
            dec!(1),
            entry_id,
        );
        let position_id = position.position_id.clone();
        ledger.track_position(position);

        // Target order attached to the position, zero reservation.
        let target = Order::exit(
            account(),
            ExchangeId::new("paper"),
            "BTCUSDT",
            OrderSide::Sell,
            dec!(110),
            dec!(1),
            position_id.clone(),
        );
        ledger.add_order(target);

        let (violated, _) = ledger.check_double_reservation(&position_id, &account());
        assert!(!violated);
    }

    #[test]
    fn test_double_reservation_detected() {
        let ledger = AccountLedger::new();
        let entry = make_entry("BTCUSDT", dec!(100));
        let entry_id = entry.order_id.clone();
        ledger.add_order(entry);

        let position = Position::opened(
            account(),
            ExchangeId::new("paper"),
            "BTCUSDT",
            OrderSide::Buy,
            dec!(100),
            dec!(1),
            entry_id,
        );
        let position_id = position.position_id.clone();
        ledger.track_position(position);

        // A target order that wrongly reserves the same capital again.
        let mut target = Order::exit(
            account(),
            ExchangeId::new("paper"),
            "BTCUSDT",
            OrderSide::Sell,
            dec!(110),
            dec!(1),
            position_id.clone(),
        );
        target.reserved_capital = dec!(100);
        ledger.add_order(target);

        let (violated, explanation) = ledger.check_double_reservation(&position_id, &account());
        assert!(violated, "{explanation}");
        assert!(explanation.contains("2 orders"));
    }

    #[test]
    fn test_fragmentation_thresholds() {
        let ledger = AccountLedger::new();
        for i in 0..8 {
            ledger.add_order(make_entry(&format!("SYM{i}"), dec!(10)));
        }
        // $80 held, $100 balance, 30% threshold: fragmented.
        let (fragmented, _) =
            ledger.detect_fragmentation(&account(), dec!(100), dec!(0.30));
        assert!(fragmented);

        // Same held capital against a $5000 balance: fine.
        let (fragmented, _) =
            ledger.detect_fragmentation(&account(), dec!(5000), dec!(0.30));
        assert!(!fragmented);
    }

    #[test]
    fn test_cleanup_stale_counts_and_forces() {
        let ledger = AccountLedger::new();
        let mut old = make_entry("BTCUSDT", dec!(50));
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        let old_id = old.order_id.clone();
        ledger.add_order(old);
        ledger.add_order(make_entry("ETHUSDT", dec!(50)));

        let found = ledger.cleanup_stale(&account(), Duration::from_secs(3600), false);
        assert_eq!(found, 1);
        // Non-forced call leaves the order open.
        assert_eq!(ledger.open_orders(&account()).len(), 2);

        let forced = ledger.cleanup_stale(&account(), Duration::from_secs(3600), true);
        assert_eq!(forced, 1);
        assert_eq!(
            ledger.get_order(&account(), &old_id).unwrap().status,
            OrderStatus::Cancelled
        );
        assert_eq!(ledger.reserved_capital(&account()), dec!(50));

        // Repeated calls are safe and find nothing new.
        assert_eq!(ledger.cleanup_stale(&account(), Duration::from_secs(3600), true), 0);
    }

    #[test]
    fn test_position_adoption_is_at_most_once() {
        let ledger = AccountLedger::new();
        let position = Position::adopted(
            account(),
            ExchangeId::new("paper"),
            "SOLUSDT",
            OrderSide::Buy,
            dec!(150),
            dec!(2),
        );
        assert!(ledger.track_position(position.clone()));
        assert!(!ledger.track_position(position));
        assert_eq!(ledger.positions(&account()).len(), 1);
    }

    #[test]
    fn test_reduce_position_partial_and_full() {
        let ledger = AccountLedger::new();
        let position = Position::adopted(
            account(),
            ExchangeId::new("paper"),
            "SOLUSDT",
            OrderSide::Buy,
            dec!(100),
            dec!(4),
        );
        ledger.track_position(position);

        ledger.reduce_position(&account(), "SOLUSDT", dec!(1));
        let remaining = &ledger.positions(&account())[0];
        assert_eq!(remaining.quantity, dec!(3));
        assert_eq!(remaining.size_in_quote_currency, dec!(300));

        ledger.reduce_position(&account(), "SOLUSDT", dec!(3));
        assert!(ledger.positions(&account()).is_empty());
    }

    #[test]
    fn test_accounts_do_not_share_books() {
        let ledger = AccountLedger::new();
        ledger.add_order(make_entry("BTCUSDT", dec!(100)));

        let other = AccountId::new("a2");
        assert_eq!(ledger.reserved_capital(&other), dec!(0));
        assert!(ledger.open_orders(&other).is_empty());
    }

    #[test]
    fn test_stats_snapshot() {
        let ledger = AccountLedger::new();
        let entry = make_entry("BTCUSDT", dec!(100));
        let entry_id = entry.order_id.clone();
        ledger.add_order(entry);
        ledger.add_order(make_entry("ETHUSDT", dec!(40)));
        ledger.mark_filled(&entry_id, &account());

        let stats = ledger.get_account_stats(&account());
        assert_eq!(stats.open_orders, 1);
        assert_eq!(stats.filled_orders, 1);
        assert_eq!(stats.reserved_capital, dec!(40));
        assert!(stats.oldest_open_order_age_secs.is_some());
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let ledger = AccountLedger::new();
        ledger.add_order(make_entry("BTCUSDT", dec!(100)));
        ledger.track_position(Position::adopted(
            account(),
            ExchangeId::new("paper"),
            "ETHUSDT",
            OrderSide::Buy,
            dec!(2500),
            dec!(1),
        ));

        let snapshot = ledger.snapshot();
        let restored = AccountLedger::new();
        restored.restore(snapshot);

        assert_eq!(restored.reserved_capital(&account()), dec!(100));
        assert_eq!(restored.open_orders(&account()).len(), 1);
        assert!(restored.has_position(&account(), "ETHUSDT"));
    }

    proptest! {
        /// Whatever interleaving of fills and cancels happens, the running
        /// reservation total always equals the sum over orders that still
        /// hold a reservation, and never goes negative.
        #[test]
        fn prop_reservation_total_consistent(
            amounts in proptest::collection::vec(1u64..10_000, 1..20),
            close_mask in proptest::collection::vec(proptest::bool::ANY, 1..20),
        ) {
            let ledger = AccountLedger::new();
            let mut ids = Vec::new();
            for (i, cents) in amounts.iter().enumerate() {
                let order = make_entry(&format!("SYM{i}"), Decimal::new(*cents as i64, 2));
                ids.push(order.order_id.clone());
                ledger.add_order(order);
            }
            for (i, close) in close_mask.iter().enumerate() {
                if let Some(id) = ids.get(i) {
                    if *close {
                        ledger.mark_filled(id, &account());
                    } else {
                        ledger.mark_closed(id, &account(), OrderStatus::Cancelled);
                    }
                }
            }

            let expected: Decimal = ledger
                .open_orders(&account())
                .iter()
                .map(|o| o.reserved_capital)
                .sum();
            prop_assert_eq!(ledger.reserved_capital(&account()), expected);
            prop_assert!(ledger.reserved_capital(&account()) >= Decimal::ZERO);
        }
    }
}
