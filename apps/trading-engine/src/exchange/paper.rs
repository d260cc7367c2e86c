//! In-process paper venue.
//!
//! Fills market orders instantly at a settable mark price with adjustable
//! adverse slippage, tracks positions and balances per account, and
//! enforces the strictly-increasing sequence rule the way a real
//! sequence-authenticated venue would. Used for DRY_RUN and as the test
//! double everywhere a venue is needed.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{AccountId, OrderSide};

use super::{ExchangeAdapter, ExchangeError, RawOrder, RawPosition, RawResponse, WireFill, WireOrder};

#[derive(Debug, Clone)]
struct PaperPosition {
    side: OrderSide,
    quantity: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    marks: HashMap<String, Decimal>,
    adverse_slippage: Decimal,
    balances: HashMap<AccountId, Decimal>,
    positions: HashMap<(AccountId, String), PaperPosition>,
    open_orders: Vec<RawOrder>,
    failing_symbols: HashSet<String>,
    fills: Vec<WireFill>,
}

/// Simulated exchange with real sequence-authentication semantics.
#[derive(Debug, Default)]
pub struct PaperExchange {
    state: Mutex<PaperState>,
    last_sequence: AtomicU64,
    order_counter: AtomicU64,
}

impl PaperExchange {
    /// Create an empty paper venue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn locked<T>(&self, f: impl FnOnce(&mut PaperState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Set the mark price for `symbol`.
    pub fn set_mark(&self, symbol: &str, price: Decimal) {
        self.locked(|s| {
            s.marks.insert(symbol.to_string(), price);
        });
    }

    /// Set the adverse slippage fraction applied to every fill.
    pub fn set_adverse_slippage(&self, fraction: Decimal) {
        self.locked(|s| s.adverse_slippage = fraction);
    }

    /// Set the available balance for `account`.
    pub fn set_balance(&self, account: &AccountId, balance: Decimal) {
        self.locked(|s| {
            s.balances.insert(account.clone(), balance);
        });
    }

    /// Seed an exchange-side position (for reconciliation scenarios).
    pub fn seed_position(&self, account: &AccountId, symbol: &str, side: OrderSide, quantity: Decimal) {
        self.locked(|s| {
            s.positions
                .insert((account.clone(), symbol.to_string()), PaperPosition { side, quantity });
        });
    }

    /// Seed an exchange-side resting order.
    pub fn seed_open_order(&self, order: RawOrder) {
        self.locked(|s| s.open_orders.push(order));
    }

    /// Make price lookups for `symbol` fail until restored.
    pub fn fail_price_lookups_for(&self, symbol: &str) {
        self.locked(|s| {
            s.failing_symbols.insert(symbol.to_string());
        });
    }

    /// Let price lookups for `symbol` succeed again.
    pub fn restore_price_lookups_for(&self, symbol: &str) {
        self.locked(|s| {
            s.failing_symbols.remove(symbol);
        });
    }

    /// All fills executed so far, in order.
    pub fn fills(&self) -> Vec<WireFill> {
        self.locked(|s| s.fills.clone())
    }

    fn execute(&self, order: &WireOrder) -> Result<WireFill, ExchangeError> {
        self.locked(|s| {
            if s.failing_symbols.contains(&order.symbol) {
                return Err(ExchangeError::PriceUnavailable(order.symbol.clone()));
            }
            let mark = *s
                .marks
                .get(&order.symbol)
                .ok_or_else(|| ExchangeError::PriceUnavailable(order.symbol.clone()))?;

            // Slippage is always adverse to the taker.
            let price = match order.side {
                OrderSide::Buy => mark * (Decimal::ONE + s.adverse_slippage),
                OrderSide::Sell => mark * (Decimal::ONE - s.adverse_slippage),
            };
            let notional = price * order.quantity;

            let balance = s.balances.entry(order.account.clone()).or_default();
            match order.side {
                OrderSide::Buy => *balance -= notional,
                OrderSide::Sell => *balance += notional,
            }

            let key = (order.account.clone(), order.symbol.clone());
            match s.positions.get_mut(&key) {
                Some(position) if position.side == order.side => {
                    position.quantity += order.quantity;
                }
                Some(position) => {
                    position.quantity -= order.quantity;
                    if position.quantity <= Decimal::ZERO {
                        s.positions.remove(&key);
                    }
                }
                None => {
                    s.positions.insert(
                        key,
                        PaperPosition {
                            side: order.side,
                            quantity: order.quantity,
                        },
                    );
                }
            }

            let fill = WireFill {
                order_id: format!("paper-{}", self.order_counter.fetch_add(1, Ordering::SeqCst) + 1),
                symbol: order.symbol.clone(),
                side: order.side,
                price,
                quantity: order.quantity,
            };
            s.fills.push(fill.clone());
            Ok(fill)
        })
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn shares_sequence_scope(&self) -> bool {
        true
    }

    async fn sign_and_send(
        &self,
        method: &str,
        path: &str,
        body: &serde_json::Value,
        sequence: u64,
    ) -> Result<RawResponse, ExchangeError> {
        // Strictly-increasing sequence, exactly like a nonce-authenticated
        // venue: an equal or lower value is a replay and gets rejected.
        let prev = self.last_sequence.fetch_max(sequence, Ordering::SeqCst);
        if sequence <= prev {
            return Err(ExchangeError::SequenceRejected { sequence });
        }

        match (method, path) {
            ("POST", "/orders") => {
                let order: WireOrder = serde_json::from_value(body.clone())
                    .map_err(|e| ExchangeError::Rejected(format!("malformed order body: {e}")))?;
                let fill = self.execute(&order)?;
                Ok(RawResponse {
                    status: 200,
                    body: serde_json::to_value(&fill)
                        .map_err(|e| ExchangeError::Transport(e.to_string()))?,
                })
            }
            _ => Err(ExchangeError::Transport(format!(
                "no route for {method} {path}"
            ))),
        }
    }

    async fn get_open_orders(&self, _account: &AccountId) -> Result<Vec<RawOrder>, ExchangeError> {
        Ok(self.locked(|s| s.open_orders.clone()))
    }

    async fn get_positions(&self, account: &AccountId) -> Result<Vec<RawPosition>, ExchangeError> {
        Ok(self.locked(|s| {
            s.positions
                .iter()
                .filter(|((a, _), _)| a == account)
                .map(|((_, symbol), p)| RawPosition {
                    symbol: symbol.clone(),
                    side: p.side,
                    quantity: Some(p.quantity),
                    entry_price: None,
                })
                .collect()
        }))
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.locked(|s| {
            if s.failing_symbols.contains(symbol) {
                return Err(ExchangeError::PriceUnavailable(symbol.to_string()));
            }
            s.marks
                .get(symbol)
                .copied()
                .ok_or_else(|| ExchangeError::PriceUnavailable(symbol.to_string()))
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError> {
        Ok(self.locked(|s| {
            let before = s.open_orders.len();
            s.open_orders.retain(|o| o.order_id != order_id);
            s.open_orders.len() < before
        }))
    }

    async fn get_balance(&self, account: &AccountId) -> Result<Decimal, ExchangeError> {
        Ok(self.locked(|s| s.balances.get(account).copied().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn account() -> AccountId {
        AccountId::new("a1")
    }

    fn order_body(symbol: &str, side: OrderSide, quantity: Decimal) -> serde_json::Value {
        serde_json::to_value(WireOrder {
            account: account(),
            symbol: symbol.to_string(),
            side,
            quantity,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_stale_sequence_rejected() {
        let venue = PaperExchange::new();
        venue.set_mark("BTCUSDT", dec!(100));

        let body = order_body("BTCUSDT", OrderSide::Buy, dec!(1));
        venue.sign_and_send("POST", "/orders", &body, 5).await.unwrap();

        let replay = venue.sign_and_send("POST", "/orders", &body, 5).await;
        assert!(matches!(
            replay,
            Err(ExchangeError::SequenceRejected { sequence: 5 })
        ));
        let lower = venue.sign_and_send("POST", "/orders", &body, 4).await;
        assert!(matches!(lower, Err(ExchangeError::SequenceRejected { .. })));

        venue.sign_and_send("POST", "/orders", &body, 6).await.unwrap();
    }

    #[tokio::test]
    async fn test_fill_applies_adverse_slippage_both_sides() {
        let venue = PaperExchange::new();
        venue.set_mark("BTCUSDT", dec!(100));
        venue.set_adverse_slippage(dec!(0.01));

        let buy = venue
            .sign_and_send("POST", "/orders", &order_body("BTCUSDT", OrderSide::Buy, dec!(1)), 1)
            .await
            .unwrap();
        let fill: WireFill = serde_json::from_value(buy.body).unwrap();
        assert_eq!(fill.price, dec!(101.00));

        let sell = venue
            .sign_and_send("POST", "/orders", &order_body("BTCUSDT", OrderSide::Sell, dec!(1)), 2)
            .await
            .unwrap();
        let fill: WireFill = serde_json::from_value(sell.body).unwrap();
        assert_eq!(fill.price, dec!(99.00));
    }

    #[tokio::test]
    async fn test_positions_and_balance_update_on_fills() {
        let venue = PaperExchange::new();
        venue.set_mark("ETHUSDT", dec!(2000));
        venue.set_balance(&account(), dec!(5000));

        venue
            .sign_and_send("POST", "/orders", &order_body("ETHUSDT", OrderSide::Buy, dec!(2)), 1)
            .await
            .unwrap();
        assert_eq!(venue.get_balance(&account()).await.unwrap(), dec!(1000));

        let positions = venue.get_positions(&account()).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, Some(dec!(2)));

        // Selling the full quantity closes the exchange-side position.
        venue
            .sign_and_send("POST", "/orders", &order_body("ETHUSDT", OrderSide::Sell, dec!(2)), 2)
            .await
            .unwrap();
        assert!(venue.get_positions(&account()).await.unwrap().is_empty());
        assert_eq!(venue.get_balance(&account()).await.unwrap(), dec!(5000));
    }

    #[tokio::test]
    async fn test_price_failure_is_explicit() {
        let venue = PaperExchange::new();
        venue.set_mark("DOGEUSDT", dec!(0.1));
        venue.fail_price_lookups_for("DOGEUSDT");

        assert!(matches!(
            venue.get_price("DOGEUSDT").await,
            Err(ExchangeError::PriceUnavailable(_))
        ));

        venue.restore_price_lookups_for("DOGEUSDT");
        assert_eq!(venue.get_price("DOGEUSDT").await.unwrap(), dec!(0.1));

        assert!(matches!(
            venue.get_price("UNLISTED").await,
            Err(ExchangeError::PriceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_order_reports_presence() {
        let venue = PaperExchange::new();
        venue.seed_open_order(RawOrder {
            order_id: "paper-99".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            price: Some(dec!(90)),
            quantity: dec!(1),
            created_at: Utc::now(),
        });

        assert!(venue.cancel_order("paper-99").await.unwrap());
        assert!(!venue.cancel_order("paper-99").await.unwrap());
    }
}
