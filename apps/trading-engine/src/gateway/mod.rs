//! Order placement and cancellation gateway.
//!
//! Every order for one exchange connection flows through one
//! [`ExecutionGateway`]. The gateway is where the engine's safety rules
//! meet the wire:
//!
//! - entries are gated on trading state and on the account's reservable
//!   balance; exits are **never** gated on balance, because their whole
//!   purpose is to reduce risk and they must always be able to execute
//! - the exchange call lock is held around the entire
//!   build-sign-send-receive sequence, and every send attempt uses a fresh
//!   sequence value; a rejected sequence is never resent
//! - a confirmed fill is validated against the expected price, and an entry
//!   filled with more adverse slippage than configured is immediately
//!   unwound with an offsetting exit rather than left open
//! - ledger mutations happen only after a confirmed exchange response
//!
//! The gateway is generic over the adapter so tests and DRY_RUN can run the
//! identical code path against the paper venue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::exchange::{
    BackoffSchedule, ExchangeAdapter, ExchangeError, RetryPolicy, WireFill, WireOrder, with_retry,
};
use crate::ledger::AccountLedger;
use crate::models::{
    AccountId, ExchangeId, Fill, Order, OrderId, OrderSide, OrderStatus, Position,
};
use crate::sequencer::SequenceGenerator;
use crate::state::{TradingState, TradingStateMachine};

/// Errors from order submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The state machine does not currently allow entries.
    #[error("Trading halted: state is {0}")]
    TradingHalted(TradingState),

    /// The reservation does not fit the account's balance.
    #[error(
        "Insufficient balance for {account}: requested {requested}, already reserved {reserved}, balance {balance}"
    )]
    InsufficientBalance {
        /// Affected account.
        account: AccountId,
        /// Reservation requested for the new order.
        requested: Decimal,
        /// Capital already reserved.
        reserved: Decimal,
        /// Reported available balance.
        balance: Decimal,
    },

    /// The fill was worse than the configured slippage tolerance and was
    /// unwound.
    #[error(
        "Fill rejected: adverse slippage {slippage} exceeds limit (expected {expected}, filled {filled}), realized loss {realized_loss}"
    )]
    SlippageExceeded {
        /// Price the caller expected.
        expected: Decimal,
        /// Price actually realized.
        filled: Decimal,
        /// Adverse slippage as a fraction of the expected price.
        slippage: Decimal,
        /// Loss realized by the immediate unwind (quote currency).
        realized_loss: Decimal,
        /// Whether the offsetting exit confirmed. `false` means the bad
        /// fill is still open and needs operator attention.
        unwound: bool,
    },

    /// No tracked position to exit.
    #[error("No open position in {symbol} for {account}")]
    NoPosition {
        /// Affected account.
        account: AccountId,
        /// Requested symbol.
        symbol: String,
    },

    /// The venue call failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Serializes and validates order placement for one exchange connection.
pub struct ExecutionGateway<E: ExchangeAdapter + ?Sized> {
    exchange: Arc<E>,
    exchange_id: ExchangeId,
    sequencer: Arc<SequenceGenerator>,
    ledger: Arc<AccountLedger>,
    state: Arc<TradingStateMachine>,
    retry: RetryPolicy,
    config: ExecutionConfig,
}

impl<E: ExchangeAdapter + ?Sized> ExecutionGateway<E> {
    /// Create a gateway for one exchange connection.
    #[must_use]
    pub fn new(
        exchange: Arc<E>,
        exchange_id: ExchangeId,
        sequencer: Arc<SequenceGenerator>,
        ledger: Arc<AccountLedger>,
        state: Arc<TradingStateMachine>,
        retry: RetryPolicy,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            exchange,
            exchange_id,
            sequencer,
            ledger,
            state,
            retry,
            config,
        }
    }

    /// The connection this gateway routes to.
    #[must_use]
    pub fn exchange_id(&self) -> &ExchangeId {
        &self.exchange_id
    }

    /// The ledger this gateway mutates.
    #[must_use]
    pub fn ledger(&self) -> &Arc<AccountLedger> {
        &self.ledger
    }

    /// Reported available balance for `account`, with transient retry.
    pub async fn balance(&self, account: &AccountId) -> Result<Decimal, ExchangeError> {
        with_retry(&self.retry, "get_balance", || {
            self.exchange.get_balance(account)
        })
        .await
    }

    /// Submit an entry order.
    ///
    /// Gated on trading state and reservable balance. The realized fill is
    /// validated against `expected_price`; adverse slippage beyond the
    /// configured fraction gets the fill unwound immediately and reported
    /// as [`SubmitError::SlippageExceeded`].
    pub async fn submit_entry(
        &self,
        account: &AccountId,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        expected_price: Decimal,
    ) -> Result<Fill, SubmitError> {
        if !self.state.is_trading_allowed() {
            return Err(SubmitError::TradingHalted(self.state.current_state()));
        }

        let reservation = expected_price * quantity;
        let balance = self.balance(account).await?;
        if !self.ledger.can_reserve(
            account,
            reservation,
            balance,
            self.config.reserve_safety_margin,
        ) {
            let reserved = self.ledger.reserved_capital(account);
            warn!(
                account = %account,
                symbol,
                requested = %reservation,
                reserved = %reserved,
                balance = %balance,
                "Entry refused: reservation does not fit balance"
            );
            return Err(SubmitError::InsufficientBalance {
                account: account.clone(),
                requested: reservation,
                reserved,
                balance,
            });
        }

        let wire_fill = self.send_order(account, symbol, side, quantity).await?;

        // Confirmed response: now, and only now, mutate the ledger.
        let mut entry = Order::entry(
            account.clone(),
            self.exchange_id.clone(),
            symbol,
            side,
            expected_price,
            quantity,
            reservation,
        );
        entry.status = OrderStatus::Open;
        entry.venue_order_id = Some(wire_fill.order_id.clone());
        let entry_id = entry.order_id.clone();
        self.ledger.add_order(entry);
        self.ledger
            .record_fill(&entry_id, account, wire_fill.price);

        let position = Position::opened(
            account.clone(),
            self.exchange_id.clone(),
            symbol,
            side,
            wire_fill.price,
            quantity,
            entry_id.clone(),
        );
        let position_id = position.position_id.clone();
        if !self.ledger.track_position(position) {
            warn!(
                account = %account,
                symbol,
                "Entry filled for a symbol already under management; not re-tracked"
            );
        }

        let slippage = adverse_fraction(side, expected_price, wire_fill.price);
        if slippage > self.config.max_slippage_fraction {
            return Err(self
                .unwind_bad_fill(account, symbol, side, quantity, expected_price, &wire_fill, slippage)
                .await);
        }

        info!(
            account = %account,
            exchange = %self.exchange_id,
            symbol,
            side = %side,
            quantity = %quantity,
            price = %wire_fill.price,
            "Entry filled"
        );

        Ok(Fill {
            order_id: entry_id,
            position_id,
            symbol: symbol.to_string(),
            side,
            price: wire_fill.price,
            quantity,
            filled_at: Utc::now(),
        })
    }

    /// Submit an exit for (part of) an open position.
    ///
    /// Never gated on trading state or balance. `force` marks enforcement
    /// exits that bypass entry-side filters; it is logged so the audit
    /// trail shows who closed what and why.
    pub async fn submit_exit(
        &self,
        account: &AccountId,
        symbol: &str,
        quantity: Option<Decimal>,
        force: bool,
    ) -> Result<Fill, SubmitError> {
        let position = self
            .ledger
            .positions(account)
            .into_iter()
            .find(|p| p.symbol == symbol)
            .ok_or_else(|| SubmitError::NoPosition {
                account: account.clone(),
                symbol: symbol.to_string(),
            })?;

        let quantity = quantity
            .unwrap_or(position.quantity)
            .min(position.quantity);
        let side = position.side.opposite();

        if force {
            warn!(
                account = %account,
                symbol,
                quantity = %quantity,
                "Forced exit"
            );
        }

        let wire_fill = self.send_order(account, symbol, side, quantity).await?;

        let mut exit = Order::exit(
            account.clone(),
            self.exchange_id.clone(),
            symbol,
            side,
            position.entry_price,
            quantity,
            position.position_id.clone(),
        );
        exit.status = OrderStatus::Open;
        exit.venue_order_id = Some(wire_fill.order_id.clone());
        let exit_id = exit.order_id.clone();
        self.ledger.add_order(exit);
        self.ledger.record_fill(&exit_id, account, wire_fill.price);
        self.ledger.reduce_position(account, symbol, quantity);

        info!(
            account = %account,
            exchange = %self.exchange_id,
            symbol,
            side = %side,
            quantity = %quantity,
            price = %wire_fill.price,
            force,
            "Exit filled"
        );

        Ok(Fill {
            order_id: exit_id,
            position_id: position.position_id,
            symbol: symbol.to_string(),
            side,
            price: wire_fill.price,
            quantity,
            filled_at: Utc::now(),
        })
    }

    /// Cancel a tracked order on the venue and in the ledger.
    ///
    /// Returns `true` when the venue still knew the order.
    pub async fn cancel_order(
        &self,
        account: &AccountId,
        order_id: &OrderId,
    ) -> Result<bool, SubmitError> {
        let order = self
            .ledger
            .get_order(account, order_id)
            .ok_or_else(|| SubmitError::Exchange(ExchangeError::OrderNotFound(order_id.to_string())))?;

        let venue_knew = match &order.venue_order_id {
            Some(venue_id) => {
                with_retry(&self.retry, "cancel_order", || {
                    self.exchange.cancel_order(venue_id)
                })
                .await?
            }
            None => false,
        };

        self.ledger.mark_closed(order_id, account, OrderStatus::Cancelled);
        info!(
            account = %account,
            order_id = %order_id,
            symbol = %order.symbol,
            venue_knew,
            "Order cancelled"
        );
        Ok(venue_knew)
    }

    /// Send one order, holding the exchange call lock across the whole
    /// sign-send-receive sequence.
    ///
    /// Each attempt obtains a fresh sequence value. Transient failures back
    /// off and retry (with a new sequence); a stale-sequence rejection is
    /// fatal for the call and never resent.
    async fn send_order(
        &self,
        account: &AccountId,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<WireFill, SubmitError> {
        let body = serde_json::to_value(WireOrder {
            account: account.clone(),
            symbol: symbol.to_string(),
            side,
            quantity,
        })
        .map_err(|e| SubmitError::Exchange(ExchangeError::Rejected(e.to_string())))?;

        // One serialization point per credential scope: the lock covers
        // sequence acquisition and the network call together. Venues with
        // per-connection ordering skip it; their sequencer is private.
        let _guard = if self.exchange.shares_sequence_scope() {
            Some(self.sequencer.lock_exchange_call().await)
        } else {
            None
        };

        let send_policy = RetryPolicy {
            max_attempts: self.config.send_attempts,
            ..self.retry.clone()
        };
        let mut schedule = BackoffSchedule::new(&send_policy);
        let timeout = Duration::from_secs(self.config.call_timeout_secs);

        loop {
            let sequence = self.sequencer.next().await;
            debug!(venue = self.exchange.name(), symbol, sequence, "Sending order");

            let outcome =
                match tokio::time::timeout(
                    timeout,
                    self.exchange.sign_and_send("POST", "/orders", &body, sequence),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ExchangeError::Timeout(format!(
                        "order send exceeded {}s",
                        timeout.as_secs()
                    ))),
                };

            match outcome {
                Ok(response) => {
                    let fill: WireFill = serde_json::from_value(response.body).map_err(|e| {
                        SubmitError::Exchange(ExchangeError::Rejected(format!(
                            "unparseable fill payload: {e}"
                        )))
                    })?;
                    return Ok(fill);
                }
                Err(e @ ExchangeError::SequenceRejected { .. }) => {
                    // Fatal for this call: never resend a rejected sequence.
                    error!(
                        account = %account,
                        symbol,
                        error = %e,
                        "Order send rejected on sequence ordering"
                    );
                    return Err(SubmitError::Exchange(e));
                }
                Err(e) if e.is_transient() => match schedule.next_backoff() {
                    Some(delay) => {
                        warn!(
                            account = %account,
                            symbol,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Order send failed transiently; retrying with a fresh sequence"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(SubmitError::Exchange(e)),
                },
                Err(e) => return Err(SubmitError::Exchange(e)),
            }
        }
    }

    /// Unwind an entry that filled outside the slippage tolerance.
    #[allow(clippy::too_many_arguments)]
    async fn unwind_bad_fill(
        &self,
        account: &AccountId,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        expected_price: Decimal,
        entry_fill: &WireFill,
        slippage: Decimal,
    ) -> SubmitError {
        error!(
            account = %account,
            symbol,
            expected = %expected_price,
            filled = %entry_fill.price,
            slippage = %slippage,
            "Entry filled outside slippage tolerance; unwinding"
        );

        match self.submit_exit(account, symbol, Some(quantity), true).await {
            Ok(exit_fill) => {
                // Loss is what the round trip cost us, signed so a positive
                // value is money gone.
                let per_unit = match side {
                    OrderSide::Buy => entry_fill.price - exit_fill.price,
                    OrderSide::Sell => exit_fill.price - entry_fill.price,
                };
                let realized_loss = per_unit * quantity;
                warn!(
                    account = %account,
                    symbol,
                    realized_loss = %realized_loss,
                    "Bad fill unwound"
                );
                SubmitError::SlippageExceeded {
                    expected: expected_price,
                    filled: entry_fill.price,
                    slippage,
                    realized_loss,
                    unwound: true,
                }
            }
            Err(e) => {
                // The bad fill stays tracked as a position so the enforcer
                // and operators can see it; it is not silently dropped.
                error!(
                    account = %account,
                    symbol,
                    quantity = %quantity,
                    error = %e,
                    "UNWIND FAILED: bad fill remains open, operator action required"
                );
                SubmitError::SlippageExceeded {
                    expected: expected_price,
                    filled: entry_fill.price,
                    slippage,
                    realized_loss: Decimal::ZERO,
                    unwound: false,
                }
            }
        }
    }
}

/// Slippage adverse to the taker, as a fraction of the expected price.
/// Favorable fills come back negative.
#[must_use]
pub fn adverse_fraction(side: OrderSide, expected: Decimal, filled: Decimal) -> Decimal {
    if expected == Decimal::ZERO {
        return Decimal::ZERO;
    }
    match side {
        OrderSide::Buy => (filled - expected) / expected,
        OrderSide::Sell => (expected - filled) / expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SequencerConfig;
    use crate::exchange::PaperExchange;
    use crate::persistence::FileStore;
    use crate::state::KillSwitch;
    use rust_decimal_macros::dec;
    use test_case::test_case;

    struct Fixture {
        _dir: tempfile::TempDir,
        venue: Arc<PaperExchange>,
        ledger: Arc<AccountLedger>,
        state: Arc<TradingStateMachine>,
        gateway: ExecutionGateway<PaperExchange>,
    }

    async fn make_fixture() -> Fixture {
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
        state
            .request_transition(TradingState::DryRun, "test")
            .unwrap();

        let venue = Arc::new(PaperExchange::new());
        let gateway = ExecutionGateway::new(
            Arc::clone(&venue),
            ExchangeId::new("paper"),
            sequencer,
            Arc::clone(&ledger),
            Arc::clone(&state),
            RetryPolicy::none(),
            ExecutionConfig::default(),
        );
        Fixture {
            _dir: dir,
            venue,
            ledger,
            state,
            gateway,
        }
    }

    fn account() -> AccountId {
        AccountId::new("a1")
    }

    #[tokio::test]
    async fn test_entry_fills_and_tracks_position() {
        let f = make_fixture().await;
        f.venue.set_mark("BTCUSDT", dec!(100));
        f.venue.set_balance(&account(), dec!(1000));

        let fill = f
            .gateway
            .submit_entry(&account(), "BTCUSDT", OrderSide::Buy, dec!(2), dec!(100))
            .await
            .unwrap();
        assert_eq!(fill.price, dec!(100));

        assert!(f.ledger.has_position(&account(), "BTCUSDT"));
        // Reservation released on fill.
        assert_eq!(f.ledger.reserved_capital(&account()), dec!(0));
        let stats = f.ledger.get_account_stats(&account());
        assert_eq!(stats.filled_orders, 1);
    }

    #[tokio::test]
    async fn test_entry_blocked_when_halted() {
        let f = make_fixture().await;
        f.venue.set_mark("BTCUSDT", dec!(100));
        f.venue.set_balance(&account(), dec!(1000));
        f.state.trigger_emergency_stop("test halt");

        let result = f
            .gateway
            .submit_entry(&account(), "BTCUSDT", OrderSide::Buy, dec!(1), dec!(100))
            .await;
        assert!(matches!(
            result,
            Err(SubmitError::TradingHalted(TradingState::EmergencyStop))
        ));
    }

    #[tokio::test]
    async fn test_entry_blocked_on_insufficient_balance() {
        let f = make_fixture().await;
        f.venue.set_mark("BTCUSDT", dec!(100));
        f.venue.set_balance(&account(), dec!(50));

        let result = f
            .gateway
            .submit_entry(&account(), "BTCUSDT", OrderSide::Buy, dec!(2), dec!(100))
            .await;
        assert!(matches!(
            result,
            Err(SubmitError::InsufficientBalance { .. })
        ));
        // Nothing was sent or recorded.
        assert!(f.venue.fills().is_empty());
        assert!(f.ledger.positions(&account()).is_empty());
    }

    // 0.4% adverse: accepted. 0.6% adverse: rejected and unwound.
    #[test_case(dec!(0.004), true; "inside tolerance")]
    #[test_case(dec!(0.006), false; "outside tolerance")]
    #[tokio::test]
    async fn test_slippage_boundary(adverse: Decimal, accepted: bool) {
        let f = make_fixture().await;
        f.venue.set_mark("BTCUSDT", dec!(100));
        f.venue.set_balance(&account(), dec!(1000));
        f.venue.set_adverse_slippage(adverse);

        let result = f
            .gateway
            .submit_entry(&account(), "BTCUSDT", OrderSide::Buy, dec!(1), dec!(100))
            .await;

        if accepted {
            let fill = result.unwrap();
            assert_eq!(fill.price, dec!(100) * (Decimal::ONE + adverse));
            assert!(f.ledger.has_position(&account(), "BTCUSDT"));
        } else {
            match result {
                Err(SubmitError::SlippageExceeded {
                    realized_loss,
                    unwound,
                    ..
                }) => {
                    assert!(unwound);
                    assert!(realized_loss > Decimal::ZERO);
                }
                other => panic!("expected slippage rejection, got {other:?}"),
            }
            // Unwound: no position locally or on the venue.
            assert!(!f.ledger.has_position(&account(), "BTCUSDT"));
            assert!(f.venue.get_positions(&account()).await.unwrap().is_empty());
            // Entry fill + offsetting exit fill.
            assert_eq!(f.venue.fills().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_exit_allowed_with_zero_balance() {
        let f = make_fixture().await;
        f.venue.set_mark("ETHUSDT", dec!(2000));
        f.venue.set_balance(&account(), dec!(0));

        // Position adopted out-of-band; balance reported as zero.
        f.ledger.track_position(Position::adopted(
            account(),
            ExchangeId::new("paper"),
            "ETHUSDT",
            OrderSide::Buy,
            dec!(2000),
            dec!(1),
        ));

        let fill = f
            .gateway
            .submit_exit(&account(), "ETHUSDT", None, false)
            .await
            .unwrap();
        assert_eq!(fill.side, OrderSide::Sell);
        assert!(f.ledger.positions(&account()).is_empty());
    }

    #[tokio::test]
    async fn test_exit_allowed_while_halted() {
        let f = make_fixture().await;
        f.venue.set_mark("ETHUSDT", dec!(2000));
        f.state.trigger_emergency_stop("halt");

        f.ledger.track_position(Position::adopted(
            account(),
            ExchangeId::new("paper"),
            "ETHUSDT",
            OrderSide::Buy,
            dec!(2000),
            dec!(1),
        ));

        assert!(
            f.gateway
                .submit_exit(&account(), "ETHUSDT", None, true)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_exit_without_position_is_explicit() {
        let f = make_fixture().await;
        let result = f.gateway.submit_exit(&account(), "NOPE", None, false).await;
        assert!(matches!(result, Err(SubmitError::NoPosition { .. })));
    }

    #[tokio::test]
    async fn test_partial_exit_reduces_position() {
        let f = make_fixture().await;
        f.venue.set_mark("SOLUSDT", dec!(100));
        f.ledger.track_position(Position::adopted(
            account(),
            ExchangeId::new("paper"),
            "SOLUSDT",
            OrderSide::Buy,
            dec!(100),
            dec!(4),
        ));

        f.gateway
            .submit_exit(&account(), "SOLUSDT", Some(dec!(1)), false)
            .await
            .unwrap();

        let positions = f.ledger.positions(&account());
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(3));
    }

    #[tokio::test]
    async fn test_cancel_order_clears_ledger_state() {
        let f = make_fixture().await;
        let mut order = Order::entry(
            account(),
            ExchangeId::new("paper"),
            "BTCUSDT",
            OrderSide::Buy,
            dec!(90),
            dec!(1),
            dec!(90),
        );
        order.status = OrderStatus::Open;
        order.venue_order_id = Some("paper-7".to_string());
        let order_id = order.order_id.clone();
        f.ledger.add_order(order);
        f.venue.seed_open_order(crate::exchange::RawOrder {
            order_id: "paper-7".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            price: Some(dec!(90)),
            quantity: dec!(1),
            created_at: Utc::now(),
        });

        let venue_knew = f.gateway.cancel_order(&account(), &order_id).await.unwrap();
        assert!(venue_knew);
        assert_eq!(
            f.ledger.get_order(&account(), &order_id).unwrap().status,
            OrderStatus::Cancelled
        );
        assert_eq!(f.ledger.reserved_capital(&account()), dec!(0));
    }

    #[test]
    fn test_adverse_fraction_signs() {
        assert_eq!(
            adverse_fraction(OrderSide::Buy, dec!(100), dec!(100.6)),
            dec!(0.006)
        );
        assert_eq!(
            adverse_fraction(OrderSide::Sell, dec!(100), dec!(99.4)),
            dec!(0.006)
        );
        // Favorable fills are negative.
        assert!(adverse_fraction(OrderSide::Buy, dec!(100), dec!(99)) < Decimal::ZERO);
    }
}
