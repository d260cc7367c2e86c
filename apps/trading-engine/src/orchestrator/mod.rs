//! Supervision of per-(account, exchange) execution tasks.
//!
//! The orchestrator owns one long-running tokio task per (account,
//! exchange) pair. Each task runs its decision/exit cycle on a fixed
//! interval and is fully isolated from its siblings: an unhandled cycle
//! error is logged, the task sleeps a backoff interval, and it resumes. A
//! pair can be slow, blocked, or broken without stalling any other pair;
//! the only cross-pair serialization point in the engine is the exchange
//! call lock inside the gateway.
//!
//! Shutdown is cooperative: each task finishes its current exchange call
//! (calls are never aborted mid-flight) and then exits its loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::exchange::ExchangeAdapter;
use crate::gateway::{ExecutionGateway, SubmitError};
use crate::models::{AccountId, ExchangeId};
use crate::state::TradingStateMachine;
use crate::strategy::{Intent, PairView, Strategy};

/// One (account, exchange) pair under supervision.
struct Pair<E: ExchangeAdapter + ?Sized> {
    account: AccountId,
    exchange_id: ExchangeId,
    gateway: Arc<ExecutionGateway<E>>,
}

/// Supervisor of per-pair execution tasks.
pub struct AccountOrchestrator<E: ExchangeAdapter + ?Sized> {
    pairs: Vec<Pair<E>>,
    strategy: Arc<dyn Strategy>,
    state: Arc<TradingStateMachine>,
    config: OrchestratorConfig,
}

impl<E: ExchangeAdapter + ?Sized + 'static> AccountOrchestrator<E> {
    /// Create an orchestrator with no pairs registered yet.
    #[must_use]
    pub fn new(
        strategy: Arc<dyn Strategy>,
        state: Arc<TradingStateMachine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pairs: Vec::new(),
            strategy,
            state,
            config,
        }
    }

    /// Register one (account, exchange) pair.
    pub fn add_pair(
        &mut self,
        account: AccountId,
        exchange_id: ExchangeId,
        gateway: Arc<ExecutionGateway<E>>,
    ) {
        self.pairs.push(Pair {
            account,
            exchange_id,
            gateway,
        });
    }

    /// Number of registered pairs.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Balances per (account, exchange) for pairs meeting the configured
    /// minimum. Pairs whose balance cannot be read are excluded and logged.
    pub async fn detect_funded_pairs(&self) -> HashMap<AccountId, HashMap<ExchangeId, Decimal>> {
        let mut funded: HashMap<AccountId, HashMap<ExchangeId, Decimal>> = HashMap::new();
        for pair in &self.pairs {
            match pair.gateway.balance(&pair.account).await {
                Ok(balance) if balance >= self.config.min_balance => {
                    funded
                        .entry(pair.account.clone())
                        .or_default()
                        .insert(pair.exchange_id.clone(), balance);
                }
                Ok(balance) => {
                    debug!(
                        account = %pair.account,
                        exchange = %pair.exchange_id,
                        balance = %balance,
                        min = %self.config.min_balance,
                        "Pair below minimum balance; not eligible"
                    );
                }
                Err(e) => {
                    warn!(
                        account = %pair.account,
                        exchange = %pair.exchange_id,
                        error = %e,
                        "Balance probe failed; pair excluded"
                    );
                }
            }
        }
        funded
    }

    /// One decision cycle for every registered pair, in registration order.
    /// Returns the number of pairs whose cycle errored. Used by tests and
    /// one-shot runs; the supervised loops in [`Self::run`] call the same
    /// per-pair cycle.
    pub async fn run_once(&self) -> usize {
        let mut errors = 0;
        for pair in &self.pairs {
            if let Err(e) = Self::cycle(pair, &self.strategy, &self.state).await {
                warn!(
                    account = %pair.account,
                    exchange = %pair.exchange_id,
                    error = %e,
                    "Pair cycle failed"
                );
                errors += 1;
            }
        }
        errors
    }

    /// Spawn one supervised task per pair and run until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let funded = self.detect_funded_pairs().await;
        let mut handles = Vec::new();

        for (index, pair) in self.pairs.iter().enumerate() {
            let eligible = funded
                .get(&pair.account)
                .is_some_and(|exchanges| exchanges.contains_key(&pair.exchange_id));
            if !eligible {
                info!(
                    account = %pair.account,
                    exchange = %pair.exchange_id,
                    "Pair not funded; no task spawned"
                );
                continue;
            }

            let orchestrator = Arc::clone(&self);
            let shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                orchestrator.pair_loop(index, shutdown_rx).await;
            }));
        }

        info!(tasks = handles.len(), "Orchestrator running");
        for handle in handles {
            // A panicking pair task must not take the orchestrator down.
            if let Err(e) = handle.await {
                error!(error = %e, "Pair task terminated abnormally");
            }
        }
    }

    /// The supervised loop for one pair.
    async fn pair_loop(&self, index: usize, mut shutdown: broadcast::Receiver<()>) {
        let pair = &self.pairs[index];
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.cycle_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            account = %pair.account,
            exchange = %pair.exchange_id,
            interval_secs = self.config.cycle_interval_secs,
            "Pair task started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = Self::cycle(pair, &self.strategy, &self.state).await {
                        // Contain, back off, resume. Never terminate, never
                        // touch sibling pairs.
                        error!(
                            account = %pair.account,
                            exchange = %pair.exchange_id,
                            error = %e,
                            backoff_secs = self.config.error_backoff_secs,
                            "Pair cycle failed; backing off"
                        );
                        tokio::time::sleep(Duration::from_secs(self.config.error_backoff_secs)).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!(
                        account = %pair.account,
                        exchange = %pair.exchange_id,
                        "Pair task shutting down"
                    );
                    break;
                }
            }
        }
    }

    /// One decision cycle: snapshot the pair, ask the strategy, route the
    /// intents through the gateway.
    async fn cycle(
        pair: &Pair<E>,
        strategy: &Arc<dyn Strategy>,
        state: &Arc<TradingStateMachine>,
    ) -> Result<(), SubmitError> {
        if !state.is_trading_allowed() {
            debug!(
                account = %pair.account,
                state = %state.current_state(),
                "Trading not allowed; skipping decision cycle"
            );
            return Ok(());
        }

        let ledger = pair.gateway.ledger();
        let view = PairView {
            account: pair.account.clone(),
            exchange: pair.exchange_id.clone(),
            balance: pair.gateway.balance(&pair.account).await?,
            positions: ledger.positions(&pair.account),
            open_orders: ledger.open_orders(&pair.account),
        };

        for intent in strategy.decide(&view).await {
            match intent {
                Intent::Open {
                    symbol,
                    side,
                    quantity,
                    expected_price,
                } => {
                    match pair
                        .gateway
                        .submit_entry(&pair.account, &symbol, side, quantity, expected_price)
                        .await
                    {
                        Ok(_) | Err(SubmitError::SlippageExceeded { unwound: true, .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Intent::Close { symbol } => {
                    pair.gateway
                        .submit_exit(&pair.account, &symbol, None, false)
                        .await?;
                }
            }
        }
        Ok(())
    }
}
