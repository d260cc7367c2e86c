//! Trading Engine Binary
//!
//! Starts the Armada execution core: loads configuration and durable state,
//! reconciles exchange positions, then supervises the per-(account,
//! exchange) execution tasks and the exit enforcer until shutdown.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trading-engine
//! ```
//!
//! # Environment Variables
//!
//! - `ARMADA_CONFIG`: path to the TOML config file (default: `armada.toml`)
//! - `ARMADA_*`: per-field overrides (e.g. `ARMADA_STATE_DIR`)
//! - `RUST_LOG`: log filter (default: from config)
//!
//! # Operator surface
//!
//! The kill switch is the marker file at `kill_switch_path`; creating it by
//! any means (including `touch` from a shell) halts trading on the next
//! state check. Deactivation and state transitions go through the library
//! API, each requiring a recorded reason.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use trading_engine::config::Config;
use trading_engine::enforcer::ExitEnforcer;
use trading_engine::exchange::{ExchangeAdapter, PaperExchange, RetryPolicy};
use trading_engine::gateway::ExecutionGateway;
use trading_engine::ledger::AccountLedger;
use trading_engine::models::{AccountId, ExchangeId};
use trading_engine::orchestrator::AccountOrchestrator;
use trading_engine::persistence::{FileStore, LEDGER_SNAPSHOT_FILE, LedgerSnapshot};
use trading_engine::reconcile::{PositionReconciler, ZombieBlacklist};
use trading_engine::sequencer::SequenceGenerator;
use trading_engine::state::{KillSwitch, TradingState, TradingStateMachine};
use trading_engine::strategy::HoldStrategy;
use trading_engine::telemetry;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("ARMADA_CONFIG").ok();
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    telemetry::init(&config.log_filter);

    info!(
        accounts = config.accounts.len(),
        state_dir = %config.state_dir,
        "Armada trading engine starting"
    );

    // Durable state.
    let store = FileStore::new(&config.state_dir).context("opening state directory")?;
    let sequencer = Arc::new(
        SequenceGenerator::load(config.sequencer.clone(), store.clone())
            .await
            .context("loading sequence checkpoint")?,
    );
    let ledger = Arc::new(AccountLedger::new());
    if let Some(snapshot) = store
        .load_json::<LedgerSnapshot>(LEDGER_SNAPSHOT_FILE)
        .await
        .context("loading ledger snapshot")?
    {
        info!(
            orders = snapshot.orders.len(),
            positions = snapshot.positions.len(),
            saved_at = %snapshot.saved_at,
            "Restoring ledger snapshot"
        );
        ledger.restore(snapshot);
    }
    let blacklist = Arc::new(
        ZombieBlacklist::load(store.clone())
            .await
            .context("loading zombie blacklist")?,
    );

    let state = Arc::new(TradingStateMachine::new(KillSwitch::new(
        &config.kill_switch_path,
    )));
    if state.current_state() == TradingState::EmergencyStop {
        warn!("Kill switch is active; starting halted (restore_safe_mode to resume)");
    } else {
        state
            .request_transition(TradingState::DryRun, "process start")
            .context("entering DRY_RUN")?;
    }

    // One shared venue and gateway per exchange id. Only the in-tree paper
    // venue is wired here; real venues plug in through ExchangeAdapter.
    let mut venues: HashMap<ExchangeId, Arc<PaperExchange>> = HashMap::new();
    let mut gateways: HashMap<ExchangeId, Arc<ExecutionGateway<PaperExchange>>> = HashMap::new();
    let mut exchange_accounts: HashMap<ExchangeId, Vec<AccountId>> = HashMap::new();

    let mut orchestrator = AccountOrchestrator::new(
        Arc::new(HoldStrategy),
        Arc::clone(&state),
        config.orchestrator.clone(),
    );

    for account_config in &config.accounts {
        let account = account_config.to_account();
        for exchange_id in &account.exchanges {
            let venue = Arc::clone(
                venues
                    .entry(exchange_id.clone())
                    .or_insert_with(|| Arc::new(PaperExchange::new())),
            );
            let gateway = match gateways.get(exchange_id).cloned() {
                Some(gateway) => gateway,
                None => {
                    // Venues whose auth scheme orders requests per credential
                    // share the process-wide generator; the rest get a
                    // private instance with its own checkpoint.
                    let pair_sequencer = if venue.shares_sequence_scope() {
                        Arc::clone(&sequencer)
                    } else {
                        let scope_store = FileStore::new(
                            std::path::Path::new(&config.state_dir)
                                .join("sequence")
                                .join(exchange_id.as_str()),
                        )
                        .context("opening per-connection sequence directory")?;
                        Arc::new(
                            SequenceGenerator::load(config.sequencer.clone(), scope_store)
                                .await
                                .context("loading per-connection sequence checkpoint")?,
                        )
                    };
                    let gateway = Arc::new(ExecutionGateway::new(
                        venue,
                        exchange_id.clone(),
                        pair_sequencer,
                        Arc::clone(&ledger),
                        Arc::clone(&state),
                        RetryPolicy::default(),
                        config.execution.clone(),
                    ));
                    gateways.insert(exchange_id.clone(), Arc::clone(&gateway));
                    gateway
                }
            };
            exchange_accounts
                .entry(exchange_id.clone())
                .or_default()
                .push(account.id.clone());
            orchestrator.add_pair(account.id.clone(), exchange_id.clone(), gateway);
        }
    }

    // Startup reconciliation: adopt or quarantine whatever the venues hold.
    let reconciler = PositionReconciler::new(
        Arc::clone(&ledger),
        Arc::clone(&blacklist),
        RetryPolicy::default(),
        config.reconcile.clone(),
    );
    if config.reconcile.on_startup {
        for (exchange_id, accounts) in &exchange_accounts {
            let Some(venue) = venues.get(exchange_id) else {
                continue;
            };
            for account in accounts {
                match reconciler
                    .reconcile(account, exchange_id, venue.as_ref())
                    .await
                {
                    Ok(report) => info!(
                        account = %account,
                        exchange = %exchange_id,
                        summary = %report.summary(),
                        "Startup reconciliation"
                    ),
                    Err(e) => error!(
                        account = %account,
                        exchange = %exchange_id,
                        error = %e,
                        "Startup reconciliation failed"
                    ),
                }
            }
        }
    }

    let (shutdown_tx, _) = broadcast::channel(4);
    let mut background = Vec::new();

    // One enforcer per exchange connection, isolated from the decision
    // loops.
    for (exchange_id, gateway) in &gateways {
        let accounts = exchange_accounts
            .get(exchange_id)
            .cloned()
            .unwrap_or_default();
        let enforcer = Arc::new(ExitEnforcer::new(
            Arc::clone(gateway),
            accounts,
            config.enforcement.clone(),
            config.ledger.clone(),
        ));
        background.push(tokio::spawn(
            enforcer.run(shutdown_tx.subscribe()),
        ));
    }

    // Periodic ledger snapshot so a crash resumes from recent state.
    {
        let ledger = Arc::clone(&ledger);
        let store = store.clone();
        let interval_secs = config.snapshot_interval_secs;
        let mut shutdown_rx = shutdown_tx.subscribe();
        background.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = store
                            .save_json(LEDGER_SNAPSHOT_FILE, &ledger.snapshot())
                            .await
                        {
                            warn!(error = %e, "Periodic ledger snapshot failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }));
    }

    let orchestrator = Arc::new(orchestrator);
    let orchestrator_tx = shutdown_tx.clone();
    let orchestrator_handle = tokio::spawn(async move {
        orchestrator.run(&orchestrator_tx).await;
    });

    // Run until interrupted.
    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, orchestrator_handle)
        .await
        .is_err()
    {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Orchestrator did not stop in time"
        );
    }
    for handle in background {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }

    // Final ledger snapshot so restart resumes without re-querying venues.
    store
        .save_json(LEDGER_SNAPSHOT_FILE, &ledger.snapshot())
        .await
        .context("saving ledger snapshot")?;

    info!("Armada trading engine stopped");
    Ok(())
}
