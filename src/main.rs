// =============================================================================
// Quorum — committee-driven engine for 15-minute binary prediction markets
// =============================================================================
//
// Exit codes:
//   0 — clean shutdown
//   2 — fatal configuration error
//   3 — fatal state-store / ledger error
//   4 — required dependency unavailable at startup
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod agents;
mod app_state;
mod config;
mod engine;
mod execution;
mod feed;
mod gateway;
mod indicators;
mod ledger;
mod reconcile;
mod resolve;
mod risk;
mod scheduler;
mod shadow;
mod sizing;
mod state;
mod types;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::{Credentials, EngineConfig};
use crate::feed::PriceFeed;
use crate::gateway::clob::ClobClient;
use crate::gateway::MarketGateway;
use crate::ledger::Ledger;
use crate::scheduler::Scheduler;
use crate::state::StateStore;

const CONFIG_PATH: &str = "engine_config.json";

/// Attempts made to read the chain cash balance before declaring the
/// dependency unavailable.
const STARTUP_BALANCE_ATTEMPTS: u32 = 3;

/// Grace period for the in-flight cycle on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Quorum Engine — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let config = if std::path::Path::new(CONFIG_PATH).exists() {
        match EngineConfig::load(CONFIG_PATH) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "fatal config error");
                return ExitCode::from(2);
            }
        }
    } else {
        warn!(path = CONFIG_PATH, "no config file — using defaults");
        EngineConfig::default()
    };

    let creds = match Credentials::from_env() {
        Ok(creds) => creds,
        Err(e) => {
            error!(error = %e, "fatal config error — missing credentials");
            return ExitCode::from(2);
        }
    };

    // ── 2. Venue gateway & startup dependency check ──────────────────────
    let gateway: Arc<dyn MarketGateway> = Arc::new(ClobClient::new(creds));

    let venue_cash = {
        let mut cash = None;
        for attempt in 1..=STARTUP_BALANCE_ATTEMPTS {
            match gateway.cash_balance().await {
                Ok(balance) => {
                    cash = Some(balance);
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "chain balance read failed");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        match cash {
            Some(balance) => balance,
            None => {
                error!("settlement chain unavailable at startup");
                return ExitCode::from(4);
            }
        }
    };
    info!(venue_cash, "settlement chain reachable");

    // ── 3. Durable stores ────────────────────────────────────────────────
    let store = match StateStore::load_or_init(
        &config.state_path,
        &config.halt_sentinel_path,
        venue_cash,
        Utc::now().timestamp(),
    ) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "fatal state-store error");
            return ExitCode::from(3);
        }
    };

    let ledger = match Ledger::open(&config.ledger_path, &config.spool_path) {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            error!(error = %e, "fatal ledger error");
            return ExitCode::from(3);
        }
    };
    if let Err(e) = ledger.replay_spool() {
        warn!(error = %e, "spool replay failed — continuing");
    }

    // ── 4. Price feed streams ────────────────────────────────────────────
    let price_feed = Arc::new(PriceFeed::new());

    {
        let feed = price_feed.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = feed::stream::run_binance_ticker(&feed).await {
                    error!(error = %e, "binance ticker stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }
    {
        let feed = price_feed.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = feed::stream::run_coinbase_ticker(&feed).await {
                    error!(error = %e, "coinbase ticker stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }
    {
        let feed = price_feed.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = feed::stream::run_kraken_ticker(&feed).await {
                    error!(error = %e, "kraken ticker stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }
    {
        let feed = price_feed.clone();
        let interval = Duration::from_secs(config.funding_poll_interval_s.max(30));
        tokio::spawn(feed::stream::run_funding_poller(feed, interval));
    }
    info!("price feed streams launched");

    // ── 5. Shared state & startup reconciliation ─────────────────────────
    let app = match AppState::new(config, price_feed, store, ledger) {
        Ok(app) => Arc::new(app),
        Err(e) => {
            error!(error = %e, "fatal ledger error during startup");
            return ExitCode::from(3);
        }
    };

    if let Err(e) = reconcile::run_once(&app, gateway.as_ref()).await {
        error!(error = %e, "fatal state-store error during startup reconcile");
        return ExitCode::from(3);
    }

    // ── 6. Scheduler & graceful shutdown ─────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(app.clone(), gateway.clone());
    let mut scheduler_handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    info!("all subsystems running");

    let fatal = tokio::select! {
        result = &mut scheduler_handle => {
            match result {
                Ok(Err(e)) => {
                    error!(error = %e, "scheduler terminated on fatal store error");
                    true
                }
                Ok(Ok(())) => false,
                Err(e) => {
                    error!(error = %e, "scheduler task panicked");
                    true
                }
            }
        }
        _ = shutdown_signal() => {
            warn!("shutdown signal received — stopping gracefully");
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut scheduler_handle).await {
                Ok(Ok(Err(e))) => {
                    error!(error = %e, "scheduler failed during shutdown");
                    true
                }
                Ok(_) => false,
                Err(_) => {
                    warn!("in-flight cycle exceeded shutdown grace — aborting");
                    scheduler_handle.abort();
                    false
                }
            }
        }
    };

    if fatal {
        return ExitCode::from(3);
    }

    info!("Quorum engine shut down complete");
    ExitCode::SUCCESS
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable — ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
