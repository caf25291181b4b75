// =============================================================================
// Scheduler — the clock that drives the engine
// =============================================================================
//
// One task, three clocks:
//
//   - every `scan_interval_s` (default 2 s): build snapshots and run the
//     decision pipeline for every active market,
//   - on each 15-minute epoch boundary + settlement grace: resolve closed
//     epochs (resolve.rs keeps a lookback window so slow data catches up),
//   - at midnight UTC: roll daily counters.
//
// The scheduler is clock-driven, not tick-counted: lost cycles are skipped,
// never replayed. A cycle that exceeds its wall-clock budget is abandoned
// with a warning. Transient I/O errors skip the cycle; state-store failures
// are fatal and propagate to main.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::engine::evaluate_market;
use crate::gateway::{Market, MarketGateway};
use crate::reconcile;
use crate::resolve::resolve_due;
use crate::state::midnight_of;
use crate::types::{epoch_of, Crypto};

pub struct Scheduler {
    state: Arc<AppState>,
    gateway: Arc<dyn MarketGateway>,
}

/// Pick the market for `crypto` trading the CURRENT epoch (venues also list
/// the next epoch ahead of time).
fn market_for_current_epoch(markets: &[Market], crypto: Crypto, now_unix: i64) -> Option<&Market> {
    let current = epoch_of(now_unix);
    markets
        .iter()
        .find(|m| m.crypto == crypto && m.epoch == current)
}

impl Scheduler {
    pub fn new(state: Arc<AppState>, gateway: Arc<dyn MarketGateway>) -> Self {
        Self { state, gateway }
    }

    /// Block until the shutdown signal flips. Returns `Err` only on fatal
    /// state-store failures.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let scan_interval = Duration::from_secs(self.state.config.scan_interval_s.max(1));
        let budget = Duration::from_secs(self.state.config.cycle_budget_s.max(1));

        let mut ticker = tokio::time::interval(scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            scan_interval_s = scan_interval.as_secs(),
            cycle_budget_s = budget.as_secs(),
            "scheduler running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now().timestamp();
                    match tokio::time::timeout(budget, self.run_cycle(now)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            // Only fatal store errors escape run_cycle.
                            return Err(e.context("fatal state-store failure"));
                        }
                        Err(_) => {
                            warn!(budget_s = budget.as_secs(), "cycle exceeded budget — skipped");
                            self.state.push_error("cycle budget exceeded".to_string());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    async fn run_cycle(&self, now_unix: i64) -> Result<()> {
        let cycle = self.state.next_cycle();
        debug!(cycle, "scan cycle start");

        // 1. Operator unhalt sentinel (polled once per cycle).
        self.state
            .store
            .poll_unhalt()
            .context("unhalt sentinel poll")?;

        // 2. Midnight UTC roll.
        if midnight_of(now_unix) != self.state.store.current().day_start_unix {
            self.state.store.roll_day(now_unix).context("midnight roll")?;
        }

        // 3. Resolve closed epochs past their settlement grace.
        resolve_due(&self.state, self.gateway.as_ref(), now_unix).await?;

        // 4. Periodic venue/chain reconciliation.
        let check_every = self.state.config.position_check_every.max(1);
        if cycle % check_every == 0 {
            reconcile::run_once(&self.state, self.gateway.as_ref()).await?;
        }

        // 5. Evaluate every active market. A venue listing failure skips
        //    trading this cycle but the resolution work above already ran.
        let markets = match self.gateway.list_active_markets().await {
            Ok(markets) => markets,
            Err(e) => {
                warn!(error = %e, "market listing failed — trading skipped this cycle");
                return Ok(());
            }
        };

        for crypto in Crypto::ALL {
            let Some(market) = market_for_current_epoch(&markets, crypto, now_unix) else {
                debug!(crypto = %crypto, "no current-epoch market listed");
                continue;
            };
            evaluate_market(&self.state, self.gateway.as_ref(), market, now_unix).await?;
        }

        debug!(cycle, "scan cycle done");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::config::EngineConfig;
    use crate::feed::PriceFeed;
    use crate::gateway::{GatewayError, OrderFill, VenuePosition};
    use crate::ledger::Ledger;
    use crate::state::StateStore;
    use crate::types::Position;

    fn market(crypto: Crypto, epoch: i64) -> Market {
        Market {
            crypto,
            epoch,
            up_token: "u".into(),
            down_token: "d".into(),
            up_ask: 0.5,
            down_ask: 0.52,
            secs_to_close: 600,
        }
    }

    #[test]
    fn picks_current_epoch_market_only() {
        let now = 1_704_067_200 + 100;
        let current = epoch_of(now);
        let markets = vec![
            market(Crypto::Btc, current - 1),
            market(Crypto::Btc, current),
            market(Crypto::Btc, current + 1),
            market(Crypto::Eth, current + 1),
        ];

        let picked = market_for_current_epoch(&markets, Crypto::Btc, now).unwrap();
        assert_eq!(picked.epoch, current);
        assert!(market_for_current_epoch(&markets, Crypto::Eth, now).is_none());
        assert!(market_for_current_epoch(&markets, Crypto::Sol, now).is_none());
    }

    struct EmptyGateway;

    #[async_trait]
    impl MarketGateway for EmptyGateway {
        async fn list_active_markets(&self) -> Result<Vec<Market>, GatewayError> {
            Ok(Vec::new())
        }
        async fn place_order(
            &self,
            _token_id: &str,
            _size_usd: f64,
        ) -> Result<OrderFill, GatewayError> {
            Err(GatewayError::Rejected("no markets".into()))
        }
        async fn read_positions(&self) -> Result<Vec<VenuePosition>, GatewayError> {
            Ok(Vec::new())
        }
        async fn redeem(&self, _position: &Position) -> Result<f64, GatewayError> {
            Ok(0.0)
        }
        async fn cash_balance(&self) -> Result<f64, GatewayError> {
            Ok(100.0)
        }
    }

    fn app_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        let feed = Arc::new(PriceFeed::new());
        let store = Arc::new(
            StateStore::load_or_init(
                dir.path().join("state.json"),
                dir.path().join("unhalt.signal"),
                100.0,
                Utc::now().timestamp(),
            )
            .unwrap(),
        );
        let ledger = Arc::new(
            Ledger::open(dir.path().join("ledger.db"), dir.path().join("spool.jsonl")).unwrap(),
        );
        Arc::new(AppState::new(EngineConfig::default(), feed, store, ledger).unwrap())
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(&dir);
        let scheduler = Scheduler::new(state, Arc::new(EmptyGateway));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop promptly")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cycle_with_no_markets_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(&dir);
        let scheduler = Scheduler::new(state.clone(), Arc::new(EmptyGateway));

        scheduler.run_cycle(Utc::now().timestamp()).await.unwrap();
        assert_eq!(state.cycles.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
