// =============================================================================
// Shadow Orchestrator — parallel strategies on the live tape, virtual funds
// =============================================================================
//
// Every enabled strategy re-aggregates the production committee's votes under
// its own thresholds/weights/filters and its own sizer, then persists a
// decision row. Virtual balances live in the ledger's `strategies` table and
// never touch real funds.
//
// Resolution applies the actual epoch outcome to each strategy's committed
// decision: virtual P&L, balance update, and exactly one outcome row per
// (strategy, crypto, epoch). Strategies run sequentially and share no
// mutable state.
// =============================================================================

use anyhow::Result;
use tracing::{debug, info};
use uuid::Uuid;

use crate::aggregator::{aggregate, AccuracyBook, AggregatorSettings};
use crate::agents::Vote;
use crate::config::EngineConfig;
use crate::ledger::{DecisionRow, Ledger, OutcomeInsert, OutcomeRow};
use crate::sizing::size_for_policy;
use crate::types::{Crypto, Epoch, MarketSnapshot, Side, TradeMode};

/// Starting virtual bankroll for a freshly registered strategy.
pub const SHADOW_INITIAL_BALANCE: f64 = 100.0;

pub struct ShadowOrchestrator {
    config: EngineConfig,
}

impl ShadowOrchestrator {
    /// Register every configured strategy in the ledger (existing virtual
    /// balances survive restarts).
    pub fn new(config: EngineConfig, ledger: &Ledger, now_unix: i64) -> Result<Self> {
        for strategy in &config.shadow_strategies {
            ledger.ensure_strategy(&strategy.name, SHADOW_INITIAL_BALANCE, now_unix)?;
        }
        info!(
            strategies = config.shadow_strategies.len(),
            "shadow orchestrator ready"
        );
        Ok(Self { config })
    }

    /// Replay one snapshot through every strategy and persist decision rows.
    pub fn evaluate(
        &self,
        snapshot: &MarketSnapshot,
        votes: &[Vote],
        accuracy: &AccuracyBook,
        ledger: &Ledger,
        now_unix: i64,
    ) -> Result<()> {
        for strategy in &self.config.shadow_strategies {
            let settings = AggregatorSettings::shadow(&self.config, strategy);
            let decision = aggregate(votes, snapshot.regime, &settings, accuracy);

            let balance = ledger
                .strategy_balance(&strategy.name)?
                .unwrap_or(SHADOW_INITIAL_BALANCE);

            let entry_cap = strategy
                .max_entry_price
                .unwrap_or(self.config.max_entry_price);

            let (would_trade, entry_price, size_usd) = match decision.direction {
                Some(side) => {
                    let entry = match side {
                        Side::Up => snapshot.up_ask,
                        Side::Down => snapshot.down_ask,
                    };
                    if entry > entry_cap {
                        (false, Some(entry), None)
                    } else {
                        let size = size_for_policy(
                            strategy.sizing,
                            balance,
                            decision.score,
                            entry,
                            TradeMode::Normal,
                            &self.config,
                        );
                        (size.is_some(), Some(entry), size)
                    }
                }
                None => (false, None, None),
            };

            let row = DecisionRow {
                id: Uuid::new_v4().to_string(),
                strategy: strategy.name.clone(),
                crypto: snapshot.crypto,
                epoch: snapshot.epoch,
                direction: decision.direction,
                score: decision.score,
                agreement: decision.agreement,
                vetoed: decision.vetoed,
                reason: decision.reason.clone(),
                would_trade,
                entry_price,
                size_usd,
                created_at: now_unix,
            };
            ledger.record_decision(&row)?;

            debug!(
                strategy = %strategy.name,
                crypto = %snapshot.crypto,
                epoch = snapshot.epoch,
                would_trade,
                score = decision.score,
                reason = %decision.reason,
                "shadow decision recorded"
            );
        }
        Ok(())
    }

    /// Apply a resolved epoch to one strategy's committed decision: virtual
    /// P&L, balance update, and exactly one outcome row.
    pub fn resolve_decision(
        &self,
        row: &DecisionRow,
        outcome: Side,
        ledger: &Ledger,
        now_unix: i64,
    ) -> Result<OutcomeInsert> {
        let (Some(entry), Some(size), Some(predicted)) =
            (row.entry_price, row.size_usd, row.direction)
        else {
            // A would_trade row always carries these; tolerate legacy rows.
            return Ok(OutcomeInsert::AlreadyResolved);
        };

        let pnl = virtual_pnl(predicted, outcome, entry, size);

        let inserted = ledger.insert_outcome(&OutcomeRow {
            strategy: row.strategy.clone(),
            crypto: row.crypto,
            epoch: row.epoch,
            outcome,
            pnl,
            predicted: Some(predicted),
            confidence: row.score,
            resolved_at: now_unix,
        });

        if inserted == OutcomeInsert::Inserted {
            let balance = ledger
                .strategy_balance(&row.strategy)?
                .unwrap_or(SHADOW_INITIAL_BALANCE);
            ledger.set_strategy_balance(&row.strategy, balance + pnl)?;

            let day = chrono::DateTime::from_timestamp(now_unix, 0)
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            ledger.record_performance(&row.strategy, &day, pnl > 0.0, pnl)?;

            info!(
                strategy = %row.strategy,
                crypto = %row.crypto,
                epoch = row.epoch,
                outcome = %outcome,
                pnl,
                "shadow outcome recorded"
            );
        }

        Ok(inserted)
    }

    /// Resolve every pending shadow trade of (crypto, epoch), ordered by
    /// strategy name (the production row is the engine's to settle).
    pub fn resolve_epoch(
        &self,
        crypto: Crypto,
        epoch: Epoch,
        outcome: Side,
        ledger: &Ledger,
        now_unix: i64,
    ) -> Result<()> {
        for row in ledger.unresolved_trades(crypto, epoch)? {
            if row.strategy == crate::engine::PRODUCTION_STRATEGY {
                continue;
            }
            self.resolve_decision(&row, outcome, ledger, now_unix)?;
        }
        Ok(())
    }
}

/// Virtual P&L for a binary position: winning shares pay out $1 each.
fn virtual_pnl(predicted: Side, outcome: Side, entry: f64, size_usd: f64) -> f64 {
    if entry <= 0.0 {
        return 0.0;
    }
    if predicted == outcome {
        let shares = size_usd / entry;
        shares - size_usd
    } else {
        -size_usd
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::snapshot_fixture;
    use crate::types::{RegimeTag, VoteDirection};

    fn config_with_strategies() -> EngineConfig {
        let json = r#"{
            "max_entry_price": 0.50,
            "shadow_strategies": [
                { "name": "tight", "consensus_threshold": 0.80 },
                { "name": "loose", "consensus_threshold": 0.55 }
            ]
        }"#;
        serde_json::from_str(json).unwrap()
    }

    fn ledger(dir: &tempfile::TempDir) -> Ledger {
        Ledger::open(dir.path().join("ledger.db"), dir.path().join("spool.jsonl")).unwrap()
    }

    /// Votes matching the S1 texture: a strong technical Up plus a neutral
    /// sentiment — agreement 1/2, sideways score ≈ 0.75.
    fn s1_votes() -> Vec<Vote> {
        vec![
            Vote::new("sentiment", VoteDirection::Neutral, 0.25, 0.6),
            Vote::new("technical", VoteDirection::Up, 0.70, 1.0),
        ]
    }

    #[test]
    fn virtual_pnl_win_and_loss() {
        // $9 at 0.42: 21.43 shares pay $21.43 — pnl ≈ +$12.43.
        let win = virtual_pnl(Side::Up, Side::Up, 0.42, 9.0);
        assert!((win - (9.0 / 0.42 - 9.0)).abs() < 1e-9);

        let loss = virtual_pnl(Side::Up, Side::Down, 0.42, 9.0);
        assert!((loss + 9.0).abs() < 1e-9);
    }

    #[test]
    fn shadow_divergence_scenario_s6() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);
        let orch = ShadowOrchestrator::new(config_with_strategies(), &ledger, 0).unwrap();

        let snap = snapshot_fixture(Crypto::Btc);
        orch.evaluate(&snap, &s1_votes(), &AccuracyBook::new(), &ledger, 100)
            .unwrap();

        let tight = ledger
            .decision_for("tight", Crypto::Btc, snap.epoch)
            .unwrap()
            .unwrap();
        let loose = ledger
            .decision_for("loose", Crypto::Btc, snap.epoch)
            .unwrap()
            .unwrap();

        assert!(!tight.would_trade, "tight (0.80) must not trade");
        assert!(loose.would_trade, "loose (0.55) must trade");
        assert_eq!(loose.direction, Some(Side::Up));
        assert!((loose.entry_price.unwrap() - 0.42).abs() < 1e-9);
        assert!(loose.size_usd.unwrap() >= 1.10);
    }

    #[test]
    fn entry_cap_blocks_rich_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);
        let mut config = config_with_strategies();
        config.shadow_strategies[1].max_entry_price = Some(0.40);
        let orch = ShadowOrchestrator::new(config, &ledger, 0).unwrap();

        let mut snap = snapshot_fixture(Crypto::Eth);
        snap.up_ask = 0.45;
        snap.down_ask = 0.57;
        orch.evaluate(&snap, &s1_votes(), &AccuracyBook::new(), &ledger, 100)
            .unwrap();

        let loose = ledger
            .decision_for("loose", Crypto::Eth, snap.epoch)
            .unwrap()
            .unwrap();
        assert!(!loose.would_trade);
        assert_eq!(loose.direction, Some(Side::Up));
    }

    #[test]
    fn resolution_updates_virtual_balance_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);
        let orch = ShadowOrchestrator::new(config_with_strategies(), &ledger, 0).unwrap();

        let snap = snapshot_fixture(Crypto::Btc);
        orch.evaluate(&snap, &s1_votes(), &AccuracyBook::new(), &ledger, 100)
            .unwrap();

        orch.resolve_epoch(Crypto::Btc, snap.epoch, Side::Up, &ledger, 1_000)
            .unwrap();
        let balance_after = ledger.strategy_balance("loose").unwrap().unwrap();
        assert!(balance_after > SHADOW_INITIAL_BALANCE);

        // Feeding the same resolution again must not move the balance.
        orch.resolve_epoch(Crypto::Btc, snap.epoch, Side::Up, &ledger, 2_000)
            .unwrap();
        let balance_repeat = ledger.strategy_balance("loose").unwrap().unwrap();
        assert!((balance_after - balance_repeat).abs() < 1e-9);

        // tight never traded — no outcome row for it.
        assert!(!ledger.outcome_exists("tight", Crypto::Btc, snap.epoch).unwrap());
        assert!(ledger.outcome_exists("loose", Crypto::Btc, snap.epoch).unwrap());
    }

    #[test]
    fn losing_resolution_debits_balance() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir);
        let orch = ShadowOrchestrator::new(config_with_strategies(), &ledger, 0).unwrap();

        let snap = snapshot_fixture(Crypto::Btc);
        orch.evaluate(&snap, &s1_votes(), &AccuracyBook::new(), &ledger, 100)
            .unwrap();
        orch.resolve_epoch(Crypto::Btc, snap.epoch, Side::Down, &ledger, 1_000)
            .unwrap();

        let balance = ledger.strategy_balance("loose").unwrap().unwrap();
        assert!(balance < SHADOW_INITIAL_BALANCE);
    }
}
