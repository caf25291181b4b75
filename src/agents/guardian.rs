// =============================================================================
// Guardian Agent — the risk engine's seat at the committee table
// =============================================================================
//
// Veto-only: the direction is always Skip, so the vote never contributes to
// consensus scoring. The veto verdict rides on the vote's details, where the
// aggregator resolves it (any veto ⇒ no trade).
//
// Reads the trading state; never writes it. Halting on drawdown and
// loss-streak vetoes is applied by the engine, which re-evaluates the
// predicates with the winning direction before placement.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;

use crate::agents::{Agent, Vote};
use crate::config::EngineConfig;
use crate::risk::evaluate_vetoes;
use crate::state::StateStore;
use crate::types::MarketSnapshot;

pub struct GuardianAgent {
    config: EngineConfig,
    store: Arc<StateStore>,
}

impl GuardianAgent {
    pub fn new(config: EngineConfig, store: Arc<StateStore>) -> Self {
        Self { config, store }
    }
}

impl Agent for GuardianAgent {
    fn name(&self) -> &'static str {
        "guardian"
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote> {
        let state = self.store.current();
        let mut vetoes = evaluate_vetoes(&state, snapshot.crypto, None, &self.config);

        // Both sides priced above the entry cap means no acceptable entry
        // exists regardless of the winning direction.
        if snapshot.up_ask.min(snapshot.down_ask) > self.config.max_entry_price {
            vetoes.push(crate::risk::Veto {
                code: "entry-price-cap".to_string(),
                halts: false,
            });
        }

        let reasons: Vec<&str> = vetoes.iter().map(|v| v.code.as_str()).collect();
        let halts = vetoes.iter().any(|v| v.halts);

        Ok(Vote::skip(self.name()).with_details(serde_json::json!({
            "veto_reasons": reasons,
            "halts": halts,
            "drawdown": state.drawdown(),
            "daily_loss": state.daily_loss(),
            "mode": state.mode.to_string(),
        })))
    }
}
