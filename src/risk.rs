// =============================================================================
// Risk Guardian — veto checks and the capital-preservation ladder
// =============================================================================
//
// Veto checks protecting capital (any hit turns the decision into a no-trade):
//
//   1. Halted            — the engine is halted; nothing trades.
//   2. Drawdown          — (peak - cash) / peak at or above the limit. Halts.
//   3. Daily loss        — realised same-day loss at the cap. The cap is
//                          min($50, 20% of day-start balance).
//   4. Duplicate         — an open position already exists for this crypto.
//   5. Direction exposure— open same-direction positions at the limit.
//   6. Total exposure    — total open positions at the limit.
//   7. Consecutive losses— loss streak at the limit. Halts.
//
// The mode ladder is recomputed on every resolved outcome and only ever
// escalates intraday; the midnight roll (state.rs) is the only de-escalation
// path, and leaving Halted always requires the operator sentinel.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::EngineConfig;
use crate::state::TradingState;
use crate::types::{Crypto, Side, TradeMode};

// ---------------------------------------------------------------------------
// Vetoes
// ---------------------------------------------------------------------------

/// One tripped veto. `halts` marks the classes that put the engine into
/// halted mode rather than just skipping the trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Veto {
    pub code: String,
    pub halts: bool,
}

impl Veto {
    fn skip(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            halts: false,
        }
    }

    fn halting(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            halts: true,
        }
    }
}

/// Evaluate every veto predicate against the current state.
///
/// `direction` is the candidate trade direction when known; the
/// direction-exposure check is skipped when it is `None` (the committee pass
/// runs before a direction exists, the placement pass re-checks with one).
pub fn evaluate_vetoes(
    state: &TradingState,
    crypto: Crypto,
    direction: Option<Side>,
    config: &EngineConfig,
) -> Vec<Veto> {
    let mut vetoes = Vec::new();

    if state.mode == TradeMode::Halted {
        vetoes.push(Veto::skip("halted"));
    }

    // Threshold is inclusive: exactly 30% drawdown halts.
    let drawdown = state.drawdown();
    if drawdown >= config.max_drawdown_pct {
        vetoes.push(Veto::halting(format!(
            "drawdown-{:.0}%",
            config.max_drawdown_pct * 100.0
        )));
    }

    let loss_limit = config.effective_daily_loss_limit(state.day_start_balance);
    if loss_limit > 0.0 && state.daily_loss() >= loss_limit {
        vetoes.push(Veto::skip("daily-loss-limit"));
    }

    if state.position_for(crypto).is_some() {
        vetoes.push(Veto::skip(format!("position-open-{}", crypto.slug())));
    }

    if let Some(side) = direction {
        let same_direction = state
            .open_positions
            .iter()
            .filter(|p| p.side == side)
            .count();
        if same_direction >= config.max_positions_same_direction {
            vetoes.push(Veto::skip("direction-exposure"));
        }
    }

    if state.open_positions.len() >= config.max_positions_total {
        vetoes.push(Veto::skip("max-positions"));
    }

    if state.consecutive_losses >= config.max_consecutive_losses {
        vetoes.push(Veto::halting("consecutive-losses"));
    }

    if !vetoes.is_empty() {
        warn!(
            crypto = %crypto,
            vetoes = ?vetoes.iter().map(|v| v.code.as_str()).collect::<Vec<_>>(),
            "guardian veto"
        );
    }

    vetoes
}

// ---------------------------------------------------------------------------
// Recovery-mode ladder
// ---------------------------------------------------------------------------

fn severity(mode: TradeMode) -> u8 {
    match mode {
        TradeMode::Normal => 0,
        TradeMode::Conservative => 1,
        TradeMode::Defensive => 2,
        TradeMode::Recovery => 3,
        TradeMode::Halted => 4,
    }
}

/// Mode implied by the current daily loss and drawdown. The ladder only
/// escalates: the returned mode is never less severe than `current`.
pub fn ladder_mode(state: &TradingState, config: &EngineConfig) -> TradeMode {
    let loss = state.daily_loss_frac();
    let drawdown = state.drawdown();

    let target = if loss >= 0.30 || drawdown >= config.max_drawdown_pct {
        TradeMode::Halted
    } else if loss >= 0.25 {
        TradeMode::Recovery
    } else if loss >= 0.15 {
        TradeMode::Defensive
    } else if loss >= 0.08 {
        TradeMode::Conservative
    } else {
        TradeMode::Normal
    };

    if severity(target) > severity(state.mode) {
        target
    } else {
        state.mode
    }
}
