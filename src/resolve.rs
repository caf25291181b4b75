// =============================================================================
// Epoch Resolution — settle positions, journal outcomes, update the ladder
// =============================================================================
//
// The actual Up/Down outcome of an epoch is read off the price feed's
// epoch-open book: the first price of the NEXT epoch is this epoch's close.
// Resolution is attempted after the settlement grace delay and retried on
// later cycles while the data (or the venue) is not ready.
//
// All paths are idempotent: outcome rows upsert on (strategy, crypto,
// epoch), the production position disappears exactly once, and repeated
// resolution of a settled epoch is a quiet no-op.
// =============================================================================

use anyhow::Result;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::engine::PRODUCTION_STRATEGY;
use crate::gateway::MarketGateway;
use crate::ledger::{OutcomeInsert, OutcomeRow};
use crate::risk::ladder_mode;
use crate::types::{epoch_start, Crypto, Epoch, Side, TradeMode, VoteDirection};

/// How many closed epochs back the scheduler keeps trying to resolve.
pub const RESOLVE_LOOKBACK: i64 = 4;

/// Determine the resolved direction of `epoch` from the feed's epoch-open
/// book. `None` while the close price is not yet observed.
fn epoch_outcome(state: &AppState, crypto: Crypto, epoch: Epoch) -> Option<Side> {
    let open = state.feed.epoch_open(crypto, epoch)?;
    let close = state.feed.epoch_open(crypto, epoch + 1)?;
    Some(if close > open { Side::Up } else { Side::Down })
}

/// Resolve one (crypto, epoch). Returns `Ok(true)` when fully settled, or
/// `Ok(false)` when it must be retried on a later cycle.
pub async fn resolve_epoch(
    state: &AppState,
    gateway: &dyn MarketGateway,
    crypto: Crypto,
    epoch: Epoch,
    now_unix: i64,
) -> Result<bool> {
    let Some(outcome) = epoch_outcome(state, crypto, epoch) else {
        return Ok(false);
    };

    // One-time side effects: outcome memory, agent history, adaptive
    // accuracy.
    if !state.is_resolved(crypto, epoch) {
        state.feed.record_outcome(crypto, outcome);
        state.committee.lock().observe_outcome(crypto, epoch, outcome);

        if let Some(votes) = state.take_votes(crypto, epoch) {
            let mut accuracy = state.accuracy.lock();
            for vote in votes {
                match vote.direction {
                    VoteDirection::Up | VoteDirection::Down => {
                        let correct = vote.direction.side() == Some(outcome);
                        accuracy.record(&vote.agent, correct);
                    }
                    VoteDirection::Neutral | VoteDirection::Skip => {}
                }
            }
        }
    }

    // Production settles first; a redemption that cannot complete keeps the
    // whole epoch pending so funds are never silently dropped.
    if !settle_production(state, gateway, crypto, epoch, outcome, now_unix).await? {
        return Ok(false);
    }

    // Shadow strategies settle virtually, ordered by name.
    if let Err(e) = state
        .shadow
        .resolve_epoch(crypto, epoch, outcome, &state.ledger, now_unix)
    {
        warn!(crypto = %crypto, epoch, error = %e, "shadow resolution failed");
        state.push_error(format!("shadow resolution: {e}"));
    }

    state.mark_resolved(crypto, epoch);
    info!(
        event = "epoch_resolved",
        crypto = %crypto,
        epoch,
        outcome = %outcome,
        "epoch resolution complete"
    );
    Ok(true)
}

/// Settle the production account's position in (crypto, epoch), if any.
/// Returns false when the venue redemption must be retried.
async fn settle_production(
    state: &AppState,
    gateway: &dyn MarketGateway,
    crypto: Crypto,
    epoch: Epoch,
    outcome: Side,
    now_unix: i64,
) -> Result<bool> {
    let trading = state.store.current();
    let Some(position) = trading
        .open_positions
        .iter()
        .find(|p| p.crypto == crypto && p.epoch == epoch)
        .cloned()
    else {
        return Ok(true);
    };

    let cost = position.cost();
    let won = position.side == outcome;

    let credited = if won {
        match gateway.redeem(&position).await {
            Ok(amount) => amount,
            Err(e) => {
                warn!(
                    crypto = %crypto,
                    epoch,
                    error = %e,
                    "redemption failed — will retry"
                );
                return Ok(false);
            }
        }
    } else {
        0.0
    };

    let pnl = credited - cost;
    let config = state.config.clone();

    state.store.update(|s| {
        s.remove_position(crypto, epoch);

        if won {
            // Redemption credit: the only event that may raise the peak.
            s.current_balance += credited;
            if s.current_balance > s.peak_balance {
                s.peak_balance = s.current_balance;
            }
            s.consecutive_wins += 1;
            s.consecutive_losses = 0;
        } else {
            s.consecutive_losses += 1;
            s.consecutive_wins = 0;
        }
        s.daily_pnl += pnl;

        // Ladder transition on every resolved outcome.
        let target = ladder_mode(s, &config);
        if target == TradeMode::Halted && s.mode != TradeMode::Halted {
            let code = if s.drawdown() >= config.max_drawdown_pct {
                format!("drawdown-{:.0}%", config.max_drawdown_pct * 100.0)
            } else {
                "daily-loss-30%".to_string()
            };
            s.halt(&code);
        } else {
            s.mode = target;
        }
    })?;

    // Journal the production outcome.
    let confidence = state
        .ledger
        .decision_for(PRODUCTION_STRATEGY, crypto, epoch)
        .ok()
        .flatten()
        .map(|d| d.score)
        .unwrap_or(0.0);

    let inserted = state.ledger.insert_outcome(&OutcomeRow {
        strategy: PRODUCTION_STRATEGY.to_string(),
        crypto,
        epoch,
        outcome,
        pnl,
        predicted: Some(position.side),
        confidence,
        resolved_at: now_unix,
    });

    if inserted == OutcomeInsert::Inserted {
        let day = chrono::DateTime::from_timestamp(now_unix, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        if let Err(e) = state
            .ledger
            .record_performance(PRODUCTION_STRATEGY, &day, won, pnl)
        {
            warn!(error = %e, "failed to roll up production performance");
        }
    }

    info!(
        event = "position_settled",
        crypto = %crypto,
        epoch,
        outcome = %outcome,
        won,
        pnl,
        credited,
        "production position settled"
    );
    Ok(true)
}

/// Attempt resolution for every closed epoch within the lookback window.
pub async fn resolve_due(
    state: &AppState,
    gateway: &dyn MarketGateway,
    now_unix: i64,
) -> Result<()> {
    let current = crate::types::epoch_of(now_unix);
    let grace = state.config.settlement_grace_s as i64;

    for crypto in Crypto::ALL {
        for epoch in (current - RESOLVE_LOOKBACK)..current {
            if state.is_resolved(crypto, epoch) {
                continue;
            }
            if now_unix < epoch_start(epoch + 1) + grace {
                continue;
            }
            if let Err(e) = resolve_epoch(state, gateway, crypto, epoch, now_unix).await {
                warn!(crypto = %crypto, epoch, error = %e, "resolution error");
                state.push_error(format!("resolution {crypto} {epoch}: {e}"));
            }
        }
    }
    Ok(())
}
