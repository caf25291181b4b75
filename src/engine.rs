// =============================================================================
// Decision Engine — one market, one cycle, one decision
// =============================================================================
//
// Pipeline per snapshot:
//   1. Build the immutable snapshot from feed + venue + trading state
//   2. Run the committee (sequential, deterministic order)
//   3. Aggregate to a weighted-consensus decision
//   4. Guardian re-check with the winning direction; halting vetoes halt
//   5. Entry-price cap and sizing
//   6. Place the order and record the position
//   7. Persist the production decision row (and votes, once a trade commits)
//   8. Replay the snapshot through every shadow strategy
//
// Ledger write failures are logged and the cycle continues; state-store
// failures are fatal and propagate to the scheduler.
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::{aggregate, AggregateDecision, AggregatorSettings};
use crate::agents::Vote;
use crate::app_state::{AppState, DecisionRecord};
use crate::execution::{place_order, ExecutionResult};
use crate::gateway::{Market, MarketGateway};
use crate::ledger::{DecisionRow, VoteRow};
use crate::risk::evaluate_vetoes;
use crate::sizing::tiered_size;
use crate::state::TradingState;
use crate::types::{MarketSnapshot, Side};

/// Strategy name under which the real account's rows are journaled.
pub const PRODUCTION_STRATEGY: &str = "production";

/// Assemble the per-cycle snapshot every agent sees.
pub fn build_snapshot(
    state: &AppState,
    market: &Market,
    trading: &TradingState,
    now_unix: i64,
) -> MarketSnapshot {
    let crypto = market.crypto;
    let (regime, _confidence) =
        crate::agents::regime::detect_regime(&state.feed.epoch_returns(crypto));

    MarketSnapshot {
        crypto,
        epoch: market.epoch,
        secs_into_epoch: crate::types::secs_into_epoch(now_unix),
        up_ask: market.up_ask,
        down_ask: market.down_ask,
        up_token: market.up_token.clone(),
        down_token: market.down_token.clone(),
        balance: trading.current_balance,
        open_positions: trading.open_positions.clone(),
        rsi_14: state.feed.rsi_14(crypto),
        exchange_mids: state.feed.fresh_mids(crypto, now_unix),
        last_outcomes: state.feed.outcome_history(crypto),
        regime,
        mode: trading.mode,
        funding_rate: state.feed.funding_rate(crypto),
    }
}

/// Evaluate one market snapshot end to end.
pub async fn evaluate_market(
    state: &AppState,
    gateway: &dyn MarketGateway,
    market: &Market,
    now_unix: i64,
) -> Result<()> {
    let trading = state.store.current();
    let snapshot = build_snapshot(state, market, &trading, now_unix);

    // ── Committee ────────────────────────────────────────────────────────
    let votes = state.committee.lock().run(&snapshot, now_unix);
    state.stash_votes(snapshot.crypto, snapshot.epoch, votes.clone());

    // ── Aggregation ──────────────────────────────────────────────────────
    let settings = AggregatorSettings::production(&state.config);
    let decision = {
        let accuracy = state.accuracy.lock();
        aggregate(&votes, snapshot.regime, &settings, &accuracy)
    };

    // ── Guardian re-check with the winning direction ─────────────────────
    let vetoes = evaluate_vetoes(&trading, snapshot.crypto, decision.direction, &state.config);
    if let Some(halting) = vetoes.iter().find(|v| v.halts) {
        let code = halting.code.clone();
        state.store.update(|s| s.halt(&code))?;
    }

    // ── Trade attempt ────────────────────────────────────────────────────
    let mut row = DecisionRow {
        id: Uuid::new_v4().to_string(),
        strategy: PRODUCTION_STRATEGY.to_string(),
        crypto: snapshot.crypto,
        epoch: snapshot.epoch,
        direction: decision.direction,
        score: decision.score,
        agreement: decision.agreement,
        vetoed: decision.vetoed || !vetoes.is_empty(),
        reason: decision.reason.clone(),
        would_trade: false,
        entry_price: None,
        size_usd: None,
        created_at: now_unix,
    };

    if let Some(side) = decision.direction {
        if !vetoes.is_empty() {
            row.reason = "vetoed".to_string();
        } else {
            attempt_trade(state, gateway, &snapshot, &decision, side, &votes, &mut row).await?;
        }
    }

    if let Err(e) = state.ledger.record_decision(&row) {
        warn!(error = %e, "failed to journal production decision");
        state.push_error(format!("decision journal: {e}"));
    }

    state.push_decision(DecisionRecord {
        crypto: snapshot.crypto,
        epoch: snapshot.epoch,
        direction: row.direction,
        score: row.score,
        reason: row.reason.clone(),
        at: Utc::now().to_rfc3339(),
    });

    // ── Shadow replay ────────────────────────────────────────────────────
    {
        let accuracy = state.accuracy.lock();
        if let Err(e) = state
            .shadow
            .evaluate(&snapshot, &votes, &accuracy, &state.ledger, now_unix)
        {
            warn!(error = %e, "shadow evaluation failed");
            state.push_error(format!("shadow: {e}"));
        }
    }

    Ok(())
}

/// Entry cap, sizing and order placement for an approved decision.
async fn attempt_trade(
    state: &AppState,
    gateway: &dyn MarketGateway,
    snapshot: &MarketSnapshot,
    decision: &AggregateDecision,
    side: Side,
    votes: &[Vote],
    row: &mut DecisionRow,
) -> Result<()> {
    let (entry, token) = match side {
        Side::Up => (snapshot.up_ask, snapshot.up_token.as_str()),
        Side::Down => (snapshot.down_ask, snapshot.down_token.as_str()),
    };

    if entry > state.config.max_entry_price {
        row.reason = "entry-price-cap".to_string();
        return Ok(());
    }

    let Some(size) = tiered_size(snapshot.balance, decision.score, snapshot.mode, &state.config)
    else {
        row.reason = "size-suppressed".to_string();
        return Ok(());
    };

    match place_order(
        gateway,
        &state.store,
        snapshot.crypto,
        side,
        token,
        size,
        snapshot.epoch,
    )
    .await?
    {
        ExecutionResult::Placed(position) => {
            row.would_trade = true;
            row.entry_price = Some(position.entry_price);
            row.size_usd = Some(size);

            info!(
                event = "trade_placed",
                crypto = %snapshot.crypto,
                epoch = snapshot.epoch,
                side = %side,
                score = decision.score,
                agreement = decision.agreement,
                size_usd = size,
                entry_price = position.entry_price,
                "production trade placed"
            );

            // Journal the committee's votes behind the committed trade.
            let vote_rows: Vec<VoteRow> = votes
                .iter()
                .map(|v| VoteRow {
                    decision_id: row.id.clone(),
                    agent_name: v.agent.clone(),
                    crypto: snapshot.crypto,
                    epoch: snapshot.epoch,
                    direction: format!("{:?}", v.direction),
                    confidence: v.confidence,
                    quality: v.quality,
                })
                .collect();
            let now = Utc::now().timestamp();
            if let Err(e) = state.ledger.record_votes(&vote_rows, now) {
                warn!(error = %e, "failed to journal committee votes");
            }
        }
        ExecutionResult::Rejected(reason) => {
            row.reason = "order-rejected".to_string();
            state.push_error(format!("order rejected: {reason}"));
        }
        ExecutionResult::Transient(reason) => {
            row.reason = "order-transient".to_string();
            warn!(reason = %reason, "order not placed this cycle");
        }
    }

    Ok(())
}
