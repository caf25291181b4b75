// =============================================================================
// Reconciliation — cross-check engine state against venue and chain
// =============================================================================
//
// SAFETY POLICY: reconciliation corrects the CASH figure (per the 2%/10%
// thresholds in the state store) but never creates or closes positions on
// its own. Position discrepancies are logged for the operator; unknown
// venue-side positions never spawn new trades.
// =============================================================================

use std::collections::HashSet;

use anyhow::Result;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::gateway::MarketGateway;
use crate::state::ReconcileOutcome;

/// Summary of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileSummary {
    pub cash: ReconcileOutcome,
    /// Positions we track that the venue does not report.
    pub missing_on_venue: usize,
    /// Venue positions we do not track.
    pub unknown_on_venue: usize,
}

/// Run one reconciliation pass: chain cash first, then the position sets.
///
/// Gateway failures degrade to a no-op pass (the engine keeps trading on its
/// own book); state-store failures are fatal and propagate.
pub async fn run_once(state: &AppState, gateway: &dyn MarketGateway) -> Result<ReconcileSummary> {
    // ── Cash ────────────────────────────────────────────────────────────
    let cash = match gateway.cash_balance().await {
        Ok(venue_cash) => state.store.reconcile(venue_cash)?,
        Err(e) => {
            warn!(error = %e, "cash reconciliation skipped — balance read failed");
            ReconcileOutcome::InSync
        }
    };

    // ── Positions ───────────────────────────────────────────────────────
    let (missing_on_venue, unknown_on_venue) = match gateway.read_positions().await {
        Ok(venue_positions) => {
            let venue_tokens: HashSet<&str> = venue_positions
                .iter()
                .map(|p| p.token_id.as_str())
                .collect();
            let trading = state.store.current();
            let our_tokens: HashSet<&str> = trading
                .open_positions
                .iter()
                .map(|p| p.token_id.as_str())
                .collect();

            let mut missing = 0;
            for position in &trading.open_positions {
                if !venue_tokens.contains(position.token_id.as_str()) {
                    missing += 1;
                    warn!(
                        event = "position_missing_on_venue",
                        crypto = %position.crypto,
                        epoch = position.epoch,
                        token_id = %position.token_id,
                        "tracked position not reported by venue"
                    );
                }
            }

            let mut unknown = 0;
            for position in &venue_positions {
                if !our_tokens.contains(position.token_id.as_str()) {
                    unknown += 1;
                    warn!(
                        event = "unknown_venue_position",
                        token_id = %position.token_id,
                        shares = position.shares,
                        "venue reports a position we do not track — no trade will be created"
                    );
                }
            }
            (missing, unknown)
        }
        Err(e) => {
            warn!(error = %e, "position reconciliation skipped — venue read failed");
            (0, 0)
        }
    };

    let summary = ReconcileSummary {
        cash,
        missing_on_venue,
        unknown_on_venue,
    };

    if missing_on_venue + unknown_on_venue > 0 || summary.cash != ReconcileOutcome::InSync {
        info!(
            cash = ?summary.cash,
            missing_on_venue,
            unknown_on_venue,
            "reconciliation pass found drift"
        );
    }
    Ok(summary)
}
