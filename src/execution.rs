// =============================================================================
// Execution — routes an approved decision through the venue gateway
// =============================================================================
//
// On a confirmed fill the position is recorded and its cost leaves the cash
// balance in one transactional state update. Venue rejections abandon the
// snapshot (no retry); transient failures are left to the circuit breaker
// and the next scan.
// =============================================================================

use chrono::Utc;
use tracing::{info, warn};

use crate::gateway::{GatewayError, MarketGateway};
use crate::state::StateStore;
use crate::types::{Crypto, Epoch, Position, Side};

/// Outcome of an order attempt.
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// Order filled and position recorded.
    Placed(Position),
    /// Venue rejected the order for business reasons; snapshot abandoned.
    Rejected(String),
    /// Transient venue failure; the next cycle may retry.
    Transient(String),
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Placed(p) => write!(f, "Placed({} {} {:.2} shares)", p.crypto, p.side, p.shares),
            Self::Rejected(reason) => write!(f, "Rejected({reason})"),
            Self::Transient(reason) => write!(f, "Transient({reason})"),
        }
    }
}

/// Submit a market order and record the resulting position.
pub async fn place_order(
    gateway: &dyn MarketGateway,
    store: &StateStore,
    crypto: Crypto,
    side: Side,
    token_id: &str,
    size_usd: f64,
    epoch: Epoch,
) -> anyhow::Result<ExecutionResult> {
    let fill = match gateway.place_order(token_id, size_usd).await {
        Ok(fill) => fill,
        Err(e) if e.is_transient() => {
            warn!(crypto = %crypto, side = %side, error = %e, "order transient failure");
            return Ok(ExecutionResult::Transient(e.to_string()));
        }
        Err(e @ (GatewayError::Rejected(_) | GatewayError::InsufficientLiquidity)) => {
            warn!(crypto = %crypto, side = %side, error = %e, "order rejected by venue");
            return Ok(ExecutionResult::Rejected(e.to_string()));
        }
        Err(e) => {
            // Circuit open — treated like a transient miss.
            return Ok(ExecutionResult::Transient(e.to_string()));
        }
    };

    let position = Position {
        crypto,
        side,
        shares: fill.shares,
        entry_price: fill.entry_price,
        epoch,
        token_id: fill.token_id,
        opened_at: Utc::now().to_rfc3339(),
    };
    let cost = position.cost();

    // Position creation and the cash debit commit atomically.
    store.update(|s| {
        s.open_positions.push(position.clone());
        s.current_balance -= cost;
    })?;

    info!(
        event = "position_opened",
        crypto = %crypto,
        side = %side,
        epoch,
        shares = position.shares,
        entry_price = position.entry_price,
        cost,
        "order filled and position recorded"
    );

    Ok(ExecutionResult::Placed(position))
}
