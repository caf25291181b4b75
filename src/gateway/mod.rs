// =============================================================================
// Market Gateway — the venue seam of the engine
// =============================================================================
//
// Everything the engine knows about the trading venue and the settlement
// chain goes through this trait: market listing, order placement, position
// readout, redemption and the chain cash balance. The concrete client lives
// in clob.rs; tests substitute their own implementations.
//
// Every call must resolve within an explicit timeout and surface one of the
// categorised [`GatewayError`] variants. Transient variants are retried and
// feed the per-endpoint circuit breaker (circuit.rs); rejections abandon the
// current snapshot without retry.
// =============================================================================

pub mod circuit;
pub mod clob;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Crypto, Epoch, Position};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One active 15-minute binary market as listed by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub crypto: Crypto,
    pub epoch: Epoch,
    pub up_token: String,
    pub down_token: String,
    /// Best ask per side, in [0, 1].
    pub up_ask: f64,
    pub down_ask: f64,
    /// Seconds until the market closes.
    pub secs_to_close: i64,
}

/// A confirmed fill returned by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub token_id: String,
    pub shares: f64,
    /// Realised average entry price per share.
    pub entry_price: f64,
}

/// A position as reported by the venue (authoritative for reconciliation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub token_id: String,
    pub shares: f64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Categorised gateway failure.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Venue throttled the request. Transient.
    RateLimited,
    /// Not enough book depth for the requested size. Business rejection.
    InsufficientLiquidity,
    /// Order rejected for any other business reason.
    Rejected(String),
    /// The call did not complete within its deadline. Transient.
    Timeout,
    /// 5xx / connection-level failure. Transient.
    Transient(String),
    /// The endpoint's circuit breaker is open; the call was not attempted.
    CircuitOpen,
}

impl GatewayError {
    /// Transient errors feed the circuit breaker and may be retried; the
    /// rest abandon the current snapshot.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited | GatewayError::Timeout | GatewayError::Transient(_)
        )
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited"),
            Self::InsufficientLiquidity => write!(f, "insufficient liquidity"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::Timeout => write!(f, "timeout"),
            Self::Transient(msg) => write!(f, "transient: {msg}"),
            Self::CircuitOpen => write!(f, "circuit open"),
        }
    }
}

impl std::error::Error for GatewayError {}

// ---------------------------------------------------------------------------
// The trait
// ---------------------------------------------------------------------------

/// Venue + settlement-chain operations used by the engine.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    /// List the active 15-minute binary markets for the four underlyings.
    async fn list_active_markets(&self) -> Result<Vec<Market>, GatewayError>;

    /// Submit a best-effort market order for `size_usd` of `token_id`.
    async fn place_order(&self, token_id: &str, size_usd: f64) -> Result<OrderFill, GatewayError>;

    /// Authoritative list of open positions on the venue.
    async fn read_positions(&self) -> Result<Vec<VenuePosition>, GatewayError>;

    /// Convert a resolved winning position into settlement currency.
    /// Returns the credited USD amount.
    async fn redeem(&self, position: &Position) -> Result<f64, GatewayError>;

    /// Liquid settlement-currency balance on the chain.
    async fn cash_balance(&self) -> Result<f64, GatewayError>;
}
