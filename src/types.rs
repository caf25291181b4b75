// =============================================================================
// Shared types used across the Quorum trading engine
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Length of one market epoch in seconds (15-minute grid).
pub const EPOCH_SECS: i64 = 900;

/// Monotonic epoch identifier: unix seconds divided by the 15-minute grid.
pub type Epoch = i64;

/// Epoch containing the given unix timestamp.
pub fn epoch_of(unix_secs: i64) -> Epoch {
    unix_secs.div_euclid(EPOCH_SECS)
}

/// Seconds elapsed since the start of the epoch containing `unix_secs`.
pub fn secs_into_epoch(unix_secs: i64) -> i64 {
    unix_secs.rem_euclid(EPOCH_SECS)
}

/// Unix timestamp of the first second of `epoch`.
pub fn epoch_start(epoch: Epoch) -> i64 {
    epoch * EPOCH_SECS
}

// ---------------------------------------------------------------------------
// Crypto
// ---------------------------------------------------------------------------

/// The four underlyings the engine trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crypto {
    Btc,
    Eth,
    Sol,
    Xrp,
}

impl Crypto {
    pub const ALL: [Crypto; 4] = [Crypto::Btc, Crypto::Eth, Crypto::Sol, Crypto::Xrp];

    /// Lowercase slug used in venue market identifiers.
    pub fn slug(&self) -> &'static str {
        match self {
            Crypto::Btc => "btc",
            Crypto::Eth => "eth",
            Crypto::Sol => "sol",
            Crypto::Xrp => "xrp",
        }
    }

    /// Spot pair symbol used by the exchange price feeds.
    pub fn exchange_symbol(&self) -> &'static str {
        match self {
            Crypto::Btc => "BTCUSDT",
            Crypto::Eth => "ETHUSDT",
            Crypto::Sol => "SOLUSDT",
            Crypto::Xrp => "XRPUSDT",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Crypto> {
        match slug.to_ascii_lowercase().as_str() {
            "btc" => Some(Crypto::Btc),
            "eth" => Some(Crypto::Eth),
            "sol" => Some(Crypto::Sol),
            "xrp" => Some(Crypto::Xrp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Crypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug().to_uppercase())
    }
}

// ---------------------------------------------------------------------------
// Directions
// ---------------------------------------------------------------------------

/// A binary market side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Up,
    Down,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Up => Side::Down,
            Side::Down => Side::Up,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Up => "up",
            Side::Down => "down",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Side> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Some(Side::Up),
            "down" => Some(Side::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Up => write!(f, "UP"),
            Side::Down => write!(f, "DOWN"),
        }
    }
}

/// Direction carried by an agent's vote.
///
/// `Skip` is an abstention and is excluded from aggregation entirely.
/// `Neutral` is an explicit "no directional signal" and participates in
/// aggregation, where it can suppress consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteDirection {
    Up,
    Down,
    Neutral,
    Skip,
}

impl VoteDirection {
    pub fn side(&self) -> Option<Side> {
        match self {
            VoteDirection::Up => Some(Side::Up),
            VoteDirection::Down => Some(Side::Down),
            _ => None,
        }
    }
}

impl From<Side> for VoteDirection {
    fn from(side: Side) -> Self {
        match side {
            Side::Up => VoteDirection::Up,
            Side::Down => VoteDirection::Down,
        }
    }
}

impl std::fmt::Display for VoteDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::Skip => write!(f, "SKIP"),
        }
    }
}

// ---------------------------------------------------------------------------
// Trading mode
// ---------------------------------------------------------------------------

/// Capital-preservation ladder. Modes below Normal only shrink position
/// sizes; Halted blocks all trading until the operator intervenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Normal,
    Conservative,
    Defensive,
    Recovery,
    Halted,
}

impl TradeMode {
    /// Position-size multiplier applied by the sizer.
    pub fn size_factor(&self) -> f64 {
        match self {
            TradeMode::Normal => 1.00,
            TradeMode::Conservative => 0.80,
            TradeMode::Defensive => 0.65,
            TradeMode::Recovery => 0.50,
            TradeMode::Halted => 0.0,
        }
    }
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Conservative => write!(f, "conservative"),
            Self::Defensive => write!(f, "defensive"),
            Self::Recovery => write!(f, "recovery"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Regime
// ---------------------------------------------------------------------------

/// Coarse market regime derived from recent inter-epoch returns. Used by the
/// aggregator to modulate agent weights, never to vote directionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeTag {
    BullMomentum,
    BearMomentum,
    Sideways,
    Volatile,
}

impl Default for RegimeTag {
    fn default() -> Self {
        Self::Sideways
    }
}

impl std::fmt::Display for RegimeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BullMomentum => write!(f, "bull_momentum"),
            Self::BearMomentum => write!(f, "bear_momentum"),
            Self::Sideways => write!(f, "sideways"),
            Self::Volatile => write!(f, "volatile"),
        }
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// An open position in one binary market epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub crypto: Crypto,
    pub side: Side,
    /// Outcome shares owned.
    pub shares: f64,
    /// Realised entry price per share, in [0, 1].
    pub entry_price: f64,
    pub epoch: Epoch,
    /// Opaque outcome-token identifier assigned by the venue.
    pub token_id: String,
    /// RFC 3339 timestamp of order confirmation.
    pub opened_at: String,
}

impl Position {
    /// USD spent to open this position.
    pub fn cost(&self) -> f64 {
        self.shares * self.entry_price
    }
}

// ---------------------------------------------------------------------------
// Market snapshot
// ---------------------------------------------------------------------------

/// Immutable per-cycle view of one market handed to every agent.
///
/// Agents must treat this as read-only; it is rebuilt from live data on every
/// scan and dropped at the end of the cycle.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub crypto: Crypto,
    pub epoch: Epoch,
    /// Wall-clock seconds into the epoch, in [0, 900).
    pub secs_into_epoch: i64,
    /// Best ask for the Up outcome token, in [0, 1].
    pub up_ask: f64,
    /// Best ask for the Down outcome token, in [0, 1].
    pub down_ask: f64,
    /// Venue token ids for the two sides.
    pub up_token: String,
    pub down_token: String,
    /// Current cash balance from the trading state.
    pub balance: f64,
    pub open_positions: Vec<Position>,
    /// RSI(14) over the primary exchange's mid history, if enough samples.
    pub rsi_14: Option<f64>,
    /// Recent mid prices per exchange, oldest first (rolling window).
    pub exchange_mids: HashMap<String, Vec<f64>>,
    /// Resolved directions of the last few epochs for this crypto, oldest
    /// first (at most [`crate::feed::OUTCOME_MEMORY`] entries).
    pub last_outcomes: Vec<Side>,
    pub regime: RegimeTag,
    pub mode: TradeMode,
    /// Latest perpetual funding rate for this crypto, if the poller has one.
    pub funding_rate: Option<f64>,
}
