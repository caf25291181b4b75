// =============================================================================
// Engine Configuration — tunable settings with atomic save
// =============================================================================
//
// Every recognised option lives here with a serde default, so older JSON
// files missing new fields still deserialise. Persistence uses the tmp +
// rename pattern to prevent corruption on crash.
//
// Credentials are NOT part of this file; they come from the environment and
// are never serialised or logged.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_scan_interval_s() -> u64 {
    2
}

fn default_consensus_threshold() -> f64 {
    0.65
}

fn default_min_confidence() -> f64 {
    0.50
}

fn default_min_agreement() -> f64 {
    0.50
}

fn default_max_entry_price() -> f64 {
    0.30
}

fn default_max_drawdown_pct() -> f64 {
    0.30
}

fn default_daily_loss_limit_usd() -> f64 {
    50.0
}

fn default_daily_loss_frac() -> f64 {
    0.20
}

fn default_max_positions_total() -> usize {
    4
}

fn default_max_positions_same_direction() -> usize {
    3
}

fn default_max_consecutive_losses() -> u32 {
    10
}

fn default_position_tiers() -> Vec<PositionTier> {
    vec![
        PositionTier { ceiling_usd: 30.0, max_fraction: 0.15 },
        PositionTier { ceiling_usd: 75.0, max_fraction: 0.10 },
        PositionTier { ceiling_usd: 150.0, max_fraction: 0.07 },
    ]
}

fn default_top_tier_fraction() -> f64 {
    0.05
}

fn default_min_bet_usd() -> f64 {
    1.10
}

fn default_max_bet_usd() -> f64 {
    15.0
}

fn default_sentiment_rich() -> f64 {
    0.70
}

fn default_sentiment_cheap() -> f64 {
    0.20
}

fn default_settlement_grace_s() -> u64 {
    60
}

fn default_cycle_budget_s() -> u64 {
    10
}

fn default_position_check_every() -> u64 {
    30
}

fn default_funding_poll_interval_s() -> u64 {
    300
}

fn default_state_path() -> String {
    "trading_state.json".to_string()
}

fn default_ledger_path() -> String {
    "ledger.db".to_string()
}

fn default_spool_path() -> String {
    "ledger_spool.jsonl".to_string()
}

fn default_halt_sentinel_path() -> String {
    "unhalt.signal".to_string()
}

fn default_social_sentiment_path() -> String {
    "social_sentiment.json".to_string()
}

fn default_model_path() -> String {
    "model_coefficients.json".to_string()
}

// =============================================================================
// Sizing
// =============================================================================

/// One row of the balance-tiered sizing table: balances strictly below
/// `ceiling_usd` may risk at most `max_fraction` of cash per position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionTier {
    pub ceiling_usd: f64,
    pub max_fraction: f64,
}

/// Which sizing rule a strategy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingPolicy {
    Tiered,
    Kelly,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self::Tiered
    }
}

// =============================================================================
// Shadow strategies
// =============================================================================

/// A named shadow configuration: every field overrides the production value
/// when present, otherwise the production default applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowStrategyConfig {
    pub name: String,

    #[serde(default)]
    pub consensus_threshold: Option<f64>,

    #[serde(default)]
    pub min_confidence: Option<f64>,

    #[serde(default)]
    pub min_agreement: Option<f64>,

    /// Agents this strategy listens to; absent means all enabled agents.
    #[serde(default)]
    pub agents_enabled: Option<HashSet<String>>,

    /// Per-agent base-weight overrides.
    #[serde(default)]
    pub agent_weights: Option<HashMap<String, f64>>,

    #[serde(default)]
    pub max_entry_price: Option<f64>,

    #[serde(default)]
    pub sizing: SizingPolicy,
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Quorum engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Scheduler ----------------------------------------------------------
    /// Main-loop period in seconds.
    #[serde(default = "default_scan_interval_s")]
    pub scan_interval_s: u64,

    /// Delay after an epoch closes before resolution is attempted.
    #[serde(default = "default_settlement_grace_s")]
    pub settlement_grace_s: u64,

    /// Hard wall-clock budget for a single scan cycle.
    #[serde(default = "default_cycle_budget_s")]
    pub cycle_budget_s: u64,

    /// Compare our position set against the venue every N cycles.
    #[serde(default = "default_position_check_every")]
    pub position_check_every: u64,

    /// Perpetual funding-rate poll period.
    #[serde(default = "default_funding_poll_interval_s")]
    pub funding_poll_interval_s: u64,

    // --- Aggregator gates ---------------------------------------------------
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_min_agreement")]
    pub min_agreement: f64,

    // --- Guardian -----------------------------------------------------------
    /// Hard cap on entry price; snapshots priced above this are skipped.
    #[serde(default = "default_max_entry_price")]
    pub max_entry_price: f64,

    /// Drawdown fraction at which the engine halts (inclusive).
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,

    /// Absolute same-day realised-loss cap in USD.
    #[serde(default = "default_daily_loss_limit_usd")]
    pub daily_loss_limit_usd: f64,

    /// Same-day loss cap as a fraction of day-start balance; the effective
    /// limit is the smaller of this and `daily_loss_limit_usd`.
    #[serde(default = "default_daily_loss_frac")]
    pub daily_loss_frac: f64,

    #[serde(default = "default_max_positions_total")]
    pub max_positions_total: usize,

    #[serde(default = "default_max_positions_same_direction")]
    pub max_positions_same_direction: usize,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    // --- Sizing -------------------------------------------------------------
    /// Balance-tiered sizing table, ascending by ceiling.
    #[serde(default = "default_position_tiers")]
    pub position_tiers: Vec<PositionTier>,

    /// Fraction for balances at or above the last tier ceiling.
    #[serde(default = "default_top_tier_fraction")]
    pub top_tier_fraction: f64,

    #[serde(default = "default_min_bet_usd")]
    pub min_bet_usd: f64,

    #[serde(default = "default_max_bet_usd")]
    pub max_bet_usd: f64,

    // --- Committee ----------------------------------------------------------
    /// Agents to run; absent means every registered agent.
    #[serde(default)]
    pub agents_enabled: Option<HashSet<String>>,

    /// Per-agent base weight; agents not listed get 1.0.
    #[serde(default)]
    pub agent_weights: HashMap<String, f64>,

    /// Contrarian agent price thresholds (empirically retuned over time).
    #[serde(default = "default_sentiment_rich")]
    pub sentiment_rich: f64,

    #[serde(default = "default_sentiment_cheap")]
    pub sentiment_cheap: f64,

    // --- Shadow book --------------------------------------------------------
    #[serde(default)]
    pub shadow_strategies: Vec<ShadowStrategyConfig>,

    // --- Paths --------------------------------------------------------------
    #[serde(default = "default_state_path")]
    pub state_path: String,

    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,

    #[serde(default = "default_spool_path")]
    pub spool_path: String,

    /// Presence of this file releases a halt; it is consumed when seen.
    #[serde(default = "default_halt_sentinel_path")]
    pub halt_sentinel_path: String,

    #[serde(default = "default_social_sentiment_path")]
    pub social_sentiment_path: String,

    #[serde(default = "default_model_path")]
    pub model_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises from defaults")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning; a malformed file is a fatal config error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            scan_interval_s = config.scan_interval_s,
            consensus_threshold = config.consensus_threshold,
            shadow_strategies = config.shadow_strategies.len(),
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Reject configurations the engine cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval_s == 0 {
            bail!("scan_interval_s must be >= 1");
        }
        for (name, v) in [
            ("consensus_threshold", self.consensus_threshold),
            ("min_confidence", self.min_confidence),
            ("min_agreement", self.min_agreement),
            ("max_entry_price", self.max_entry_price),
            ("max_drawdown_pct", self.max_drawdown_pct),
            ("daily_loss_frac", self.daily_loss_frac),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("{name} must be in [0, 1], got {v}");
            }
        }
        if self.min_bet_usd <= 0.0 || self.min_bet_usd >= self.max_bet_usd {
            bail!(
                "min_bet_usd ({}) must be positive and below max_bet_usd ({})",
                self.min_bet_usd,
                self.max_bet_usd
            );
        }
        if self.position_tiers.is_empty() {
            bail!("position_tiers must not be empty");
        }
        let mut prev_ceiling = 0.0;
        for tier in &self.position_tiers {
            if tier.ceiling_usd <= prev_ceiling {
                bail!("position_tiers ceilings must be strictly ascending");
            }
            if !(0.0..=1.0).contains(&tier.max_fraction) {
                bail!("position tier fraction {} out of [0, 1]", tier.max_fraction);
            }
            prev_ceiling = tier.ceiling_usd;
        }
        if !(self.sentiment_cheap < self.sentiment_rich) {
            bail!(
                "sentiment_cheap ({}) must be below sentiment_rich ({})",
                self.sentiment_cheap,
                self.sentiment_rich
            );
        }

        let mut seen = HashSet::new();
        for strat in &self.shadow_strategies {
            if strat.name.trim().is_empty() {
                bail!("shadow strategy with empty name");
            }
            if !seen.insert(strat.name.as_str()) {
                bail!("duplicate shadow strategy name: {}", strat.name);
            }
        }

        Ok(())
    }

    /// Base weight for an agent (1.0 unless overridden).
    pub fn agent_weight(&self, agent: &str) -> f64 {
        self.agent_weights.get(agent).copied().unwrap_or(1.0)
    }

    /// Whether an agent is enabled by the production configuration.
    pub fn agent_enabled(&self, agent: &str) -> bool {
        match &self.agents_enabled {
            Some(set) => set.contains(agent),
            None => true,
        }
    }

    /// Effective same-day realised-loss limit for the given day-start balance.
    pub fn effective_daily_loss_limit(&self, day_start_balance: f64) -> f64 {
        self.daily_loss_limit_usd
            .min(self.daily_loss_frac * day_start_balance.max(0.0))
    }
}

// =============================================================================
// Credentials (environment only)
// =============================================================================

/// Secrets sourced from the environment. Never serialised, never logged.
#[derive(Clone)]
pub struct Credentials {
    pub wallet_address: String,
    pub private_key: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    pub chain_rpc_url: String,
}

impl Credentials {
    /// Read all credentials from the environment. Missing variables are a
    /// fatal config error at startup.
    pub fn from_env() -> Result<Self> {
        fn required(name: &str) -> Result<String> {
            std::env::var(name).with_context(|| format!("missing required env var {name}"))
        }

        Ok(Self {
            wallet_address: required("QUORUM_WALLET_ADDRESS")?,
            private_key: required("QUORUM_PRIVATE_KEY")?,
            api_key: required("QUORUM_API_KEY")?,
            api_secret: required("QUORUM_API_SECRET")?,
            api_passphrase: required("QUORUM_API_PASSPHRASE")?,
            chain_rpc_url: required("QUORUM_CHAIN_RPC_URL")?,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("wallet_address", &"<redacted>")
            .field("private_key", &"<redacted>")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("api_passphrase", &"<redacted>")
            .field("chain_rpc_url", &"<redacted>")
            .finish()
    }
}
