// =============================================================================
// Position Sizing — balance-tiered default and fractional Kelly
// =============================================================================
//
// Tiered pipeline:
//   balance -> tier fraction -> mode factor -> score scale -> clamps
//
// The score scale is 0.7 + 0.3 * min(score, 1): a marginal consensus trades
// at 70% of the tier allowance, a perfect one at 100%.
//
// Sizes are rounded down to the venue's $0.01 increment, capped at the
// maximum bet, and suppressed entirely (None) when below the minimum bet.
// =============================================================================

use crate::config::{EngineConfig, SizingPolicy};
use crate::types::TradeMode;

/// Fraction of the full Kelly stake actually risked.
const KELLY_FRACTION: f64 = 0.25;

/// Round down to the venue's minimum increment (cents).
fn to_increment(size: f64) -> f64 {
    (size * 100.0).floor() / 100.0
}

fn apply_clamps(size: f64, config: &EngineConfig) -> Option<f64> {
    let size = to_increment(size.min(config.max_bet_usd));
    if size < config.min_bet_usd {
        return None;
    }
    Some(size)
}

/// Tier fraction for the given cash balance.
fn tier_fraction(balance: f64, config: &EngineConfig) -> f64 {
    for tier in &config.position_tiers {
        if balance < tier.ceiling_usd {
            return tier.max_fraction;
        }
    }
    config.top_tier_fraction
}

/// Default sizer. Returns the order size in USD, or `None` when the trade is
/// suppressed.
pub fn tiered_size(
    balance: f64,
    score: f64,
    mode: TradeMode,
    config: &EngineConfig,
) -> Option<f64> {
    if balance <= 0.0 {
        return None;
    }

    let fraction = tier_fraction(balance, config);
    let score_scale = 0.7 + 0.3 * score.clamp(0.0, 1.0);
    let size = balance * fraction * mode.size_factor() * score_scale;
    apply_clamps(size, config)
}

/// Fractional-Kelly sizer used by some shadow strategies.
///
/// `f = max(0, (score * b - (1 - score)) / b) * 0.25` with
/// `b = (1 - entry) / entry`, then the same clamps as the tiered sizer.
pub fn kelly_size(
    balance: f64,
    score: f64,
    entry_price: f64,
    mode: TradeMode,
    config: &EngineConfig,
) -> Option<f64> {
    if balance <= 0.0 || !(0.0 < entry_price && entry_price < 1.0) {
        return None;
    }

    let b = (1.0 - entry_price) / entry_price;
    let score = score.clamp(0.0, 1.0);
    let f = ((score * b - (1.0 - score)) / b).max(0.0) * KELLY_FRACTION;
    if f <= 0.0 {
        return None;
    }

    let size = balance * f * mode.size_factor();
    apply_clamps(size, config)
}

/// Dispatch on a strategy's configured sizing policy.
pub fn size_for_policy(
    policy: SizingPolicy,
    balance: f64,
    score: f64,
    entry_price: f64,
    mode: TradeMode,
    config: &EngineConfig,
) -> Option<f64> {
    match policy {
        SizingPolicy::Tiered => tiered_size(balance, score, mode, config),
        SizingPolicy::Kelly => kelly_size(balance, score, entry_price, mode, config),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn tier_fractions_by_balance() {
        let cfg = cfg();
        assert!((tier_fraction(10.0, &cfg) - 0.15).abs() < 1e-12);
        assert!((tier_fraction(29.99, &cfg) - 0.15).abs() < 1e-12);
        assert!((tier_fraction(30.0, &cfg) - 0.10).abs() < 1e-12);
        assert!((tier_fraction(75.0, &cfg) - 0.07).abs() < 1e-12);
        assert!((tier_fraction(150.0, &cfg) - 0.05).abs() < 1e-12);
        assert!((tier_fraction(10_000.0, &cfg) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn happy_path_size_matches_scenario_s1() {
        // $200 balance, normal mode, score near 0.66:
        // 200 * 5% * 1.0 * (0.7 + 0.3 * 0.66) ≈ $8.98
        let size = tiered_size(200.0, 0.66, TradeMode::Normal, &cfg()).unwrap();
        assert!((size - 8.98).abs() < 0.01, "got {size}");
    }

    #[test]
    fn mode_factor_shrinks_size() {
        let cfg = cfg();
        let normal = tiered_size(200.0, 1.0, TradeMode::Normal, &cfg).unwrap();
        let conservative = tiered_size(200.0, 1.0, TradeMode::Conservative, &cfg).unwrap();
        let recovery = tiered_size(200.0, 1.0, TradeMode::Recovery, &cfg).unwrap();
        assert!((conservative - normal * 0.8).abs() < 0.011);
        assert!((recovery - normal * 0.5).abs() < 0.011);
    }

    #[test]
    fn halted_mode_never_sizes() {
        assert!(tiered_size(200.0, 1.0, TradeMode::Halted, &cfg()).is_none());
    }

    #[test]
    fn score_scale_bounds() {
        let cfg = cfg();
        let low = tiered_size(200.0, 0.0, TradeMode::Normal, &cfg).unwrap();
        let high = tiered_size(200.0, 1.0, TradeMode::Normal, &cfg).unwrap();
        // 0.7x vs 1.0x of the tier allowance ($10).
        assert!((low - 7.0).abs() < 0.011);
        assert!((high - 10.0).abs() < 0.011);
        // Scores past 1.0 are capped.
        let over = tiered_size(200.0, 5.0, TradeMode::Normal, &cfg).unwrap();
        assert!((over - high).abs() < 1e-9);
    }

    #[test]
    fn tiny_balance_is_suppressed() {
        // $5 * 15% * 1.0 * <=1.0 < $1.10 minimum.
        assert!(tiered_size(5.0, 1.0, TradeMode::Normal, &cfg()).is_none());
        assert!(tiered_size(0.0, 1.0, TradeMode::Normal, &cfg()).is_none());
    }

    #[test]
    fn large_balance_hits_max_bet() {
        // $1000 * 5% = $50, capped at $15.
        let size = tiered_size(1_000.0, 1.0, TradeMode::Normal, &cfg()).unwrap();
        assert!((size - 15.0).abs() < 1e-9);
    }

    #[test]
    fn size_respects_property_bounds() {
        let cfg = cfg();
        for balance in [12.0, 40.0, 99.0, 180.0, 500.0] {
            for score in [0.0, 0.3, 0.66, 1.0] {
                for mode in [
                    TradeMode::Normal,
                    TradeMode::Conservative,
                    TradeMode::Defensive,
                    TradeMode::Recovery,
                ] {
                    if let Some(size) = tiered_size(balance, score, mode, &cfg) {
                        let ceiling = (balance * tier_fraction(balance, &cfg) * mode.size_factor())
                            .min(cfg.max_bet_usd);
                        assert!(size >= cfg.min_bet_usd, "size {size} below min");
                        assert!(size <= ceiling + 1e-9, "size {size} above ceiling {ceiling}");
                    }
                }
            }
        }
    }

    #[test]
    fn sizes_are_cent_increments() {
        let size = tiered_size(123.45, 0.57, TradeMode::Normal, &cfg()).unwrap();
        let cents = size * 100.0;
        assert!((cents - cents.round()).abs() < 1e-9);
    }

    #[test]
    fn kelly_with_edge() {
        // score 0.66 at entry 0.42: b ≈ 1.381, full Kelly ≈ 0.414,
        // quarter Kelly ≈ 0.103 — $200 gives ≈ $20.7, capped at $15.
        let size = kelly_size(200.0, 0.66, 0.42, TradeMode::Normal, &cfg()).unwrap();
        assert!((size - 15.0).abs() < 1e-9);

        // Smaller balance stays under the cap.
        let size = kelly_size(80.0, 0.66, 0.42, TradeMode::Normal, &cfg()).unwrap();
        assert!(size > 1.10 && size < 15.0);
    }

    #[test]
    fn kelly_without_edge_is_suppressed() {
        // score equal to the implied probability has no edge at these odds.
        assert!(kelly_size(200.0, 0.30, 0.70, TradeMode::Normal, &cfg()).is_none());
        assert!(kelly_size(200.0, 0.0, 0.42, TradeMode::Normal, &cfg()).is_none());
    }

    #[test]
    fn kelly_rejects_degenerate_entries() {
        let cfg = cfg();
        assert!(kelly_size(200.0, 0.8, 0.0, TradeMode::Normal, &cfg).is_none());
        assert!(kelly_size(200.0, 0.8, 1.0, TradeMode::Normal, &cfg).is_none());
    }

    #[test]
    fn policy_dispatch() {
        let cfg = cfg();
        let tiered = size_for_policy(
            SizingPolicy::Tiered,
            200.0,
            0.66,
            0.42,
            TradeMode::Normal,
            &cfg,
        );
        let kelly = size_for_policy(
            SizingPolicy::Kelly,
            200.0,
            0.66,
            0.42,
            TradeMode::Normal,
            &cfg,
        );
        assert_eq!(tiered, tiered_size(200.0, 0.66, TradeMode::Normal, &cfg));
        assert_eq!(
            kelly,
            kelly_size(200.0, 0.66, 0.42, TradeMode::Normal, &cfg)
        );
    }
}
