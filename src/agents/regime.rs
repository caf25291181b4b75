// =============================================================================
// Regime Agent — classifies the tape, never votes a direction
// =============================================================================
//
// Classification from the mean and variance of the last 20 inter-epoch
// returns (evaluated top-to-bottom; first match wins):
//
//   1. VOLATILE        — stdev >= 0.40% per epoch
//   2. BULL_MOMENTUM   — mean  >= +0.08%
//   3. BEAR_MOMENTUM   — mean  <= -0.08%
//   4. SIDEWAYS        — everything else
//
// The agent always emits a Neutral vote; the regime tag rides on the vote's
// details and is what the aggregator actually consumes for weight
// modulation.
// =============================================================================

use anyhow::Result;

use crate::agents::{Agent, Vote};
use crate::indicators::mean_variance;
use crate::types::{MarketSnapshot, RegimeTag};

/// Epoch returns considered by the classifier.
const RETURN_WINDOW: usize = 20;

/// Returns needed before any non-default classification.
const MIN_SAMPLES: usize = 6;

/// Per-epoch return stdev marking a volatile tape.
const VOLATILE_STDEV: f64 = 0.004;

/// Mean per-epoch return marking directional momentum.
const MOMENTUM_MEAN: f64 = 0.0008;

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`,
/// clamped to the output range.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    out_lo + t.clamp(0.0, 1.0) * (out_hi - out_lo)
}

/// Classify the regime from inter-epoch returns (oldest first). Returns the
/// tag plus a confidence in [0, 1].
pub fn detect_regime(returns: &[f64]) -> (RegimeTag, f64) {
    if returns.len() < MIN_SAMPLES {
        return (RegimeTag::Sideways, 0.2);
    }

    let start = returns.len().saturating_sub(RETURN_WINDOW);
    let window = &returns[start..];
    let (mean, variance) = mean_variance(window).expect("window is non-empty");
    let stdev = variance.sqrt();

    if stdev >= VOLATILE_STDEV {
        let confidence = remap(stdev, VOLATILE_STDEV, 0.01, 0.6, 1.0);
        return (RegimeTag::Volatile, confidence);
    }

    if mean >= MOMENTUM_MEAN {
        let confidence = remap(mean, MOMENTUM_MEAN, 0.004, 0.55, 1.0);
        return (RegimeTag::BullMomentum, confidence);
    }

    if mean <= -MOMENTUM_MEAN {
        let confidence = remap(-mean, MOMENTUM_MEAN, 0.004, 0.55, 1.0);
        return (RegimeTag::BearMomentum, confidence);
    }

    (RegimeTag::Sideways, 0.6)
}

pub struct RegimeAgent;

impl RegimeAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Agent for RegimeAgent {
    fn name(&self) -> &'static str {
        "regime"
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote> {
        // The engine stamps the snapshot with the freshly detected tag; the
        // vote just carries it into the trace. Confidence stays modest so a
        // lone regime vote cannot smother a thin committee.
        Ok(
            Vote::neutral(self.name(), 0.3, 0.5).with_details(serde_json::json!({
                "regime": snapshot.regime.to_string(),
            })),
        )
    }
}
