// =============================================================================
// Technical Agent — cross-exchange momentum confluence
// =============================================================================
//
// Votes a direction only when at least 2 of 3 exchanges show same-sign
// short-horizon returns above the confluence threshold. Confidence blends:
//
//   exchange agreement  0.35
//   return magnitude    0.25
//   RSI(14) alignment   0.25   (Up discounted near overbought, Down near
//                               oversold)
//   entry-price value   0.15   (cheaper side preferred)
//
// If the last epochs resolved 3+ times in the same direction, a vote against
// that run has its confidence halved.
// =============================================================================

use anyhow::Result;

use crate::agents::{Agent, Vote};
use crate::indicators::window_return;
use crate::types::{MarketSnapshot, Side, VoteDirection};

/// Minimum same-sign return for an exchange to count as confluent.
const CONFLUENCE_THRESHOLD: f64 = 0.002;

/// Return magnitude that earns the full magnitude component.
const FULL_MAGNITUDE: f64 = 0.005;

/// Trailing same-direction outcomes that trigger the streak discount.
const STREAK_LEN: usize = 3;

pub struct TechnicalAgent;

impl TechnicalAgent {
    pub fn new() -> Self {
        Self
    }
}

/// Length of the trailing same-direction run in `outcomes`.
fn trailing_streak(outcomes: &[Side]) -> Option<(Side, usize)> {
    let last = *outcomes.last()?;
    let run = outcomes.iter().rev().take_while(|o| **o == last).count();
    Some((last, run))
}

impl Agent for TechnicalAgent {
    fn name(&self) -> &'static str {
        "technical"
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote> {
        // Per-exchange short-horizon returns.
        let returns: Vec<f64> = snapshot
            .exchange_mids
            .values()
            .filter_map(|mids| window_return(mids))
            .collect();

        // Confluence needs at least two live exchanges.
        if returns.len() < 2 {
            return Ok(Vote::skip(self.name()));
        }

        let ups = returns.iter().filter(|r| **r > CONFLUENCE_THRESHOLD).count();
        let downs = returns
            .iter()
            .filter(|r| **r < -CONFLUENCE_THRESHOLD)
            .count();

        let quality = (returns.len() as f64 / 3.0).min(1.0);

        let direction = if ups >= 2 && ups > downs {
            VoteDirection::Up
        } else if downs >= 2 && downs > ups {
            VoteDirection::Down
        } else {
            return Ok(Vote::neutral(self.name(), 0.2, quality));
        };

        let side = direction.side().expect("directional");
        let agreeing: Vec<f64> = returns
            .iter()
            .copied()
            .filter(|r| match side {
                Side::Up => *r > CONFLUENCE_THRESHOLD,
                Side::Down => *r < -CONFLUENCE_THRESHOLD,
            })
            .collect();

        let agreement = agreeing.len() as f64 / returns.len() as f64;
        let magnitude = (agreeing.iter().map(|r| r.abs()).sum::<f64>()
            / agreeing.len() as f64
            / FULL_MAGNITUDE)
            .min(1.0);

        // RSI alignment: an Up vote loses conviction approaching overbought,
        // a Down vote approaching oversold. Unknown RSI sits in the middle.
        let alignment = match snapshot.rsi_14 {
            Some(rsi) => match side {
                Side::Up => ((80.0 - rsi) / 40.0).clamp(0.0, 1.0),
                Side::Down => ((rsi - 20.0) / 40.0).clamp(0.0, 1.0),
            },
            None => 0.5,
        };

        let own_ask = match side {
            Side::Up => snapshot.up_ask,
            Side::Down => snapshot.down_ask,
        };
        let entry_value = (1.0 - own_ask).clamp(0.0, 1.0);

        let mut confidence =
            0.35 * agreement + 0.25 * magnitude + 0.25 * alignment + 0.15 * entry_value;

        // Streak discount: fighting an established run costs half the
        // conviction.
        let mut against_streak = false;
        if let Some((streak_side, run)) = trailing_streak(&snapshot.last_outcomes) {
            if run >= STREAK_LEN && streak_side != side {
                confidence /= 2.0;
                against_streak = true;
            }
        }

        Ok(Vote::new(self.name(), direction, confidence, quality)
            .with_details(serde_json::json!({
                "exchanges": returns.len(),
                "agreement": agreement,
                "magnitude": magnitude,
                "rsi_alignment": alignment,
                "entry_value": entry_value,
                "against_streak": against_streak,
            })))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::snapshot_fixture;
    use crate::types::Crypto;

    fn with_mids(returns_pct: &[(&str, f64)]) -> MarketSnapshot {
        let mut snap = snapshot_fixture(Crypto::Btc);
        for (exchange, pct) in returns_pct {
            let start = 95_000.0;
            let end = start * (1.0 + pct / 100.0);
            snap.exchange_mids
                .insert(exchange.to_string(), vec![start, end]);
        }
        snap
    }

    #[test]
    fn single_exchange_skips() {
        let mut agent = TechnicalAgent::new();
        let snap = with_mids(&[("binance", 0.5)]);
        let vote = agent.analyze(&snap).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
    }

    #[test]
    fn no_exchange_data_skips() {
        let mut agent = TechnicalAgent::new();
        let snap = snapshot_fixture(Crypto::Btc);
        let vote = agent.analyze(&snap).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
    }

    #[test]
    fn three_exchange_confluence_votes_up_near_0_7() {
        // Scenario S1: all three exchanges +0.25%, RSI 55, up ask 0.42.
        let mut agent = TechnicalAgent::new();
        let snap = with_mids(&[("binance", 0.25), ("kraken", 0.25), ("coinbase", 0.25)]);
        let vote = agent.analyze(&snap).unwrap();
        assert_eq!(vote.direction, VoteDirection::Up);
        assert!(
            (vote.confidence - 0.70).abs() < 0.05,
            "confidence {} not near 0.70",
            vote.confidence
        );
        assert!((vote.quality - 1.0).abs() < 1e-9);
    }

    #[test]
    fn downward_confluence_votes_down() {
        let mut agent = TechnicalAgent::new();
        let snap = with_mids(&[("binance", -0.4), ("kraken", -0.3), ("coinbase", 0.1)]);
        let vote = agent.analyze(&snap).unwrap();
        assert_eq!(vote.direction, VoteDirection::Down);
        assert!(vote.confidence > 0.3);
    }

    #[test]
    fn mixed_returns_are_neutral() {
        let mut agent = TechnicalAgent::new();
        let snap = with_mids(&[("binance", 0.5), ("kraken", -0.5), ("coinbase", 0.05)]);
        let vote = agent.analyze(&snap).unwrap();
        assert_eq!(vote.direction, VoteDirection::Neutral);
    }

    #[test]
    fn sub_threshold_returns_are_neutral() {
        let mut agent = TechnicalAgent::new();
        let snap = with_mids(&[("binance", 0.1), ("kraken", 0.1), ("coinbase", 0.1)]);
        let vote = agent.analyze(&snap).unwrap();
        assert_eq!(vote.direction, VoteDirection::Neutral);
    }

    #[test]
    fn overbought_rsi_discounts_up_vote() {
        let mut agent = TechnicalAgent::new();
        let mut cool = with_mids(&[("binance", 0.3), ("kraken", 0.3)]);
        cool.rsi_14 = Some(50.0);
        let mut hot = with_mids(&[("binance", 0.3), ("kraken", 0.3)]);
        hot.rsi_14 = Some(85.0);

        let cool_vote = agent.analyze(&cool).unwrap();
        let hot_vote = agent.analyze(&hot).unwrap();
        assert!(cool_vote.confidence > hot_vote.confidence);
    }

    #[test]
    fn streak_halves_contradicting_vote() {
        let mut agent = TechnicalAgent::new();
        let mut snap = with_mids(&[("binance", -0.4), ("kraken", -0.35), ("coinbase", -0.3)]);
        let baseline = agent.analyze(&snap).unwrap();

        snap.last_outcomes = vec![Side::Up, Side::Up, Side::Up];
        let discounted = agent.analyze(&snap).unwrap();
        assert_eq!(discounted.direction, VoteDirection::Down);
        assert!((discounted.confidence - baseline.confidence / 2.0).abs() < 1e-9);

        // A vote WITH the streak is untouched.
        let mut snap_up = with_mids(&[("binance", 0.4), ("kraken", 0.35)]);
        snap_up.last_outcomes = vec![Side::Up, Side::Up, Side::Up];
        let with_streak = agent.analyze(&snap_up).unwrap();
        let details = with_streak.details.unwrap();
        assert_eq!(details["against_streak"], serde_json::json!(false));
    }

    #[test]
    fn short_streak_does_not_discount() {
        let mut agent = TechnicalAgent::new();
        let mut snap = with_mids(&[("binance", -0.4), ("kraken", -0.35)]);
        snap.last_outcomes = vec![Side::Down, Side::Up, Side::Up];
        let vote = agent.analyze(&snap).unwrap();
        let details = vote.details.unwrap();
        assert_eq!(details["against_streak"], serde_json::json!(false));
    }

    #[test]
    fn trailing_streak_helper() {
        assert_eq!(trailing_streak(&[]), None);
        assert_eq!(
            trailing_streak(&[Side::Up, Side::Down, Side::Down]),
            Some((Side::Down, 2))
        );
        assert_eq!(
            trailing_streak(&[Side::Up, Side::Up, Side::Up]),
            Some((Side::Up, 3))
        );
    }
}
