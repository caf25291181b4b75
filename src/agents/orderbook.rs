// =============================================================================
// Orderbook Agent — follows a moderate book lean
// =============================================================================
//
// The ask prices ARE the crowd's probability estimate. A side priced in the
// lean band [0.55, 0.70) gets a follow vote scaled by how pronounced the
// lean is. Prices at or past 0.70 are the contrarian agent's territory and
// this agent abstains there; a balanced book is Neutral.
//
// Vote quality shrinks with the combined spread (up + down − 1): a wide
// two-sided premium means a thin, unreliable book.
// =============================================================================

use anyhow::Result;

use crate::agents::{Agent, Vote};
use crate::types::{MarketSnapshot, VoteDirection};

/// Lower edge of the follow band.
const LEAN_LOW: f64 = 0.55;
/// Upper edge (exclusive) of the follow band.
const LEAN_HIGH: f64 = 0.70;

pub struct OrderbookAgent;

impl OrderbookAgent {
    pub fn new() -> Self {
        Self
    }

    fn lean_confidence(ask: f64) -> f64 {
        0.3 + 0.4 * ((ask - LEAN_LOW) / (LEAN_HIGH - LEAN_LOW)).clamp(0.0, 1.0)
    }
}

impl Agent for OrderbookAgent {
    fn name(&self) -> &'static str {
        "orderbook"
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote> {
        let up = snapshot.up_ask;
        let down = snapshot.down_ask;

        if !(0.0 < up && up < 1.0 && 0.0 < down && down < 1.0) {
            return Ok(Vote::skip(self.name()));
        }

        // Extremes belong to the contrarian fade, not a momentum follow.
        if up >= LEAN_HIGH || down >= LEAN_HIGH {
            return Ok(Vote::skip(self.name()));
        }

        let spread = (up + down - 1.0).max(0.0);
        let quality = (1.0 - 5.0 * spread).clamp(0.2, 1.0);

        let (direction, confidence) = if up >= LEAN_LOW && down < LEAN_LOW {
            (VoteDirection::Up, Self::lean_confidence(up))
        } else if down >= LEAN_LOW && up < LEAN_LOW {
            (VoteDirection::Down, Self::lean_confidence(down))
        } else {
            (VoteDirection::Neutral, 0.15)
        };

        Ok(Vote::new(self.name(), direction, confidence, quality)
            .with_details(serde_json::json!({
                "up_ask": up,
                "down_ask": down,
                "spread": spread,
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

    fn snap(up: f64, down: f64) -> MarketSnapshot {
        let mut s = snapshot_fixture(Crypto::Sol);
        s.up_ask = up;
        s.down_ask = down;
        s
    }

    #[test]
    fn moderate_up_lean_follows_up() {
        let vote = OrderbookAgent::new().analyze(&snap(0.62, 0.40)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Up);
        assert!(vote.confidence > 0.3 && vote.confidence < 0.7);
    }

    #[test]
    fn moderate_down_lean_follows_down() {
        let vote = OrderbookAgent::new().analyze(&snap(0.40, 0.62)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Down);
    }

    #[test]
    fn stronger_lean_means_more_confidence() {
        let mild = OrderbookAgent::new().analyze(&snap(0.56, 0.45)).unwrap();
        let firm = OrderbookAgent::new().analyze(&snap(0.68, 0.33)).unwrap();
        assert!(firm.confidence > mild.confidence);
    }

    #[test]
    fn extreme_prices_abstain() {
        let vote = OrderbookAgent::new().analyze(&snap(0.80, 0.15)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
        let vote = OrderbookAgent::new().analyze(&snap(0.12, 0.90)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
    }

    #[test]
    fn balanced_book_is_neutral() {
        let vote = OrderbookAgent::new().analyze(&snap(0.50, 0.52)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Neutral);
    }

    #[test]
    fn degenerate_prices_skip() {
        let vote = OrderbookAgent::new().analyze(&snap(0.0, 0.5)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
        let vote = OrderbookAgent::new().analyze(&snap(0.5, 1.0)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
    }

    #[test]
    fn wide_spread_lowers_quality() {
        let tight = OrderbookAgent::new().analyze(&snap(0.60, 0.41)).unwrap();
        let wide = OrderbookAgent::new().analyze(&snap(0.60, 0.52)).unwrap();
        assert!(tight.quality > wide.quality);
    }
}
