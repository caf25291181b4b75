// =============================================================================
// Sentiment Agent — contrarian fade of crowd extremes
// =============================================================================
//
// When one side of the book is priced rich (>= 0.70 by default) and the other
// cheap (<= 0.20), the crowd is extended: vote the cheap side with high
// confidence. Anywhere between the bounds the agent stays Neutral.
//
// Confidence combines how far past the rich threshold the crowd has pushed
// and how cheap the contrarian entry is. Both thresholds are configuration,
// not contract — retuning is expected.
// =============================================================================

use anyhow::Result;

use crate::agents::{Agent, Vote};
use crate::types::{MarketSnapshot, VoteDirection};

pub struct SentimentAgent {
    rich: f64,
    cheap: f64,
}

impl SentimentAgent {
    pub fn new(rich: f64, cheap: f64) -> Self {
        Self { rich, cheap }
    }

    fn extreme_confidence(&self, rich_ask: f64, cheap_ask: f64) -> f64 {
        // How far past the rich threshold the crowd side trades.
        let extremity = ((rich_ask - self.rich) / (1.0 - self.rich)).clamp(0.0, 1.0);
        // How cheap the contrarian entry is relative to the cheap bound.
        let cheap_bonus = ((self.cheap - cheap_ask) / self.cheap).clamp(0.0, 1.0);
        0.6 + 0.4 * (0.5 * extremity + 0.5 * cheap_bonus)
    }
}

impl Agent for SentimentAgent {
    fn name(&self) -> &'static str {
        "sentiment"
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote> {
        let up = snapshot.up_ask;
        let down = snapshot.down_ask;

        if !(up.is_finite() && down.is_finite()) {
            return Ok(Vote::skip(self.name()));
        }

        let (direction, confidence) = if up >= self.rich && down <= self.cheap {
            (VoteDirection::Down, self.extreme_confidence(up, down))
        } else if down >= self.rich && up <= self.cheap {
            (VoteDirection::Up, self.extreme_confidence(down, up))
        } else {
            return Ok(Vote::neutral(self.name(), 0.25, 0.6).with_details(serde_json::json!({
                "rich": self.rich,
                "cheap": self.cheap,
            })));
        };

        Ok(Vote::new(self.name(), direction, confidence, 0.8)
            .with_details(serde_json::json!({
                "up_ask": up,
                "down_ask": down,
                "rich": self.rich,
                "cheap": self.cheap,
            })))
    }
}
