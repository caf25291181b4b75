// =============================================================================
// Funding Agent — contrarian read of perpetual funding extremes
// =============================================================================
//
// Funding rates anchor the perp to spot; extreme positive funding means
// overleveraged longs (fade to Down), extreme negative means a crowded short
// (squeeze to Up).
//
//   rate >= +0.05%  =>  Down, strong
//   rate >= +0.03%  =>  Down, mild
//   rate <= -0.05%  =>  Up,   strong
//   rate <= -0.03%  =>  Up,   mild
//   otherwise       =>  Neutral
//
// No funding datum on the snapshot means the poller is behind; abstain.
// =============================================================================

use anyhow::Result;

use crate::agents::{Agent, Vote};
use crate::types::{MarketSnapshot, VoteDirection};

pub struct FundingAgent;

impl FundingAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Agent for FundingAgent {
    fn name(&self) -> &'static str {
        "funding"
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote> {
        let Some(rate) = snapshot.funding_rate else {
            return Ok(Vote::skip(self.name()));
        };
        let rate_pct = rate * 100.0;

        let (direction, confidence) = if rate_pct >= 0.05 {
            (VoteDirection::Down, 0.80)
        } else if rate_pct >= 0.03 {
            (VoteDirection::Down, 0.50)
        } else if rate_pct <= -0.05 {
            (VoteDirection::Up, 0.85)
        } else if rate_pct <= -0.03 {
            (VoteDirection::Up, 0.55)
        } else {
            (VoteDirection::Neutral, 0.20)
        };

        Ok(Vote::new(self.name(), direction, confidence, 0.7)
            .with_details(serde_json::json!({ "rate_pct": rate_pct })))
    }
}
