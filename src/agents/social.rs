// =============================================================================
// Social Agent — operator-supplied sentiment file
// =============================================================================
//
// Reads a small JSON document maintained by an external pipeline:
//
//   { "updated_at": <unix seconds>, "scores": { "btc": 0.4, "eth": -0.6 } }
//
// Scores are in [-1, 1]. A missing file, a stale file (older than one
// epoch) or an absent score means abstain — social data is strictly
// opportunistic.
// =============================================================================

use std::path::PathBuf;

use anyhow::Result;

use crate::agents::{Agent, Vote};
use crate::types::{MarketSnapshot, VoteDirection, EPOCH_SECS};

/// Scores within this band are treated as no signal.
const NEUTRAL_BAND: f64 = 0.25;

pub struct SocialAgent {
    path: PathBuf,
}

impl SocialAgent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_score(&self, slug: &str, now_unix: i64) -> Option<f64> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let doc: serde_json::Value = serde_json::from_str(&content).ok()?;

        let updated_at = doc["updated_at"].as_i64()?;
        if now_unix - updated_at > EPOCH_SECS {
            return None;
        }

        doc["scores"][slug].as_f64()
    }
}

impl Agent for SocialAgent {
    fn name(&self) -> &'static str {
        "social"
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote> {
        let now = chrono::Utc::now().timestamp();
        let Some(score) = self.read_score(snapshot.crypto.slug(), now) else {
            return Ok(Vote::skip(self.name()));
        };
        let score = score.clamp(-1.0, 1.0);

        let (direction, confidence) = if score > NEUTRAL_BAND {
            (VoteDirection::Up, score.abs())
        } else if score < -NEUTRAL_BAND {
            (VoteDirection::Down, score.abs())
        } else {
            (VoteDirection::Neutral, 0.2)
        };

        Ok(Vote::new(self.name(), direction, confidence, 0.6)
            .with_details(serde_json::json!({ "score": score })))
    }
}
