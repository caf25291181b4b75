// =============================================================================
// ML Agent — black-box P(Up) predictor behind the Analyze contract
// =============================================================================
//
// Inference is a logistic model over two snapshot features (short-horizon
// return on the primary exchange and centred RSI). Coefficients come from a
// JSON file produced by the offline training pipeline:
//
//   { "bias": 0.1, "w_return": 0.8, "w_rsi": -0.3, "quality": 0.7 }
//
// Without a coefficient file the agent degrades to P(Up) = 0.5, whose
// confidence |p − 0.5| × 2 is zero — a Skip-equivalent vote.
// =============================================================================

use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

use crate::agents::{Agent, Vote};
use crate::feed::PRIMARY_EXCHANGE;
use crate::indicators::window_return;
use crate::types::{MarketSnapshot, VoteDirection};

#[derive(Debug, Clone, Deserialize)]
pub struct ModelCoefficients {
    #[serde(default)]
    pub bias: f64,
    #[serde(default)]
    pub w_return: f64,
    #[serde(default)]
    pub w_rsi: f64,
    /// Model-reported quality, forwarded as the vote's quality.
    #[serde(default = "default_quality")]
    pub quality: f64,
}

fn default_quality() -> f64 {
    0.5
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub struct MlAgent {
    coefficients: Option<ModelCoefficients>,
}

impl MlAgent {
    pub fn new(coefficients: Option<ModelCoefficients>) -> Self {
        Self { coefficients }
    }

    /// Load coefficients from disk; a missing or unreadable file leaves the
    /// agent in its 0.5-stub mode.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let coefficients = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<ModelCoefficients>(&content) {
                Ok(c) => {
                    info!(path = %path.display(), "model coefficients loaded");
                    Some(c)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "bad model file — running as 0.5 stub");
                    None
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no model file — running as 0.5 stub");
                None
            }
        };
        Self { coefficients }
    }

    /// P(Up) for a snapshot, if the features are available.
    fn predict(&self, snapshot: &MarketSnapshot) -> Option<f64> {
        let Some(coeff) = &self.coefficients else {
            return Some(0.5);
        };

        let mids = snapshot.exchange_mids.get(PRIMARY_EXCHANGE)?;
        let short_return_pct = window_return(mids)? * 100.0;
        let rsi_centred = (snapshot.rsi_14? - 50.0) / 50.0;

        let logit = coeff.bias + coeff.w_return * short_return_pct + coeff.w_rsi * rsi_centred;
        Some(sigmoid(logit))
    }
}

impl Agent for MlAgent {
    fn name(&self) -> &'static str {
        "ml"
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote> {
        let Some(p_up) = self.predict(snapshot) else {
            return Ok(Vote::skip(self.name()));
        };

        let direction = if p_up >= 0.5 {
            VoteDirection::Up
        } else {
            VoteDirection::Down
        };
        let confidence = (p_up - 0.5).abs() * 2.0;
        let quality = self
            .coefficients
            .as_ref()
            .map(|c| c.quality)
            .unwrap_or(0.5);

        Ok(Vote::new(self.name(), direction, confidence, quality)
            .with_details(serde_json::json!({ "p_up": p_up })))
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

    fn snap_with_features(return_pct: f64, rsi: f64) -> MarketSnapshot {
        let mut s = snapshot_fixture(Crypto::Btc);
        let start = 95_000.0;
        s.exchange_mids.insert(
            PRIMARY_EXCHANGE.to_string(),
            vec![start, start * (1.0 + return_pct / 100.0)],
        );
        s.rsi_14 = Some(rsi);
        s
    }

    #[test]
    fn stub_without_model_is_zero_confidence() {
        let mut agent = MlAgent::new(None);
        let vote = agent.analyze(&snapshot_fixture(Crypto::Btc)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Up);
        assert!(vote.confidence.abs() < 1e-12);
        assert_eq!(vote.details.unwrap()["p_up"], serde_json::json!(0.5));
    }

    #[test]
    fn missing_file_falls_back_to_stub() {
        let mut agent = MlAgent::from_file("/nonexistent/model.json");
        let vote = agent.analyze(&snapshot_fixture(Crypto::Btc)).unwrap();
        assert!(vote.confidence.abs() < 1e-12);
    }

    #[test]
    fn positive_return_predicts_up() {
        let mut agent = MlAgent::new(Some(ModelCoefficients {
            bias: 0.0,
            w_return: 2.0,
            w_rsi: 0.0,
            quality: 0.7,
        }));
        let vote = agent.analyze(&snap_with_features(0.5, 50.0)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Up);
        assert!(vote.confidence > 0.0);
        assert!((vote.quality - 0.7).abs() < 1e-12);
    }

    #[test]
    fn negative_return_predicts_down() {
        let mut agent = MlAgent::new(Some(ModelCoefficients {
            bias: 0.0,
            w_return: 2.0,
            w_rsi: 0.0,
            quality: 0.7,
        }));
        let vote = agent.analyze(&snap_with_features(-0.5, 50.0)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Down);
    }

    #[test]
    fn model_without_features_skips() {
        let mut agent = MlAgent::new(Some(ModelCoefficients {
            bias: 0.2,
            w_return: 1.0,
            w_rsi: 1.0,
            quality: 0.6,
        }));
        // No mids, no RSI.
        let vote = agent.analyze(&snapshot_fixture(Crypto::Btc)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
    }

    #[test]
    fn loads_coefficients_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_coefficients.json");
        std::fs::write(
            &path,
            r#"{ "bias": 0.0, "w_return": 3.0, "w_rsi": 0.0, "quality": 0.8 }"#,
        )
        .unwrap();

        let mut agent = MlAgent::from_file(&path);
        let vote = agent.analyze(&snap_with_features(1.0, 55.0)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Up);
        assert!(vote.confidence > 0.5);
        assert!((vote.quality - 0.8).abs() < 1e-12);
    }

    #[test]
    fn corrupt_file_falls_back_to_stub() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_coefficients.json");
        std::fs::write(&path, "not json").unwrap();

        let mut agent = MlAgent::from_file(&path);
        let vote = agent.analyze(&snap_with_features(1.0, 55.0)).unwrap();
        assert!(vote.confidence.abs() < 1e-12);
    }

    #[test]
    fn sigmoid_sanity() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }
}
