// =============================================================================
// Time-of-Day Agent — hour-bucket outcome patterns
// =============================================================================
//
// Keeps a bounded private history of resolved epoch directions per
// (crypto, UTC hour). Once a bucket holds enough samples, a pronounced skew
// (>= 65% one way) becomes a low-weight directional vote for epochs falling
// in that hour. Sparse buckets abstain.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use chrono::Timelike;

use crate::agents::{Agent, Vote};
use crate::types::{epoch_start, Crypto, Epoch, MarketSnapshot, Side, VoteDirection};

/// Outcomes retained per (crypto, hour) bucket.
const BUCKET_CAP: usize = 40;
/// Samples required before the bucket may vote.
const MIN_SAMPLES: usize = 20;
/// Win-rate skew required for a directional vote.
const SKEW_THRESHOLD: f64 = 0.65;

fn hour_of_epoch(epoch: Epoch) -> u32 {
    chrono::DateTime::from_timestamp(epoch_start(epoch), 0)
        .map(|dt| dt.hour())
        .unwrap_or(0)
}

pub struct TimeOfDayAgent {
    buckets: HashMap<(Crypto, u32), VecDeque<Side>>,
}

impl TimeOfDayAgent {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }
}

impl Agent for TimeOfDayAgent {
    fn name(&self) -> &'static str {
        "timeofday"
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote> {
        let hour = hour_of_epoch(snapshot.epoch);
        let Some(bucket) = self.buckets.get(&(snapshot.crypto, hour)) else {
            return Ok(Vote::skip(self.name()));
        };
        if bucket.len() < MIN_SAMPLES {
            return Ok(Vote::skip(self.name()));
        }

        let ups = bucket.iter().filter(|s| **s == Side::Up).count();
        let up_rate = ups as f64 / bucket.len() as f64;
        let quality = (bucket.len() as f64 / BUCKET_CAP as f64).min(1.0);

        let (direction, confidence) = if up_rate >= SKEW_THRESHOLD {
            (VoteDirection::Up, ((up_rate - 0.5) * 2.0).min(1.0))
        } else if up_rate <= 1.0 - SKEW_THRESHOLD {
            (VoteDirection::Down, ((0.5 - up_rate) * 2.0).min(1.0))
        } else {
            (VoteDirection::Neutral, 0.15)
        };

        Ok(Vote::new(self.name(), direction, confidence, quality)
            .with_details(serde_json::json!({
                "hour": hour,
                "samples": bucket.len(),
                "up_rate": up_rate,
            })))
    }

    fn observe_outcome(&mut self, crypto: Crypto, epoch: Epoch, outcome: Side) {
        let hour = hour_of_epoch(epoch);
        let bucket = self.buckets.entry((crypto, hour)).or_default();
        bucket.push_back(outcome);
        while bucket.len() > BUCKET_CAP {
            bucket.pop_front();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::snapshot_fixture;

    // 2024-01-01T00:00:00Z — hour 0.
    const BASE_EPOCH: Epoch = 1_704_067_200 / 900;

    fn seeded_agent(crypto: Crypto, ups: usize, downs: usize) -> TimeOfDayAgent {
        let mut agent = TimeOfDayAgent::new();
        for i in 0..ups {
            agent.observe_outcome(crypto, BASE_EPOCH + i as i64 * 96, Side::Up);
        }
        for i in 0..downs {
            agent.observe_outcome(crypto, BASE_EPOCH + (ups + i) as i64 * 96, Side::Down);
        }
        agent
    }

    fn snap_at(crypto: Crypto, epoch: Epoch) -> MarketSnapshot {
        let mut s = snapshot_fixture(crypto);
        s.epoch = epoch;
        s
    }

    #[test]
    fn hour_derivation() {
        assert_eq!(hour_of_epoch(BASE_EPOCH), 0);
        // +4 epochs = +1 hour.
        assert_eq!(hour_of_epoch(BASE_EPOCH + 4), 1);
    }

    #[test]
    fn empty_history_skips() {
        let mut agent = TimeOfDayAgent::new();
        let vote = agent.analyze(&snap_at(Crypto::Btc, BASE_EPOCH)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
    }

    #[test]
    fn sparse_bucket_skips() {
        // 96 epochs apart keeps everything in hour 0, but only 10 samples.
        let mut agent = seeded_agent(Crypto::Btc, 10, 0);
        let vote = agent.analyze(&snap_at(Crypto::Btc, BASE_EPOCH)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
    }

    #[test]
    fn skewed_bucket_votes_up() {
        let mut agent = seeded_agent(Crypto::Btc, 16, 4); // 80% up over 20
        let vote = agent.analyze(&snap_at(Crypto::Btc, BASE_EPOCH)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Up);
        assert!((vote.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn skewed_bucket_votes_down() {
        let mut agent = seeded_agent(Crypto::Eth, 4, 16);
        let vote = agent.analyze(&snap_at(Crypto::Eth, BASE_EPOCH)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Down);
    }

    #[test]
    fn balanced_bucket_is_neutral() {
        let mut agent = seeded_agent(Crypto::Btc, 10, 10);
        let vote = agent.analyze(&snap_at(Crypto::Btc, BASE_EPOCH)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Neutral);
    }

    #[test]
    fn other_hours_unaffected() {
        let mut agent = seeded_agent(Crypto::Btc, 20, 0);
        // One hour later there is no history.
        let vote = agent.analyze(&snap_at(Crypto::Btc, BASE_EPOCH + 4)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
    }

    #[test]
    fn buckets_are_bounded_and_recent_biased() {
        let mut agent = seeded_agent(Crypto::Btc, BUCKET_CAP, BUCKET_CAP);
        // The first CAP ups were evicted by the later downs.
        let vote = agent.analyze(&snap_at(Crypto::Btc, BASE_EPOCH)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Down);
        let bucket = agent.buckets.get(&(Crypto::Btc, 0)).unwrap();
        assert_eq!(bucket.len(), BUCKET_CAP);
    }

    #[test]
    fn cryptos_have_separate_buckets() {
        let mut agent = seeded_agent(Crypto::Btc, 20, 0);
        let vote = agent.analyze(&snap_at(Crypto::Eth, BASE_EPOCH)).unwrap();
        assert_eq!(vote.direction, VoteDirection::Skip);
    }
}
