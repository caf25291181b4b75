// =============================================================================
// Agent Committee — independent signal producers behind one contract
// =============================================================================
//
// Every agent implements `analyze(snapshot) -> Vote`. Agents never reference
// one another and share only the immutable snapshot; private bounded history
// is allowed (fed through `observe_outcome`).
//
// Agents are constructed from an explicit registry (`name -> factory`), never
// via runtime introspection. Adding an agent is one registry entry plus a
// type implementing [`Agent`].
//
// Committee error policy: an agent error drops its vote for the cycle (the
// cycle continues with the rest); two consecutive errors mark the agent
// degraded for a cool-down window.
// =============================================================================

pub mod candlestick;
pub mod funding;
pub mod guardian;
pub mod ml;
pub mod orderbook;
pub mod regime;
pub mod sentiment;
pub mod social;
pub mod technical;
pub mod timeofday;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::state::StateStore;
use crate::types::{Crypto, Epoch, MarketSnapshot, Side, VoteDirection};

/// Degraded agents sit out this many seconds after two consecutive errors.
const DEGRADED_COOLDOWN_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Vote
// ---------------------------------------------------------------------------

/// One agent's opinion on a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub agent: String,
    pub direction: VoteDirection,
    /// Strength of the opinion, in [0, 1].
    pub confidence: f64,
    /// Quality of the data behind the opinion, in [0, 1].
    pub quality: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Vote {
    pub fn new(
        agent: impl Into<String>,
        direction: VoteDirection,
        confidence: f64,
        quality: f64,
    ) -> Self {
        Self {
            agent: agent.into(),
            direction,
            confidence: confidence.clamp(0.0, 1.0),
            quality: quality.clamp(0.0, 1.0),
            details: None,
        }
    }

    pub fn skip(agent: impl Into<String>) -> Self {
        Self::new(agent, VoteDirection::Skip, 0.0, 0.0)
    }

    pub fn neutral(agent: impl Into<String>, confidence: f64, quality: f64) -> Self {
        Self::new(agent, VoteDirection::Neutral, confidence, quality)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ---------------------------------------------------------------------------
// Agent contract
// ---------------------------------------------------------------------------

/// Broad behavioural class of an agent, used by the aggregator's regime
/// weight modulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStyle {
    Momentum,
    Contrarian,
    Neutral,
}

pub trait Agent: Send {
    fn name(&self) -> &'static str;

    /// Produce a vote for the snapshot. Errors drop the vote for this cycle.
    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote>;

    /// Hook for agents that keep bounded private outcome history.
    fn observe_outcome(&mut self, _crypto: Crypto, _epoch: Epoch, _outcome: Side) {}
}

/// Behavioural class of a registered agent by name. Unknown names are
/// treated as Neutral so they never receive regime boosts.
pub fn style_of(agent: &str) -> AgentStyle {
    match agent {
        "technical" | "orderbook" | "candlestick" | "timeofday" | "social" | "ml" => {
            AgentStyle::Momentum
        }
        "sentiment" | "funding" => AgentStyle::Contrarian,
        _ => AgentStyle::Neutral,
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type AgentFactory = fn(&EngineConfig, &Arc<StateStore>) -> Box<dyn Agent>;

/// The explicit agent registry. Order here is irrelevant; votes are sorted
/// by agent name before aggregation.
pub fn registry() -> Vec<(&'static str, AgentFactory)> {
    vec![
        ("technical", |_, _| Box::new(technical::TechnicalAgent::new())),
        ("sentiment", |cfg, _| {
            Box::new(sentiment::SentimentAgent::new(
                cfg.sentiment_rich,
                cfg.sentiment_cheap,
            ))
        }),
        ("regime", |_, _| Box::new(regime::RegimeAgent::new())),
        ("guardian", |cfg, store| {
            Box::new(guardian::GuardianAgent::new(cfg.clone(), store.clone()))
        }),
        ("orderbook", |_, _| Box::new(orderbook::OrderbookAgent::new())),
        ("funding", |_, _| Box::new(funding::FundingAgent::new())),
        ("social", |cfg, _| {
            Box::new(social::SocialAgent::new(cfg.social_sentiment_path.clone()))
        }),
        ("candlestick", |_, _| {
            Box::new(candlestick::CandlestickAgent::new())
        }),
        ("timeofday", |_, _| Box::new(timeofday::TimeOfDayAgent::new())),
        ("ml", |cfg, _| Box::new(ml::MlAgent::from_file(&cfg.model_path))),
    ]
}

// ---------------------------------------------------------------------------
// Committee
// ---------------------------------------------------------------------------

struct AgentSlot {
    agent: Box<dyn Agent>,
    consecutive_errors: u32,
    degraded_until_unix: i64,
}

/// The assembled committee: enabled agents plus per-agent health tracking.
pub struct Committee {
    slots: Vec<AgentSlot>,
}

impl Committee {
    /// Build the committee from the registry, honouring `agents_enabled`.
    pub fn build(config: &EngineConfig, store: &Arc<StateStore>) -> Self {
        let mut slots = Vec::new();
        for (name, factory) in registry() {
            if !config.agent_enabled(name) {
                debug!(agent = name, "agent disabled by config");
                continue;
            }
            slots.push(AgentSlot {
                agent: factory(config, store),
                consecutive_errors: 0,
                degraded_until_unix: 0,
            });
        }
        slots
            .iter()
            .for_each(|s| debug!(agent = s.agent.name(), "agent registered"));
        Self { slots }
    }

    pub fn agent_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.agent.name()).collect()
    }

    /// Run every healthy agent against the snapshot and return the votes in
    /// deterministic (agent-name) order. All agents finish before the caller
    /// aggregates; partial committees only arise from errors or degradation.
    pub fn run(&mut self, snapshot: &MarketSnapshot, now_unix: i64) -> Vec<Vote> {
        let mut votes = Vec::with_capacity(self.slots.len());

        for slot in &mut self.slots {
            let name = slot.agent.name();
            if now_unix < slot.degraded_until_unix {
                debug!(agent = name, "agent degraded — sitting out");
                continue;
            }

            match slot.agent.analyze(snapshot) {
                Ok(vote) => {
                    slot.consecutive_errors = 0;
                    votes.push(vote);
                }
                Err(e) => {
                    slot.consecutive_errors += 1;
                    warn!(
                        agent = name,
                        crypto = %snapshot.crypto,
                        consecutive_errors = slot.consecutive_errors,
                        error = %e,
                        "agent error — vote dropped"
                    );
                    if slot.consecutive_errors >= 2 {
                        slot.degraded_until_unix = now_unix + DEGRADED_COOLDOWN_SECS;
                        warn!(
                            agent = name,
                            cooldown_secs = DEGRADED_COOLDOWN_SECS,
                            "agent marked degraded"
                        );
                    }
                }
            }
        }

        votes.sort_by(|a, b| a.agent.cmp(&b.agent));
        votes
    }

    /// Fan a resolved outcome out to agents with private history.
    pub fn observe_outcome(&mut self, crypto: Crypto, epoch: Epoch, outcome: Side) {
        for slot in &mut self.slots {
            slot.agent.observe_outcome(crypto, epoch, outcome);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::types::{RegimeTag, TradeMode};

    pub(crate) fn snapshot_fixture(crypto: Crypto) -> MarketSnapshot {
        MarketSnapshot {
            crypto,
            epoch: 1_893_408,
            secs_into_epoch: 120,
            up_ask: 0.42,
            down_ask: 0.58,
            up_token: "tok-up".into(),
            down_token: "tok-down".into(),
            balance: 200.0,
            open_positions: Vec::new(),
            rsi_14: Some(55.0),
            exchange_mids: HashMap::new(),
            last_outcomes: Vec::new(),
            regime: RegimeTag::Sideways,
            mode: TradeMode::Normal,
            funding_rate: None,
        }
    }

    struct FlakyAgent {
        fail: bool,
    }

    impl Agent for FlakyAgent {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn analyze(&mut self, _snapshot: &MarketSnapshot) -> Result<Vote> {
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(Vote::new("flaky", VoteDirection::Up, 0.5, 0.5))
        }
    }

    struct SteadyAgent;

    impl Agent for SteadyAgent {
        fn name(&self) -> &'static str {
            "steady"
        }
        fn analyze(&mut self, _snapshot: &MarketSnapshot) -> Result<Vote> {
            Ok(Vote::new("steady", VoteDirection::Down, 0.6, 0.9))
        }
    }

    fn committee_of(agents: Vec<Box<dyn Agent>>) -> Committee {
        Committee {
            slots: agents
                .into_iter()
                .map(|agent| AgentSlot {
                    agent,
                    consecutive_errors: 0,
                    degraded_until_unix: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn vote_clamps_confidence_and_quality() {
        let v = Vote::new("x", VoteDirection::Up, 1.7, -0.2);
        assert!((v.confidence - 1.0).abs() < f64::EPSILON);
        assert!(v.quality.abs() < f64::EPSILON);
    }

    #[test]
    fn registry_names_are_unique() {
        let names: Vec<&str> = registry().iter().map(|(n, _)| *n).collect();
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
    }

    #[test]
    fn styles_cover_the_committee() {
        assert_eq!(style_of("technical"), AgentStyle::Momentum);
        assert_eq!(style_of("sentiment"), AgentStyle::Contrarian);
        assert_eq!(style_of("funding"), AgentStyle::Contrarian);
        assert_eq!(style_of("regime"), AgentStyle::Neutral);
        assert_eq!(style_of("guardian"), AgentStyle::Neutral);
        assert_eq!(style_of("unknown"), AgentStyle::Neutral);
    }

    #[test]
    fn erroring_agent_drops_vote_but_cycle_continues() {
        let mut committee = committee_of(vec![
            Box::new(FlakyAgent { fail: true }),
            Box::new(SteadyAgent),
        ]);
        let snap = snapshot_fixture(Crypto::Btc);

        let votes = committee.run(&snap, 1_000);
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].agent, "steady");
    }

    #[test]
    fn two_consecutive_errors_degrade_agent() {
        let mut committee = committee_of(vec![Box::new(FlakyAgent { fail: true })]);
        let snap = snapshot_fixture(Crypto::Btc);

        committee.run(&snap, 1_000);
        committee.run(&snap, 1_001);
        assert_eq!(committee.slots[0].consecutive_errors, 2);
        assert!(committee.slots[0].degraded_until_unix > 1_001);

        // While degraded the agent is not invoked at all.
        committee.slots[0].agent = Box::new(FlakyAgent { fail: false });
        let votes = committee.run(&snap, 1_002);
        assert!(votes.is_empty());

        // After the cool-down it participates again.
        let votes = committee.run(&snap, 1_001 + DEGRADED_COOLDOWN_SECS + 1);
        assert_eq!(votes.len(), 1);
    }

    #[test]
    fn votes_sorted_by_agent_name() {
        let mut committee = committee_of(vec![
            Box::new(SteadyAgent),
            Box::new(FlakyAgent { fail: false }),
        ]);
        let snap = snapshot_fixture(Crypto::Eth);
        let votes = committee.run(&snap, 1_000);
        assert_eq!(votes.len(), 2);
        assert_eq!(votes[0].agent, "flaky");
        assert_eq!(votes[1].agent, "steady");
    }
}
