// =============================================================================
// Aggregator — weighted consensus over the committee's votes
// =============================================================================
//
// Effective weight per vote:
//
//   w = base_weight × regime_multiplier × adaptive_multiplier, capped at 2.0
//
// Regime multipliers: bull/bear boost momentum agents 1.3 and demote
// contrarians 0.7; sideways demotes momentum 0.9 and boosts contrarians 1.4;
// volatile demotes both 0.8. Neutral-style agents are never modulated.
//
// Adaptive multiplier: clamp(0.5, 1.5, 0.5 + 2.5·(accuracy − 0.5)) over each
// agent's last 50 resolved outcomes, 1.0 until 20 outcomes exist.
//
// Direction scores are S_d = Σ confidence·quality·w over votes with
// direction d. The winner trades only when its normalised score clears the
// consensus threshold AND its best vote clears the confidence floor AND the
// agreement fraction clears the agreement floor — the last one plugs the
// "one dominant agent" failure mode.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::debug;

use crate::agents::{style_of, AgentStyle, Vote};
use crate::config::{EngineConfig, ShadowStrategyConfig};
use crate::types::{RegimeTag, Side, VoteDirection};

/// Hard ceiling on any effective vote weight.
const WEIGHT_CAP: f64 = 2.0;

/// Rolling window of resolved outcomes per agent.
const ACCURACY_WINDOW: usize = 50;

/// Outcomes required before the adaptive multiplier leaves 1.0.
const ACCURACY_MIN_SAMPLES: usize = 20;

// ---------------------------------------------------------------------------
// Adaptive accuracy tracking
// ---------------------------------------------------------------------------

/// Per-agent rolling record of directional-vote correctness.
#[derive(Debug, Default)]
pub struct AccuracyBook {
    windows: HashMap<String, VecDeque<bool>>,
}

impl AccuracyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whether `agent`'s directional vote matched the resolved
    /// outcome.
    pub fn record(&mut self, agent: &str, correct: bool) {
        let window = self.windows.entry(agent.to_string()).or_default();
        window.push_back(correct);
        while window.len() > ACCURACY_WINDOW {
            window.pop_front();
        }
    }

    pub fn accuracy(&self, agent: &str) -> Option<f64> {
        let window = self.windows.get(agent)?;
        if window.is_empty() {
            return None;
        }
        let hits = window.iter().filter(|c| **c).count();
        Some(hits as f64 / window.len() as f64)
    }

    /// Adaptive weight multiplier for an agent.
    pub fn multiplier(&self, agent: &str) -> f64 {
        let Some(window) = self.windows.get(agent) else {
            return 1.0;
        };
        if window.len() < ACCURACY_MIN_SAMPLES {
            return 1.0;
        }
        let accuracy = self.accuracy(agent).unwrap_or(0.5);
        (0.5 + 2.5 * (accuracy - 0.5)).clamp(0.5, 1.5)
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Threshold/weight bundle for one aggregation pass. Production uses the
/// engine config directly; shadow strategies overlay their overrides.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub consensus_threshold: f64,
    pub min_confidence: f64,
    pub min_agreement: f64,
    pub agent_weights: HashMap<String, f64>,
    pub agents_enabled: Option<HashSet<String>>,
    /// Production honours guardian vetoes; shadow books trade virtually and
    /// ignore production-account vetoes.
    pub honor_vetoes: bool,
}

impl AggregatorSettings {
    pub fn production(config: &EngineConfig) -> Self {
        Self {
            consensus_threshold: config.consensus_threshold,
            min_confidence: config.min_confidence,
            min_agreement: config.min_agreement,
            agent_weights: config.agent_weights.clone(),
            agents_enabled: config.agents_enabled.clone(),
            honor_vetoes: true,
        }
    }

    pub fn shadow(config: &EngineConfig, strategy: &ShadowStrategyConfig) -> Self {
        Self {
            consensus_threshold: strategy
                .consensus_threshold
                .unwrap_or(config.consensus_threshold),
            min_confidence: strategy.min_confidence.unwrap_or(config.min_confidence),
            min_agreement: strategy.min_agreement.unwrap_or(config.min_agreement),
            agent_weights: strategy
                .agent_weights
                .clone()
                .unwrap_or_else(|| config.agent_weights.clone()),
            agents_enabled: strategy
                .agents_enabled
                .clone()
                .or_else(|| config.agents_enabled.clone()),
            honor_vetoes: false,
        }
    }

    fn base_weight(&self, agent: &str) -> f64 {
        self.agent_weights.get(agent).copied().unwrap_or(1.0)
    }

    fn includes(&self, agent: &str) -> bool {
        match &self.agents_enabled {
            Some(set) => set.contains(agent),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Weighted contribution of one vote, kept for the audit trace.
#[derive(Debug, Clone, Serialize)]
pub struct VoteTrace {
    pub agent: String,
    pub direction: VoteDirection,
    pub confidence: f64,
    pub quality: f64,
    pub effective_weight: f64,
    pub contribution: f64,
}

/// The aggregator's verdict for one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateDecision {
    pub direction: Option<Side>,
    /// Normalised winning score in [0, 1].
    pub score: f64,
    /// Fraction of non-Skip voters backing the winner.
    pub agreement: f64,
    /// Best confidence among winning-direction votes.
    pub max_confidence: f64,
    pub vetoed: bool,
    pub veto_reasons: Vec<String>,
    /// Why the decision is what it is ("approved" or a rejection code).
    pub reason: String,
    pub regime: RegimeTag,
    pub trace: Vec<VoteTrace>,
}

impl AggregateDecision {
    fn rejected(reason: &str, regime: RegimeTag, trace: Vec<VoteTrace>) -> Self {
        Self {
            direction: None,
            score: 0.0,
            agreement: 0.0,
            max_confidence: 0.0,
            vetoed: false,
            veto_reasons: Vec::new(),
            reason: reason.to_string(),
            regime,
            trace,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

fn regime_multiplier(style: AgentStyle, regime: RegimeTag) -> f64 {
    match (regime, style) {
        (RegimeTag::BullMomentum | RegimeTag::BearMomentum, AgentStyle::Momentum) => 1.3,
        (RegimeTag::BullMomentum | RegimeTag::BearMomentum, AgentStyle::Contrarian) => 0.7,
        (RegimeTag::Sideways, AgentStyle::Momentum) => 0.9,
        (RegimeTag::Sideways, AgentStyle::Contrarian) => 1.4,
        (RegimeTag::Volatile, AgentStyle::Momentum | AgentStyle::Contrarian) => 0.8,
        (_, AgentStyle::Neutral) => 1.0,
    }
}

/// Pull veto reasons out of a guardian-style vote's details.
fn veto_reasons_of(vote: &Vote) -> Vec<String> {
    vote.details
        .as_ref()
        .and_then(|d| d.get("veto_reasons"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|r| r.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Run one weighted-consensus pass over the committee's votes.
///
/// `votes` must already be in deterministic (agent-name) order; the trace
/// preserves that order so identical inputs always log identically.
pub fn aggregate(
    votes: &[Vote],
    regime: RegimeTag,
    settings: &AggregatorSettings,
    accuracy: &AccuracyBook,
) -> AggregateDecision {
    // Veto resolution comes first: a vetoed cycle never trades, whatever the
    // scores say.
    if settings.honor_vetoes {
        let reasons: Vec<String> = votes
            .iter()
            .filter(|v| settings.includes(&v.agent))
            .flat_map(veto_reasons_of)
            .collect();
        if !reasons.is_empty() {
            let mut decision = AggregateDecision::rejected("vetoed", regime, Vec::new());
            decision.vetoed = true;
            decision.veto_reasons = reasons;
            return decision;
        }
    }

    // Step 1: drop Skip votes (and agents this pass does not listen to).
    let active: Vec<&Vote> = votes
        .iter()
        .filter(|v| settings.includes(&v.agent) && v.direction != VoteDirection::Skip)
        .collect();

    if active.is_empty() {
        return AggregateDecision::rejected("no-signal", regime, Vec::new());
    }

    // Steps 2–3: effective weights and per-direction scores.
    let mut sums: HashMap<VoteDirection, f64> = HashMap::new();
    let mut trace = Vec::with_capacity(active.len());

    for vote in &active {
        let weight = (settings.base_weight(&vote.agent)
            * regime_multiplier(style_of(&vote.agent), regime)
            * accuracy.multiplier(&vote.agent))
        .min(WEIGHT_CAP);

        let contribution = vote.confidence * vote.quality * weight;
        *sums.entry(vote.direction).or_default() += contribution;

        trace.push(VoteTrace {
            agent: vote.agent.clone(),
            direction: vote.direction,
            confidence: vote.confidence,
            quality: vote.quality,
            effective_weight: weight,
            contribution,
        });
    }

    let s_up = sums.get(&VoteDirection::Up).copied().unwrap_or(0.0);
    let s_down = sums.get(&VoteDirection::Down).copied().unwrap_or(0.0);
    let s_neutral = sums.get(&VoteDirection::Neutral).copied().unwrap_or(0.0);
    let total = s_up + s_down + s_neutral;

    if total <= 0.0 {
        return AggregateDecision::rejected("no-signal", regime, trace);
    }

    // Step 4: pick the winner; Up/Down ties are a deadlock, a Neutral winner
    // suppresses the cycle.
    if s_up > 0.0 && (s_up - s_down).abs() < 1e-12 && s_up >= s_neutral {
        return AggregateDecision::rejected("deadlock", regime, trace);
    }

    let (winner, s_winner) = if s_up >= s_down && s_up >= s_neutral {
        (VoteDirection::Up, s_up)
    } else if s_down >= s_up && s_down >= s_neutral {
        (VoteDirection::Down, s_down)
    } else {
        (VoteDirection::Neutral, s_neutral)
    };

    if winner == VoteDirection::Neutral {
        return AggregateDecision::rejected("neutral-consensus", regime, trace);
    }

    // Steps 5–6: normalised score and agreement fraction.
    let score = s_winner / total;
    let winning_votes: Vec<&&Vote> = active.iter().filter(|v| v.direction == winner).collect();
    let agreement = winning_votes.len() as f64 / active.len() as f64;
    let max_confidence = winning_votes
        .iter()
        .map(|v| v.confidence)
        .fold(0.0, f64::max);

    let side = winner.side().expect("winner is directional");

    // Step 7: the three gates, most informative failure first.
    let reason = if score < settings.consensus_threshold {
        "below-threshold"
    } else if max_confidence < settings.min_confidence {
        "low-confidence"
    } else if agreement < settings.min_agreement {
        "agreement-floor"
    } else {
        "approved"
    };

    let direction = (reason == "approved").then_some(side);

    debug!(
        winner = %side,
        score,
        agreement,
        max_confidence,
        reason,
        regime = %regime,
        "aggregation complete"
    );

    AggregateDecision {
        direction,
        score,
        agreement,
        max_confidence,
        vetoed: false,
        veto_reasons: Vec::new(),
        reason: reason.to_string(),
        regime,
        trace,
    }
}
