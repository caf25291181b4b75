// =============================================================================
// Central Application State — Quorum Trading Engine
// =============================================================================
//
// Ties the long-lived subsystems together for the scheduler and the decision
// pipeline. The only writable shared resources are the state store and the
// ledger; everything else here is read-mostly caches and bounded audit
// rings.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::aggregator::AccuracyBook;
use crate::agents::{Committee, Vote};
use crate::config::EngineConfig;
use crate::feed::PriceFeed;
use crate::ledger::Ledger;
use crate::shadow::ShadowOrchestrator;
use crate::state::StateStore;
use crate::types::{Crypto, Epoch, Side};

/// Maximum number of recent errors retained for inspection.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent decision summaries retained.
const MAX_RECENT_DECISIONS: usize = 100;
/// How many epochs of pending vote stashes are kept per crypto.
const VOTE_STASH_EPOCHS: i64 = 8;
/// Resolved vote/outcome pairs loaded to warm the accuracy book.
const ACCURACY_WARM_LIMIT: usize = 2_000;

/// A recorded error event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: String,
}

/// Compact per-cycle decision summary for the audit ring.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub crypto: Crypto,
    pub epoch: Epoch,
    pub direction: Option<Side>,
    pub score: f64,
    pub reason: String,
    pub at: String,
}

/// Shared engine state. Wrapped in `Arc` and handed to every task.
pub struct AppState {
    pub config: EngineConfig,
    pub feed: Arc<PriceFeed>,
    pub store: Arc<StateStore>,
    pub ledger: Arc<Ledger>,

    pub committee: Mutex<Committee>,
    pub accuracy: Mutex<AccuracyBook>,
    pub shadow: ShadowOrchestrator,

    /// Latest committee votes per (crypto, epoch); consumed at resolution to
    /// update per-agent accuracy.
    pending_votes: Mutex<HashMap<(Crypto, Epoch), Vec<Vote>>>,

    /// Epochs whose resolution side-effects already ran this process.
    resolved_epochs: Mutex<std::collections::HashSet<(Crypto, Epoch)>>,

    recent_decisions: Mutex<Vec<DecisionRecord>>,
    recent_errors: Mutex<Vec<ErrorRecord>>,

    pub cycles: AtomicU64,
}

impl AppState {
    pub fn new(
        config: EngineConfig,
        feed: Arc<PriceFeed>,
        store: Arc<StateStore>,
        ledger: Arc<Ledger>,
    ) -> Result<Self> {
        let now = Utc::now().timestamp();

        let committee = Committee::build(&config, &store);
        info!(agents = ?committee.agent_names(), "committee assembled");

        // Warm the adaptive-accuracy book from the ledger's resolved votes.
        let mut accuracy = AccuracyBook::new();
        for (agent, correct) in ledger.vote_results(ACCURACY_WARM_LIMIT)? {
            accuracy.record(&agent, correct);
        }

        let shadow = ShadowOrchestrator::new(config.clone(), &ledger, now)?;

        Ok(Self {
            config,
            feed,
            store,
            ledger,
            committee: Mutex::new(committee),
            accuracy: Mutex::new(accuracy),
            shadow,
            pending_votes: Mutex::new(HashMap::new()),
            resolved_epochs: Mutex::new(std::collections::HashSet::new()),
            recent_decisions: Mutex::new(Vec::new()),
            recent_errors: Mutex::new(Vec::new()),
            cycles: AtomicU64::new(0),
        })
    }

    pub fn next_cycle(&self) -> u64 {
        self.cycles.fetch_add(1, Ordering::Relaxed)
    }

    // ── Vote stash ──────────────────────────────────────────────────────

    /// Remember the freshest committee votes for (crypto, epoch) and prune
    /// stashes from long-closed epochs.
    pub fn stash_votes(&self, crypto: Crypto, epoch: Epoch, votes: Vec<Vote>) {
        let mut stash = self.pending_votes.lock();
        stash.insert((crypto, epoch), votes);
        stash.retain(|(_, e), _| epoch - *e <= VOTE_STASH_EPOCHS);
    }

    /// Take (and remove) the stashed votes for a resolving epoch.
    pub fn take_votes(&self, crypto: Crypto, epoch: Epoch) -> Option<Vec<Vote>> {
        self.pending_votes.lock().remove(&(crypto, epoch))
    }

    // ── Resolution tracking ─────────────────────────────────────────────

    pub fn is_resolved(&self, crypto: Crypto, epoch: Epoch) -> bool {
        self.resolved_epochs.lock().contains(&(crypto, epoch))
    }

    /// Mark an epoch's resolution side-effects as done; prunes old entries.
    pub fn mark_resolved(&self, crypto: Crypto, epoch: Epoch) {
        let mut set = self.resolved_epochs.lock();
        set.insert((crypto, epoch));
        set.retain(|(_, e)| epoch - *e <= 16);
    }

    // ── Audit rings ─────────────────────────────────────────────────────

    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.lock();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    pub fn push_decision(&self, record: DecisionRecord) {
        let mut decisions = self.recent_decisions.lock();
        decisions.push(record);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.lock().clone()
    }

    pub fn recent_decisions(&self) -> Vec<DecisionRecord> {
        self.recent_decisions.lock().clone()
    }
}
