// =============================================================================
// Trading-State Store — durable engine state with atomic writes
// =============================================================================
//
// The single source of truth for cash balance, peak, daily counters, mode and
// open positions. Persistence rules:
//
//   - every write goes to a sibling tmp file, is fsynced, then renamed over
//     the live file; no partial file is ever observable,
//   - the write lock is held across the whole read-modify-write-persist,
//   - readers get cheap copies and never block writers for long.
//
// Peak balance rises ONLY on confirmed redemption credits — never from
// marked-to-market position values — and otherwise only moves via an explicit
// operator reset.
//
// Leaving `halted` requires the operator's sentinel file; no automatic
// condition ever unhalts the engine.
// =============================================================================

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::types::{Crypto, Epoch, Position, TradeMode};

/// Relative cash difference below which reconciliation stays silent.
const RECONCILE_IGNORE_FRAC: f64 = 0.02;
/// Relative cash difference at which state is overwritten from the venue.
const RECONCILE_OVERWRITE_FRAC: f64 = 0.10;

// ---------------------------------------------------------------------------
// TradingState
// ---------------------------------------------------------------------------

/// The persisted engine state. All fields default so old files keep loading
/// after new fields appear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingState {
    #[serde(default)]
    pub version: u32,
    /// Liquid settlement-currency cash only; never includes open positions.
    #[serde(default)]
    pub current_balance: f64,
    #[serde(default)]
    pub peak_balance: f64,
    #[serde(default)]
    pub day_start_balance: f64,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub mode: TradeMode,
    #[serde(default)]
    pub consecutive_wins: u32,
    #[serde(default)]
    pub consecutive_losses: u32,
    /// Non-empty exactly when `mode == Halted`.
    #[serde(default)]
    pub halt_reason: String,
    /// Unix timestamp of the current trading day's start (midnight UTC).
    #[serde(default)]
    pub day_start_unix: i64,
    #[serde(default)]
    pub open_positions: Vec<Position>,
}

impl TradingState {
    fn fresh(venue_cash: f64, now_unix: i64) -> Self {
        Self {
            version: 1,
            current_balance: venue_cash,
            peak_balance: venue_cash,
            day_start_balance: venue_cash,
            daily_pnl: 0.0,
            mode: TradeMode::Normal,
            consecutive_wins: 0,
            consecutive_losses: 0,
            halt_reason: String::new(),
            day_start_unix: midnight_of(now_unix),
            open_positions: Vec::new(),
        }
    }

    /// Current drawdown from peak, in [0, 1].
    pub fn drawdown(&self) -> f64 {
        if self.peak_balance <= 0.0 {
            return 0.0;
        }
        ((self.peak_balance - self.current_balance) / self.peak_balance).max(0.0)
    }

    /// Today's realised loss as a positive number (0 when in profit).
    pub fn daily_loss(&self) -> f64 {
        (-self.daily_pnl).max(0.0)
    }

    /// Today's loss as a fraction of the day-start balance.
    pub fn daily_loss_frac(&self) -> f64 {
        if self.day_start_balance <= 0.0 {
            return 0.0;
        }
        self.daily_loss() / self.day_start_balance
    }

    pub fn position_for(&self, crypto: Crypto) -> Option<&Position> {
        self.open_positions.iter().find(|p| p.crypto == crypto)
    }

    pub fn remove_position(&mut self, crypto: Crypto, epoch: Epoch) -> Option<Position> {
        let idx = self
            .open_positions
            .iter()
            .position(|p| p.crypto == crypto && p.epoch == epoch)?;
        Some(self.open_positions.remove(idx))
    }

    /// Put the engine into halted mode. Idempotent; the first reason wins.
    pub fn halt(&mut self, reason: &str) {
        if self.mode == TradeMode::Halted {
            return;
        }
        self.mode = TradeMode::Halted;
        self.halt_reason = reason.to_string();
        error!(event = "engine_halted", reason, "trading halted");
    }
}

/// Midnight UTC of the day containing `unix_secs`.
pub fn midnight_of(unix_secs: i64) -> i64 {
    unix_secs.div_euclid(86_400) * 86_400
}

// ---------------------------------------------------------------------------
// Reconciliation outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileOutcome {
    /// Below 2% difference — nothing to do.
    InSync,
    /// Between 2% and 10% — logged, state untouched.
    Warned { diff_frac: f64 },
    /// At or above 10% — state overwritten from the venue.
    Overwritten { old_balance: f64, new_balance: f64 },
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Mutex-serialised durable store for [`TradingState`].
pub struct StateStore {
    path: PathBuf,
    sentinel_path: PathBuf,
    inner: Mutex<TradingState>,
}

impl StateStore {
    /// Load persisted state, or initialise a fresh one from the venue's cash
    /// balance when no file exists yet. A file that exists but fails to
    /// decode is a fatal state error.
    pub fn load_or_init(
        path: impl Into<PathBuf>,
        sentinel_path: impl Into<PathBuf>,
        venue_cash: f64,
        now_unix: i64,
    ) -> Result<Self> {
        let path = path.into();
        let sentinel_path = sentinel_path.into();

        let mut state = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read state from {}", path.display()))?;
            let state: TradingState = serde_json::from_str(&content)
                .with_context(|| format!("failed to decode state from {}", path.display()))?;
            info!(
                path = %path.display(),
                balance = state.current_balance,
                peak = state.peak_balance,
                mode = %state.mode,
                "trading state loaded"
            );
            state
        } else {
            info!(
                path = %path.display(),
                venue_cash,
                "no state file — initialising from venue cash balance"
            );
            TradingState::fresh(venue_cash, now_unix)
        };

        // A negative balance can only come from corruption or venue chaos;
        // refuse to trade until the operator looks at it.
        if state.current_balance < 0.0 {
            state.halt("negative balance on load");
        }

        let store = Self {
            path,
            sentinel_path,
            inner: Mutex::new(state),
        };
        store.persist_locked(&store.inner.lock())?;
        Ok(store)
    }

    /// Cheap copy of the current state.
    pub fn current(&self) -> TradingState {
        self.inner.lock().clone()
    }

    /// Transactional update: the lock is held across mutate-and-persist so a
    /// concurrent writer can never interleave, and the on-disk file always
    /// holds the last committed value.
    pub fn update<F>(&self, mutate: F) -> Result<TradingState>
    where
        F: FnOnce(&mut TradingState),
    {
        let mut guard = self.inner.lock();
        mutate(&mut guard);

        if guard.current_balance < 0.0 {
            guard.halt("negative balance observed");
        }

        self.persist_locked(&guard)?;
        Ok(guard.clone())
    }

    /// Compare state cash against the venue's figure and correct per policy.
    /// Peak is never raised here, whatever the venue says.
    pub fn reconcile(&self, venue_cash: f64) -> Result<ReconcileOutcome> {
        if venue_cash <= 0.0 {
            // A zero/negative venue read is treated as unusable data, not as
            // a command to zero the book.
            warn!(venue_cash, "reconcile skipped — implausible venue balance");
            return Ok(ReconcileOutcome::InSync);
        }

        let state_balance = self.inner.lock().current_balance;
        let diff_frac = (state_balance - venue_cash).abs() / venue_cash;

        if diff_frac < RECONCILE_IGNORE_FRAC {
            return Ok(ReconcileOutcome::InSync);
        }

        if diff_frac < RECONCILE_OVERWRITE_FRAC {
            warn!(
                event = "reconcile_drift",
                state_balance,
                venue_cash,
                diff_frac,
                "state and venue cash disagree"
            );
            return Ok(ReconcileOutcome::Warned { diff_frac });
        }

        let updated = self.update(|s| {
            s.current_balance = venue_cash;
        })?;
        error!(
            event = "reconcile_overwrite",
            old_balance = state_balance,
            new_balance = venue_cash,
            peak = updated.peak_balance,
            "state balance overwritten from venue"
        );
        Ok(ReconcileOutcome::Overwritten {
            old_balance: state_balance,
            new_balance: venue_cash,
        })
    }

    /// Credit a confirmed redemption. This is the only code path that raises
    /// the peak balance.
    pub fn credit_redemption(&self, amount: f64) -> Result<TradingState> {
        self.update(|s| {
            s.current_balance += amount;
            if s.current_balance > s.peak_balance {
                s.peak_balance = s.current_balance;
            }
        })
    }

    /// Explicit operator reset of the peak balance to the current balance.
    pub fn reset_peak(&self) -> Result<TradingState> {
        self.update(|s| {
            s.peak_balance = s.current_balance;
            warn!(peak = s.peak_balance, "peak balance reset by operator");
        })
    }

    /// If halted and the operator's sentinel file exists, consume it and
    /// return to normal mode. Polled once per cycle.
    pub fn poll_unhalt(&self) -> Result<bool> {
        {
            let guard = self.inner.lock();
            if guard.mode != TradeMode::Halted {
                return Ok(false);
            }
        }
        if !self.sentinel_path.exists() {
            return Ok(false);
        }

        fs::remove_file(&self.sentinel_path).with_context(|| {
            format!(
                "failed to consume halt sentinel {}",
                self.sentinel_path.display()
            )
        })?;

        self.update(|s| {
            info!(
                event = "engine_unhalted",
                previous_reason = %s.halt_reason,
                "halt released by operator sentinel"
            );
            s.mode = TradeMode::Normal;
            s.halt_reason.clear();
        })?;
        Ok(true)
    }

    /// Roll daily counters at midnight UTC. Any non-halted mode returns to
    /// normal if yesterday's loss stayed under 5%.
    pub fn roll_day(&self, now_unix: i64) -> Result<TradingState> {
        self.update(|s| {
            let prior_loss_frac = s.daily_loss_frac();
            s.day_start_balance = s.current_balance;
            s.daily_pnl = 0.0;
            s.day_start_unix = midnight_of(now_unix);
            if s.mode != TradeMode::Halted && prior_loss_frac < 0.05 {
                s.mode = TradeMode::Normal;
            }
            info!(
                event = "day_rolled",
                day_start_balance = s.day_start_balance,
                mode = %s.mode,
                "daily counters reset"
            );
        })
    }

    // -------------------------------------------------------------------------
    // Persistence internals
    // -------------------------------------------------------------------------

    fn persist_locked(&self, state: &TradingState) -> Result<()> {
        let content =
            serde_json::to_string_pretty(state).context("failed to serialise trading state")?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path).with_context(|| {
                format!("failed to create tmp state file {}", tmp_path.display())
            })?;
            file.write_all(content.as_bytes())
                .with_context(|| format!("failed to write tmp state {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to fsync tmp state {}", tmp_path.display()))?;
        }
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename {} over {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .field("sentinel_path", &self.sentinel_path)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn store_in(dir: &tempfile::TempDir, venue_cash: f64) -> StateStore {
        StateStore::load_or_init(
            dir.path().join("state.json"),
            dir.path().join("unhalt.signal"),
            venue_cash,
            1_704_067_200,
        )
        .unwrap()
    }

    #[test]
    fn init_from_venue_cash_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 123.45);
        let s = store.current();
        assert!((s.current_balance - 123.45).abs() < 1e-9);
        assert!((s.peak_balance - 123.45).abs() < 1e-9);
        assert_eq!(s.mode, TradeMode::Normal);
        assert!(s.halt_reason.is_empty());
    }

    #[test]
    fn updates_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = store_in(&dir, 100.0);
            store
                .update(|s| {
                    s.current_balance = 87.5;
                    s.consecutive_losses = 2;
                })
                .unwrap();
        }
        let store =
            StateStore::load_or_init(&path, dir.path().join("unhalt.signal"), 0.0, 0).unwrap();
        let s = store.current();
        assert!((s.current_balance - 87.5).abs() < 1e-9);
        assert_eq!(s.consecutive_losses, 2);
    }

    #[test]
    fn leftover_tmp_file_never_shadows_committed_state() {
        // Simulates a crash between tmp write and rename: the stray tmp file
        // must not affect the next load.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = store_in(&dir, 100.0);
            store.update(|s| s.current_balance = 42.0).unwrap();
        }
        fs::write(path.with_extension("json.tmp"), b"{ torn garbage").unwrap();

        let store =
            StateStore::load_or_init(&path, dir.path().join("unhalt.signal"), 0.0, 0).unwrap();
        assert!((store.current().current_balance - 42.0).abs() < 1e-9);
    }

    #[test]
    fn corrupt_state_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"not json").unwrap();
        assert!(
            StateStore::load_or_init(&path, dir.path().join("unhalt.signal"), 0.0, 0).is_err()
        );
    }

    #[test]
    fn peak_rises_only_on_redemption_credit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 100.0);

        // A plain balance bump (e.g. reconciliation overwrite) must not move
        // the peak.
        store.update(|s| s.current_balance = 150.0).unwrap();
        assert!((store.current().peak_balance - 100.0).abs() < 1e-9);

        store.credit_redemption(10.0).unwrap();
        let s = store.current();
        assert!((s.current_balance - 160.0).abs() < 1e-9);
        assert!((s.peak_balance - 160.0).abs() < 1e-9);
    }

    #[test]
    fn peak_is_monotone_across_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 100.0);
        let mut last_peak = store.current().peak_balance;

        for (credit, spend) in [(5.0, 30.0), (0.5, 2.0), (40.0, 1.0), (0.0, 70.0)] {
            store.credit_redemption(credit).unwrap();
            store.update(|s| s.current_balance -= spend).unwrap();
            let peak = store.current().peak_balance;
            assert!(peak >= last_peak);
            last_peak = peak;
        }
    }

    #[test]
    fn reconcile_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 100.0);

        // < 2% — ignored.
        assert_eq!(store.reconcile(101.0).unwrap(), ReconcileOutcome::InSync);
        assert!((store.current().current_balance - 100.0).abs() < 1e-9);

        // 2–10% — warn only.
        assert!(matches!(
            store.reconcile(105.0).unwrap(),
            ReconcileOutcome::Warned { .. }
        ));
        assert!((store.current().current_balance - 100.0).abs() < 1e-9);

        // >= 10% — overwritten, peak untouched.
        let outcome = store.reconcile(200.97).unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Overwritten { .. }));
        let s = store.current();
        assert!((s.current_balance - 200.97).abs() < 1e-9);
        assert!((s.peak_balance - 100.0).abs() < 1e-9);
    }

    #[test]
    fn reconcile_scenario_s4() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 14.91);
        let outcome = store.reconcile(200.97).unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Overwritten {
                old_balance: 14.91,
                new_balance: 200.97
            }
        );
        assert!((store.current().current_balance - 200.97).abs() < 1e-9);
    }

    #[test]
    fn negative_balance_forces_halt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10.0);
        let s = store.update(|s| s.current_balance = -1.0).unwrap();
        assert_eq!(s.mode, TradeMode::Halted);
        assert!(!s.halt_reason.is_empty());
    }

    #[test]
    fn unhalt_requires_sentinel_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 100.0);
        store.update(|s| s.halt("drawdown 30%")).unwrap();

        // No sentinel — still halted.
        assert!(!store.poll_unhalt().unwrap());
        assert_eq!(store.current().mode, TradeMode::Halted);

        // Sentinel appears — halt released, file consumed.
        let sentinel = dir.path().join("unhalt.signal");
        fs::write(&sentinel, b"").unwrap();
        assert!(store.poll_unhalt().unwrap());
        let s = store.current();
        assert_eq!(s.mode, TradeMode::Normal);
        assert!(s.halt_reason.is_empty());
        assert!(!sentinel.exists());
    }

    #[test]
    fn midnight_roll_resets_daily_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 100.0);
        store
            .update(|s| {
                s.mode = TradeMode::Defensive;
                s.daily_pnl = -3.0; // 3% loss — under the 5% bar
                s.current_balance = 97.0;
            })
            .unwrap();

        let s = store.roll_day(1_704_153_600).unwrap();
        assert_eq!(s.mode, TradeMode::Normal);
        assert!((s.day_start_balance - 97.0).abs() < 1e-9);
        assert!(s.daily_pnl.abs() < 1e-9);
    }

    #[test]
    fn midnight_roll_never_unhalts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 100.0);
        store.update(|s| s.halt("consecutive losses")).unwrap();

        let s = store.roll_day(1_704_153_600).unwrap();
        assert_eq!(s.mode, TradeMode::Halted);
        assert_eq!(s.halt_reason, "consecutive losses");
    }

    #[test]
    fn midnight_roll_keeps_mode_on_heavy_loss() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 100.0);
        store
            .update(|s| {
                s.mode = TradeMode::Recovery;
                s.daily_pnl = -26.0; // 26% loss — mode is kept
            })
            .unwrap();
        let s = store.roll_day(1_704_153_600).unwrap();
        assert_eq!(s.mode, TradeMode::Recovery);
    }

    #[test]
    fn position_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 100.0);
        store
            .update(|s| {
                s.open_positions.push(Position {
                    crypto: Crypto::Btc,
                    side: Side::Up,
                    shares: 10.0,
                    entry_price: 0.4,
                    epoch: 7,
                    token_id: "t".into(),
                    opened_at: "2024-01-01T00:00:00Z".into(),
                });
            })
            .unwrap();

        let mut s = store.current();
        assert!(s.position_for(Crypto::Btc).is_some());
        assert!(s.position_for(Crypto::Eth).is_none());
        assert!(s.remove_position(Crypto::Btc, 7).is_some());
        assert!(s.remove_position(Crypto::Btc, 7).is_none());
    }
}
