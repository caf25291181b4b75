// =============================================================================
// Outcome Ledger — durable SQLite journal of decisions, outcomes and votes
// =============================================================================
//
// Tables: strategies, decisions, outcomes, agent_votes, performance.
// (strategy, crypto, epoch) is unique on decisions and outcomes — outcome
// insertion is idempotent on that triple and a duplicate is reported, never
// a crash.
//
// WAL mode keeps readers concurrent with the single writer; synchronous=FULL
// makes each outcome commit durable before the call returns.
//
// A failed outcome write is retried three times, then appended to an on-disk
// JSONL spool and escalated as CRITICAL; the spool is replayed at startup.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::types::{Crypto, Epoch, Side};

/// Attempts before an outcome write is spooled.
const WRITE_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRow {
    pub id: String,
    pub strategy: String,
    pub crypto: Crypto,
    pub epoch: Epoch,
    pub direction: Option<Side>,
    pub score: f64,
    pub agreement: f64,
    pub vetoed: bool,
    pub reason: String,
    pub would_trade: bool,
    pub entry_price: Option<f64>,
    pub size_usd: Option<f64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRow {
    pub strategy: String,
    pub crypto: Crypto,
    pub epoch: Epoch,
    pub outcome: Side,
    pub pnl: f64,
    pub predicted: Option<Side>,
    pub confidence: f64,
    pub resolved_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteRow {
    pub decision_id: String,
    pub agent_name: String,
    pub crypto: Crypto,
    pub epoch: Epoch,
    pub direction: String,
    pub confidence: f64,
    pub quality: f64,
}

/// What happened to an outcome insertion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeInsert {
    Inserted,
    /// The (strategy, crypto, epoch) triple already had a row.
    AlreadyResolved,
    /// All retries failed; the row went to the spool file.
    Spooled,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct Ledger {
    conn: Mutex<Connection>,
    spool_path: PathBuf,
}

impl Ledger {
    pub fn open(path: impl AsRef<Path>, spool_path: impl Into<PathBuf>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open ledger at {}", path.as_ref().display()))?;

        conn.pragma_update(None, "journal_mode", "WAL").ok();
        // Outcome commits must be durable the moment the call returns.
        conn.pragma_update(None, "synchronous", "FULL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS strategies (
                name            TEXT PRIMARY KEY,
                virtual_balance REAL NOT NULL,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS decisions (
                id          TEXT PRIMARY KEY,
                strategy    TEXT NOT NULL,
                crypto      TEXT NOT NULL,
                epoch       INTEGER NOT NULL,
                direction   TEXT,
                score       REAL NOT NULL,
                agreement   REAL NOT NULL,
                vetoed      INTEGER NOT NULL,
                reason      TEXT NOT NULL,
                would_trade INTEGER NOT NULL,
                entry_price REAL,
                size_usd    REAL,
                created_at  INTEGER NOT NULL,
                UNIQUE (strategy, crypto, epoch)
            );

            CREATE TABLE IF NOT EXISTS outcomes (
                id          INTEGER PRIMARY KEY,
                strategy    TEXT NOT NULL,
                crypto      TEXT NOT NULL,
                epoch       INTEGER NOT NULL,
                outcome     TEXT NOT NULL,
                pnl         REAL NOT NULL,
                predicted   TEXT,
                confidence  REAL NOT NULL,
                resolved_at INTEGER NOT NULL,
                UNIQUE (strategy, crypto, epoch)
            );
            CREATE INDEX IF NOT EXISTS idx_outcomes_strategy_resolved
                ON outcomes(strategy, resolved_at);

            CREATE TABLE IF NOT EXISTS agent_votes (
                id          INTEGER PRIMARY KEY,
                decision_id TEXT NOT NULL,
                agent_name  TEXT NOT NULL,
                crypto      TEXT NOT NULL,
                epoch       INTEGER NOT NULL,
                direction   TEXT NOT NULL,
                confidence  REAL NOT NULL,
                quality     REAL NOT NULL,
                created_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_votes_agent
                ON agent_votes(agent_name);

            CREATE TABLE IF NOT EXISTS performance (
                strategy TEXT NOT NULL,
                day      TEXT NOT NULL,
                trades   INTEGER NOT NULL,
                wins     INTEGER NOT NULL,
                pnl      REAL NOT NULL,
                PRIMARY KEY (strategy, day)
            );",
        )
        .context("create ledger schema")?;

        info!(path = %path.as_ref().display(), "ledger opened");
        Ok(Self {
            conn: Mutex::new(conn),
            spool_path: spool_path.into(),
        })
    }

    // -------------------------------------------------------------------------
    // Strategies
    // -------------------------------------------------------------------------

    /// Register a strategy if unknown; existing balances are preserved.
    pub fn ensure_strategy(&self, name: &str, initial_balance: f64, now_unix: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO strategies (name, virtual_balance, created_at)
             VALUES (?1, ?2, ?3)",
            params![name, initial_balance, now_unix],
        )?;
        Ok(())
    }

    pub fn strategy_balance(&self, name: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let balance = conn
            .query_row(
                "SELECT virtual_balance FROM strategies WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance)
    }

    pub fn set_strategy_balance(&self, name: &str, balance: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE strategies SET virtual_balance = ?2 WHERE name = ?1",
            params![name, balance],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Decisions
    // -------------------------------------------------------------------------

    /// Insert or refresh the decision for (strategy, crypto, epoch). A row
    /// that already committed a trade is never overwritten by later scans of
    /// the same epoch.
    pub fn record_decision(&self, row: &DecisionRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO decisions
                 (id, strategy, crypto, epoch, direction, score, agreement,
                  vetoed, reason, would_trade, entry_price, size_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(strategy, crypto, epoch) DO UPDATE SET
                 direction   = excluded.direction,
                 score       = excluded.score,
                 agreement   = excluded.agreement,
                 vetoed      = excluded.vetoed,
                 reason      = excluded.reason,
                 would_trade = excluded.would_trade,
                 entry_price = excluded.entry_price,
                 size_usd    = excluded.size_usd,
                 created_at  = excluded.created_at
             WHERE decisions.would_trade = 0",
            params![
                row.id,
                row.strategy,
                row.crypto.slug(),
                row.epoch,
                row.direction.map(|d| d.as_str()),
                row.score,
                row.agreement,
                row.vetoed as i64,
                row.reason,
                row.would_trade as i64,
                row.entry_price,
                row.size_usd,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn decision_for(
        &self,
        strategy: &str,
        crypto: Crypto,
        epoch: Epoch,
    ) -> Result<Option<DecisionRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, strategy, crypto, epoch, direction, score, agreement,
                        vetoed, reason, would_trade, entry_price, size_usd, created_at
                 FROM decisions
                 WHERE strategy = ?1 AND crypto = ?2 AND epoch = ?3",
                params![strategy, crypto.slug(), epoch],
                decode_decision,
            )
            .optional()?;
        Ok(row)
    }

    /// Decisions of one (crypto, epoch) that committed a trade but have no
    /// outcome row yet, ordered by strategy name for deterministic
    /// resolution.
    pub fn unresolved_trades(&self, crypto: Crypto, epoch: Epoch) -> Result<Vec<DecisionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT d.id, d.strategy, d.crypto, d.epoch, d.direction, d.score,
                    d.agreement, d.vetoed, d.reason, d.would_trade,
                    d.entry_price, d.size_usd, d.created_at
             FROM decisions d
             WHERE d.crypto = ?1 AND d.epoch = ?2 AND d.would_trade = 1
               AND NOT EXISTS (
                   SELECT 1 FROM outcomes o
                   WHERE o.strategy = d.strategy
                     AND o.crypto = d.crypto
                     AND o.epoch = d.epoch
               )
             ORDER BY d.strategy ASC",
        )?;
        let rows = stmt
            .query_map(params![crypto.slug(), epoch], decode_decision)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Votes
    // -------------------------------------------------------------------------

    pub fn record_votes(&self, votes: &[VoteRow], now_unix: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for vote in votes {
            tx.execute(
                "INSERT INTO agent_votes
                     (decision_id, agent_name, crypto, epoch, direction,
                      confidence, quality, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    vote.decision_id,
                    vote.agent_name,
                    vote.crypto.slug(),
                    vote.epoch,
                    vote.direction,
                    vote.confidence,
                    vote.quality,
                    now_unix,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Directional production votes joined to their resolved outcomes,
    /// oldest first. Used to warm the adaptive-accuracy book on startup.
    pub fn vote_results(&self, limit: usize) -> Result<Vec<(String, bool)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT av.agent_name, av.direction, o.outcome
             FROM agent_votes av
             JOIN outcomes o
               ON o.strategy = 'production'
              AND o.crypto = av.crypto
              AND o.epoch = av.epoch
             WHERE av.direction IN ('Up', 'Down')
             ORDER BY av.created_at ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let agent: String = row.get(0)?;
                let direction: String = row.get(1)?;
                let outcome: String = row.get(2)?;
                Ok((agent, direction, outcome))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(agent, direction, outcome)| {
                let correct = direction.eq_ignore_ascii_case(&outcome);
                (agent, correct)
            })
            .collect())
    }

    // -------------------------------------------------------------------------
    // Outcomes
    // -------------------------------------------------------------------------

    fn try_insert_outcome(&self, row: &OutcomeRow) -> Result<OutcomeInsert> {
        let conn = self.conn.lock();

        let existing: Option<(String, f64)> = conn
            .query_row(
                "SELECT outcome, pnl FROM outcomes
                 WHERE strategy = ?1 AND crypto = ?2 AND epoch = ?3",
                params![row.strategy, row.crypto.slug(), row.epoch],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        if let Some((outcome, pnl)) = existing {
            if outcome != row.outcome.as_str() || (pnl - row.pnl).abs() > 1e-9 {
                warn!(
                    strategy = %row.strategy,
                    crypto = %row.crypto,
                    epoch = row.epoch,
                    existing_outcome = %outcome,
                    existing_pnl = pnl,
                    new_outcome = %row.outcome,
                    new_pnl = row.pnl,
                    "duplicate outcome with different content"
                );
            } else {
                debug!(
                    strategy = %row.strategy,
                    crypto = %row.crypto,
                    epoch = row.epoch,
                    "outcome already resolved"
                );
            }
            return Ok(OutcomeInsert::AlreadyResolved);
        }

        conn.execute(
            "INSERT INTO outcomes
                 (strategy, crypto, epoch, outcome, pnl, predicted, confidence, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.strategy,
                row.crypto.slug(),
                row.epoch,
                row.outcome.as_str(),
                row.pnl,
                row.predicted.map(|d| d.as_str()),
                row.confidence,
                row.resolved_at,
            ],
        )?;
        Ok(OutcomeInsert::Inserted)
    }

    /// Idempotent, durable outcome insertion: retried on failure, spooled to
    /// disk when the store will not accept it.
    pub fn insert_outcome(&self, row: &OutcomeRow) -> OutcomeInsert {
        let mut last_err = None;
        for attempt in 1..=WRITE_RETRIES {
            match self.try_insert_outcome(row) {
                Ok(result) => return result,
                Err(e) => {
                    warn!(
                        strategy = %row.strategy,
                        crypto = %row.crypto,
                        epoch = row.epoch,
                        attempt,
                        error = %e,
                        "outcome insert failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        error!(
            event = "ledger_write_failed",
            strategy = %row.strategy,
            crypto = %row.crypto,
            epoch = row.epoch,
            error = %last_err.expect("retries imply an error"),
            "outcome write failed after retries — spooling"
        );
        if let Err(e) = self.spool(row) {
            error!(error = %e, "spool append failed — outcome row lost");
        }
        OutcomeInsert::Spooled
    }

    fn spool(&self, row: &OutcomeRow) -> Result<()> {
        let line = serde_json::to_string(row).context("serialise spooled outcome")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spool_path)
            .with_context(|| format!("open spool {}", self.spool_path.display()))?;
        writeln!(file, "{line}").context("append spooled outcome")?;
        file.sync_all().context("fsync spool")?;
        Ok(())
    }

    /// Replay spooled outcome rows (called at startup). Rows that still fail
    /// stay in the spool.
    pub fn replay_spool(&self) -> Result<usize> {
        if !self.spool_path.exists() {
            return Ok(0);
        }

        let content = std::fs::read_to_string(&self.spool_path)
            .with_context(|| format!("read spool {}", self.spool_path.display()))?;

        let mut replayed = 0;
        let mut remaining = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<OutcomeRow>(line) {
                Ok(row) => match self.try_insert_outcome(&row) {
                    Ok(_) => replayed += 1,
                    Err(e) => {
                        warn!(error = %e, "spool replay insert failed — keeping row");
                        remaining.push(line.to_string());
                    }
                },
                Err(e) => {
                    warn!(error = %e, "unreadable spool line dropped");
                }
            }
        }

        if remaining.is_empty() {
            std::fs::remove_file(&self.spool_path).ok();
        } else {
            std::fs::write(&self.spool_path, remaining.join("\n") + "\n")
                .context("rewrite spool")?;
        }

        if replayed > 0 {
            info!(replayed, "spooled outcomes replayed");
        }
        Ok(replayed)
    }

    pub fn outcome_exists(&self, strategy: &str, crypto: Crypto, epoch: Epoch) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM outcomes WHERE strategy = ?1 AND crypto = ?2 AND epoch = ?3",
                params![strategy, crypto.slug(), epoch],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // -------------------------------------------------------------------------
    // Performance
    // -------------------------------------------------------------------------

    /// Accumulate one resolved trade into the per-day performance rollup.
    pub fn record_performance(&self, strategy: &str, day: &str, won: bool, pnl: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO performance (strategy, day, trades, wins, pnl)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT(strategy, day) DO UPDATE SET
                 trades = performance.trades + 1,
                 wins   = performance.wins + excluded.wins,
                 pnl    = performance.pnl + excluded.pnl",
            params![strategy, day, won as i64, pnl],
        )?;
        Ok(())
    }
}

fn decode_decision(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRow> {
    let crypto_slug: String = row.get(2)?;
    let direction: Option<String> = row.get(4)?;
    Ok(DecisionRow {
        id: row.get(0)?,
        strategy: row.get(1)?,
        crypto: Crypto::from_slug(&crypto_slug).unwrap_or(Crypto::Btc),
        epoch: row.get(3)?,
        direction: direction.and_then(|d| Side::from_str_loose(&d)),
        score: row.get(5)?,
        agreement: row.get(6)?,
        vetoed: row.get::<_, i64>(7)? != 0,
        reason: row.get(8)?,
        would_trade: row.get::<_, i64>(9)? != 0,
        entry_price: row.get(10)?,
        size_usd: row.get(11)?,
        created_at: row.get(12)?,
    })
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("spool_path", &self.spool_path)
            .finish()
    }
}
