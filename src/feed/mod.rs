// =============================================================================
// Price Feed — rolling multi-exchange mid-price histories
// =============================================================================
//
// The WebSocket ticker tasks (see stream.rs) push mids into this store; the
// snapshot builder and the agents only ever read from it. Per (crypto,
// exchange) the store keeps a bounded rolling window of recent mids, plus:
//
//   - the mid observed at each 15-minute epoch boundary (used by resolution
//     to determine the actual Up/Down outcome),
//   - the latest perpetual funding rate per crypto,
//   - the resolved directions of recent epochs per crypto.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

pub mod stream;

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::RwLock;

use crate::types::{epoch_of, Crypto, Epoch, Side};

/// Exchanges the feed listens to.
pub const EXCHANGES: [&str; 3] = ["binance", "coinbase", "kraken"];

/// Exchange whose history seeds RSI and epoch-boundary prices.
pub const PRIMARY_EXCHANGE: &str = "binance";

/// Rolling mid-price window per (crypto, exchange).
pub const HISTORY_LEN: usize = 20;

/// How many resolved epoch directions are remembered per crypto.
pub const OUTCOME_MEMORY: usize = 5;

/// How many epoch-boundary prices are retained per crypto.
const EPOCH_BOOK_LEN: usize = 24;

/// A mid older than this is considered stale for liveness purposes.
const STALE_AFTER_SECS: i64 = 30;

#[derive(Default)]
struct ExchangeSeries {
    mids: VecDeque<f64>,
    last_update_unix: i64,
}

pub struct PriceFeed {
    series: RwLock<HashMap<(Crypto, &'static str), ExchangeSeries>>,
    /// First primary-exchange mid observed in each epoch.
    epoch_opens: RwLock<HashMap<Crypto, BTreeMap<Epoch, f64>>>,
    funding: RwLock<HashMap<Crypto, f64>>,
    outcomes: RwLock<HashMap<Crypto, VecDeque<Side>>>,
}

impl PriceFeed {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            epoch_opens: RwLock::new(HashMap::new()),
            funding: RwLock::new(HashMap::new()),
            outcomes: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Writers (ticker tasks / resolution)
    // -------------------------------------------------------------------------

    /// Record a fresh mid for `(crypto, exchange)` at the current wall clock.
    pub fn record_mid(&self, crypto: Crypto, exchange: &'static str, mid: f64) {
        self.record_mid_at(crypto, exchange, mid, chrono::Utc::now().timestamp());
    }

    /// Record a mid at an explicit timestamp (used directly by tests).
    pub fn record_mid_at(&self, crypto: Crypto, exchange: &'static str, mid: f64, unix_secs: i64) {
        if !(mid.is_finite() && mid > 0.0) {
            return;
        }

        {
            let mut map = self.series.write();
            let entry = map.entry((crypto, exchange)).or_default();
            entry.mids.push_back(mid);
            while entry.mids.len() > HISTORY_LEN {
                entry.mids.pop_front();
            }
            entry.last_update_unix = unix_secs;
        }

        // The first primary-exchange mid in an epoch doubles as that epoch's
        // open price.
        if exchange == PRIMARY_EXCHANGE {
            let epoch = epoch_of(unix_secs);
            let mut opens = self.epoch_opens.write();
            let book = opens.entry(crypto).or_default();
            book.entry(epoch).or_insert(mid);
            while book.len() > EPOCH_BOOK_LEN {
                let oldest = *book.keys().next().expect("non-empty book");
                book.remove(&oldest);
            }
        }
    }

    pub fn set_funding_rate(&self, crypto: Crypto, rate: f64) {
        if rate.is_finite() {
            self.funding.write().insert(crypto, rate);
        }
    }

    /// Remember a resolved epoch direction (oldest entries are evicted).
    pub fn record_outcome(&self, crypto: Crypto, outcome: Side) {
        let mut map = self.outcomes.write();
        let ring = map.entry(crypto).or_default();
        ring.push_back(outcome);
        while ring.len() > OUTCOME_MEMORY {
            ring.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Readers (snapshot builder / agents / resolution)
    // -------------------------------------------------------------------------

    /// Recent mid history per exchange (oldest first). Exchanges without any
    /// data are absent from the map.
    pub fn mids(&self, crypto: Crypto) -> HashMap<String, Vec<f64>> {
        let map = self.series.read();
        let mut out = HashMap::new();
        for exchange in EXCHANGES {
            if let Some(entry) = map.get(&(crypto, exchange)) {
                if !entry.mids.is_empty() {
                    out.insert(exchange.to_string(), entry.mids.iter().copied().collect());
                }
            }
        }
        out
    }

    /// Like [`mids`](Self::mids), but drops exchanges whose latest mid is
    /// stale. This is what snapshots carry, so confluence agents only ever
    /// see live venues.
    pub fn fresh_mids(&self, crypto: Crypto, now_unix: i64) -> HashMap<String, Vec<f64>> {
        let map = self.series.read();
        let mut out = HashMap::new();
        for exchange in EXCHANGES {
            if let Some(entry) = map.get(&(crypto, exchange)) {
                if !entry.mids.is_empty() && now_unix - entry.last_update_unix <= STALE_AFTER_SECS {
                    out.insert(exchange.to_string(), entry.mids.iter().copied().collect());
                }
            }
        }
        out
    }

    /// Number of exchanges with a mid fresher than the staleness cutoff.
    pub fn live_exchange_count(&self, crypto: Crypto, now_unix: i64) -> usize {
        let map = self.series.read();
        EXCHANGES
            .iter()
            .filter(|ex| {
                map.get(&(crypto, **ex))
                    .map(|e| {
                        !e.mids.is_empty() && now_unix - e.last_update_unix <= STALE_AFTER_SECS
                    })
                    .unwrap_or(false)
            })
            .count()
    }

    /// RSI(14) over the primary exchange's rolling window.
    pub fn rsi_14(&self, crypto: Crypto) -> Option<f64> {
        let map = self.series.read();
        let entry = map.get(&(crypto, PRIMARY_EXCHANGE))?;
        let prices: Vec<f64> = entry.mids.iter().copied().collect();
        crate::indicators::rsi(&prices, 14)
    }

    /// Open price for `epoch`, if one was observed.
    pub fn epoch_open(&self, crypto: Crypto, epoch: Epoch) -> Option<f64> {
        self.epoch_opens
            .read()
            .get(&crypto)
            .and_then(|book| book.get(&epoch).copied())
    }

    /// Consecutive inter-epoch returns from the epoch-open book, oldest first.
    pub fn epoch_returns(&self, crypto: Crypto) -> Vec<f64> {
        let opens = self.epoch_opens.read();
        let Some(book) = opens.get(&crypto) else {
            return Vec::new();
        };
        let prices: Vec<f64> = book.values().copied().collect();
        crate::indicators::step_returns(&prices)
    }

    pub fn funding_rate(&self, crypto: Crypto) -> Option<f64> {
        self.funding.read().get(&crypto).copied()
    }

    /// Resolved directions of recent epochs, oldest first (≤ OUTCOME_MEMORY).
    pub fn outcome_history(&self, crypto: Crypto) -> Vec<Side> {
        self.outcomes
            .read()
            .get(&crypto)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for PriceFeed {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_window_trims_to_history_len() {
        let feed = PriceFeed::new();
        for i in 0..(HISTORY_LEN + 7) {
            feed.record_mid_at(Crypto::Btc, "binance", 100.0 + i as f64, 1_000 + i as i64);
        }
        let mids = feed.mids(Crypto::Btc);
        let series = &mids["binance"];
        assert_eq!(series.len(), HISTORY_LEN);
        // Oldest entries were evicted.
        assert!((series[0] - 107.0).abs() < 1e-9);
    }

    #[test]
    fn non_finite_and_non_positive_mids_dropped() {
        let feed = PriceFeed::new();
        feed.record_mid_at(Crypto::Eth, "kraken", f64::NAN, 10);
        feed.record_mid_at(Crypto::Eth, "kraken", -5.0, 10);
        feed.record_mid_at(Crypto::Eth, "kraken", 0.0, 10);
        assert!(feed.mids(Crypto::Eth).is_empty());
    }

    #[test]
    fn live_exchange_count_respects_staleness() {
        let feed = PriceFeed::new();
        feed.record_mid_at(Crypto::Btc, "binance", 95_500.0, 1_000);
        feed.record_mid_at(Crypto::Btc, "coinbase", 95_505.0, 1_000);
        feed.record_mid_at(Crypto::Btc, "kraken", 95_510.0, 900);

        // kraken is 100 s old at t=1000 — stale.
        assert_eq!(feed.live_exchange_count(Crypto::Btc, 1_000), 2);
        assert_eq!(feed.live_exchange_count(Crypto::Btc, 1_020), 2);
        assert_eq!(feed.live_exchange_count(Crypto::Btc, 2_000), 0);
    }

    #[test]
    fn epoch_open_is_first_primary_mid_of_epoch() {
        let feed = PriceFeed::new();
        let t0 = 1_704_067_200; // on the grid
        feed.record_mid_at(Crypto::Sol, "binance", 100.0, t0 + 1);
        feed.record_mid_at(Crypto::Sol, "binance", 105.0, t0 + 10);
        feed.record_mid_at(Crypto::Sol, "binance", 110.0, t0 + 901);

        let e0 = epoch_of(t0);
        assert_eq!(feed.epoch_open(Crypto::Sol, e0), Some(100.0));
        assert_eq!(feed.epoch_open(Crypto::Sol, e0 + 1), Some(110.0));

        // Non-primary exchanges never set epoch opens.
        feed.record_mid_at(Crypto::Xrp, "kraken", 2.0, t0 + 1);
        assert_eq!(feed.epoch_open(Crypto::Xrp, e0), None);
    }

    #[test]
    fn epoch_returns_from_open_book() {
        let feed = PriceFeed::new();
        let t0 = 1_704_067_200;
        feed.record_mid_at(Crypto::Btc, "binance", 100.0, t0);
        feed.record_mid_at(Crypto::Btc, "binance", 102.0, t0 + 900);
        feed.record_mid_at(Crypto::Btc, "binance", 101.0, t0 + 1_800);

        let returns = feed.epoch_returns(Crypto::Btc);
        assert_eq!(returns.len(), 2);
        assert!((returns[0] - 0.02).abs() < 1e-12);
        assert!(returns[1] < 0.0);
    }

    #[test]
    fn outcome_ring_is_bounded() {
        let feed = PriceFeed::new();
        for _ in 0..4 {
            feed.record_outcome(Crypto::Btc, Side::Up);
        }
        for _ in 0..3 {
            feed.record_outcome(Crypto::Btc, Side::Down);
        }
        let history = feed.outcome_history(Crypto::Btc);
        assert_eq!(history.len(), OUTCOME_MEMORY);
        assert_eq!(history[OUTCOME_MEMORY - 1], Side::Down);
        assert_eq!(history[0], Side::Up);
    }

    #[test]
    fn rsi_requires_fifteen_samples() {
        let feed = PriceFeed::new();
        for i in 0..14 {
            feed.record_mid_at(Crypto::Btc, "binance", 100.0 + i as f64, i as i64);
        }
        assert!(feed.rsi_14(Crypto::Btc).is_none());
        feed.record_mid_at(Crypto::Btc, "binance", 115.0, 15);
        assert!(feed.rsi_14(Crypto::Btc).is_some());
    }

    #[test]
    fn funding_rate_roundtrip() {
        let feed = PriceFeed::new();
        assert_eq!(feed.funding_rate(Crypto::Eth), None);
        feed.set_funding_rate(Crypto::Eth, 0.0004);
        assert_eq!(feed.funding_rate(Crypto::Eth), Some(0.0004));
        feed.set_funding_rate(Crypto::Eth, f64::NAN);
        assert_eq!(feed.funding_rate(Crypto::Eth), Some(0.0004));
    }
}
