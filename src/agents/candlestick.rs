// =============================================================================
// Candlestick Agent — three-soldiers / three-crows on recent mids
// =============================================================================
//
// Builds three pseudo-candles from the primary exchange's rolling mid window
// (five samples per candle) and looks for the classic continuation patterns:
// three consecutive rising bodies (three white soldiers) or three falling
// ones (three black crows). Anything else is Neutral; too little data is an
// abstention.
// =============================================================================

use anyhow::Result;

use crate::agents::{Agent, Vote};
use crate::feed::PRIMARY_EXCHANGE;
use crate::types::{MarketSnapshot, VoteDirection};

/// Samples folded into one pseudo-candle.
const CANDLE_SAMPLES: usize = 5;
/// Candles inspected for the pattern.
const PATTERN_LEN: usize = 3;

/// Total move that earns full confidence.
const FULL_MOVE: f64 = 0.004;

struct PseudoCandle {
    open: f64,
    close: f64,
}

fn build_candles(mids: &[f64]) -> Option<Vec<PseudoCandle>> {
    let needed = CANDLE_SAMPLES * PATTERN_LEN;
    if mids.len() < needed {
        return None;
    }
    let recent = &mids[mids.len() - needed..];
    Some(
        recent
            .chunks(CANDLE_SAMPLES)
            .map(|chunk| PseudoCandle {
                open: chunk[0],
                close: chunk[chunk.len() - 1],
            })
            .collect(),
    )
}

pub struct CandlestickAgent;

impl CandlestickAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Agent for CandlestickAgent {
    fn name(&self) -> &'static str {
        "candlestick"
    }

    fn analyze(&mut self, snapshot: &MarketSnapshot) -> Result<Vote> {
        let Some(mids) = snapshot.exchange_mids.get(PRIMARY_EXCHANGE) else {
            return Ok(Vote::skip(self.name()));
        };
        let Some(candles) = build_candles(mids) else {
            return Ok(Vote::skip(self.name()));
        };

        let soldiers = candles.windows(2).all(|w| w[1].close > w[0].close)
            && candles.iter().all(|c| c.close > c.open);
        let crows = candles.windows(2).all(|w| w[1].close < w[0].close)
            && candles.iter().all(|c| c.close < c.open);

        let direction = if soldiers {
            VoteDirection::Up
        } else if crows {
            VoteDirection::Down
        } else {
            return Ok(Vote::neutral(self.name(), 0.15, 0.65));
        };

        let first_open = candles[0].open;
        let last_close = candles[candles.len() - 1].close;
        let total_move = if first_open > 0.0 {
            ((last_close - first_open) / first_open).abs()
        } else {
            0.0
        };
        let confidence = (total_move / FULL_MOVE).min(1.0) * 0.7;

        Ok(Vote::new(self.name(), direction, confidence, 0.65)
            .with_details(serde_json::json!({
                "pattern": if soldiers { "three_soldiers" } else { "three_crows" },
                "total_move": total_move,
            })))
    }
}
