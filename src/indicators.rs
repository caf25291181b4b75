// =============================================================================
// Price-series helpers — RSI (Wilder's smoothing) and simple returns
// =============================================================================
//
// RSI thresholds used by the committee:  > 70 overbought,  < 30 oversold.
// =============================================================================

/// Latest RSI value over `prices` with the given `period` (Wilder smoothing).
///
/// Returns `None` when fewer than `period + 1` samples are available or the
/// computation goes non-finite.
pub fn rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();

    // Seed with the SMA of the first `period` deltas.
    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    value.is_finite().then_some(value)
}

/// Fractional return between the first and last element of `prices`.
pub fn window_return(prices: &[f64]) -> Option<f64> {
    let first = *prices.first()?;
    let last = *prices.last()?;
    if first <= 0.0 || prices.len() < 2 {
        return None;
    }
    Some((last - first) / first)
}

/// Consecutive fractional returns over `prices` (one per adjacent pair).
pub fn step_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Mean and population variance of `values`. `None` when empty.
pub fn mean_variance(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_needs_enough_samples() {
        assert!(rsi(&[], 14).is_none());
        assert!(rsi(&vec![1.0; 14], 14).is_none());
        assert!(rsi(&vec![1.0; 15], 14).is_some());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let prices: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let v = rsi(&prices, 14).unwrap();
        assert!((v - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_all_losses_is_0() {
        let prices: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let v = rsi(&prices, 14).unwrap();
        assert!(v.abs() < 1e-9);
    }

    #[test]
    fn rsi_flat_is_50() {
        let prices = vec![100.0; 30];
        let v = rsi(&prices, 14).unwrap();
        assert!((v - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_stays_in_range() {
        let prices = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let v = rsi(&prices, 14).unwrap();
        assert!((0.0..=100.0).contains(&v));
    }

    #[test]
    fn window_return_basic() {
        let r = window_return(&[100.0, 101.0, 102.0]).unwrap();
        assert!((r - 0.02).abs() < 1e-12);
        assert!(window_return(&[100.0]).is_none());
        assert!(window_return(&[]).is_none());
    }

    #[test]
    fn step_returns_len() {
        let r = step_returns(&[100.0, 110.0, 99.0]);
        assert_eq!(r.len(), 2);
        assert!((r[0] - 0.10).abs() < 1e-12);
        assert!(r[1] < 0.0);
    }

    #[test]
    fn mean_variance_basic() {
        let (m, v) = mean_variance(&[1.0, 2.0, 3.0]).unwrap();
        assert!((m - 2.0).abs() < 1e-12);
        assert!((v - 2.0 / 3.0).abs() < 1e-12);
        assert!(mean_variance(&[]).is_none());
    }
}
