// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line   = EMA(fast) - EMA(slow)
// Signal line = EMA(signal_period) of the MACD line
// Histogram   = MACD line - Signal line
//
// Standard parameters: fast=12, slow=26, signal=9.
// =============================================================================

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD reading for `closes`.
///
/// Returns `None` when there is not enough history to seed both the slow EMA
/// and the signal-line EMA of the MACD series.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }

    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);
    if fast_ema.is_empty() || slow_ema.is_empty() {
        return None;
    }

    // Align series: fast_ema has `closes.len() - fast + 1` points, slow_ema
    // has `closes.len() - slow + 1`. Take the tail of fast_ema matching
    // slow_ema's length so both series line up on the same timestamps.
    let offset = fast_ema.len().checked_sub(slow_ema.len())?;
    let macd_series: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, &slow_v)| fast_ema[i + offset] - slow_v)
        .collect();

    if macd_series.len() < signal_period {
        return None;
    }

    let signal_series = calculate_ema(&macd_series, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_series.last()?;
    let histogram = macd - signal;

    if macd.is_finite() && signal.is_finite() {
        Some(MacdResult {
            macd,
            signal,
            histogram,
        })
    } else {
        None
    }
}

/// Convenience wrapper with the standard 12/26/9 parameters.
pub fn calculate(closes: &[f64]) -> Option<MacdResult> {
    calculate_macd(closes, 12, 26, 9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data_returns_none() {
        let closes = vec![1.0, 2.0, 3.0];
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_uptrend_is_positive() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        let result = calculate(&closes).unwrap();
        assert!(result.macd > 0.0, "expected positive MACD in an uptrend");
    }

    #[test]
    fn macd_downtrend_is_negative() {
        let closes: Vec<f64> = (1..=60).rev().map(|x| x as f64).collect();
        let result = calculate(&closes).unwrap();
        assert!(result.macd < 0.0, "expected negative MACD in a downtrend");
    }

    #[test]
    fn macd_zero_period_returns_none() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
    }
}
