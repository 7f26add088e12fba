// =============================================================================
// Stochastic Oscillator (%K / %D)
// =============================================================================
//
// %K = (close - lowest_low_n) / (highest_high_n - lowest_low_n) * 100
// %D = SMA(%K, d_period)
//
// Readings > 80 are conventionally "overbought", < 20 "oversold" — the same
// convention IndicatorKit uses for RSI (§4.5 edge policy: neutral = 50).
// =============================================================================

use crate::exchange::Candle;

#[derive(Debug, Clone, Copy)]
pub struct StochasticResult {
    pub k: f64,
    pub d: f64,
}

pub fn calculate_stochastic(
    candles: &[Candle],
    k_period: usize,
    d_period: usize,
) -> Option<StochasticResult> {
    if k_period == 0 || d_period == 0 || candles.len() < k_period + d_period {
        return None;
    }

    let mut k_values = Vec::with_capacity(d_period);
    for end in (candles.len() - d_period)..candles.len() {
        let window = &candles[end + 1 - k_period..=end];
        let highest = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let close = window.last()?.close;

        let range = highest - lowest;
        let k = if range > 0.0 {
            (close - lowest) / range * 100.0
        } else {
            50.0
        };
        k_values.push(k);
    }

    let k = *k_values.last()?;
    let d = k_values.iter().sum::<f64>() / k_values.len() as f64;

    if k.is_finite() && d.is_finite() {
        Some(StochasticResult { k, d })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            quote_volume: 1.0,
            trades_count: 1,
            taker_buy_volume: 0.5,
            taker_buy_quote_volume: 0.5,
            is_closed: true,
        }
    }

    #[test]
    fn stochastic_at_range_top_is_100() {
        let mut candles = vec![candle(110.0, 90.0, 95.0); 20];
        candles.push(candle(110.0, 90.0, 110.0));
        let result = calculate_stochastic(&candles, 14, 3).unwrap();
        assert!(result.k > 90.0);
    }

    #[test]
    fn stochastic_insufficient_data_returns_none() {
        let candles = vec![candle(110.0, 90.0, 100.0); 5];
        assert!(calculate_stochastic(&candles, 14, 3).is_none());
    }
}
