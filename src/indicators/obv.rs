// =============================================================================
// On-Balance Volume (OBV)
// =============================================================================
//
// Running total: add the bar's volume when close > prior close, subtract it
// when close < prior close, carry forward unchanged on a tie. Absolute level
// is meaningless in isolation; callers read the *slope* (positive/negative)
// over a window.
// =============================================================================

use crate::exchange::Candle;

pub fn calculate_obv(candles: &[Candle]) -> Vec<f64> {
    if candles.is_empty() {
        return Vec::new();
    }

    let mut obv = Vec::with_capacity(candles.len());
    obv.push(0.0);
    for window in candles.windows(2) {
        let (prev, cur) = (&window[0], &window[1]);
        let last = *obv.last().unwrap();
        let next = if cur.close > prev.close {
            last + cur.volume
        } else if cur.close < prev.close {
            last - cur.volume
        } else {
            last
        };
        obv.push(next);
    }
    obv
}

/// Slope of OBV over the trailing `lookback` bars: positive means
/// accumulation, negative means distribution. `None` when there isn't enough
/// history.
pub fn obv_slope(candles: &[Candle], lookback: usize) -> Option<f64> {
    if lookback == 0 || candles.len() < lookback + 1 {
        return None;
    }
    let series = calculate_obv(candles);
    let start = series.len() - lookback - 1;
    let delta = series.last()? - series.get(start)?;
    if delta.is_finite() {
        Some(delta)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume,
            quote_volume: volume * close,
            trades_count: 1,
            taker_buy_volume: volume / 2.0,
            taker_buy_quote_volume: volume * close / 2.0,
            is_closed: true,
        }
    }

    #[test]
    fn obv_accumulates_on_rising_closes() {
        let candles = vec![candle(100.0, 10.0), candle(101.0, 5.0), candle(102.0, 3.0)];
        let obv = calculate_obv(&candles);
        assert_eq!(obv, vec![0.0, 5.0, 8.0]);
    }

    #[test]
    fn obv_subtracts_on_falling_closes() {
        let candles = vec![candle(100.0, 10.0), candle(99.0, 5.0)];
        let obv = calculate_obv(&candles);
        assert_eq!(obv, vec![0.0, -5.0]);
    }

    #[test]
    fn obv_empty_input_returns_empty() {
        assert!(calculate_obv(&[]).is_empty());
    }

    #[test]
    fn obv_slope_insufficient_data_returns_none() {
        let candles = vec![candle(100.0, 1.0)];
        assert!(obv_slope(&candles, 5).is_none());
    }

    #[test]
    fn obv_slope_positive_on_uptrend() {
        let candles: Vec<Candle> = (1..=10).map(|i| candle(100.0 + i as f64, 1.0)).collect();
        let slope = obv_slope(&candles, 5).unwrap();
        assert!(slope > 0.0);
    }
}
