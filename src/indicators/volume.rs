// =============================================================================
// Volume statistics
// =============================================================================
//
// Simple descriptive stats over a candle window, used by QuantSignal's volume
// sub-score (§4.6): the current bar's volume relative to its recent average.
// =============================================================================

use crate::exchange::Candle;

#[derive(Debug, Clone, Copy)]
pub struct VolumeStats {
    pub current: f64,
    pub average: f64,
    /// current / average, or 1.0 when the average is zero (neutral — §4.5).
    pub ratio: f64,
}

pub fn calculate_volume_stats(candles: &[Candle], lookback: usize) -> Option<VolumeStats> {
    if lookback == 0 || candles.len() < lookback {
        return None;
    }

    let window = &candles[candles.len() - lookback..];
    let current = window.last()?.volume;
    let average = window.iter().map(|c| c.volume).sum::<f64>() / lookback as f64;
    let ratio = if average > 0.0 { current / average } else { 1.0 };

    if current.is_finite() && average.is_finite() && ratio.is_finite() {
        Some(VolumeStats {
            current,
            average,
            ratio,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume,
            quote_volume: volume,
            trades_count: 1,
            taker_buy_volume: volume / 2.0,
            taker_buy_quote_volume: volume / 2.0,
            is_closed: true,
        }
    }

    #[test]
    fn ratio_above_one_on_volume_spike() {
        let mut candles = vec![candle(10.0); 19];
        candles.push(candle(50.0));
        let stats = calculate_volume_stats(&candles, 20).unwrap();
        assert!(stats.ratio > 1.0);
    }

    #[test]
    fn zero_average_yields_neutral_ratio() {
        let candles = vec![candle(0.0); 20];
        let stats = calculate_volume_stats(&candles, 20).unwrap();
        assert_eq!(stats.ratio, 1.0);
    }

    #[test]
    fn insufficient_data_returns_none() {
        let candles = vec![candle(10.0); 3];
        assert!(calculate_volume_stats(&candles, 20).is_none());
    }
}
