// =============================================================================
// Volume-Weighted Average Price (VWAP)
// =============================================================================
//
// VWAP = Σ(typical_price_i * volume_i) / Σ(volume_i), over the supplied
// window. Callers typically pass the current session's candles to get a
// rolling read rather than a true session-anchored VWAP.
// =============================================================================

use crate::exchange::Candle;

pub fn calculate_vwap(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }

    let mut pv_sum = 0.0;
    let mut vol_sum = 0.0;
    for c in candles {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv_sum += typical * c.volume;
        vol_sum += c.volume;
    }

    if vol_sum <= 0.0 {
        return None;
    }

    let vwap = pv_sum / vol_sum;
    if vwap.is_finite() {
        Some(vwap)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high,
            low,
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
    fn vwap_zero_volume_returns_none() {
        let candles = vec![candle(101.0, 99.0, 100.0, 0.0)];
        assert!(calculate_vwap(&candles).is_none());
    }

    #[test]
    fn vwap_weights_by_volume() {
        let candles = vec![
            candle(101.0, 99.0, 100.0, 1.0),
            candle(201.0, 199.0, 200.0, 9.0),
        ];
        let vwap = calculate_vwap(&candles).unwrap();
        assert!(vwap > 150.0, "heavier volume bar should dominate, got {vwap}");
    }
}
