// =============================================================================
// IndicatorKit — neutral-default wrapper over the raw indicator functions
// =============================================================================
//
// §4.5's edge policy: indicator computation must never raise. Every raw
// `calculate_*` function already returns `None`/empty on insufficient or
// non-finite data; this module is the single place that turns those into the
// well-defined neutral values QuantSignal and the prompt builders are allowed
// to assume are always present:
//   - oscillators (RSI, Stochastic %K/%D) -> 50.0 (neither overbought nor
//     oversold)
//   - trend strength (ADX) -> 0.0 (no trend)
//   - MACD / histogram / ROC / OBV slope -> 0.0 (no momentum)
//   - Bollinger Bands -> all bands pinned to the last close, width 0.0
//   - ATR / ATR% -> 0.0
//   - volume ratio -> 1.0 (average volume)
//   - VWAP -> last close
// =============================================================================

use std::collections::HashMap;

use crate::exchange::Candle;

use super::adx::calculate_adx;
use super::atr::{calculate_atr, calculate_atr_pct};
use super::bollinger::calculate_bollinger;
use super::ema::calculate_ema;
use super::macd::calculate as calculate_macd_default;
use super::obv::obv_slope;
use super::roc::calculate_roc;
use super::rsi::calculate_rsi;
use super::stochastic::calculate_stochastic;
use super::volume::calculate_volume_stats;
use super::vwap::calculate_vwap;

const RSI_PERIOD: usize = 14;
const ADX_PERIOD: usize = 14;
const ATR_PERIOD: usize = 14;
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_STDDEV: f64 = 2.0;
const ROC_PERIOD: usize = 10;
const EMA_FAST: usize = 20;
const EMA_SLOW: usize = 50;
const EMA_TREND: usize = 200;
const STOCH_K: usize = 14;
const STOCH_D: usize = 3;
const VOLUME_LOOKBACK: usize = 20;
const OBV_LOOKBACK: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct IndicatorBundle {
    pub rsi: f64,
    pub adx: f64,
    pub atr: f64,
    pub atr_pct: f64,
    pub bollinger_upper: f64,
    pub bollinger_middle: f64,
    pub bollinger_lower: f64,
    pub bollinger_width: f64,
    pub roc: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub ema_trend: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub stochastic_k: f64,
    pub stochastic_d: f64,
    pub obv_slope: f64,
    pub volume_ratio: f64,
    pub vwap: f64,
}

/// Compute every indicator over `candles` (oldest first, most recent last),
/// substituting the documented neutral value wherever the raw calculation
/// declines to produce one. `last_close` is the fallback used for
/// price-scaled neutral defaults (Bollinger, VWAP) when there isn't enough
/// history at all.
pub fn compute_indicator_bundle(candles: &[Candle]) -> IndicatorBundle {
    let last_close = candles.last().map(|c| c.close).unwrap_or(0.0);
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let rsi = calculate_rsi(&closes, RSI_PERIOD).last().copied().unwrap_or(50.0);
    let adx = calculate_adx(candles, ADX_PERIOD).unwrap_or(0.0);
    let atr = calculate_atr(candles, ATR_PERIOD).unwrap_or(0.0);
    let atr_pct = calculate_atr_pct(candles, ATR_PERIOD).unwrap_or(0.0);

    let bollinger = calculate_bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_STDDEV);
    let (bollinger_upper, bollinger_middle, bollinger_lower, bollinger_width) = match bollinger {
        Some(b) => (b.upper, b.middle, b.lower, b.width),
        None => (last_close, last_close, last_close, 0.0),
    };

    let roc = calculate_roc(&closes, ROC_PERIOD).last().copied().unwrap_or(0.0);

    let ema_fast = calculate_ema(&closes, EMA_FAST).last().copied().unwrap_or(last_close);
    let ema_slow = calculate_ema(&closes, EMA_SLOW).last().copied().unwrap_or(last_close);
    let ema_trend = calculate_ema(&closes, EMA_TREND).last().copied().unwrap_or(last_close);

    let macd_result = calculate_macd_default(&closes);
    let (macd, macd_signal, macd_histogram) = match macd_result {
        Some(m) => (m.macd, m.signal, m.histogram),
        None => (0.0, 0.0, 0.0),
    };

    let stoch = calculate_stochastic(candles, STOCH_K, STOCH_D);
    let (stochastic_k, stochastic_d) = match stoch {
        Some(s) => (s.k, s.d),
        None => (50.0, 50.0),
    };

    let obv = obv_slope(candles, OBV_LOOKBACK).unwrap_or(0.0);

    let volume_ratio = calculate_volume_stats(candles, VOLUME_LOOKBACK)
        .map(|v| v.ratio)
        .unwrap_or(1.0);

    let vwap = calculate_vwap(candles).unwrap_or(last_close);

    IndicatorBundle {
        rsi,
        adx,
        atr,
        atr_pct,
        bollinger_upper,
        bollinger_middle,
        bollinger_lower,
        bollinger_width,
        roc,
        ema_fast,
        ema_slow,
        ema_trend,
        macd,
        macd_signal,
        macd_histogram,
        stochastic_k,
        stochastic_d,
        obv_slope: obv,
        volume_ratio,
        vwap,
    }
}

/// Flatten a bundle into the `{name}_{timeframe}` keyed map that
/// `SymbolMarketData::indicators` stores (§3).
pub fn flatten_bundle(bundle: &IndicatorBundle, timeframe: &str) -> HashMap<String, f64> {
    let mut map = HashMap::with_capacity(19);
    let mut put = |name: &str, value: f64| {
        map.insert(format!("{name}_{timeframe}"), value);
    };
    put("rsi", bundle.rsi);
    put("adx", bundle.adx);
    put("atr", bundle.atr);
    put("atr_pct", bundle.atr_pct);
    put("bollinger_upper", bundle.bollinger_upper);
    put("bollinger_middle", bundle.bollinger_middle);
    put("bollinger_lower", bundle.bollinger_lower);
    put("bollinger_width", bundle.bollinger_width);
    put("roc", bundle.roc);
    put("ema_fast", bundle.ema_fast);
    put("ema_slow", bundle.ema_slow);
    put("ema_trend", bundle.ema_trend);
    put("macd", bundle.macd);
    put("macd_signal", bundle.macd_signal);
    put("macd_histogram", bundle.macd_histogram);
    put("stochastic_k", bundle.stochastic_k);
    put("stochastic_d", bundle.stochastic_d);
    put("obv_slope", bundle.obv_slope);
    put("volume_ratio", bundle.volume_ratio);
    put("vwap", bundle.vwap);
    map
}
