// =============================================================================
// QuantSignal (§4.6)
// =============================================================================
//
// Turns one symbol's indicator map + funding rate into a composite score in
// [0,100] the FilterStage gates on. Each of the four sub-scores starts from a
// neutral base of 50 and is nudged up/down by documented rules, then clamped.
// The rule table intentionally mirrors the sign conventions called out in the
// specification — changing a `+`/`-` here changes what the bot treats as
// bullish, so each rule carries the rationale inline.
// =============================================================================

use std::collections::HashMap;

use crate::state::QuantSignalWeights;

const BASE_SCORE: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct QuantSignalResult {
    pub composite: f64,
    pub breakdown: HashMap<String, f64>,
    pub reasons: Vec<String>,
    pub pass_filter: bool,
}

fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

/// Looks up `{name}_{timeframe}` in the flattened indicator map, falling back
/// to `default` when the key is absent (a timeframe the bot doesn't track).
fn lookup(indicators: &HashMap<String, f64>, name: &str, timeframe: &str, default: f64) -> f64 {
    indicators
        .get(&format!("{name}_{timeframe}"))
        .copied()
        .unwrap_or(default)
}

/// Trend sub-score: rewards multi-timeframe EMA alignment (fast > slow > trend
/// on each tracked timeframe) and price above the 200-period EMA.
fn score_trend(indicators: &HashMap<String, f64>, timeframes: &[String], reasons: &mut Vec<String>) -> f64 {
    let mut score = BASE_SCORE;
    let mut aligned_count = 0;

    for tf in timeframes {
        let ema_fast = lookup(indicators, "ema_fast", tf, 0.0);
        let ema_slow = lookup(indicators, "ema_slow", tf, 0.0);
        let ema_trend = lookup(indicators, "ema_trend", tf, 0.0);
        let vwap = lookup(indicators, "vwap", tf, 0.0);

        if ema_fast > ema_slow && ema_slow > ema_trend {
            aligned_count += 1;
            score += 10.0;
        } else if ema_fast < ema_slow && ema_slow < ema_trend {
            aligned_count += 1;
            score -= 10.0;
        }

        if vwap > ema_trend && ema_trend > 0.0 {
            score += 5.0;
        }
    }

    if aligned_count == timeframes.len() && !timeframes.is_empty() {
        reasons.push("EMA alignment agrees across every tracked timeframe".to_string());
    }

    clamp_score(score)
}

/// Momentum sub-score: penalizes RSI extremes, rewards MACD histogram
/// agreement (same sign) across timeframes.
fn score_momentum(indicators: &HashMap<String, f64>, timeframes: &[String], reasons: &mut Vec<String>) -> f64 {
    let mut score = BASE_SCORE;
    let mut histogram_signs = Vec::new();

    for tf in timeframes {
        let rsi = lookup(indicators, "rsi", tf, 50.0);
        if rsi > 80.0 {
            score -= 15.0;
            reasons.push(format!("RSI overbought on {tf} ({rsi:.1})"));
        } else if rsi < 20.0 {
            score -= 15.0;
            reasons.push(format!("RSI oversold on {tf} ({rsi:.1})"));
        } else if rsi > 55.0 {
            score += 5.0;
        } else if rsi < 45.0 {
            score -= 5.0;
        }

        let histogram = lookup(indicators, "macd_histogram", tf, 0.0);
        histogram_signs.push(histogram.signum());
    }

    let all_positive = !histogram_signs.is_empty() && histogram_signs.iter().all(|&s| s > 0.0);
    let all_negative = !histogram_signs.is_empty() && histogram_signs.iter().all(|&s| s < 0.0);
    if all_positive {
        score += 10.0;
        reasons.push("MACD histogram positive across all timeframes".to_string());
    } else if all_negative {
        score -= 10.0;
        reasons.push("MACD histogram negative across all timeframes".to_string());
    }

    clamp_score(score)
}

/// Volume sub-score: rewards volume ratio > 1.5 and OBV slope > 0 agreeing on
/// both of the first two tracked timeframes.
fn score_volume(indicators: &HashMap<String, f64>, timeframes: &[String], reasons: &mut Vec<String>) -> f64 {
    let mut score = BASE_SCORE;
    let mut obv_positive_count = 0;
    let sample: Vec<&String> = timeframes.iter().take(2).collect();

    for tf in &sample {
        let ratio = lookup(indicators, "volume_ratio", tf, 1.0);
        if ratio > 1.5 {
            score += 10.0;
        } else if ratio < 0.5 {
            score -= 10.0;
        }

        let obv = lookup(indicators, "obv_slope", tf, 0.0);
        if obv > 0.0 {
            obv_positive_count += 1;
        }
    }

    if obv_positive_count == sample.len() && !sample.is_empty() {
        score += 10.0;
        reasons.push("OBV rising on both tracked timeframes".to_string());
    }

    clamp_score(score)
}

/// Sentiment sub-score: funding-rate-driven. Healthy band (0 – 0.05%) is
/// neutral-to-slightly-bullish, overheated (> 0.1%) penalizes longs, negative
/// funding is read as a long opportunity (shorts are paying longs).
fn score_sentiment(funding_rate_pct: f64, reasons: &mut Vec<String>) -> f64 {
    let mut score = BASE_SCORE;

    if funding_rate_pct < 0.0 {
        score += 15.0;
        reasons.push(format!("negative funding rate ({funding_rate_pct:.4}%) favors longs"));
    } else if funding_rate_pct > 0.1 {
        score -= 15.0;
        reasons.push(format!("overheated funding rate ({funding_rate_pct:.4}%)"));
    } else if funding_rate_pct <= 0.05 {
        score += 5.0;
    } else {
        score -= 5.0;
    }

    clamp_score(score)
}

/// Compute the composite QuantSignal score for one symbol.
///
/// `indicators` is the flattened `{name}_{timeframe}` map from
/// `SymbolMarketData::indicators`; `timeframes` is the bot's configured
/// timeframe list, used to know which keys to probe.
pub fn evaluate(
    indicators: &HashMap<String, f64>,
    funding_rate_pct: f64,
    timeframes: &[String],
    weights: &QuantSignalWeights,
    threshold: i32,
) -> QuantSignalResult {
    let mut reasons = Vec::new();

    let trend = score_trend(indicators, timeframes, &mut reasons);
    let momentum = score_momentum(indicators, timeframes, &mut reasons);
    let volume = score_volume(indicators, timeframes, &mut reasons);
    let sentiment = score_sentiment(funding_rate_pct, &mut reasons);

    let composite =
        weights.trend * trend + weights.momentum * momentum + weights.volume * volume + weights.sentiment * sentiment;
    let composite = clamp_score(composite);

    let mut breakdown = HashMap::with_capacity(4);
    breakdown.insert("trend".to_string(), trend);
    breakdown.insert("momentum".to_string(), momentum);
    breakdown.insert("volume".to_string(), volume);
    breakdown.insert("sentiment".to_string(), sentiment);

    QuantSignalResult {
        composite,
        breakdown,
        reasons,
        pass_filter: composite >= threshold as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeframes() -> Vec<String> {
        vec!["3m".to_string(), "4h".to_string()]
    }

    #[test]
    fn neutral_indicators_yield_base_composite() {
        let indicators = HashMap::new();
        let weights = QuantSignalWeights::default();
        let result = evaluate(&indicators, 0.02, &timeframes(), &weights, 50);
        assert!((result.composite - 50.0).abs() < 1.0);
    }

    #[test]
    fn bullish_alignment_raises_trend_score() {
        let mut indicators = HashMap::new();
        for tf in &["3m", "4h"] {
            indicators.insert(format!("ema_fast_{tf}"), 110.0);
            indicators.insert(format!("ema_slow_{tf}"), 105.0);
            indicators.insert(format!("ema_trend_{tf}"), 100.0);
            indicators.insert(format!("vwap_{tf}"), 108.0);
        }
        let weights = QuantSignalWeights::default();
        let result = evaluate(&indicators, 0.0, &timeframes(), &weights, 50);
        assert!(result.breakdown["trend"] > 50.0);
    }

    #[test]
    fn overbought_rsi_penalizes_momentum() {
        let mut indicators = HashMap::new();
        indicators.insert("rsi_3m".to_string(), 85.0);
        indicators.insert("rsi_4h".to_string(), 85.0);
        let weights = QuantSignalWeights::default();
        let result = evaluate(&indicators, 0.0, &timeframes(), &weights, 50);
        assert!(result.breakdown["momentum"] < 50.0);
        assert!(result.reasons.iter().any(|r| r.contains("overbought")));
    }

    #[test]
    fn negative_funding_favors_sentiment() {
        let indicators = HashMap::new();
        let weights = QuantSignalWeights::default();
        let result = evaluate(&indicators, -0.02, &timeframes(), &weights, 50);
        assert!(result.breakdown["sentiment"] > 50.0);
    }

    #[test]
    fn overheated_funding_penalizes_sentiment() {
        let indicators = HashMap::new();
        let weights = QuantSignalWeights::default();
        let result = evaluate(&indicators, 0.2, &timeframes(), &weights, 50);
        assert!(result.breakdown["sentiment"] < 50.0);
    }

    #[test]
    fn pass_filter_respects_threshold() {
        let indicators = HashMap::new();
        let weights = QuantSignalWeights::default();
        let low_bar = evaluate(&indicators, 0.0, &timeframes(), &weights, 10);
        assert!(low_bar.pass_filter);
        let high_bar = evaluate(&indicators, 0.0, &timeframes(), &weights, 99);
        assert!(!high_bar.pass_filter);
    }
}
