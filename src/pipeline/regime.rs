// =============================================================================
// RegimeStage (§4.8, optional)
// =============================================================================
//
// Classifies each symbol from the primary timeframe's ADX + Bollinger
// bandwidth, then aggregates into one bot-wide label. Aggregation follows
// Open Question decision #1 in SPEC_FULL.md §E: sum confidences per
// candidate regime across symbols, label = argmax, `regime_confidence =
// max_sum / total_sum`. Never blocks the cycle — DecisionStage treats the
// label as context only.
// =============================================================================

use async_trait::async_trait;
use tracing::info;

use crate::config::MarketRegimeConfig;
use crate::pipeline::{Stage, StageOutcome};
use crate::state::{MarketRegime, State};

pub struct RegimeStage {
    config: MarketRegimeConfig,
}

impl RegimeStage {
    pub fn new(config: MarketRegimeConfig) -> Self {
        Self { config }
    }
}

/// Classifies one symbol's primary-timeframe ADX/Bollinger reading into a
/// `(regime, confidence)` vote. Direction for trending regimes comes from
/// the fast/slow EMA relationship on the same timeframe.
fn classify(indicators: &std::collections::HashMap<String, f64>, tf: &str, config: &MarketRegimeConfig) -> (MarketRegime, f64) {
    let adx = indicators.get(&format!("adx_{tf}")).copied().unwrap_or(0.0);
    let bb_width = indicators.get(&format!("bollinger_width_{tf}")).copied().unwrap_or(0.0);
    let ema_fast = indicators.get(&format!("ema_fast_{tf}")).copied().unwrap_or(0.0);
    let ema_slow = indicators.get(&format!("ema_slow_{tf}")).copied().unwrap_or(0.0);

    if adx >= config.adx_trending_threshold as f64 {
        let confidence = (adx / 100.0).clamp(0.5, 1.0);
        return if ema_fast >= ema_slow {
            (MarketRegime::TrendingUp, confidence)
        } else {
            (MarketRegime::TrendingDown, confidence)
        };
    }

    if bb_width >= config.bb_width_volatile_threshold {
        let confidence = (bb_width / (2.0 * config.bb_width_volatile_threshold)).clamp(0.5, 1.0);
        return (MarketRegime::Volatile, confidence);
    }

    if bb_width <= config.bb_width_ranging_threshold && config.bb_width_ranging_threshold > 0.0 {
        let confidence = (1.0 - bb_width / config.bb_width_ranging_threshold).clamp(0.5, 1.0);
        return (MarketRegime::Ranging, confidence);
    }

    (MarketRegime::Uncertain, 0.3)
}

#[async_trait]
impl Stage for RegimeStage {
    fn name(&self) -> &'static str {
        "market_regime"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["market_data"]
    }

    async fn run(&self, state: &mut State) -> anyhow::Result<StageOutcome> {
        let mut sums: Vec<(MarketRegime, f64)> = vec![
            (MarketRegime::TrendingUp, 0.0),
            (MarketRegime::TrendingDown, 0.0),
            (MarketRegime::Ranging, 0.0),
            (MarketRegime::Volatile, 0.0),
            (MarketRegime::Uncertain, 0.0),
        ];

        for symbol in &state.symbols {
            let Some(data) = state.market_data.get(symbol) else {
                continue;
            };
            let (regime, confidence) = classify(&data.indicators, &self.config.primary_timeframe, &self.config);
            if let Some(entry) = sums.iter_mut().find(|(r, _)| *r == regime) {
                entry.1 += confidence;
            }
            state.regime_details.insert(format!("{symbol}_{regime}"), confidence);
        }

        let total: f64 = sums.iter().map(|(_, v)| v).sum();
        if total <= 0.0 {
            state.market_regime = Some(MarketRegime::Uncertain);
            state.regime_confidence = 0.0;
            return Ok(StageOutcome::Continue);
        }

        let (label, max_sum) = sums
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap();

        state.market_regime = Some(label);
        state.regime_confidence = max_sum / total;

        info!(bot_id = state.bot_id, regime = %label, confidence = state.regime_confidence, "market regime classified");

        Ok(StageOutcome::Continue)
    }
}
