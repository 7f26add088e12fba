// =============================================================================
// FilterStage (§4.8)
// =============================================================================
//
// Runs QuantSignal per symbol with the bot's configured weights and
// threshold, drops symbols that don't pass, and writes the score breakdown
// back into `SymbolMarketData` so DecisionStage prompts can cite it without
// recomputing anything.
// =============================================================================

use async_trait::async_trait;
use tracing::info;

use crate::pipeline::{Stage, StageOutcome};
use crate::quant_signal::{self, QuantSignalResult};
use crate::state::{QuantSignalWeights, State};

pub struct FilterStage {
    weights: QuantSignalWeights,
    threshold: i32,
    timeframes: Vec<String>,
}

impl FilterStage {
    pub fn new(weights: QuantSignalWeights, threshold: i32, timeframes: Vec<String>) -> Self {
        Self {
            weights,
            threshold,
            timeframes,
        }
    }
}

#[async_trait]
impl Stage for FilterStage {
    fn name(&self) -> &'static str {
        "filtered_symbols"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["market_data"]
    }

    async fn run(&self, state: &mut State) -> anyhow::Result<StageOutcome> {
        let mut kept = Vec::with_capacity(state.symbols.len());

        for symbol in state.symbols.clone() {
            let Some(data) = state.market_data.get_mut(&symbol) else {
                continue;
            };

            let QuantSignalResult {
                composite,
                breakdown,
                pass_filter,
                ..
            } = quant_signal::evaluate(&data.indicators, data.funding_rate, &self.timeframes, &self.weights, self.threshold);

            data.quant_score = Some(composite);
            for (name, value) in breakdown {
                data.indicators.insert(format!("quant_{name}"), value);
            }

            if pass_filter {
                kept.push(symbol);
            }
        }

        info!(
            bot_id = state.bot_id,
            candidates = state.symbols.len(),
            kept = kept.len(),
            "quant signal filter applied"
        );
        state.symbols = kept;

        Ok(StageOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SymbolMarketData;
    use std::collections::HashMap;

    fn timeframes() -> Vec<String> {
        vec!["4h".to_string()]
    }

    #[tokio::test]
    async fn drops_symbols_below_threshold() {
        let stage = FilterStage::new(QuantSignalWeights::default(), 90, timeframes());
        let mut state = State::new(1, "test".to_string(), 1000.0, Vec::new());
        state.symbols = vec!["BTCUSDT".to_string()];
        state.market_data.insert(
            "BTCUSDT".to_string(),
            SymbolMarketData {
                indicators: HashMap::new(),
                ..Default::default()
            },
        );

        stage.run(&mut state).await.unwrap();

        assert!(state.symbols.is_empty());
        assert!(state.market_data["BTCUSDT"].quant_score.is_some());
    }

    #[tokio::test]
    async fn keeps_symbols_at_or_above_threshold() {
        let stage = FilterStage::new(QuantSignalWeights::default(), 10, timeframes());
        let mut state = State::new(1, "test".to_string(), 1000.0, Vec::new());
        state.symbols = vec!["BTCUSDT".to_string()];
        state.market_data.insert(
            "BTCUSDT".to_string(),
            SymbolMarketData {
                indicators: HashMap::new(),
                ..Default::default()
            },
        );

        stage.run(&mut state).await.unwrap();

        assert_eq!(state.symbols, vec!["BTCUSDT".to_string()]);
    }
}
