// =============================================================================
// CoinsPickStage (§B supplemented feature)
// =============================================================================
//
// Narrows the exchange-wide market list to the bot's tradable universe:
// quote-asset filter, a min-notional floor, an explicit include/exclude list,
// then ranks what's left by 24h quote volume and caps it at `limit` symbols.
// Backtest mode and a warm cache both short-circuit straight to the
// preset/cached symbol list, matching the original `coins_pick.py`'s
// cache-first behavior.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::cache::Cache;
use crate::exchange::{ExchangeAdapter, MarketInfo};
use crate::pipeline::{Stage, StageOutcome};
use crate::state::State;
use crate::streaming::StreamManager;

#[derive(Debug, Clone)]
pub struct CoinsPickConfig {
    pub quote_asset: String,
    pub limit: usize,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub min_notional_floor: f64,
    pub subscription_timeframes: Vec<String>,
}

impl Default for CoinsPickConfig {
    fn default() -> Self {
        Self {
            quote_asset: "USDT".to_string(),
            limit: 20,
            include: Vec::new(),
            exclude: Vec::new(),
            min_notional_floor: 5.0,
            subscription_timeframes: vec!["3m".to_string()],
        }
    }
}

pub struct CoinsPickStage {
    exchange: Arc<dyn ExchangeAdapter>,
    cache: Arc<Cache>,
    stream_manager: Option<Arc<StreamManager>>,
    config: CoinsPickConfig,
}

impl CoinsPickStage {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        cache: Arc<Cache>,
        stream_manager: Option<Arc<StreamManager>>,
        config: CoinsPickConfig,
    ) -> Self {
        Self {
            exchange,
            cache,
            stream_manager,
            config,
        }
    }

}

/// Stateless so unit tests can exercise the filtering rule without a real
/// `ExchangeAdapter`.
fn select_universe(markets: &[MarketInfo], config: &CoinsPickConfig) -> Vec<String> {
    let mut candidates: Vec<&MarketInfo> = markets
        .iter()
        .filter(|m| m.quote == config.quote_asset)
        .filter(|m| m.min_notional >= config.min_notional_floor)
        .filter(|m| !config.exclude.contains(&m.symbol))
        .collect();

    candidates.sort_by(|a, b| {
        b.quote_volume_24h
            .partial_cmp(&a.quote_volume_24h)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    candidates.truncate(config.limit);

    let mut symbols: Vec<String> = candidates.into_iter().map(|m| m.symbol.clone()).collect();
    for included in &config.include {
        if !symbols.contains(included) {
            symbols.push(included.clone());
        }
    }
    symbols
}

#[async_trait]
impl Stage for CoinsPickStage {
    fn name(&self) -> &'static str {
        "symbols"
    }

    async fn run(&self, state: &mut State) -> anyhow::Result<StageOutcome> {
        if !state.symbols.is_empty() {
            info!(bot_id = state.bot_id, count = state.symbols.len(), "using preset symbols (backtest mode)");
            return Ok(StageOutcome::Continue);
        }

        if let Some(cached) = self.cache.get_for_bot::<Vec<String>>(state.bot_id, "universe") {
            info!(bot_id = state.bot_id, count = cached.len(), "using cached coin selection");
            state.symbols = cached.clone();
            if let Some(sm) = &self.stream_manager {
                sm.sync_subscriptions(&cached, &self.config.subscription_timeframes).await;
            }
            return Ok(StageOutcome::Continue);
        }

        let markets = self.exchange.load_markets().await.unwrap_or_default();
        let symbols = select_universe(&markets, &self.config);

        self.cache.set_for_bot(state.bot_id, "universe", &symbols);
        state.symbols = symbols.clone();

        if let Some(sm) = &self.stream_manager {
            sm.sync_subscriptions(&symbols, &self.config.subscription_timeframes).await;
        }

        Ok(StageOutcome::Continue)
    }
}
