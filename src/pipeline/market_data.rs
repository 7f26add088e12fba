// =============================================================================
// MarketDataStage (§4.7)
// =============================================================================
//
// Per symbol: OHLCV window via StreamManager -> Cache -> REST (REST suppressed
// in backtest mode, a missing cache window means the symbol is skipped this
// cycle), full indicator bundle via IndicatorKit, realtime price (ticker cache
// first, batch fetch_tickers for the rest), funding rate merge, and (live mode
// only) order-book/trade microstructure metrics cached 60s. The four fan-outs
// run with a bounded concurrency of `concurrency` (suggested 5), matching the
// teacher's `for_each_concurrent` fan-out shape in its own market data puller.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::debug;

use crate::cache::Cache;
use crate::exchange::{Candle, ExchangeAdapter, OrderBook, PublicTrade, Ticker, TradeSide};
use crate::indicators::{compute_indicator_bundle, flatten_bundle};
use crate::pipeline::{Stage, StageOutcome};
use crate::state::{State, SymbolMarketData, TradingMode};
use crate::streaming::StreamManager;

const DEFAULT_CONCURRENCY: usize = 5;

pub struct MarketDataStage {
    exchange: Arc<dyn ExchangeAdapter>,
    stream_manager: Option<Arc<StreamManager>>,
    cache: Arc<Cache>,
    timeframes: Vec<String>,
    trading_mode: TradingMode,
    concurrency: usize,
}

impl MarketDataStage {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        stream_manager: Option<Arc<StreamManager>>,
        cache: Arc<Cache>,
        timeframes: Vec<String>,
        trading_mode: TradingMode,
    ) -> Self {
        Self {
            exchange,
            stream_manager,
            cache,
            timeframes,
            trading_mode,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    async fn ohlcv_window(&self, symbol: &str, timeframe: &str) -> Vec<Candle> {
        if let Some(sm) = &self.stream_manager {
            return sm.get_latest_ohlcv(symbol, timeframe).await;
        }
        let namespace = format!("ohlcv_{timeframe}");
        if let Some(cached) = self.cache.get::<Vec<Candle>>(&namespace, symbol) {
            return cached;
        }
        if self.trading_mode == TradingMode::Backtest {
            return Vec::new();
        }
        self.exchange.fetch_ohlcv(symbol, timeframe, None, 100).await.unwrap_or_default()
    }

    async fn build_symbol_data(
        &self,
        symbol: &str,
        funding_map: &HashMap<String, f64>,
        price_map: &HashMap<String, f64>,
    ) -> Option<SymbolMarketData> {
        let mut indicators = HashMap::new();
        let mut got_any_window = false;

        for tf in &self.timeframes {
            let candles = self.ohlcv_window(symbol, tf).await;
            if candles.is_empty() {
                continue;
            }
            got_any_window = true;
            let bundle = compute_indicator_bundle(&candles);
            indicators.extend(flatten_bundle(&bundle, tf));
        }

        if !got_any_window {
            debug!(symbol, "market data: no cached ohlcv window, skipping this cycle");
            return None;
        }

        let mut data = SymbolMarketData {
            indicators,
            ..Default::default()
        };
        data.current_price = price_map.get(symbol).copied().unwrap_or(0.0);
        data.funding_rate = funding_map.get(symbol).copied().unwrap_or(0.0);

        if self.trading_mode == TradingMode::Live {
            self.attach_microstructure(symbol, &mut data).await;
        }

        Some(data)
    }

    async fn attach_microstructure(&self, symbol: &str, data: &mut SymbolMarketData) {
        let book = match self.cache.get::<OrderBook>("orderbook", symbol) {
            Some(b) => Some(b),
            None => match self.exchange.fetch_order_book(symbol, 20).await {
                Ok(b) => {
                    self.cache.set("orderbook", symbol, &b);
                    Some(b)
                }
                Err(e) => {
                    debug!(symbol, error = %e, "order book fetch failed");
                    None
                }
            },
        };

        if let Some(book) = &book {
            let best_bid = book.bids.first().map(|l| l.price);
            let best_ask = book.asks.first().map(|l| l.price);
            if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
                data.spread = Some(ask - bid);
            }
            let bid_volume_10: f64 = book.bids.iter().take(10).map(|l| l.quantity).sum();
            let ask_volume_10: f64 = book.asks.iter().take(10).map(|l| l.quantity).sum();
            data.bid_volume_10 = Some(bid_volume_10);
            data.ask_volume_10 = Some(ask_volume_10);
            let total = bid_volume_10 + ask_volume_10;
            if total > 0.0 {
                data.imbalance = Some((bid_volume_10 - ask_volume_10) / total);
            }
            data.liquidity_depth = Some(total);
        }

        let trades = match self.cache.get::<Vec<PublicTrade>>("trades", symbol) {
            Some(t) => Some(t),
            None => match self.exchange.fetch_trades(symbol, 100).await {
                Ok(t) => {
                    self.cache.set("trades", symbol, &t);
                    Some(t)
                }
                Err(e) => {
                    debug!(symbol, error = %e, "trades fetch failed");
                    None
                }
            },
        };

        if let Some(trades) = &trades {
            if !trades.is_empty() {
                let buy_volume: f64 = trades.iter().filter(|t| t.side == TradeSide::Buy).map(|t| t.amount).sum();
                let sell_volume: f64 = trades.iter().filter(|t| t.side == TradeSide::Sell).map(|t| t.amount).sum();
                if sell_volume > 0.0 {
                    data.buy_sell_ratio = Some(buy_volume / sell_volume);
                }

                let total_amount: f64 = trades.iter().map(|t| t.amount).sum();
                data.avg_trade_size = Some(total_amount / trades.len() as f64);

                // trade_intensity: pure trade counts per unit time, not
                // volume-weighted (Open Question #2 in SPEC_FULL.md §E).
                if let (Some(first), Some(last)) = (trades.first(), trades.last()) {
                    let span_seconds = ((last.timestamp - first.timestamp).unsigned_abs() as f64 / 1000.0).max(1.0);
                    data.trade_intensity = Some(trades.len() as f64 / span_seconds);
                }

                if let (Some(first), Some(last)) = (trades.first(), trades.last()) {
                    if first.price > 0.0 {
                        data.price_momentum = Some((last.price - first.price) / first.price * 100.0);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Stage for MarketDataStage {
    fn name(&self) -> &'static str {
        "market_data"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["symbols"]
    }

    async fn run(&self, state: &mut State) -> anyhow::Result<StageOutcome> {
        let symbols = state.symbols.clone();
        if symbols.is_empty() {
            return Ok(StageOutcome::Continue);
        }

        let funding_map: HashMap<String, f64> = self
            .exchange
            .fetch_funding_rates(&symbols)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|f| (f.symbol, f.rate))
            .collect();

        let mut price_map: HashMap<String, f64> = HashMap::new();
        let mut missing_tickers = Vec::new();
        for symbol in &symbols {
            if let Some(t) = self.cache.get::<Ticker>("tickers", symbol) {
                price_map.insert(symbol.clone(), t.last);
            } else {
                missing_tickers.push(symbol.clone());
            }
        }
        if !missing_tickers.is_empty() {
            if let Ok(tickers) = self.exchange.fetch_tickers(&missing_tickers).await {
                for t in tickers {
                    self.cache.set("tickers", &t.symbol, &t);
                    price_map.insert(t.symbol.clone(), t.last);
                }
            }
        }

        let results: Vec<(String, Option<SymbolMarketData>)> = stream::iter(symbols.clone())
            .map(|symbol| {
                let funding_map = &funding_map;
                let price_map = &price_map;
                async move {
                    let data = self.build_symbol_data(&symbol, funding_map, price_map).await;
                    (symbol, data)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (symbol, data) in results {
            if let Some(data) = data {
                state.market_data.insert(symbol, data);
            }
        }

        // Symbols with no usable window this cycle drop out of the active
        // universe rather than flow into QuantSignal/FilterStage with empty
        // data (§4.7 "skip this symbol this cycle").
        let had = state.symbols.len();
        state.symbols.retain(|s| state.market_data.contains_key(s));
        if state.symbols.len() < had {
            debug!(bot_id = state.bot_id, dropped = had - state.symbols.len(), "symbols dropped for missing market data");
        }

        Ok(StageOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FundingRate, MarketInfo, OrderParams, OrderResult};
    use crate::state::{Account, OrderType, Position, Side};
    use crate::exchange::ExchangeCapabilities;

    struct StubExchange {
        candle_price: f64,
    }

    #[async_trait]
    impl ExchangeAdapter for StubExchange {
        fn capabilities(&self) -> ExchangeCapabilities {
            ExchangeCapabilities::default()
        }
        async fn load_markets(&self) -> anyhow::Result<Vec<MarketInfo>> {
            Ok(Vec::new())
        }
        async fn fetch_ohlcv(&self, _symbol: &str, _timeframe: &str, _since: Option<i64>, _limit: usize) -> anyhow::Result<Vec<Candle>> {
            let candles: Vec<Candle> = (0..60)
                .map(|i| Candle {
                    open_time: i,
                    close_time: i,
                    open: self.candle_price,
                    high: self.candle_price + 1.0,
                    low: self.candle_price - 1.0,
                    close: self.candle_price + i as f64 * 0.01,
                    volume: 10.0,
                    quote_volume: 1000.0,
                    trades_count: 5,
                    taker_buy_volume: 5.0,
                    taker_buy_quote_volume: 500.0,
                    is_closed: true,
                })
                .collect();
            Ok(candles)
        }
        async fn fetch_ticker(&self, symbol: &str) -> anyhow::Result<Ticker> {
            Ok(Ticker { symbol: symbol.to_string(), last: self.candle_price, ..Default::default() })
        }
        async fn fetch_tickers(&self, symbols: &[String]) -> anyhow::Result<Vec<Ticker>> {
            Ok(symbols.iter().map(|s| Ticker { symbol: s.clone(), last: self.candle_price, ..Default::default() }).collect())
        }
        async fn fetch_order_book(&self, symbol: &str, _depth: usize) -> anyhow::Result<OrderBook> {
            Ok(OrderBook { symbol: symbol.to_string(), ..Default::default() })
        }
        async fn fetch_trades(&self, _symbol: &str, _limit: usize) -> anyhow::Result<Vec<PublicTrade>> {
            Ok(Vec::new())
        }
        async fn fetch_funding_rates(&self, symbols: &[String]) -> anyhow::Result<Vec<FundingRate>> {
            Ok(symbols.iter().map(|s| FundingRate { symbol: s.clone(), rate: 0.01, next_funding_time: 0 }).collect())
        }
        async fn fetch_funding_rate_history(&self, _symbol: &str, _since: Option<i64>, _limit: usize) -> anyhow::Result<Vec<FundingRate>> {
            Ok(Vec::new())
        }
        async fn fetch_balance(&self) -> anyhow::Result<Account> {
            Ok(Account::default())
        }
        async fn fetch_positions(&self, _symbols: Option<&[String]>) -> anyhow::Result<Vec<Position>> {
            Ok(Vec::new())
        }
        async fn create_order(&self, symbol: &str, _order_type: OrderType, _side: Side, _amount: f64, _price: Option<f64>, _params: OrderParams) -> anyhow::Result<OrderResult> {
            Ok(OrderResult {
                success: true,
                order_id: None,
                symbol: symbol.to_string(),
                status: crate::state::OrderStatus::Open,
                filled: 0.0,
                remaining: 0.0,
                average: 0.0,
                fee_cost: 0.0,
                raw: serde_json::Value::Null,
            })
        }
        async fn cancel_order(&self, _order_id: &str, symbol: &str) -> anyhow::Result<OrderResult> {
            self.create_order(symbol, OrderType::Market, Side::Buy, 0.0, None, OrderParams::default()).await
        }
        async fn cancel_orders(&self, _symbol: &str) -> anyhow::Result<Vec<OrderResult>> {
            Ok(Vec::new())
        }
        async fn fetch_order(&self, _order_id: &str, symbol: &str) -> anyhow::Result<OrderResult> {
            self.create_order(symbol, OrderType::Market, Side::Buy, 0.0, None, OrderParams::default()).await
        }
    }

    #[tokio::test]
    async fn fetches_indicators_price_and_funding() {
        let stage = MarketDataStage::new(
            Arc::new(StubExchange { candle_price: 100.0 }),
            None,
            Arc::new(Cache::new()),
            vec!["1h".to_string()],
            TradingMode::Paper,
        );
        let mut state = State::new(1, "test".to_string(), 1000.0, Vec::new());
        state.symbols = vec!["BTCUSDT".to_string()];

        stage.run(&mut state).await.unwrap();

        let data = state.market_data.get("BTCUSDT").expect("symbol kept");
        assert!(data.indicators.contains_key("rsi_1h"));
        assert!(data.current_price > 0.0);
        assert_eq!(data.funding_rate, 0.01);
    }

    #[tokio::test]
    async fn backtest_mode_without_cache_drops_symbol() {
        let stage = MarketDataStage::new(
            Arc::new(StubExchange { candle_price: 100.0 }),
            None,
            Arc::new(Cache::new()),
            vec!["1h".to_string()],
            TradingMode::Backtest,
        );
        let mut state = State::new(1, "test".to_string(), 1000.0, Vec::new());
        state.symbols = vec!["BTCUSDT".to_string()];

        stage.run(&mut state).await.unwrap();

        assert!(state.market_data.get("BTCUSDT").is_none());
        assert!(state.symbols.is_empty());
    }
}
