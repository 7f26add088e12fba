// =============================================================================
// BacktestEngine (§4.15)
// =============================================================================
//
// Replaces `ExchangeAdapter` with a `MockTrader` driven by a pre-loaded
// `BacktestDataSource`, and runs the identical `PipelineGraph` code path one
// bot's scheduler loop would. Grounded on `binance_futures.rs`'s adapter
// surface (same trait, same method shapes) and on `CoinsPickStage`'s
// preset-symbols short-circuit / `MarketDataStage`'s backtest cache-only
// OHLCV path (§4.7, §4.8) to inject the fixed symbol universe and history
// without a separate pipeline stage.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;

use crate::cache::Cache;
use crate::decision::{build_batch_decision, BatchDecision};
use crate::exchange::{
    Candle, ExchangeAdapter, ExchangeCapabilities, FundingRate, MarketInfo, OrderBook, OrderParams, PublicTrade, Ticker,
};
use crate::execution::fees::FeeSchedule;
use crate::execution::{ceil_to_precision, realized_pnl};
use crate::llm::LlmProvider;
use crate::performance::{self, PerformanceReport};
use crate::pipeline::coins_pick::CoinsPickStage;
use crate::pipeline::filter::FilterStage;
use crate::pipeline::market_data::MarketDataStage;
use crate::pipeline::regime::RegimeStage;
use crate::pipeline::{InMemoryCheckpointer, PipelineGraph, Stage};
use crate::state::{
    Account, AssetBalance, BotConfig, DecisionAction, OrderResult, OrderStatus, OrderType, Position, PositionStatus,
    QuantSignalWeights, RiskLimits, Side, State, TradeHistory, TradeSide, TradeStatus, TradingMode,
};

/// Warmup extension so 200-period 4h EMAs have enough history by `start`
/// (§4.15).
const WARMUP_DAYS: i64 = 35;

/// Bar period in seconds, used to rank timeframes by granularity when
/// picking which series marks the current price. Mirrors the cadence table
/// `streaming::timeframe_to_poll_interval` uses for the same strings.
fn timeframe_to_seconds(timeframe: &str) -> i64 {
    match timeframe {
        "1m" => 60,
        "3m" => 180,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1800,
        "1h" => 3600,
        "4h" => 14400,
        "1d" => 86400,
        _ => 3600,
    }
}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub bot_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub symbols: Vec<String>,
    pub timeframes: Vec<String>,
    pub initial_balance: f64,
    pub cycle_interval_seconds: u64,
    pub slippage_pct: f64,
    pub risk_limits: RiskLimits,
    pub quant_signal_weights: QuantSignalWeights,
    pub quant_signal_threshold: i32,
    pub max_cycles: Option<u64>,
}

/// Pre-loaded OHLCV + funding history for a fixed symbol list across a date
/// range, extended `WARMUP_DAYS` before `start` (§4.15). `load` is the
/// historical data provider's responsibility; this struct only holds what
/// has already been fetched.
#[derive(Debug, Clone, Default)]
pub struct BacktestDataSource {
    /// (symbol, timeframe) -> candles sorted ascending by `open_time`.
    pub candles: HashMap<(String, String), Vec<Candle>>,
    pub funding_rates: HashMap<String, f64>,
}

impl BacktestDataSource {
    pub fn warmup_start(start: DateTime<Utc>) -> DateTime<Utc> {
        start - chrono::Duration::days(WARMUP_DAYS)
    }

    pub fn insert_candles(&mut self, symbol: &str, timeframe: &str, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.open_time);
        self.candles.insert((symbol.to_string(), timeframe.to_string()), candles);
    }

    fn series(&self, symbol: &str, timeframe: &str) -> &[Candle] {
        self.candles.get(&(symbol.to_string(), timeframe.to_string())).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// `ExchangeAdapter` backed by `BacktestDataSource` instead of a live venue
/// (§4.15). Fills at the cursor candle's close price adjusted by
/// `slippage_pct`, commissions via the shared `FeeSchedule`, and debits/credits
/// a virtual USDT balance. Advances in lockstep with `BacktestEngine`'s cycle
/// clock via `advance_to`.
pub struct MockTrader {
    data: BacktestDataSource,
    fees: FeeSchedule,
    slippage_pct: f64,
    /// Keyed by `(symbol, timeframe)` — each series advances on its own
    /// candle count, so a shared per-symbol index would misalign timeframes
    /// with different bar periods.
    cursor: RwLock<HashMap<(String, String), usize>>,
    clock: RwLock<DateTime<Utc>>,
    account: RwLock<Account>,
    positions: RwLock<Vec<Position>>,
    order_seq: RwLock<u64>,
}

impl MockTrader {
    pub fn new(data: BacktestDataSource, fees: FeeSchedule, slippage_pct: f64, initial_balance: f64, start: DateTime<Utc>) -> Self {
        let mut balances = HashMap::new();
        balances.insert(
            "USDT".to_string(),
            AssetBalance {
                free: initial_balance,
                used: 0.0,
                total: initial_balance,
                debt: 0.0,
            },
        );
        Self {
            data,
            fees,
            slippage_pct,
            cursor: RwLock::new(HashMap::new()),
            clock: RwLock::new(start),
            account: RwLock::new(Account { timestamp: start.timestamp(), balances }),
            positions: RwLock::new(Vec::new()),
            order_seq: RwLock::new(0),
        }
    }

    /// Moves the simulated clock forward and advances every symbol's cursor
    /// to the last candle whose `close_time <= now` (§4.15 "cycle cadence").
    pub fn advance_to(&self, now: DateTime<Utc>) {
        *self.clock.write() = now;
        let now_ms = now.timestamp_millis();
        let mut cursor = self.cursor.write();
        for (symbol, timeframe) in self.data.candles.keys().cloned().collect::<Vec<_>>() {
            let idx = self
                .data
                .series(&symbol, &timeframe)
                .iter()
                .rposition(|c| c.close_time <= now_ms)
                .map(|i| i + 1)
                .unwrap_or(0);
            cursor.insert((symbol, timeframe), idx);
        }
    }

    /// The finest configured timeframe for `symbol` — used to mark the
    /// current price from whichever series has the most granular bars.
    fn primary_timeframe(&self, symbol: &str) -> Option<String> {
        self.data
            .candles
            .keys()
            .filter(|(s, _)| s == symbol)
            .map(|(_, tf)| tf.clone())
            .min_by_key(|tf| timeframe_to_seconds(tf))
    }

    fn current_candle(&self, symbol: &str) -> Option<Candle> {
        let timeframe = self.primary_timeframe(symbol)?;
        let idx = *self.cursor.read().get(&(symbol.to_string(), timeframe.clone()))?;
        let series = self.data.series(symbol, &timeframe);
        idx.checked_sub(1).and_then(|i| series.get(i)).copied()
    }

    fn fill_price(&self, symbol: &str, side: Side) -> Option<f64> {
        let close = self.current_candle(symbol)?.close;
        let slip = self.slippage_pct / 100.0;
        Some(match side {
            Side::Buy => close * (1.0 + slip),
            Side::Sell => close * (1.0 - slip),
        })
    }

    fn next_order_id(&self) -> String {
        let mut seq = self.order_seq.write();
        *seq += 1;
        format!("mock-{}", *seq)
    }
}

#[async_trait]
impl ExchangeAdapter for MockTrader {
    fn capabilities(&self) -> ExchangeCapabilities {
        ExchangeCapabilities {
            attached_sl_tp: false,
            fetch_funding_rates: true,
            fetch_open_interests: false,
            fetch_funding_rate_history: false,
        }
    }

    async fn load_markets(&self) -> anyhow::Result<Vec<MarketInfo>> {
        Ok(self
            .data
            .candles
            .keys()
            .map(|(s, _)| s.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .map(|symbol| MarketInfo {
                symbol,
                base: String::new(),
                quote: "USDT".to_string(),
                amount_precision: 3,
                price_precision: 2,
                min_notional: 5.0,
                quote_volume_24h: 0.0,
            })
            .collect())
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, _since: Option<i64>, limit: usize) -> anyhow::Result<Vec<Candle>> {
        let cursor = self.cursor.read().get(&(symbol.to_string(), timeframe.to_string())).copied().unwrap_or(0);
        let series = self.data.series(symbol, timeframe);
        let end = cursor.min(series.len());
        let start = end.saturating_sub(limit);
        Ok(series[start..end].to_vec())
    }

    async fn fetch_ticker(&self, symbol: &str) -> anyhow::Result<Ticker> {
        let candle = self.current_candle(symbol).ok_or_else(|| anyhow::anyhow!("no candle yet for {symbol}"))?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: candle.close,
            bid: candle.close,
            ask: candle.close,
            timestamp: self.clock.read().timestamp(),
        })
    }

    async fn fetch_tickers(&self, symbols: &[String]) -> anyhow::Result<Vec<Ticker>> {
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            if let Ok(t) = self.fetch_ticker(symbol).await {
                out.push(t);
            }
        }
        Ok(out)
    }

    async fn fetch_order_book(&self, symbol: &str, _depth: usize) -> anyhow::Result<OrderBook> {
        // Order-book microstructure is skipped in backtest mode (§4.15).
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: self.clock.read().timestamp(),
        })
    }

    async fn fetch_trades(&self, _symbol: &str, _limit: usize) -> anyhow::Result<Vec<PublicTrade>> {
        Ok(Vec::new())
    }

    async fn fetch_funding_rates(&self, symbols: &[String]) -> anyhow::Result<Vec<FundingRate>> {
        Ok(symbols
            .iter()
            .map(|s| FundingRate {
                symbol: s.clone(),
                rate: self.data.funding_rates.get(s).copied().unwrap_or(0.0),
                next_funding_time: 0,
            })
            .collect())
    }

    async fn fetch_funding_rate_history(&self, symbol: &str, _since: Option<i64>, _limit: usize) -> anyhow::Result<Vec<FundingRate>> {
        self.fetch_funding_rates(&[symbol.to_string()]).await
    }

    async fn fetch_balance(&self) -> anyhow::Result<Account> {
        Ok(self.account.read().clone())
    }

    async fn fetch_positions(&self, symbols: Option<&[String]>) -> anyhow::Result<Vec<Position>> {
        let positions = self.positions.read();
        Ok(match symbols {
            Some(wanted) => positions.iter().filter(|p| wanted.contains(&p.symbol)).cloned().collect(),
            None => positions.clone(),
        })
    }

    async fn create_order(
        &self,
        symbol: &str,
        _order_type: OrderType,
        side: Side,
        amount: f64,
        _price: Option<f64>,
        params: OrderParams,
    ) -> anyhow::Result<OrderResult> {
        let fill_price = self.fill_price(symbol, side).ok_or_else(|| anyhow::anyhow!("no market data yet for {symbol}"))?;
        let notional = amount * fill_price;
        let fee = self.fees.commission(notional, false);

        if params.reduce_only {
            let mut positions = self.positions.write();
            if let Some(idx) = positions.iter().position(|p| p.symbol == symbol) {
                let closed = positions.remove(idx);
                let (pnl_usd, _) = realized_pnl(closed.side, closed.entry_price, fill_price, closed.amount, fee);
                let mut account = self.account.write();
                if let Some(usdt) = account.balances.get_mut("USDT") {
                    let margin_released = closed.amount * closed.entry_price / closed.leverage.max(1.0);
                    usdt.free += margin_released + pnl_usd;
                    usdt.total = usdt.free + usdt.used;
                }
            }
        } else {
            let mut account = self.account.write();
            if let Some(usdt) = account.balances.get_mut("USDT") {
                usdt.free -= fee;
                usdt.total = usdt.free + usdt.used;
            }
        }

        Ok(OrderResult {
            success: true,
            order_id: Some(self.next_order_id()),
            symbol: symbol.to_string(),
            status: OrderStatus::Closed,
            filled: amount,
            remaining: 0.0,
            average: fill_price,
            fee_cost: fee,
            raw: serde_json::Value::Null,
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> anyhow::Result<OrderResult> {
        Ok(OrderResult {
            success: true,
            order_id: Some(order_id.to_string()),
            symbol: symbol.to_string(),
            status: OrderStatus::Canceled,
            filled: 0.0,
            remaining: 0.0,
            average: 0.0,
            fee_cost: 0.0,
            raw: serde_json::Value::Null,
        })
    }

    async fn cancel_orders(&self, _symbol: &str) -> anyhow::Result<Vec<OrderResult>> {
        Ok(Vec::new())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> anyhow::Result<OrderResult> {
        // Mock orders fill synchronously in `create_order`; re-querying one
        // always reports closed.
        Ok(OrderResult {
            success: true,
            order_id: Some(order_id.to_string()),
            symbol: symbol.to_string(),
            status: OrderStatus::Closed,
            filled: 0.0,
            remaining: 0.0,
            average: 0.0,
            fee_cost: 0.0,
            raw: serde_json::Value::Null,
        })
    }
}

/// Drives the identical pipeline code path (§4.15 "otherwise the identical
/// code path") with `stream_manager = None` and a `MockTrader` standing in
/// for the real `ExchangeAdapter`. Owns the in-memory trade ledger and
/// computes its own `PerformanceReport` each cycle — the "MockPerformanceService"
/// the specification names is just `performance::calculate` over this ledger.
pub struct BacktestEngine {
    config: BacktestConfig,
    trader: Arc<MockTrader>,
    cache: Arc<Cache>,
    graph: PipelineGraph,
    decision: BatchDecision,
    trades: Vec<TradeHistory>,
    trade_seq: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BacktestReport {
    pub cycles_run: u64,
    pub final_balance: f64,
    pub total_trades: usize,
    pub performance: PerformanceReport,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig, data: BacktestDataSource, llm_provider: LlmProvider) -> anyhow::Result<Self> {
        Self::with_decision(config, data, build_batch_decision(llm_provider, 90))
    }

    /// Builds the engine against a caller-supplied `BatchDecision` instead of
    /// constructing one from an `LlmProvider`. Lets S6 (backtest
    /// reproducibility, spec.md §8) script a deterministic decision stream
    /// without a live LLM endpoint.
    pub fn with_decision(config: BacktestConfig, data: BacktestDataSource, decision: BatchDecision) -> anyhow::Result<Self> {
        let cache = Arc::new(Cache::new());
        let trader = Arc::new(MockTrader::new(data, FeeSchedule::default(), config.slippage_pct, config.initial_balance, config.start));

        let stages = Self::build_stages(&config, trader.clone(), cache.clone());
        let graph = PipelineGraph::build(stages, Arc::new(InMemoryCheckpointer::new()))?;

        Ok(Self {
            config,
            trader,
            cache,
            graph,
            decision,
            trades: Vec::new(),
            trade_seq: 0,
        })
    }

    fn build_stages(config: &BacktestConfig, trader: Arc<MockTrader>, cache: Arc<Cache>) -> Vec<Arc<dyn Stage>> {
        vec![
            Arc::new(CoinsPickStage::new(trader.clone(), cache.clone(), None, Default::default())),
            Arc::new(MarketDataStage::new(trader.clone(), None, cache.clone(), config.timeframes.clone(), TradingMode::Backtest)),
            Arc::new(RegimeStage::new(crate::config::MarketRegimeConfig::default())),
            Arc::new(FilterStage::new(config.quant_signal_weights.clone(), config.quant_signal_threshold, config.timeframes.clone())),
        ]
    }

    /// Pre-populates the `ohlcv_{timeframe}` cache namespace for every
    /// configured symbol before the pipeline runs, since `MarketDataStage`
    /// drops a symbol with no cached window in backtest mode rather than
    /// falling back to REST (confirmed by its own
    /// `backtest_mode_without_cache_drops_symbol` test).
    fn seed_cache(&self) {
        for symbol in &self.config.symbols {
            for timeframe in &self.config.timeframes {
                let candles = self.trader.data.series(symbol, timeframe);
                let cursor = self.trader.cursor.read().get(&(symbol.clone(), timeframe.clone())).copied().unwrap_or(0);
                let window = &candles[..cursor.min(candles.len())];
                if window.is_empty() {
                    continue;
                }
                let namespace = format!("ohlcv_{timeframe}");
                self.cache.set(&namespace, symbol, &window.to_vec());
            }
        }
    }

    /// Records every just-closed position (detected by diffing
    /// `positions_before` against the adapter's current position list) into
    /// the in-memory trade ledger that backs this engine's
    /// `PerformanceReport`.
    fn record_closed_trades(&mut self, bot_id: i64, positions_before: &[Position], cycle_id: &str) {
        let positions_after = self.trader.positions.read();
        for before in positions_before {
            if !positions_after.iter().any(|p| p.id == before.id) {
                self.trade_seq += 1;
                let exit_price = self.trader.fill_price(&before.symbol, match before.side {
                    Side::Buy => Side::Sell,
                    Side::Sell => Side::Buy,
                }).unwrap_or(before.entry_price);
                let fee = self.trader.fees.commission(before.amount * exit_price, false);
                let (pnl_usd, pnl_pct) = realized_pnl(before.side, before.entry_price, exit_price, before.amount, fee);
                self.trades.push(TradeHistory {
                    id: self.trade_seq,
                    bot_id,
                    symbol: before.symbol.clone(),
                    side: match before.side {
                        Side::Buy => TradeSide::Long,
                        Side::Sell => TradeSide::Short,
                    },
                    action: "close".to_string(),
                    entry_price: before.entry_price,
                    exit_price: Some(exit_price),
                    amount: before.amount,
                    leverage: before.leverage,
                    pnl_usd,
                    pnl_percent: pnl_pct,
                    fee_paid: fee,
                    status: TradeStatus::Closed,
                    opened_at: self.config.start,
                    closed_at: Some(*self.trader.clock.read()),
                    cycle_id: cycle_id.to_string(),
                    order_id: None,
                });
            }
        }
    }

    /// Runs cycles from `start` to `end` at `cycle_interval_seconds` cadence,
    /// capped by `max_cycles` if set (§4.15).
    pub async fn run(&mut self) -> anyhow::Result<BacktestReport> {
        let bot = BotConfig {
            id: self.config.bot_id,
            name: format!("backtest-{}", self.config.bot_id),
            exchange_id: 0,
            workflow_id: 0,
            llm_id: 0,
            trading_mode: TradingMode::Backtest,
            cycle_interval_seconds: self.config.cycle_interval_seconds,
            risk_limits: self.config.risk_limits.clone(),
            quant_signal_weights: self.config.quant_signal_weights.clone(),
            quant_signal_threshold: self.config.quant_signal_threshold,
            tracing_enabled: false,
            initial_balance: self.config.initial_balance,
            timeframes: self.config.timeframes.clone(),
        };

        let mut now = self.config.start;
        let step = chrono::Duration::milliseconds(self.config.cycle_interval_seconds as i64 * 1000);
        let mut cycles_run: u64 = 0;
        let mut alerts: Vec<String> = Vec::new();

        while now <= self.config.end {
            if let Some(max) = self.config.max_cycles {
                if cycles_run >= max {
                    break;
                }
            }

            self.trader.advance_to(now);
            self.seed_cache();

            let mut state = State::new(bot.id, bot.name.clone(), bot.initial_balance, std::mem::take(&mut alerts));
            state.symbols = self.config.symbols.clone();
            state.account = self.trader.fetch_balance().await.unwrap_or_default();
            state.positions = self.trader.fetch_positions(None).await.unwrap_or_default();
            state.performance = Some(performance::calculate(&self.trades, performance::DEFAULT_WINDOW));

            let positions_before = state.positions.clone();

            let thread_id = format!("backtest_{}", bot.id);
            self.graph.run(&mut state, &thread_id).await?;

            if !state.symbols.is_empty() {
                let raw = self.decision.run(&state, &self.config.risk_limits).await;
                state.alerts.clear();
                self.apply_decisions(&mut state, raw.decisions.clone()).await;
            }

            self.record_closed_trades(bot.id, &positions_before, &state.cycle_id);
            alerts = state.alerts.clone();

            info!(bot_id = bot.id, now = %now, symbols = state.symbols.len(), "backtest cycle complete");
            cycles_run += 1;
            now += step;
        }

        self.graph.cleanup();

        let final_account = self.trader.fetch_balance().await.unwrap_or_default();
        let final_balance = final_account.free_balance("USDT");
        let report = BacktestReport {
            cycles_run,
            final_balance,
            total_trades: self.trades.len(),
            performance: performance::calculate(&self.trades, performance::DEFAULT_WINDOW),
        };
        Ok(report)
    }

    /// Simplified §4.10.B execution: no preflight margin scaling (backtests
    /// run single-bot single-strategy, so the cap rarely binds), but the
    /// same amount-precision ceiling rounding and close-before-open order.
    async fn apply_decisions(&self, state: &mut State, decisions: Vec<crate::state::PortfolioDecision>) {
        let (closes, opens): (Vec<_>, Vec<_>) = decisions.into_iter().filter(|d| d.action.is_actionable()).partition(|d| d.action.is_close());

        for decision in closes {
            if let Some(pos) = state.positions.iter().find(|p| p.symbol == decision.symbol).cloned() {
                let side = match pos.side {
                    Side::Buy => Side::Sell,
                    Side::Sell => Side::Buy,
                };
                if self.trader.create_order(&decision.symbol, OrderType::Market, side, pos.amount, None, OrderParams { reduce_only: true, ..Default::default() }).await.is_ok() {
                    state.positions.retain(|p| p.id != pos.id);
                }
            }
        }

        let account = self.trader.fetch_balance().await.unwrap_or_default();
        let free_balance = account.free_balance("USDT");

        for decision in opens {
            let Some(data) = state.market_data.get(&decision.symbol) else { continue };
            let price = data.current_price;
            if price <= 0.0 {
                continue;
            }
            let leverage = if decision.leverage > 0.0 { decision.leverage } else { self.config.risk_limits.default_leverage };
            let margin = (decision.allocation_pct / 100.0) * free_balance / leverage;
            let notional = margin * leverage;
            let amount = ceil_to_precision(notional / price, 3);
            if amount <= 0.0 {
                continue;
            }
            let side = match decision.action {
                DecisionAction::OpenLong => Side::Buy,
                DecisionAction::OpenShort => Side::Sell,
                _ => continue,
            };
            if let Ok(order) = self.trader.create_order(&decision.symbol, OrderType::Market, side, amount, None, OrderParams::default()).await {
                state.positions.push(Position {
                    id: order.order_id.clone().unwrap_or_else(|| decision.symbol.clone()),
                    symbol: decision.symbol.clone(),
                    side,
                    position_type: OrderType::Market,
                    status: PositionStatus::Open,
                    entry_price: order.average,
                    current_average: order.average,
                    amount: order.filled,
                    leverage,
                    stop_loss_price: decision.stop_loss,
                    take_profit_price: decision.take_profit,
                });
                self.trader.positions.write().push(state.positions.last().unwrap().clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_candles(start: DateTime<Utc>, count: usize, price: f64) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let open_time = start.timestamp_millis() + i as i64 * 3600 * 1000;
                Candle {
                    open_time,
                    close_time: open_time + 3600 * 1000,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 100.0,
                    quote_volume: 100.0 * price,
                    trades_count: 10,
                    taker_buy_volume: 50.0,
                    taker_buy_quote_volume: 50.0 * price,
                    is_closed: true,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn mock_trader_fills_with_slippage_and_debits_fee() {
        let start = Utc::now() - chrono::Duration::days(1);
        let mut data = BacktestDataSource::default();
        data.insert_candles("BTCUSDT", "4h", flat_candles(start, 10, 100.0));
        let trader = MockTrader::new(data, FeeSchedule::default(), 1.0, 1000.0, start);
        trader.advance_to(start + chrono::Duration::hours(5));

        let order = trader
            .create_order("BTCUSDT", OrderType::Market, Side::Buy, 1.0, None, OrderParams::default())
            .await
            .unwrap();

        assert!((order.average - 101.0).abs() < 1e-9);
        let account = trader.fetch_balance().await.unwrap();
        assert!(account.free_balance("USDT") < 1000.0);
    }

    #[tokio::test]
    async fn backtest_data_source_warmup_start_precedes_start() {
        let start = Utc::now();
        let warm = BacktestDataSource::warmup_start(start);
        assert!(warm < start);
        assert_eq!((start - warm).num_days(), WARMUP_DAYS);
    }

    // S6 (spec.md §8): with a fixed start, end, initial balance, symbol list,
    // and the LLM call replaced by a scripted mock returning identical
    // decisions, two runs must produce identical final balance, total
    // trades, and max drawdown.
    mod reproducibility {
        use super::*;
        use chrono::TimeZone;
        use crate::llm::{ChatMessage, StructuredLlm};
        use crate::state::{BatchDecisionResult, PortfolioDecision};
        use std::time::Duration;

        /// Always proposes the same long entry on BTCUSDT, regardless of
        /// prompt contents, so both runs see an identical decision stream.
        struct ScriptedLlm;

        #[async_trait]
        impl StructuredLlm<BatchDecisionResult> for ScriptedLlm {
            async fn invoke(&self, _messages: &[ChatMessage], _timeout: Duration) -> anyhow::Result<BatchDecisionResult> {
                Ok(BatchDecisionResult {
                    decisions: vec![PortfolioDecision {
                        symbol: "BTCUSDT".to_string(),
                        action: DecisionAction::OpenLong,
                        allocation_pct: 10.0,
                        leverage: 2.0,
                        stop_loss: None,
                        take_profit: None,
                        confidence: 80,
                        reasoning: "scripted".to_string(),
                        priority: 1,
                    }],
                    total_allocation_pct: 10.0,
                    cash_reserve_pct: 90.0,
                    strategy_rationale: "scripted".to_string(),
                })
            }
        }

        fn rising_candles(start: DateTime<Utc>, count: usize, step_seconds: i64, start_price: f64) -> Vec<Candle> {
            (0..count)
                .map(|i| {
                    let open_time = start.timestamp_millis() + i as i64 * step_seconds * 1000;
                    let price = start_price + i as f64 * 0.5;
                    Candle {
                        open_time,
                        close_time: open_time + step_seconds * 1000,
                        open: price,
                        high: price + 1.0,
                        low: price - 1.0,
                        close: price,
                        volume: 1_000.0,
                        quote_volume: 1_000.0 * price,
                        trades_count: 50,
                        taker_buy_volume: 500.0,
                        taker_buy_quote_volume: 500.0 * price,
                        is_closed: true,
                    }
                })
                .collect()
        }

        fn make_config(start: DateTime<Utc>, end: DateTime<Utc>) -> BacktestConfig {
            BacktestConfig {
                bot_id: 1,
                start,
                end,
                symbols: vec!["BTCUSDT".to_string()],
                timeframes: vec!["3m".to_string()],
                initial_balance: 10_000.0,
                cycle_interval_seconds: 180,
                slippage_pct: 0.02,
                risk_limits: RiskLimits::default(),
                quant_signal_weights: QuantSignalWeights::default(),
                quant_signal_threshold: -100,
                max_cycles: Some(10),
            }
        }

        fn make_data(start: DateTime<Utc>) -> BacktestDataSource {
            let mut data = BacktestDataSource::default();
            let warmup_start = BacktestDataSource::warmup_start(start);
            data.insert_candles("BTCUSDT", "3m", rising_candles(warmup_start, 400, 180, 30_000.0));
            data
        }

        #[tokio::test(start_paused = true)]
        async fn two_runs_with_a_scripted_llm_produce_identical_results() {
            let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let end = start + chrono::Duration::hours(1);

            let mut engine_a = BacktestEngine::with_decision(
                make_config(start, end),
                make_data(start),
                BatchDecision::new(Arc::new(ScriptedLlm), Duration::from_secs(5)),
            )
            .unwrap();
            let report_a = engine_a.run().await.unwrap();

            let mut engine_b = BacktestEngine::with_decision(
                make_config(start, end),
                make_data(start),
                BatchDecision::new(Arc::new(ScriptedLlm), Duration::from_secs(5)),
            )
            .unwrap();
            let report_b = engine_b.run().await.unwrap();

            assert_eq!(report_a.cycles_run, report_b.cycles_run);
            assert_eq!(report_a.total_trades, report_b.total_trades);
            assert!((report_a.final_balance - report_b.final_balance).abs() < 1e-9);
            assert!((report_a.performance.max_drawdown - report_b.performance.max_drawdown).abs() < 1e-9);
        }
    }
}
