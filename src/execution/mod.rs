// =============================================================================
// ExecutionStage (§4.10)
// =============================================================================
//
// Runs, in order: (A) trailing-stop sweep, (B) decision execution — closes
// first without budget checks, then a preflight margin budget over the
// remaining opens, then a per-decision validation chain, amount-precision
// ceiling rounding, order placement, (C) fill confirmation, (D) TradeHistory
// bookkeeping. Grounded on the teacher's `position_engine.rs` order/close
// flow, generalized to the validation chain and forced-close/trailing-stop
// priority ordering this specification requires.
// =============================================================================

pub mod fees;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::cache::Cache;
use crate::exchange::{ExchangeAdapter, MarketInfo, OrderParams};
use crate::execution::fees::FeeSchedule;
use crate::pipeline::{Stage, StageOutcome};
use crate::repo::SharedTradeHistoryRepo;
use crate::state::{DecisionAction, OrderResult, OrderType, Position, PortfolioDecision, PositionStatus, RiskLimits, Side, State, TradeHistory, TradeSide, TradeStatus};
use crate::trailing_stop::TrailingStop;

/// Ceiling-rounds `amount` to `precision` decimal places (§4.10.4, §8
/// round-trip law). Truncation would silently take a notional like $10.03
/// below a $10 exchange minimum; ceiling never does.
pub fn ceil_to_precision(amount: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (amount * factor).ceil() / factor
}

/// Realized PnL for a closed position (§4.10.D, §8 scenario S5).
pub fn realized_pnl(side: Side, entry_price: f64, exit_price: f64, amount: f64, fee: f64) -> (f64, f64) {
    let pnl_usd = match side {
        Side::Buy => (exit_price - entry_price) * amount - fee,
        Side::Sell => (entry_price - exit_price) * amount - fee,
    };
    let cost_basis = entry_price * amount;
    let pnl_pct = if cost_basis > 0.0 { pnl_usd / cost_basis * 100.0 } else { 0.0 };
    (pnl_usd, pnl_pct)
}

pub struct ExecutionStage {
    exchange: Arc<dyn ExchangeAdapter>,
    trailing_stop: Arc<TrailingStop>,
    trade_history: SharedTradeHistoryRepo,
    cache: Arc<Cache>,
    fees: FeeSchedule,
    risk_limits: RiskLimits,
}

impl ExecutionStage {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        trailing_stop: Arc<TrailingStop>,
        trade_history: SharedTradeHistoryRepo,
        cache: Arc<Cache>,
        fees: FeeSchedule,
        risk_limits: RiskLimits,
    ) -> Self {
        Self {
            exchange,
            trailing_stop,
            trade_history,
            cache,
            fees,
            risk_limits,
        }
    }

    async fn market_info(&self, symbol: &str) -> Option<MarketInfo> {
        let markets: Vec<MarketInfo> = match self.cache.get("markets", "all") {
            Some(m) => m,
            None => {
                let fetched = self.exchange.load_markets().await.unwrap_or_default();
                self.cache.set("markets", "all", &fetched);
                fetched
            }
        };
        markets.into_iter().find(|m| m.symbol == symbol)
    }

    async fn confirm_fill(&self, order: OrderResult, symbol: &str) -> anyhow::Result<OrderResult> {
        if order.filled > 0.0 {
            return Ok(order);
        }
        let Some(order_id) = order.order_id.clone() else {
            return Ok(order);
        };
        self.exchange.wait_for_order_fill(&order_id, symbol, Duration::from_secs(5), Duration::from_millis(500)).await
    }

    /// §4.10.A — update trailing-stop ratchet state for every open position
    /// and close whichever ones it triggers. Positions without a current
    /// price this cycle are skipped with a warning, never fabricated.
    async fn trailing_stop_sweep(&self, state: &mut State) {
        let mut remaining = Vec::with_capacity(state.positions.len());
        for position in std::mem::take(&mut state.positions) {
            let current_price = state.market_data.get(&position.symbol).map(|d| d.current_price).filter(|p| *p > 0.0);
            if current_price.is_none() {
                warn!(symbol = %position.symbol, "trailing stop: no current price this cycle, skipping");
                remaining.push(position);
                continue;
            }

            if self.trailing_stop.evaluate(&position, current_price, &self.risk_limits) {
                match self.close_position(&position, "trailing_stop", state).await {
                    Ok(()) => self.trailing_stop.clear(&position.id),
                    Err(e) => {
                        error!(symbol = %position.symbol, error = %e, "trailing stop close failed");
                        remaining.push(position);
                    }
                }
            } else {
                remaining.push(position);
            }
        }
        state.positions = remaining;
    }

    async fn close_position(&self, position: &Position, reason: &str, state: &mut State) -> anyhow::Result<()> {
        let side = match position.side {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        };

        let order = self
            .exchange
            .create_order(&position.symbol, OrderType::Market, side, position.amount, None, OrderParams { reduce_only: true, ..Default::default() })
            .await?;
        let order = self.confirm_fill(order, &position.symbol).await?;

        if order.filled <= 0.0 {
            anyhow::bail!("{reason} close did not fill for {}", position.symbol);
        }

        let current_price = state.market_data.get(&position.symbol).map(|d| d.current_price).unwrap_or(order.average);
        let exit_price = if order.average > 0.0 { order.average } else { current_price };
        let notional = position.amount * exit_price;
        let fee = self.fees.commission(notional, false);
        let (pnl_usd, pnl_pct) = realized_pnl(position.side, position.entry_price, exit_price, position.amount, fee);

        self.trade_history.close_trade_by_symbol(state.bot_id, &position.symbol, exit_price, pnl_usd, pnl_pct, fee).await?;

        info!(bot_id = state.bot_id, symbol = %position.symbol, reason, pnl_usd, pnl_pct, "position closed");
        Ok(())
    }

    /// §4.10.B — executes `state.batch_decision`, closes first, then opens
    /// under a preflight margin budget and a full validation chain.
    async fn execute_decisions(&self, state: &mut State) {
        let Some(batch) = state.batch_decision.clone() else {
            return;
        };

        let mut decisions: Vec<PortfolioDecision> = batch.decisions.into_iter().filter(|d| d.action.is_actionable()).collect();
        decisions.sort_by_key(|d| d.priority);

        let account = self.exchange.fetch_balance().await.unwrap_or_else(|_| state.account.clone());
        let mut free_balance = account.free_balance("USDT");
        let free_balance_at_cycle_start = free_balance;

        let (closes, opens): (Vec<_>, Vec<_>) = decisions.into_iter().partition(|d| d.action.is_close());

        for decision in closes {
            let Some(pos) = state.positions.iter().find(|p| p.symbol == decision.symbol).cloned() else {
                continue;
            };
            match self.close_position(&pos, "decision", state).await {
                Ok(()) => {
                    state.positions.retain(|p| p.id != pos.id);
                    self.trailing_stop.clear(&pos.id);
                    if let Ok(acct) = self.exchange.fetch_balance().await {
                        free_balance = acct.free_balance("USDT");
                    }
                }
                Err(e) => {
                    warn!(symbol = %decision.symbol, error = %e, "close decision failed");
                    state.alerts.push(format!("{}: close failed: {e}", decision.symbol));
                }
            }
        }

        if opens.is_empty() {
            return;
        }

        let mut margin_needed: HashMap<String, f64> = HashMap::new();
        let mut total_margin_needed = 0.0;
        for d in &opens {
            let leverage = if d.leverage > 0.0 { d.leverage } else { self.risk_limits.default_leverage };
            let margin = (d.allocation_pct / 100.0) * free_balance / leverage;
            margin_needed.insert(d.symbol.clone(), margin);
            total_margin_needed += margin;
        }
        let budget_cap = 0.8 * free_balance;
        let scale = if total_margin_needed > budget_cap && total_margin_needed > 0.0 {
            budget_cap / total_margin_needed
        } else {
            1.0
        };

        let mut used_margin = 0.0;
        for decision in opens {
            let leverage = if decision.leverage > 0.0 { decision.leverage } else { self.risk_limits.default_leverage };
            let margin = margin_needed.get(&decision.symbol).copied().unwrap_or(0.0) * scale;

            if let Err(reason) = self.validate_decision(state, &decision, margin, used_margin, free_balance_at_cycle_start).await {
                warn!(symbol = %decision.symbol, reason, "decision rejected");
                state.alerts.push(format!("{}: {reason}", decision.symbol));
                continue;
            }

            match self.open_position(state, &decision, leverage, margin).await {
                Ok(()) => used_margin += margin,
                Err(e) => {
                    error!(symbol = %decision.symbol, error = %e, "order placement failed");
                    state.alerts.push(format!("{}: order failed: {e}", decision.symbol));
                }
            }
        }
    }

    /// §4.10.B.1-3 — the full validation chain for one open decision.
    async fn validate_decision(&self, state: &State, decision: &PortfolioDecision, margin: f64, used_margin_so_far: f64, free_balance_at_cycle_start: f64) -> Result<(), String> {
        if decision.leverage <= 0.0 {
            return Err("leverage must be positive".to_string());
        }
        if decision.allocation_pct <= 0.0 {
            return Err("allocation_pct must be positive".to_string());
        }

        let Some(data) = state.market_data.get(&decision.symbol) else {
            return Err("no market data for symbol".to_string());
        };
        let price = data.current_price;
        if price <= 0.0 {
            return Err("no current price".to_string());
        }

        if let (Some(sl), Some(tp)) = (decision.stop_loss, decision.take_profit) {
            if sl <= 0.0 || tp <= 0.0 {
                return Err("stop_loss/take_profit must be positive".to_string());
            }
            let consistent = match decision.action {
                DecisionAction::OpenLong => sl < tp,
                DecisionAction::OpenShort => sl > tp,
                _ => true,
            };
            if !consistent {
                return Err("stop_loss/take_profit direction inconsistent with side".to_string());
            }

            let reward = (tp - price).abs();
            let risk = (price - sl).abs();
            let rr = if risk > 0.0 { reward / risk } else { 0.0 };
            if rr < self.risk_limits.min_risk_reward_ratio {
                return Err(format!("risk-reward {rr:.2} below minimum {:.2}", self.risk_limits.min_risk_reward_ratio));
            }
        }

        let notional = margin * decision.leverage;
        if notional < self.risk_limits.min_position_size_usd || notional > self.risk_limits.max_position_size_usd {
            return Err(format!(
                "position size {notional:.2} outside [{:.2},{:.2}]",
                self.risk_limits.min_position_size_usd, self.risk_limits.max_position_size_usd
            ));
        }
        if decision.leverage > self.risk_limits.max_leverage {
            return Err(format!("leverage {:.1} exceeds max {:.1}", decision.leverage, self.risk_limits.max_leverage));
        }

        if free_balance_at_cycle_start > 0.0 {
            let total_margin_pct = (used_margin_so_far + margin) / free_balance_at_cycle_start * 100.0;
            if total_margin_pct > self.risk_limits.max_total_allocation_pct {
                return Err(format!("total margin usage {total_margin_pct:.1}% exceeds cap {:.1}%", self.risk_limits.max_total_allocation_pct));
            }
        }
        if decision.allocation_pct > self.risk_limits.max_single_allocation_pct {
            return Err(format!("allocation {:.1}% exceeds single-symbol cap {:.1}%", decision.allocation_pct, self.risk_limits.max_single_allocation_pct));
        }

        if self.risk_limits.max_consecutive_losses > 0 {
            let limit = self.risk_limits.max_consecutive_losses as usize;
            if let Ok(recent) = self.trade_history.get_recent_trades(state.bot_id, limit).await {
                if recent.len() >= limit && recent.iter().all(|t| t.pnl_usd < 0.0) {
                    return Err("consecutive-loss pause in effect".to_string());
                }
            }
        }

        let funding_rate = data.funding_rate;
        match decision.action {
            DecisionAction::OpenLong if funding_rate > self.risk_limits.max_funding_rate_pct => {
                return Err(format!("funding rate {funding_rate:.3}% above max for longs"));
            }
            DecisionAction::OpenShort if funding_rate < -self.risk_limits.max_funding_rate_pct => {
                return Err(format!("funding rate {funding_rate:.3}% below -max for shorts"));
            }
            _ => {}
        }

        if let Some(perf) = &state.performance {
            if perf.max_drawdown * 100.0 >= self.risk_limits.max_drawdown_pct {
                return Err(format!("drawdown {:.1}% at or above pause threshold", perf.max_drawdown * 100.0));
            }
        }

        Ok(())
    }

    /// §4.10.B.4-6, §4.10.D — converts margin to amount, places the order,
    /// confirms the fill, and books the open trade.
    async fn open_position(&self, state: &mut State, decision: &PortfolioDecision, leverage: f64, margin: f64) -> anyhow::Result<()> {
        let price = state.market_data.get(&decision.symbol).map(|d| d.current_price).ok_or_else(|| anyhow::anyhow!("missing market data"))?;
        let notional = margin * leverage;
        let precision = self.market_info(&decision.symbol).await.map(|m| m.amount_precision).unwrap_or(3);
        let amount = ceil_to_precision(notional / price, precision);
        if amount <= 0.0 {
            anyhow::bail!("computed amount is zero for {}", decision.symbol);
        }

        let side = match decision.action {
            DecisionAction::OpenLong => Side::Buy,
            DecisionAction::OpenShort => Side::Sell,
            _ => anyhow::bail!("open_position called with a non-open decision"),
        };

        let capabilities = self.exchange.capabilities();
        let params = if capabilities.attached_sl_tp {
            OrderParams {
                reduce_only: false,
                stop_loss_price: decision.stop_loss,
                take_profit_price: decision.take_profit,
            }
        } else {
            OrderParams::default()
        };

        let order = self.exchange.create_order(&decision.symbol, OrderType::Market, side, amount, None, params).await?;
        let order = self.confirm_fill(order, &decision.symbol).await?;
        if order.filled <= 0.0 {
            anyhow::bail!("order did not fill for {}", decision.symbol);
        }

        if !capabilities.attached_sl_tp {
            let reduce_side = match side {
                Side::Buy => Side::Sell,
                Side::Sell => Side::Buy,
            };
            if let Some(sl) = decision.stop_loss {
                let _ = self.exchange.create_order(&decision.symbol, OrderType::Limit, reduce_side, order.filled, Some(sl), OrderParams { reduce_only: true, ..Default::default() }).await;
            }
            if let Some(tp) = decision.take_profit {
                let _ = self.exchange.create_order(&decision.symbol, OrderType::Limit, reduce_side, order.filled, Some(tp), OrderParams { reduce_only: true, ..Default::default() }).await;
            }
        }

        let trade_side = match side {
            Side::Buy => TradeSide::Long,
            Side::Sell => TradeSide::Short,
        };
        let action = match decision.action {
            DecisionAction::OpenLong => "open_long",
            DecisionAction::OpenShort => "open_short",
            _ => "open",
        };

        self.trade_history
            .create(TradeHistory {
                id: 0,
                bot_id: state.bot_id,
                symbol: decision.symbol.clone(),
                side: trade_side,
                action: action.to_string(),
                entry_price: order.average,
                exit_price: None,
                amount: order.filled,
                leverage,
                pnl_usd: 0.0,
                pnl_percent: 0.0,
                fee_paid: order.fee_cost,
                status: TradeStatus::Open,
                opened_at: chrono::Utc::now(),
                closed_at: None,
                cycle_id: state.cycle_id.clone(),
                order_id: order.order_id.clone(),
            })
            .await?;

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

        info!(bot_id = state.bot_id, symbol = %decision.symbol, amount = order.filled, price = order.average, "position opened");
        Ok(())
    }
}

#[async_trait]
impl Stage for ExecutionStage {
    fn name(&self) -> &'static str {
        "execution"
    }

    fn requires(&self) -> &'static [&'static str] {
        &["decision"]
    }

    async fn run(&self, state: &mut State) -> anyhow::Result<StageOutcome> {
        self.trailing_stop_sweep(state).await;
        self.execute_decisions(state).await;
        Ok(StageOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Candle, ExchangeCapabilities, FundingRate, OrderBook, PublicTrade, Ticker};
    use crate::repo::InMemoryTradeHistoryRepo;
    use crate::state::{Account, BatchDecisionResult, OrderStatus, SymbolMarketData};
    use std::sync::atomic::{AtomicU64, Ordering};

    // S4 — amount-precision ceiling rounding.
    #[test]
    fn ceil_to_precision_matches_scenario_s4() {
        let amount = ceil_to_precision(10.03 / 3108.0, 4);
        assert!((amount - 0.0033).abs() < 1e-12);
        assert!(amount * 3108.0 >= 10.0);
    }

    // S5 — PnL long calculation.
    #[test]
    fn realized_pnl_matches_scenario_s5() {
        let (pnl_usd, pnl_pct) = realized_pnl(Side::Buy, 100.0, 110.0, 0.1, 0.0055);
        assert!((pnl_usd - 0.9945).abs() < 1e-9);
        assert!((pnl_pct - 9.945).abs() < 1e-6);
    }

    struct StubExchange {
        order_seq: AtomicU64,
        fill_amount: Option<f64>,
    }

    impl StubExchange {
        fn new() -> Self {
            Self {
                order_seq: AtomicU64::new(0),
                fill_amount: None,
            }
        }
    }

    #[async_trait]
    impl ExchangeAdapter for StubExchange {
        fn capabilities(&self) -> ExchangeCapabilities {
            ExchangeCapabilities::default()
        }

        async fn load_markets(&self) -> anyhow::Result<Vec<MarketInfo>> {
            Ok(vec![MarketInfo {
                symbol: "BTCUSDT".to_string(),
                base: "BTC".to_string(),
                quote: "USDT".to_string(),
                amount_precision: 3,
                price_precision: 2,
                min_notional: 10.0,
                quote_volume_24h: 0.0,
            }])
        }

        async fn fetch_ohlcv(&self, _symbol: &str, _timeframe: &str, _since: Option<i64>, _limit: usize) -> anyhow::Result<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn fetch_ticker(&self, symbol: &str) -> anyhow::Result<Ticker> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                last: 100.0,
                bid: 99.9,
                ask: 100.1,
                timestamp: 0,
            })
        }

        async fn fetch_tickers(&self, symbols: &[String]) -> anyhow::Result<Vec<Ticker>> {
            let mut out = Vec::new();
            for s in symbols {
                out.push(self.fetch_ticker(s).await?);
            }
            Ok(out)
        }

        async fn fetch_order_book(&self, symbol: &str, _depth: usize) -> anyhow::Result<OrderBook> {
            Ok(OrderBook {
                symbol: symbol.to_string(),
                bids: Vec::new(),
                asks: Vec::new(),
                timestamp: 0,
            })
        }

        async fn fetch_trades(&self, _symbol: &str, _limit: usize) -> anyhow::Result<Vec<PublicTrade>> {
            Ok(Vec::new())
        }

        async fn fetch_funding_rates(&self, _symbols: &[String]) -> anyhow::Result<Vec<FundingRate>> {
            Ok(Vec::new())
        }

        async fn fetch_funding_rate_history(&self, _symbol: &str, _since: Option<i64>, _limit: usize) -> anyhow::Result<Vec<FundingRate>> {
            Ok(Vec::new())
        }

        async fn fetch_balance(&self) -> anyhow::Result<Account> {
            let mut account = Account::default();
            account.balances.insert(
                "USDT".to_string(),
                crate::state::AssetBalance {
                    free: 1000.0,
                    used: 0.0,
                    total: 1000.0,
                    debt: 0.0,
                },
            );
            Ok(account)
        }

        async fn fetch_positions(&self, _symbols: Option<&[String]>) -> anyhow::Result<Vec<Position>> {
            Ok(Vec::new())
        }

        async fn create_order(
            &self,
            symbol: &str,
            _order_type: OrderType,
            _side: Side,
            amount: f64,
            _price: Option<f64>,
            _params: OrderParams,
        ) -> anyhow::Result<OrderResult> {
            let id = self.order_seq.fetch_add(1, Ordering::SeqCst);
            let filled = self.fill_amount.unwrap_or(amount);
            Ok(OrderResult {
                success: true,
                order_id: Some(format!("ord-{id}")),
                symbol: symbol.to_string(),
                status: OrderStatus::Closed,
                filled,
                remaining: amount - filled,
                average: 100.0,
                fee_cost: 0.05,
                raw: serde_json::Value::Null,
            })
        }

        async fn cancel_order(&self, _order_id: &str, symbol: &str) -> anyhow::Result<OrderResult> {
            Ok(OrderResult {
                success: true,
                order_id: None,
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

        async fn fetch_order(&self, _order_id: &str, symbol: &str) -> anyhow::Result<OrderResult> {
            Ok(OrderResult {
                success: true,
                order_id: None,
                symbol: symbol.to_string(),
                status: OrderStatus::Closed,
                filled: 1.0,
                remaining: 0.0,
                average: 100.0,
                fee_cost: 0.0,
                raw: serde_json::Value::Null,
            })
        }
    }

    fn stage(exchange: Arc<StubExchange>) -> ExecutionStage {
        ExecutionStage::new(
            exchange,
            Arc::new(TrailingStop::new()),
            Arc::new(InMemoryTradeHistoryRepo::new()),
            Arc::new(Cache::new()),
            FeeSchedule::default(),
            RiskLimits::default(),
        )
    }

    fn state_with_decision(decision: PortfolioDecision, price: f64, funding_rate: f64) -> State {
        let mut state = State::new(1, "test".to_string(), 1000.0, Vec::new());
        state.symbols = vec![decision.symbol.clone()];
        state.market_data.insert(
            decision.symbol.clone(),
            SymbolMarketData {
                current_price: price,
                funding_rate,
                ..Default::default()
            },
        );
        state.batch_decision = Some(BatchDecisionResult {
            decisions: vec![decision],
            total_allocation_pct: 20.0,
            cash_reserve_pct: 80.0,
            strategy_rationale: "test".to_string(),
        });
        state
    }

    fn open_decision(symbol: &str) -> PortfolioDecision {
        PortfolioDecision {
            symbol: symbol.to_string(),
            action: DecisionAction::OpenLong,
            allocation_pct: 20.0,
            leverage: 3.0,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            confidence: 80,
            reasoning: "test".to_string(),
            priority: 50,
        }
    }

    #[tokio::test]
    async fn opens_a_valid_decision_and_books_trade_history() {
        let exchange = Arc::new(StubExchange::new());
        let stage = stage(exchange);
        let mut state = state_with_decision(open_decision("BTCUSDT"), 100.0, 0.0);

        stage.run(&mut state).await.unwrap();

        assert_eq!(state.positions.len(), 1);
        assert!(state.alerts.is_empty());
    }

    #[tokio::test]
    async fn rejects_decision_when_funding_rate_gate_trips() {
        let exchange = Arc::new(StubExchange::new());
        let stage = stage(exchange);
        let mut state = state_with_decision(open_decision("BTCUSDT"), 100.0, 5.0);

        stage.run(&mut state).await.unwrap();

        assert!(state.positions.is_empty());
        assert_eq!(state.alerts.len(), 1);
    }

    #[tokio::test]
    async fn rejects_decision_when_risk_reward_below_minimum() {
        let exchange = Arc::new(StubExchange::new());
        let stage = stage(exchange);
        let mut decision = open_decision("BTCUSDT");
        decision.take_profit = Some(100.5);
        let mut state = state_with_decision(decision, 100.0, 0.0);

        stage.run(&mut state).await.unwrap();

        assert!(state.positions.is_empty());
        assert_eq!(state.alerts.len(), 1);
    }
}
