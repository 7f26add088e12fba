// =============================================================================
// Core domain types — the entities of §3 of the trading-platform specification
// =============================================================================
//
// Everything in this module is a plain data type (or a thin constructor). No
// I/O, no locking: `State` is single-owner for the duration of one cycle and
// is mutated linearly by each pipeline stage. Stages take `&mut State`.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Bot / exchange / workflow configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Paper,
    Live,
    Backtest,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
            Self::Backtest => write!(f, "backtest"),
        }
    }
}

/// Risk limits embedded in `BotConfig` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_total_allocation_pct: f64,
    pub max_single_allocation_pct: f64,
    pub min_position_size_usd: f64,
    pub max_position_size_usd: f64,
    pub min_risk_reward_ratio: f64,
    pub max_leverage: f64,
    pub default_leverage: f64,
    pub max_funding_rate_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_daily_loss_pct: f64,
    pub max_drawdown_pct: f64,
    pub trailing_stop_enabled: bool,
    pub trailing_stop_trigger_pct: f64,
    pub trailing_stop_distance_pct: f64,
    pub trailing_stop_lock_profit_pct: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_total_allocation_pct: 80.0,
            max_single_allocation_pct: 25.0,
            min_position_size_usd: 10.0,
            max_position_size_usd: 5000.0,
            min_risk_reward_ratio: 1.5,
            max_leverage: 10.0,
            default_leverage: 3.0,
            max_funding_rate_pct: 0.1,
            max_consecutive_losses: 4,
            max_daily_loss_pct: 5.0,
            max_drawdown_pct: 15.0,
            trailing_stop_enabled: true,
            trailing_stop_trigger_pct: 1.5,
            trailing_stop_distance_pct: 0.8,
            trailing_stop_lock_profit_pct: 0.3,
        }
    }
}

/// Quant-signal sub-score weights. Invariant: the four weights sum to 1.0
/// (enforced by `BotConfig::validate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantSignalWeights {
    pub trend: f64,
    pub momentum: f64,
    pub volume: f64,
    pub sentiment: f64,
}

impl Default for QuantSignalWeights {
    fn default() -> Self {
        Self {
            trend: 0.35,
            momentum: 0.25,
            volume: 0.20,
            sentiment: 0.20,
        }
    }
}

/// One row of `BotConfig` (§3). Immutable for the duration of one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: i64,
    pub name: String,
    pub exchange_id: i64,
    pub workflow_id: i64,
    pub llm_id: i64,
    pub trading_mode: TradingMode,
    pub cycle_interval_seconds: u64,
    pub risk_limits: RiskLimits,
    pub quant_signal_weights: QuantSignalWeights,
    pub quant_signal_threshold: i32,
    pub tracing_enabled: bool,
    pub initial_balance: f64,
    pub timeframes: Vec<String>,
}

impl BotConfig {
    /// Validates the `Σ quant_signal_weights = 1.0` invariant (§3).
    pub fn validate(&self) -> Result<(), String> {
        let w = &self.quant_signal_weights;
        let sum = w.trend + w.momentum + w.volume + w.sentiment;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!(
                "quant_signal_weights must sum to 1.0, got {sum:.6}"
            ));
        }
        if !(0..=100).contains(&self.quant_signal_threshold) {
            return Err("quant_signal_threshold must be in 0..=100".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub id: i64,
    pub adapter_type: String,
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
}

// =============================================================================
// Account / Position / Order
// =============================================================================

/// `Account` (§3): timestamped per-asset balances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: f64,
    pub used: f64,
    pub total: f64,
    pub debt: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub timestamp: i64,
    pub balances: HashMap<String, AssetBalance>,
}

impl Account {
    pub fn free_balance(&self, asset: &str) -> f64 {
        self.balances.get(asset).map(|b| b.free).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// `Position` (§3). Invariant: for an open position, `amount > 0 && leverage
/// >= 1.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub position_type: OrderType,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub current_average: f64,
    pub amount: f64,
    pub leverage: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
}

impl Position {
    pub fn notional(&self, price: f64) -> f64 {
        self.amount * price
    }

    pub fn margin_used(&self, price: f64) -> f64 {
        if self.leverage <= 0.0 {
            return 0.0;
        }
        self.notional(price) / self.leverage
    }

    /// Unrealized PnL as a percentage price move, unleveraged (matches
    /// `execution::realized_pnl`'s basis).
    pub fn unrealized_pnl_pct(&self, current_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let direction = match self.side {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        };
        direction * ((current_price - self.entry_price) / self.entry_price) * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Expired,
    Rejected,
    Pending,
}

/// `OrderResult` (§3). Invariant: `filled + remaining == requested amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub symbol: String,
    pub status: OrderStatus,
    pub filled: f64,
    pub remaining: f64,
    pub average: f64,
    pub fee_cost: f64,
    pub raw: serde_json::Value,
}

// =============================================================================
// Decision model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Wait,
}

impl DecisionAction {
    pub fn is_actionable(self) -> bool {
        !matches!(self, DecisionAction::Wait)
    }

    pub fn is_open(self) -> bool {
        matches!(self, DecisionAction::OpenLong | DecisionAction::OpenShort)
    }

    pub fn is_close(self) -> bool {
        matches!(self, DecisionAction::CloseLong | DecisionAction::CloseShort)
    }
}

/// `PortfolioDecision` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioDecision {
    pub symbol: String,
    pub action: DecisionAction,
    pub allocation_pct: f64,
    pub leverage: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub confidence: i32,
    pub reasoning: String,
    pub priority: i32,
}

/// `BatchDecisionResult` (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchDecisionResult {
    pub decisions: Vec<PortfolioDecision>,
    pub total_allocation_pct: f64,
    pub cash_reserve_pct: f64,
    pub strategy_rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystOutput {
    pub symbol: String,
    pub trend: String,
    pub key_levels: Vec<f64>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderSuggestion {
    pub symbol: String,
    pub action: String,
    pub confidence: i32,
    pub allocation_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub reasoning: String,
}

/// `DebateDecisionResult` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateDecisionResult {
    pub analyst_outputs: Vec<AnalystOutput>,
    pub bull_suggestions: Vec<TraderSuggestion>,
    pub bear_suggestions: Vec<TraderSuggestion>,
    pub debate_rounds: Vec<String>,
    pub final_decision: BatchDecisionResult,
    pub debate_summary: String,
    pub completed_at: DateTime<Utc>,
}

// =============================================================================
// Trade history
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Open,
    Closed,
}

/// `TradeHistory` (§3, external repo row — the authoritative ledger).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeHistory {
    pub id: i64,
    pub bot_id: i64,
    pub symbol: String,
    pub side: TradeSide,
    pub action: String,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub amount: f64,
    pub leverage: f64,
    pub pnl_usd: f64,
    pub pnl_percent: f64,
    pub fee_paid: f64,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub cycle_id: String,
    pub order_id: Option<String>,
}

// =============================================================================
// Market regime
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketRegime {
    TrendingUp,
    TrendingDown,
    Ranging,
    Volatile,
    Uncertain,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrendingUp => "trending_up",
            Self::TrendingDown => "trending_down",
            Self::Ranging => "ranging",
            Self::Volatile => "volatile",
            Self::Uncertain => "uncertain",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Per-cycle market data bundle
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolMarketData {
    /// timeframe -> indicator map (indicator name -> value)
    pub indicators: HashMap<String, f64>,
    pub current_price: f64,
    pub funding_rate: f64,
    pub spread: Option<f64>,
    pub imbalance: Option<f64>,
    pub liquidity_depth: Option<f64>,
    pub bid_volume_10: Option<f64>,
    pub ask_volume_10: Option<f64>,
    pub buy_sell_ratio: Option<f64>,
    pub trade_intensity: Option<f64>,
    pub avg_trade_size: Option<f64>,
    pub price_momentum: Option<f64>,
    pub quant_score: Option<f64>,
}

// =============================================================================
// State — the per-cycle working object (§3)
// =============================================================================

#[derive(Debug, Clone)]
pub struct State {
    pub bot_id: i64,
    pub prompt_name: String,
    pub initial_balance: f64,
    pub cycle_id: String,

    pub symbols: Vec<String>,
    pub market_data: HashMap<String, SymbolMarketData>,

    pub account: Account,
    pub positions: Vec<Position>,

    pub batch_decision: Option<BatchDecisionResult>,
    pub debate_decision: Option<DebateDecisionResult>,
    pub performance: Option<crate::performance::PerformanceReport>,

    /// Risk-rejection messages from the previous cycle, consumed and cleared
    /// by the decision stage (§3, §5 ordering guarantee).
    pub alerts: Vec<String>,

    pub market_regime: Option<MarketRegime>,
    pub regime_confidence: f64,
    pub regime_details: HashMap<String, f64>,
}

impl State {
    /// Create a new cycle's `State`, carrying forward only what §3 says
    /// survives conceptually across cycles (`alerts`); account/positions are
    /// always re-fetched fresh by the caller before the pipeline runs.
    pub fn new(bot_id: i64, prompt_name: String, initial_balance: f64, carried_alerts: Vec<String>) -> Self {
        Self {
            bot_id,
            prompt_name,
            initial_balance,
            cycle_id: uuid::Uuid::new_v4().to_string(),
            symbols: Vec::new(),
            market_data: HashMap::new(),
            account: Account::default(),
            positions: Vec::new(),
            batch_decision: None,
            debate_decision: None,
            performance: None,
            alerts: carried_alerts,
            market_regime: None,
            regime_confidence: 0.0,
            regime_details: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_config_rejects_bad_weight_sum() {
        let mut cfg = sample_bot_config();
        cfg.quant_signal_weights.trend = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bot_config_accepts_valid_weight_sum() {
        let cfg = sample_bot_config();
        assert!(cfg.validate().is_ok());
    }

    fn sample_bot_config() -> BotConfig {
        BotConfig {
            id: 1,
            name: "test".into(),
            exchange_id: 1,
            workflow_id: 1,
            llm_id: 1,
            trading_mode: TradingMode::Paper,
            cycle_interval_seconds: 300,
            risk_limits: RiskLimits::default(),
            quant_signal_weights: QuantSignalWeights::default(),
            quant_signal_threshold: 60,
            tracing_enabled: false,
            initial_balance: 10_000.0,
            timeframes: vec!["3m".into(), "4h".into()],
        }
    }

    #[test]
    fn position_margin_and_notional() {
        let pos = Position {
            id: "1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            position_type: OrderType::Market,
            status: PositionStatus::Open,
            entry_price: 100.0,
            current_average: 100.0,
            amount: 2.0,
            leverage: 4.0,
            stop_loss_price: None,
            take_profit_price: None,
        };
        assert_eq!(pos.notional(110.0), 220.0);
        assert_eq!(pos.margin_used(110.0), 55.0);
    }

    #[test]
    fn unrealized_pnl_pct_long_vs_short() {
        let long = Position {
            id: "1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            position_type: OrderType::Market,
            status: PositionStatus::Open,
            entry_price: 100.0,
            current_average: 100.0,
            amount: 1.0,
            leverage: 1.0,
            stop_loss_price: None,
            take_profit_price: None,
        };
        assert!((long.unrealized_pnl_pct(110.0) - 10.0).abs() < 1e-9);

        let mut short = long.clone();
        short.side = Side::Sell;
        assert!((short.unrealized_pnl_pct(110.0) - (-10.0)).abs() < 1e-9);
    }

    #[test]
    fn unrealized_pnl_pct_is_unleveraged() {
        // Leverage scales margin and notional, not the price-move percentage —
        // the same 10% move reads as 10%, not 30%, at 3x leverage.
        let leveraged = Position {
            id: "1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            position_type: OrderType::Market,
            status: PositionStatus::Open,
            entry_price: 100.0,
            current_average: 100.0,
            amount: 1.0,
            leverage: 3.0,
            stop_loss_price: None,
            take_profit_price: None,
        };
        assert!((leveraged.unrealized_pnl_pct(110.0) - 10.0).abs() < 1e-9);
    }
}
