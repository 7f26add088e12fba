// =============================================================================
// ExchangeAdapter — uniform async surface over one perpetual-futures exchange
// =============================================================================
//
// §4.3 of the specification. Every method is async and every concrete
// implementation must route its REST calls through a `RateLimiter`
// (`wait_if_needed`) before sending — WebSocket subscriptions are the only
// exception. Capability flags let upper layers probe for features a given
// exchange may not support (attached SL/TP, funding history, ...).
// =============================================================================

pub mod binance_futures;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::state::{OrderResult, OrderType};
use crate::state::{Position, Side};

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub is_closed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicTrade {
    pub symbol: String,
    pub price: f64,
    pub amount: f64,
    pub side: TradeSide,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    pub rate: f64,
    pub next_funding_time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketInfo {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub amount_precision: u32,
    pub price_precision: u32,
    pub min_notional: f64,
    /// 24h quote-asset trading volume, used to rank the tradable universe
    /// (`pipeline::coins_pick`). Zero when the adapter has no volume feed.
    pub quote_volume_24h: f64,
}

/// Capability flags an adapter advertises so upper layers can degrade
/// gracefully instead of calling an unsupported endpoint (§4.3, §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExchangeCapabilities {
    pub attached_sl_tp: bool,
    pub fetch_funding_rates: bool,
    pub fetch_open_interests: bool,
    pub fetch_funding_rate_history: bool,
}

#[derive(Debug, Clone)]
pub struct OrderParams {
    pub reduce_only: bool,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
}

impl Default for OrderParams {
    fn default() -> Self {
        Self {
            reduce_only: false,
            stop_loss_price: None,
            take_profit_price: None,
        }
    }
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn capabilities(&self) -> ExchangeCapabilities;

    async fn load_markets(&self) -> anyhow::Result<Vec<MarketInfo>>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
        limit: usize,
    ) -> anyhow::Result<Vec<Candle>>;

    async fn fetch_ticker(&self, symbol: &str) -> anyhow::Result<Ticker>;

    async fn fetch_tickers(&self, symbols: &[String]) -> anyhow::Result<Vec<Ticker>>;

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> anyhow::Result<OrderBook>;

    async fn fetch_trades(&self, symbol: &str, limit: usize) -> anyhow::Result<Vec<PublicTrade>>;

    async fn fetch_funding_rates(&self, symbols: &[String]) -> anyhow::Result<Vec<FundingRate>>;

    async fn fetch_funding_rate_history(
        &self,
        symbol: &str,
        since: Option<i64>,
        limit: usize,
    ) -> anyhow::Result<Vec<FundingRate>>;

    async fn fetch_balance(&self) -> anyhow::Result<crate::state::Account>;

    async fn fetch_positions(&self, symbols: Option<&[String]>) -> anyhow::Result<Vec<Position>>;

    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: Side,
        amount: f64,
        price: Option<f64>,
        params: OrderParams,
    ) -> anyhow::Result<OrderResult>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> anyhow::Result<OrderResult>;

    async fn cancel_orders(&self, symbol: &str) -> anyhow::Result<Vec<OrderResult>>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> anyhow::Result<OrderResult>;

    /// Polls `fetch_order` until the order reaches a terminal status or
    /// `max_wait` elapses, returning the latest snapshot either way (§4.3).
    async fn wait_for_order_fill(
        &self,
        order_id: &str,
        symbol: &str,
        max_wait: std::time::Duration,
        poll_interval: std::time::Duration,
    ) -> anyhow::Result<OrderResult> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let snapshot = self.fetch_order(order_id, symbol).await?;
            if matches!(
                snapshot.status,
                crate::state::OrderStatus::Closed | crate::state::OrderStatus::Canceled
            ) {
                return Ok(snapshot);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(snapshot);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
