// =============================================================================
// BinanceFutures — ExchangeAdapter over Binance USDT-M perpetual futures
// =============================================================================
//
// HMAC-SHA256 signed REST client against `fapi.binance.com`. Every request
// passes through the shared `RateLimiter` before being sent. SECURITY: the
// secret key is held only long enough to sign a query string; it is never
// logged or serialized.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::ratelimit::RateLimiter;
use crate::state::{Account, AssetBalance, OrderResult, OrderStatus, OrderType, Position, PositionStatus, Side};

use super::{
    Candle, ExchangeAdapter, ExchangeCapabilities, FundingRate, MarketInfo, OrderBook,
    OrderBookLevel, OrderParams, PublicTrade, Ticker, TradeSide,
};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;
const BASE_URL: &str = "https://fapi.binance.com";

pub struct BinanceFutures {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl BinanceFutures {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: BASE_URL.to_string(),
            client,
            limiter,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    #[instrument(skip(self), name = "binance_futures::get_signed")]
    async fn get_signed(&self, path: &str, params: &str) -> Result<Value> {
        self.limiter.wait_if_needed().await;
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.get(&url).send().await.context("GET request failed")?;
        let status = resp.status();
        let body: Value = resp.json().await.context("failed to parse response body")?;
        if !status.is_success() {
            anyhow::bail!("Binance {} returned {}: {}", path, status, body);
        }
        Ok(body)
    }

    #[instrument(skip(self, params), name = "binance_futures::post_signed")]
    async fn post_signed(&self, path: &str, params: &str) -> Result<Value> {
        self.limiter.wait_if_needed().await;
        let qs = self.signed_query(params);
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(qs)
            .send()
            .await
            .context("POST request failed")?;
        let status = resp.status();
        let body: Value = resp.json().await.context("failed to parse response body")?;
        if !status.is_success() {
            anyhow::bail!("Binance {} returned {}: {}", path, status, body);
        }
        Ok(body)
    }

    #[instrument(skip(self, params), name = "binance_futures::delete_signed")]
    async fn delete_signed(&self, path: &str, params: &str) -> Result<Value> {
        self.limiter.wait_if_needed().await;
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.delete(&url).send().await.context("DELETE request failed")?;
        let status = resp.status();
        let body: Value = resp.json().await.context("failed to parse response body")?;
        if !status.is_success() {
            anyhow::bail!("Binance {} returned {}: {}", path, status, body);
        }
        Ok(body)
    }

    async fn get_public(&self, path: &str, query: &str) -> Result<Value> {
        self.limiter.wait_if_needed().await;
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let resp = self.client.get(&url).send().await.context("GET request failed")?;
        let status = resp.status();
        let body: Value = resp.json().await.context("failed to parse response body")?;
        if !status.is_success() {
            anyhow::bail!("Binance {} returned {}: {}", path, status, body);
        }
        Ok(body)
    }

    /// Fetches 24h `quoteVolume` for every symbol via the bulk ticker
    /// endpoint, keyed by symbol. Used to rank `load_markets`' output by
    /// trading volume.
    async fn fetch_24h_quote_volumes(&self) -> Result<std::collections::HashMap<String, f64>> {
        let body = self.get_public("/fapi/v1/ticker/24hr", "").await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        let mut volumes = std::collections::HashMap::with_capacity(rows.len());
        for row in rows {
            let symbol = row.get("symbol").and_then(Value::as_str).unwrap_or_default().to_string();
            let quote_volume = row
                .get("quoteVolume")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            volumes.insert(symbol, quote_volume);
        }
        Ok(volumes)
    }

    fn order_status_from_str(s: &str) -> OrderStatus {
        match s {
            "NEW" | "PARTIALLY_FILLED" => OrderStatus::Open,
            "FILLED" => OrderStatus::Closed,
            "CANCELED" => OrderStatus::Canceled,
            "EXPIRED" => OrderStatus::Expired,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        }
    }

    fn order_from_json(symbol: &str, v: &Value) -> OrderResult {
        let status = v
            .get("status")
            .and_then(Value::as_str)
            .map(Self::order_status_from_str)
            .unwrap_or(OrderStatus::Pending);
        let filled: f64 = v
            .get("executedQty")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let orig_qty: f64 = v
            .get("origQty")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(filled);
        let average: f64 = v
            .get("avgPrice")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        OrderResult {
            success: !matches!(status, OrderStatus::Rejected),
            order_id: v.get("orderId").map(|id| id.to_string()),
            symbol: symbol.to_string(),
            status,
            filled,
            remaining: (orig_qty - filled).max(0.0),
            average,
            fee_cost: 0.0,
            raw: v.clone(),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceFutures {
    fn capabilities(&self) -> ExchangeCapabilities {
        ExchangeCapabilities {
            attached_sl_tp: false,
            fetch_funding_rates: true,
            fetch_open_interests: true,
            fetch_funding_rate_history: true,
        }
    }

    async fn load_markets(&self) -> Result<Vec<MarketInfo>> {
        let body = self.get_public("/fapi/v1/exchangeInfo", "").await?;
        let symbols = body
            .get("symbols")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let volumes = self.fetch_24h_quote_volumes().await.unwrap_or_default();

        let mut markets = Vec::with_capacity(symbols.len());
        for s in symbols {
            let symbol = s.get("symbol").and_then(Value::as_str).unwrap_or_default().to_string();
            let base = s.get("baseAsset").and_then(Value::as_str).unwrap_or_default().to_string();
            let quote = s.get("quoteAsset").and_then(Value::as_str).unwrap_or_default().to_string();
            let amount_precision = s.get("quantityPrecision").and_then(Value::as_u64).unwrap_or(3) as u32;
            let price_precision = s.get("pricePrecision").and_then(Value::as_u64).unwrap_or(2) as u32;
            let quote_volume_24h = volumes.get(&symbol).copied().unwrap_or(0.0);
            markets.push(MarketInfo {
                symbol,
                base,
                quote,
                amount_precision,
                price_precision,
                min_notional: 5.0,
                quote_volume_24h,
            });
        }
        Ok(markets)
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, since: Option<i64>, limit: usize) -> Result<Vec<Candle>> {
        let mut query = format!("symbol={symbol}&interval={timeframe}&limit={limit}");
        if let Some(since) = since {
            query.push_str(&format!("&startTime={since}"));
        }
        let body = self.get_public("/fapi/v1/klines", &query).await?;
        let rows = body.as_array().cloned().unwrap_or_default();

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let arr = row.as_array().cloned().unwrap_or_default();
            if arr.len() < 11 {
                continue;
            }
            let parse_f64 = |v: &Value| v.as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                close_time: arr[6].as_i64().unwrap_or(0),
                open: parse_f64(&arr[1]),
                high: parse_f64(&arr[2]),
                low: parse_f64(&arr[3]),
                close: parse_f64(&arr[4]),
                volume: parse_f64(&arr[5]),
                quote_volume: parse_f64(&arr[7]),
                trades_count: arr[8].as_u64().unwrap_or(0),
                taker_buy_volume: parse_f64(&arr[9]),
                taker_buy_quote_volume: parse_f64(&arr[10]),
                is_closed: true,
            });
        }
        Ok(candles)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let body = self.get_public("/fapi/v1/ticker/bookTicker", &format!("symbol={symbol}")).await?;
        let parse_f64 = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let bid = parse_f64("bidPrice");
        let ask = parse_f64("askPrice");
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: (bid + ask) / 2.0,
            bid,
            ask,
            timestamp: Self::timestamp_ms() as i64,
        })
    }

    async fn fetch_tickers(&self, symbols: &[String]) -> Result<Vec<Ticker>> {
        let body = self.get_public("/fapi/v1/ticker/bookTicker", "").await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        let wanted: std::collections::HashSet<&str> = symbols.iter().map(String::as_str).collect();

        let mut tickers = Vec::new();
        for row in rows {
            let symbol = row.get("symbol").and_then(Value::as_str).unwrap_or_default();
            if !wanted.is_empty() && !wanted.contains(symbol) {
                continue;
            }
            let parse_f64 = |key: &str| {
                row.get(key)
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0)
            };
            let bid = parse_f64("bidPrice");
            let ask = parse_f64("askPrice");
            tickers.push(Ticker {
                symbol: symbol.to_string(),
                last: (bid + ask) / 2.0,
                bid,
                ask,
                timestamp: Self::timestamp_ms() as i64,
            });
        }
        Ok(tickers)
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        let body = self
            .get_public("/fapi/v1/depth", &format!("symbol={symbol}&limit={depth}"))
            .await?;

        let parse_levels = |key: &str| -> Vec<OrderBookLevel> {
            body.get(key)
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|r| {
                            let arr = r.as_array()?;
                            let price = arr.first()?.as_str()?.parse().ok()?;
                            let quantity = arr.get(1)?.as_str()?.parse().ok()?;
                            Some(OrderBookLevel { price, quantity })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: parse_levels("bids"),
            asks: parse_levels("asks"),
            timestamp: Self::timestamp_ms() as i64,
        })
    }

    async fn fetch_trades(&self, symbol: &str, limit: usize) -> Result<Vec<PublicTrade>> {
        let body = self
            .get_public("/fapi/v1/trades", &format!("symbol={symbol}&limit={limit}"))
            .await?;
        let rows = body.as_array().cloned().unwrap_or_default();

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            let price = row.get("price").and_then(Value::as_str).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let amount = row.get("qty").and_then(Value::as_str).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let is_buyer_maker = row.get("isBuyerMaker").and_then(Value::as_bool).unwrap_or(false);
            let timestamp = row.get("time").and_then(Value::as_i64).unwrap_or(0);
            trades.push(PublicTrade {
                symbol: symbol.to_string(),
                price,
                amount,
                // Binance reports the maker side; the taker side is the
                // opposite of the maker side.
                side: if is_buyer_maker { TradeSide::Sell } else { TradeSide::Buy },
                timestamp,
            });
        }
        Ok(trades)
    }

    async fn fetch_funding_rates(&self, symbols: &[String]) -> Result<Vec<FundingRate>> {
        let body = self.get_public("/fapi/v1/premiumIndex", "").await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        let wanted: std::collections::HashSet<&str> = symbols.iter().map(String::as_str).collect();

        let mut rates = Vec::new();
        for row in rows {
            let symbol = row.get("symbol").and_then(Value::as_str).unwrap_or_default();
            if !wanted.is_empty() && !wanted.contains(symbol) {
                continue;
            }
            let rate = row
                .get("lastFundingRate")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let next_funding_time = row.get("nextFundingTime").and_then(Value::as_i64).unwrap_or(0);
            rates.push(FundingRate {
                symbol: symbol.to_string(),
                rate,
                next_funding_time,
            });
        }
        Ok(rates)
    }

    async fn fetch_funding_rate_history(&self, symbol: &str, since: Option<i64>, limit: usize) -> Result<Vec<FundingRate>> {
        let mut query = format!("symbol={symbol}&limit={limit}");
        if let Some(since) = since {
            query.push_str(&format!("&startTime={since}"));
        }
        let body = self.get_public("/fapi/v1/fundingRate", &query).await?;
        let rows = body.as_array().cloned().unwrap_or_default();

        let mut rates = Vec::with_capacity(rows.len());
        for row in rows {
            let rate = row
                .get("fundingRate")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let next_funding_time = row.get("fundingTime").and_then(Value::as_i64).unwrap_or(0);
            rates.push(FundingRate {
                symbol: symbol.to_string(),
                rate,
                next_funding_time,
            });
        }
        Ok(rates)
    }

    async fn fetch_balance(&self) -> Result<Account> {
        let body = self.get_signed("/fapi/v2/account", "").await?;
        let assets = body.get("assets").and_then(Value::as_array).cloned().unwrap_or_default();

        let mut balances = std::collections::HashMap::new();
        for a in assets {
            let asset = a.get("asset").and_then(Value::as_str).unwrap_or_default().to_string();
            let free: f64 = a.get("availableBalance").and_then(Value::as_str).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let total: f64 = a.get("walletBalance").and_then(Value::as_str).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            if total == 0.0 && free == 0.0 {
                continue;
            }
            balances.insert(
                asset,
                AssetBalance {
                    free,
                    used: (total - free).max(0.0),
                    total,
                    debt: 0.0,
                },
            );
        }

        Ok(Account {
            timestamp: Self::timestamp_ms() as i64,
            balances,
        })
    }

    async fn fetch_positions(&self, symbols: Option<&[String]>) -> Result<Vec<Position>> {
        let body = self.get_signed("/fapi/v2/positionRisk", "").await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        let wanted: Option<std::collections::HashSet<&str>> =
            symbols.map(|s| s.iter().map(String::as_str).collect());

        let mut positions = Vec::new();
        for row in rows {
            let symbol = row.get("symbol").and_then(Value::as_str).unwrap_or_default().to_string();
            if let Some(wanted) = &wanted {
                if !wanted.contains(symbol.as_str()) {
                    continue;
                }
            }
            let amount: f64 = row
                .get("positionAmt")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            if amount == 0.0 {
                continue;
            }
            let entry_price: f64 = row.get("entryPrice").and_then(Value::as_str).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let leverage: f64 = row.get("leverage").and_then(Value::as_str).and_then(|s| s.parse().ok()).unwrap_or(1.0);

            positions.push(Position {
                id: symbol.clone(),
                symbol,
                side: if amount > 0.0 { Side::Buy } else { Side::Sell },
                position_type: OrderType::Market,
                status: PositionStatus::Open,
                entry_price,
                current_average: entry_price,
                amount: amount.abs(),
                leverage,
                stop_loss_price: None,
                take_profit_price: None,
            });
        }
        Ok(positions)
    }

    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: Side,
        amount: f64,
        price: Option<f64>,
        params: OrderParams,
    ) -> Result<OrderResult> {
        let side_str = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let type_str = match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        };

        let mut query = format!("symbol={symbol}&side={side_str}&type={type_str}&quantity={amount}");
        if let (OrderType::Limit, Some(p)) = (order_type, price) {
            query.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if params.reduce_only {
            query.push_str("&reduceOnly=true");
        }

        let body = self.post_signed("/fapi/v1/order", &query).await?;
        if body.get("orderId").is_none() {
            warn!(%symbol, ?body, "order placement returned no orderId");
        }
        Ok(Self::order_from_json(symbol, &body))
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<OrderResult> {
        let query = format!("symbol={symbol}&orderId={order_id}");
        let body = self.delete_signed("/fapi/v1/order", &query).await?;
        Ok(Self::order_from_json(symbol, &body))
    }

    async fn cancel_orders(&self, symbol: &str) -> Result<Vec<OrderResult>> {
        let query = format!("symbol={symbol}");
        let body = self.delete_signed("/fapi/v1/allOpenOrders", &query).await?;
        debug!(%symbol, ?body, "canceled all open orders");
        Ok(Vec::new())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<OrderResult> {
        let query = format!("symbol={symbol}&orderId={order_id}");
        let body = self.get_signed("/fapi/v1/order", &query).await?;
        Ok(Self::order_from_json(symbol, &body))
    }
}
