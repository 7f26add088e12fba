// =============================================================================
// StreamManager (§4.4)
// =============================================================================
//
// Owns the symbol -> set-of-timeframes subscription map and one supervised
// background task per (symbol, timeframe). `ExchangeAdapter` exposes no raw
// WebSocket primitive (§4.3 standardizes on polling REST + a rate limiter),
// so each task polls `fetch_ohlcv` on a cadence derived from the timeframe
// and writes closed/partial candles into the shared `Cache` — the same
// effect the specification's `watch_ohlcv` loop produces, reusing the
// teacher's reconnect-with-backoff shape instead of a live socket.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::exchange::ExchangeAdapter;

const MAX_BACKOFF_ATTEMPTS: u32 = 5;
const POLL_FLOOR: Duration = Duration::from_secs(5);
const OHLCV_FETCH_LIMIT: usize = 100;

fn timeframe_to_poll_interval(timeframe: &str) -> Duration {
    // Poll at roughly a quarter of the bar period so a freshly-closed candle
    // is observed promptly, floored so low timeframes don't hammer the API.
    let seconds = match timeframe {
        "1m" => 15,
        "3m" => 45,
        "5m" => 75,
        "15m" => 225,
        "30m" => 450,
        "1h" => 900,
        "4h" => 3600,
        "1d" => 14400,
        _ => 60,
    };
    Duration::from_secs(seconds).max(POLL_FLOOR)
}

struct SymbolState {
    timeframes: HashSet<String>,
    failed: HashSet<String>,
}

pub struct StreamManager {
    exchange: Arc<dyn ExchangeAdapter>,
    cache: Arc<Cache>,
    subscriptions: RwLock<HashMap<String, SymbolState>>,
    tasks: RwLock<HashMap<(String, String), JoinHandle<()>>>,
}

impl StreamManager {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, cache: Arc<Cache>) -> Self {
        Self {
            exchange,
            cache,
            subscriptions: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Reconcile the desired (symbol, timeframes) set against what is
    /// currently running: subscribe the delta, unsubscribe the complement,
    /// retry previously-failed symbols still present in `new_symbols`.
    pub async fn sync_subscriptions(self: &Arc<Self>, new_symbols: &[String], timeframes: &[String]) {
        let wanted: HashSet<String> = new_symbols.iter().cloned().collect();
        let wanted_tfs: HashSet<String> = timeframes.iter().cloned().collect();

        let mut to_start: Vec<(String, String)> = Vec::new();
        let mut to_stop: Vec<(String, String)> = Vec::new();

        {
            let mut subs = self.subscriptions.write();

            // Drop symbols no longer wanted.
            let stale_symbols: Vec<String> = subs
                .keys()
                .filter(|s| !wanted.contains(*s))
                .cloned()
                .collect();
            for symbol in stale_symbols {
                if let Some(state) = subs.remove(&symbol) {
                    for tf in state.timeframes {
                        to_stop.push((symbol.clone(), tf));
                    }
                }
            }

            for symbol in &wanted {
                let entry = subs.entry(symbol.clone()).or_insert_with(|| SymbolState {
                    timeframes: HashSet::new(),
                    failed: HashSet::new(),
                });

                // Retry anything that previously failed but is still wanted.
                entry.failed.retain(|tf| !wanted_tfs.contains(tf));

                for tf in &wanted_tfs {
                    if !entry.timeframes.contains(tf) {
                        entry.timeframes.insert(tf.clone());
                        to_start.push((symbol.clone(), tf.clone()));
                    }
                }

                let stale_tfs: Vec<String> = entry
                    .timeframes
                    .iter()
                    .filter(|tf| !wanted_tfs.contains(*tf))
                    .cloned()
                    .collect();
                for tf in stale_tfs {
                    entry.timeframes.remove(&tf);
                    to_stop.push((symbol.clone(), tf));
                }
            }
        }

        {
            let mut tasks = self.tasks.write();
            for key in &to_stop {
                if let Some(handle) = tasks.remove(key) {
                    handle.abort();
                }
            }
        }

        for (symbol, tf) in to_start {
            // Pre-populate the cache synchronously so a concurrent
            // `get_latest_ohlcv` call does not cold-start.
            if let Ok(candles) = self.exchange.fetch_ohlcv(&symbol, &tf, None, OHLCV_FETCH_LIMIT).await {
                self.cache.set(&format!("ohlcv_{tf}"), &symbol, &candles);
            }
            self.spawn_poll_task(symbol, tf);
        }
    }

    fn spawn_poll_task(self: &Arc<Self>, symbol: String, timeframe: String) {
        let manager = Arc::clone(self);
        let key = (symbol.clone(), timeframe.clone());
        let handle = tokio::spawn(async move {
            manager.poll_loop(symbol, timeframe).await;
        });
        self.tasks.write().insert(key, handle);
    }

    async fn poll_loop(self: Arc<Self>, symbol: String, timeframe: String) {
        let interval = timeframe_to_poll_interval(&timeframe);
        let mut attempt = 0u32;

        loop {
            tokio::time::sleep(interval).await;

            match self.exchange.fetch_ohlcv(&symbol, &timeframe, None, OHLCV_FETCH_LIMIT).await {
                Ok(candles) => {
                    attempt = 0;
                    if let Some(latest) = candles.last() {
                        let namespace = format!("ohlcv_{timeframe}");
                        let newer = self
                            .cache
                            .get::<Vec<crate::exchange::Candle>>(&namespace, &symbol)
                            .and_then(|existing| existing.last().map(|c| c.close_time))
                            .map(|last_close_time| latest.close_time > last_close_time || !latest.is_closed)
                            .unwrap_or(true);
                        if newer {
                            self.cache.set(&namespace, &symbol, &candles);
                        }
                    }
                }
                Err(e) => {
                    attempt += 1;
                    let backoff = Duration::from_secs(2u64.saturating_pow(attempt)).min(Duration::from_secs(60));
                    warn!(%symbol, %timeframe, attempt, error = %e, "ohlcv poll failed, backing off");
                    if attempt >= MAX_BACKOFF_ATTEMPTS {
                        error!(%symbol, %timeframe, "marking symbol failed after max backoff attempts");
                        let mut subs = self.subscriptions.write();
                        if let Some(state) = subs.get_mut(&symbol) {
                            state.failed.insert(timeframe.clone());
                            state.timeframes.remove(&timeframe);
                        }
                        return;
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Cache first, REST fallback, empty on total failure (§4.4).
    pub async fn get_latest_ohlcv(&self, symbol: &str, timeframe: &str) -> Vec<crate::exchange::Candle> {
        let namespace = format!("ohlcv_{timeframe}");
        if let Some(cached) = self.cache.get::<Vec<crate::exchange::Candle>>(&namespace, symbol) {
            return cached;
        }

        match self.exchange.fetch_ohlcv(symbol, timeframe, None, OHLCV_FETCH_LIMIT).await {
            Ok(candles) => {
                self.cache.set(&namespace, symbol, &candles);
                candles
            }
            Err(e) => {
                debug!(symbol, timeframe, error = %e, "ohlcv REST fallback failed");
                Vec::new()
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.write();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        info!("stream manager shut down all tasks");
    }
}
