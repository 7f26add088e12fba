// =============================================================================
// Cache — typed-namespace key/value store with per-namespace TTLs (§4.1)
// =============================================================================
//
// A single coarse-grained mutex guards the whole store; TTLs are measured in
// whole seconds so contention is not a concern at the call volumes this
// engine produces. No persistence — process-local only.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Process-wide cache singleton (§3 ownership). Construct once in `main` and
/// share via `Arc`.
pub struct Cache {
    store: Mutex<HashMap<(String, String), Entry>>,
    ttls: Mutex<HashMap<String, Duration>>,
    /// Per-bot override for the `coin_selection` namespace's TTL, keyed by
    /// bot id so multiple bots sharing one cache do not clobber each other's
    /// setting (§9 design note).
    coin_selection_overrides: Mutex<HashMap<i64, Duration>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        let mut ttls = HashMap::new();
        ttls.insert("tickers".to_string(), Duration::from_secs(30));
        ttls.insert("ohlcv_3m".to_string(), Duration::from_secs(300));
        ttls.insert("ohlcv_4h".to_string(), Duration::from_secs(3600));
        ttls.insert("orderbook".to_string(), Duration::from_secs(60));
        ttls.insert("trades".to_string(), Duration::from_secs(60));
        ttls.insert("markets".to_string(), Duration::from_secs(3600));
        ttls.insert("coin_selection".to_string(), Duration::from_secs(270));

        Self {
            store: Mutex::new(HashMap::new()),
            ttls: Mutex::new(ttls),
            coin_selection_overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_namespace_ttl(&self, namespace: &str, ttl: Duration) {
        self.ttls.lock().insert(namespace.to_string(), ttl);
    }

    fn ttl_for(&self, namespace: &str) -> Duration {
        self.ttls
            .lock()
            .get(namespace)
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }

    /// `set_cycle_interval(s)` (§4.1): recomputes the `coin_selection` TTL
    /// (0.9 * cycle_interval) for one bot, scoped so concurrent bots on a
    /// shared cache do not overwrite each other's value.
    pub fn set_cycle_interval(&self, bot_id: i64, cycle_interval_seconds: u64) {
        let ttl = Duration::from_secs_f64(cycle_interval_seconds as f64 * 0.9);
        self.coin_selection_overrides.lock().insert(bot_id, ttl);
    }

    fn coin_selection_key(bot_id: i64, key: &str) -> String {
        format!("bot_{bot_id}:{key}")
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let mut store = self.store.lock();
        let composite = (namespace.to_string(), key.to_string());
        match store.get(&composite) {
            Some(entry) if entry.expires_at > Instant::now() => {
                serde_json::from_value(entry.value.clone()).ok()
            }
            Some(_) => {
                store.remove(&composite);
                None
            }
            None => None,
        }
    }

    pub fn get_for_bot<T: serde::de::DeserializeOwned>(
        &self,
        bot_id: i64,
        key: &str,
    ) -> Option<T> {
        self.get("coin_selection", &Self::coin_selection_key(bot_id, key))
    }

    pub fn set<T: serde::Serialize>(&self, namespace: &str, key: &str, value: &T) {
        let Ok(json) = serde_json::to_value(value) else {
            return;
        };
        let ttl = if namespace == "coin_selection" {
            // Caller should use `set_for_bot`; fall back to the namespace
            // default if they didn't.
            self.ttl_for(namespace)
        } else {
            self.ttl_for(namespace)
        };
        let mut store = self.store.lock();
        store.insert(
            (namespace.to_string(), key.to_string()),
            Entry {
                value: json,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn set_for_bot<T: serde::Serialize>(&self, bot_id: i64, key: &str, value: &T) {
        let Ok(json) = serde_json::to_value(value) else {
            return;
        };
        let ttl = self
            .coin_selection_overrides
            .lock()
            .get(&bot_id)
            .copied()
            .unwrap_or_else(|| self.ttl_for("coin_selection"));
        let mut store = self.store.lock();
        store.insert(
            ("coin_selection".to_string(), Self::coin_selection_key(bot_id, key)),
            Entry {
                value: json,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn delete(&self, namespace: &str, key: &str) {
        self.store
            .lock()
            .remove(&(namespace.to_string(), key.to_string()));
    }

    pub fn invalidate(&self, namespace: &str, key: Option<&str>) {
        let mut store = self.store.lock();
        match key {
            Some(k) => {
                store.remove(&(namespace.to_string(), k.to_string()));
            }
            None => {
                store.retain(|(ns, _), _| ns != namespace);
            }
        }
    }

    /// Linear sweep dropping every expired entry. Call periodically; `get`
    /// also evicts lazily on miss so this is a memory-bound, not a
    /// correctness concern.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.store.lock().retain(|_, entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        let cache = Cache::new();
        cache.set("tickers", "BTCUSDT", &42.0_f64);
        let v: Option<f64> = cache.get("tickers", "BTCUSDT");
        assert_eq!(v, Some(42.0));
    }

    #[test]
    fn expired_entry_returns_none_and_is_evicted() {
        let cache = Cache::new();
        cache.set_namespace_ttl("tickers", Duration::from_millis(1));
        cache.set("tickers", "BTCUSDT", &42.0_f64);
        std::thread::sleep(Duration::from_millis(10));
        let v: Option<f64> = cache.get("tickers", "BTCUSDT");
        assert_eq!(v, None);
        assert_eq!(cache.store.lock().len(), 0);
    }

    #[test]
    fn set_cycle_interval_is_scoped_per_bot() {
        let cache = Cache::new();
        cache.set_cycle_interval(1, 100);
        cache.set_cycle_interval(2, 1000);
        cache.set_for_bot(1, "universe", &vec!["BTCUSDT".to_string()]);
        let v: Option<Vec<String>> = cache.get_for_bot(1, "universe");
        assert_eq!(v, Some(vec!["BTCUSDT".to_string()]));
        let missing: Option<Vec<String>> = cache.get_for_bot(2, "universe");
        assert_eq!(missing, None);
    }

    #[test]
    fn cleanup_expired_sweeps_all_namespaces() {
        let cache = Cache::new();
        cache.set_namespace_ttl("trades", Duration::from_millis(1));
        cache.set("trades", "A", &1);
        cache.set("markets", "B", &2);
        std::thread::sleep(Duration::from_millis(10));
        cache.cleanup_expired();
        assert_eq!(cache.store.lock().len(), 1);
    }

    #[test]
    fn invalidate_namespace_drops_all_keys() {
        let cache = Cache::new();
        cache.set("trades", "A", &1);
        cache.set("trades", "B", &2);
        cache.invalidate("trades", None);
        let v: Option<i32> = cache.get("trades", "A");
        assert_eq!(v, None);
    }
}
