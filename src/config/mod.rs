// =============================================================================
// ConfigCenter (§6) — dotted-key typed configuration with documented defaults
// =============================================================================
//
// The system runs without a single configuration row present: every key
// below has a hard-coded default. `SystemConfigRepo::upsert` rows, when
// present, override the default for their key. Reload is just re-reading the
// backing repo; there is no separate cache layer here because the repo
// itself (in-memory or DB-backed) is already cheap to read.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::repo::SystemConfigRepo;

#[derive(Debug, Clone)]
pub struct DebateConfig {
    pub enabled: bool,
    pub max_rounds: u32,
    pub timeout_per_phase_seconds: u64,
    pub trade_history_limit: usize,
    pub roles: Vec<String>,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_rounds: 2,
            timeout_per_phase_seconds: 90,
            trade_history_limit: 20,
            roles: vec![
                "analyst".to_string(),
                "bull".to_string(),
                "bear".to_string(),
                "risk_manager".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketRegimeConfig {
    pub adx_trending_threshold: i32,
    pub bb_width_ranging_threshold: f64,
    pub bb_width_volatile_threshold: f64,
    pub primary_timeframe: String,
    pub continue_if_has_positions: bool,
}

impl Default for MarketRegimeConfig {
    fn default() -> Self {
        Self {
            adx_trending_threshold: 25,
            bb_width_ranging_threshold: 0.02,
            bb_width_volatile_threshold: 0.06,
            primary_timeframe: "4h".to_string(),
            continue_if_has_positions: true,
        }
    }
}

/// Process-wide singleton (§5): internally locked, read by any task.
pub struct ConfigCenter {
    repo: Arc<dyn SystemConfigRepo>,
    cache: RwLock<HashMap<String, Value>>,
}

impl ConfigCenter {
    pub fn new(repo: Arc<dyn SystemConfigRepo>) -> Self {
        Self {
            repo,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Re-read every row from the backing repo (hot reload).
    pub async fn reload(&self) -> anyhow::Result<()> {
        let rows = self.repo.get_by_prefix("").await?;
        *self.cache.write() = rows;
        Ok(())
    }

    fn raw(&self, key: &str) -> Option<Value> {
        self.cache.read().get(key).cloned()
    }

    pub fn cache_ttl_seconds(&self, namespace: &str) -> Option<u64> {
        self.raw(&format!("cache.ttl.{namespace}")).and_then(|v| v.as_u64())
    }

    pub fn debate(&self) -> DebateConfig {
        let mut cfg = DebateConfig::default();
        if let Some(v) = self.raw("debate.enabled").and_then(|v| v.as_bool()) {
            cfg.enabled = v;
        }
        if let Some(v) = self.raw("debate.max_rounds").and_then(|v| v.as_u64()) {
            cfg.max_rounds = v as u32;
        }
        if let Some(v) = self.raw("debate.timeout_per_phase").and_then(|v| v.as_u64()) {
            cfg.timeout_per_phase_seconds = v;
        }
        if let Some(v) = self.raw("debate.trade_history_limit").and_then(|v| v.as_u64()) {
            cfg.trade_history_limit = v as usize;
        }
        if let Some(v) = self.raw("debate.roles").and_then(|v| v.as_array().cloned()) {
            cfg.roles = v.into_iter().filter_map(|r| r.as_str().map(String::from)).collect();
        }
        cfg
    }

    pub fn market_regime(&self) -> MarketRegimeConfig {
        let mut cfg = MarketRegimeConfig::default();
        if let Some(v) = self.raw("market_regime.adx_trending_threshold").and_then(|v| v.as_i64()) {
            cfg.adx_trending_threshold = v as i32;
        }
        if let Some(v) = self.raw("market_regime.bb_width_ranging_threshold").and_then(|v| v.as_f64()) {
            cfg.bb_width_ranging_threshold = v;
        }
        if let Some(v) = self.raw("market_regime.bb_width_volatile_threshold").and_then(|v| v.as_f64()) {
            cfg.bb_width_volatile_threshold = v;
        }
        if let Some(v) = self.raw("market_regime.primary_timeframe").and_then(|v| v.as_str().map(String::from)) {
            cfg.primary_timeframe = v;
        }
        if let Some(v) = self.raw("market_regime.continue_if_has_positions").and_then(|v| v.as_bool()) {
            cfg.continue_if_has_positions = v;
        }
        cfg
    }

    pub fn batch_decision_timeout_seconds(&self) -> u64 {
        self.raw("batch_decision.timeout_seconds").and_then(|v| v.as_u64()).unwrap_or(90)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemorySystemConfigRepo;

    #[tokio::test]
    async fn defaults_apply_with_no_rows() {
        let repo = Arc::new(InMemorySystemConfigRepo::new());
        let center = ConfigCenter::new(repo);
        center.reload().await.unwrap();
        assert_eq!(center.batch_decision_timeout_seconds(), 90);
        assert!(!center.debate().enabled);
        assert_eq!(center.market_regime().adx_trending_threshold, 25);
    }

    #[tokio::test]
    async fn row_overrides_default() {
        let repo = Arc::new(InMemorySystemConfigRepo::new());
        repo.upsert("debate.enabled", serde_json::json!(true)).await.unwrap();
        repo.upsert("batch_decision.timeout_seconds", serde_json::json!(30)).await.unwrap();
        let center = ConfigCenter::new(repo);
        center.reload().await.unwrap();
        assert!(center.debate().enabled);
        assert_eq!(center.batch_decision_timeout_seconds(), 30);
    }
}
