// =============================================================================
// Repository contracts (§6) — no SQL here, just the trait surface plus
// in-memory reference implementations. Persistence is explicitly out of
// scope (§1 Non-goals); these let the rest of the system depend on a stable
// contract instead of a concrete store.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::state::{BotConfig, TradeHistory, TradeStatus};

#[async_trait]
pub trait BotRepo: Send + Sync {
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<BotConfig>>;
    async fn list_active(&self) -> anyhow::Result<Vec<BotConfig>>;
    async fn update(&self, bot: BotConfig) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowNode {
    pub id: i64,
    pub node_type: String,
    pub config: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowEdge {
    pub from_node: i64,
    pub to_node: i64,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Workflow {
    pub id: i64,
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

#[async_trait]
pub trait WorkflowRepo: Send + Sync {
    async fn get_workflow(&self, id: i64) -> anyhow::Result<Option<Workflow>>;
    async fn get_node_config_dict(&self, node_id: i64) -> anyhow::Result<HashMap<String, Value>>;
    async fn clear_nodes_and_edges(&self, workflow_id: i64) -> anyhow::Result<()>;
    async fn add_node(&self, workflow_id: i64, node: WorkflowNode) -> anyhow::Result<()>;
    async fn add_edge(&self, workflow_id: i64, edge: WorkflowEdge) -> anyhow::Result<()>;
    async fn set_node_config(&self, node_id: i64, key: &str, value: Value) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeRow {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
}

#[async_trait]
pub trait ExchangeRepo: Send + Sync {
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<ExchangeRow>>;
}

#[derive(Debug, Clone, Default)]
pub struct LlmConfigRow {
    pub id: i64,
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
}

#[async_trait]
pub trait LlmConfigRepo: Send + Sync {
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<LlmConfigRow>>;
    async fn get_default(&self) -> anyhow::Result<Option<LlmConfigRow>>;
}

#[async_trait]
pub trait SystemConfigRepo: Send + Sync {
    async fn get_by_key(&self, key: &str) -> anyhow::Result<Option<Value>>;
    async fn get_by_prefix(&self, prefix: &str) -> anyhow::Result<HashMap<String, Value>>;
    async fn upsert(&self, key: &str, value: Value) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TradeHistoryRepo: Send + Sync {
    async fn create(&self, row: TradeHistory) -> anyhow::Result<()>;
    async fn close_trade_by_symbol(
        &self,
        bot_id: i64,
        symbol: &str,
        exit_price: f64,
        pnl_usd: f64,
        pnl_percent: f64,
        fee_paid: f64,
    ) -> anyhow::Result<()>;
    async fn get_recent_trades(&self, bot_id: i64, limit: usize) -> anyhow::Result<Vec<TradeHistory>>;
    async fn get_open_trade_by_symbol(&self, bot_id: i64, symbol: &str) -> anyhow::Result<Option<TradeHistory>>;
}

// =============================================================================
// In-memory reference implementations
// =============================================================================

#[derive(Default)]
pub struct InMemoryBotRepo {
    bots: RwLock<HashMap<i64, BotConfig>>,
}

impl InMemoryBotRepo {
    pub fn new(bots: Vec<BotConfig>) -> Self {
        Self {
            bots: RwLock::new(bots.into_iter().map(|b| (b.id, b)).collect()),
        }
    }
}

#[async_trait]
impl BotRepo for InMemoryBotRepo {
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<BotConfig>> {
        Ok(self.bots.read().get(&id).cloned())
    }

    async fn list_active(&self) -> anyhow::Result<Vec<BotConfig>> {
        Ok(self.bots.read().values().cloned().collect())
    }

    async fn update(&self, bot: BotConfig) -> anyhow::Result<()> {
        self.bots.write().insert(bot.id, bot);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryExchangeRepo {
    rows: RwLock<HashMap<i64, ExchangeRow>>,
}

impl InMemoryExchangeRepo {
    pub fn new(rows: Vec<ExchangeRow>) -> Self {
        Self {
            rows: RwLock::new(rows.into_iter().map(|r| (r.id, r)).collect()),
        }
    }
}

#[async_trait]
impl ExchangeRepo for InMemoryExchangeRepo {
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<ExchangeRow>> {
        Ok(self.rows.read().get(&id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryLlmConfigRepo {
    rows: RwLock<HashMap<i64, LlmConfigRow>>,
    default_id: RwLock<Option<i64>>,
}

impl InMemoryLlmConfigRepo {
    pub fn new(rows: Vec<LlmConfigRow>, default_id: Option<i64>) -> Self {
        let default_id = default_id.or_else(|| rows.first().map(|r| r.id));
        Self {
            rows: RwLock::new(rows.into_iter().map(|r| (r.id, r)).collect()),
            default_id: RwLock::new(default_id),
        }
    }
}

#[async_trait]
impl LlmConfigRepo for InMemoryLlmConfigRepo {
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<LlmConfigRow>> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn get_default(&self) -> anyhow::Result<Option<LlmConfigRow>> {
        let id = *self.default_id.read();
        Ok(id.and_then(|id| self.rows.read().get(&id).cloned()))
    }
}

#[derive(Default)]
pub struct InMemoryWorkflowRepo {
    workflows: RwLock<HashMap<i64, Workflow>>,
}

#[async_trait]
impl WorkflowRepo for InMemoryWorkflowRepo {
    async fn get_workflow(&self, id: i64) -> anyhow::Result<Option<Workflow>> {
        Ok(self.workflows.read().get(&id).cloned())
    }

    async fn get_node_config_dict(&self, node_id: i64) -> anyhow::Result<HashMap<String, Value>> {
        let workflows = self.workflows.read();
        for wf in workflows.values() {
            if let Some(node) = wf.nodes.iter().find(|n| n.id == node_id) {
                return Ok(node.config.clone());
            }
        }
        Ok(HashMap::new())
    }

    async fn clear_nodes_and_edges(&self, workflow_id: i64) -> anyhow::Result<()> {
        if let Some(wf) = self.workflows.write().get_mut(&workflow_id) {
            wf.nodes.clear();
            wf.edges.clear();
        }
        Ok(())
    }

    async fn add_node(&self, workflow_id: i64, node: WorkflowNode) -> anyhow::Result<()> {
        let mut workflows = self.workflows.write();
        let wf = workflows.entry(workflow_id).or_insert_with(|| Workflow {
            id: workflow_id,
            ..Default::default()
        });
        wf.nodes.push(node);
        Ok(())
    }

    async fn add_edge(&self, workflow_id: i64, edge: WorkflowEdge) -> anyhow::Result<()> {
        let mut workflows = self.workflows.write();
        let wf = workflows.entry(workflow_id).or_insert_with(|| Workflow {
            id: workflow_id,
            ..Default::default()
        });
        wf.edges.push(edge);
        Ok(())
    }

    async fn set_node_config(&self, node_id: i64, key: &str, value: Value) -> anyhow::Result<()> {
        let mut workflows = self.workflows.write();
        for wf in workflows.values_mut() {
            if let Some(node) = wf.nodes.iter_mut().find(|n| n.id == node_id) {
                node.config.insert(key.to_string(), value);
                return Ok(());
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySystemConfigRepo {
    rows: RwLock<HashMap<String, Value>>,
}

impl InMemorySystemConfigRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SystemConfigRepo for InMemorySystemConfigRepo {
    async fn get_by_key(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.rows.read().get(key).cloned())
    }

    async fn get_by_prefix(&self, prefix: &str) -> anyhow::Result<HashMap<String, Value>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn upsert(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.rows.write().insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryTradeHistoryRepo {
    rows: RwLock<Vec<TradeHistory>>,
}

impl InMemoryTradeHistoryRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeHistoryRepo for InMemoryTradeHistoryRepo {
    async fn create(&self, row: TradeHistory) -> anyhow::Result<()> {
        self.rows.write().push(row);
        Ok(())
    }

    async fn close_trade_by_symbol(
        &self,
        bot_id: i64,
        symbol: &str,
        exit_price: f64,
        pnl_usd: f64,
        pnl_percent: f64,
        fee_paid: f64,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.write();
        if let Some(row) = rows
            .iter_mut()
            .rev()
            .find(|r| r.bot_id == bot_id && r.symbol == symbol && r.status == TradeStatus::Open)
        {
            row.status = TradeStatus::Closed;
            row.exit_price = Some(exit_price);
            row.pnl_usd = pnl_usd;
            row.pnl_percent = pnl_percent;
            row.fee_paid += fee_paid;
            row.closed_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn get_recent_trades(&self, bot_id: i64, limit: usize) -> anyhow::Result<Vec<TradeHistory>> {
        let rows = self.rows.read();
        Ok(rows
            .iter()
            .rev()
            .filter(|r| r.bot_id == bot_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_open_trade_by_symbol(&self, bot_id: i64, symbol: &str) -> anyhow::Result<Option<TradeHistory>> {
        let rows = self.rows.read();
        Ok(rows
            .iter()
            .rev()
            .find(|r| r.bot_id == bot_id && r.symbol == symbol && r.status == TradeStatus::Open)
            .cloned())
    }
}

pub type SharedBotRepo = Arc<dyn BotRepo>;
pub type SharedWorkflowRepo = Arc<dyn WorkflowRepo>;
pub type SharedExchangeRepo = Arc<dyn ExchangeRepo>;
pub type SharedLlmConfigRepo = Arc<dyn LlmConfigRepo>;
pub type SharedSystemConfigRepo = Arc<dyn SystemConfigRepo>;
pub type SharedTradeHistoryRepo = Arc<dyn TradeHistoryRepo>;
