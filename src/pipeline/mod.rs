// =============================================================================
// PipelineGraph (§4.12)
// =============================================================================
//
// Python's dynamic node-class registry becomes, in Rust, a `Vec<Box<dyn
// Stage>>` compiled once per bot: each stage is a plugin instance with a
// `run(&mut State) -> Result<()>` contract and a `requires()` metadata list
// the graph validates before first run. Edges are linear by default
// (`execution_order`); a stage may short-circuit the remaining pipeline by
// returning `StageOutcome::Halt`, which is this module's equivalent of a
// conditional edge selecting "skip to the end" — the only conditional
// branch the specification's data flow actually exercises (FilterStage
// dropping all symbols ends the cycle early). The checkpointer persists
// `State` after every stage so a restarted process can resume mid-cycle.
// =============================================================================

pub mod coins_pick;
pub mod filter;
pub mod market_data;
pub mod regime;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, instrument};

use crate::state::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Continue,
    Halt,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Metadata keys on `State` this stage depends on having been populated
    /// by an earlier stage. Validated once at graph-build time.
    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    async fn run(&self, state: &mut State) -> anyhow::Result<StageOutcome>;
}

/// A persistent key-value checkpoint store keyed by `thread_id = bot_<id>`
/// (§6). An in-memory fallback is acceptable when nothing is configured.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save(&self, thread_id: &str, state: &State) -> anyhow::Result<()>;
    async fn load(&self, thread_id: &str) -> anyhow::Result<Option<State>>;
}

#[derive(Default)]
pub struct InMemoryCheckpointer {
    snapshots: Mutex<HashMap<String, State>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save(&self, thread_id: &str, state: &State) -> anyhow::Result<()> {
        self.snapshots.lock().insert(thread_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> anyhow::Result<Option<State>> {
        Ok(self.snapshots.lock().get(thread_id).cloned())
    }
}

/// Declares which `State` fields a stage can rely on having been populated.
/// Stages self-report via `requires()`; the graph checks those names appear
/// in the union of names every prior stage is known to produce via
/// `provides()`.
pub trait Provides {
    fn provides(&self) -> &'static [&'static str] {
        &[]
    }
}

pub struct PipelineGraph {
    stages: Vec<Arc<dyn Stage>>,
    checkpointer: Arc<dyn Checkpointer>,
}

impl PipelineGraph {
    /// Builds the graph from an ordered stage list, verifying every stage's
    /// `requires()` is satisfied by an earlier stage's declared `name()`
    /// (the simple substitute for a real `provides()` registry: the
    /// specification names stages by the State fields they own, so a
    /// stage's own name doubles as the capability it provides).
    pub fn build(stages: Vec<Arc<dyn Stage>>, checkpointer: Arc<dyn Checkpointer>) -> anyhow::Result<Self> {
        let mut satisfied: Vec<&'static str> = Vec::new();
        for stage in &stages {
            for requirement in stage.requires() {
                if !satisfied.contains(requirement) {
                    anyhow::bail!(
                        "pipeline stage '{}' requires '{}' but no earlier stage provides it",
                        stage.name(),
                        requirement
                    );
                }
            }
            satisfied.push(stage.name());
        }
        Ok(Self { stages, checkpointer })
    }

    #[instrument(skip(self, state), fields(bot_id = state.bot_id, cycle_id = %state.cycle_id))]
    pub async fn run(&self, state: &mut State, thread_id: &str) -> anyhow::Result<()> {
        for stage in &self.stages {
            let outcome = stage.run(state).await.unwrap_or_else(|e| {
                error!(stage = stage.name(), error = %e, "pipeline stage failed, continuing with unchanged state");
                state.alerts.push(format!("{}: {}", stage.name(), e));
                StageOutcome::Continue
            });

            if let Err(e) = self.checkpointer.save(thread_id, state).await {
                error!(stage = stage.name(), error = %e, "failed to persist checkpoint");
            }

            if outcome == StageOutcome::Halt {
                info!(stage = stage.name(), "stage halted the pipeline early");
                break;
            }
        }
        Ok(())
    }

    /// No background resources owned directly by the graph itself today;
    /// kept so `CycleScheduler`'s teardown sequence (§4.13) has a symmetric
    /// call even though it is currently a no-op.
    pub fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    struct Noop(&'static str, &'static [&'static str]);

    #[async_trait]
    impl Stage for Noop {
        fn name(&self) -> &'static str {
            self.0
        }
        fn requires(&self) -> &'static [&'static str] {
            self.1
        }
        async fn run(&self, _state: &mut State) -> anyhow::Result<StageOutcome> {
            Ok(StageOutcome::Continue)
        }
    }

    struct Halter;

    #[async_trait]
    impl Stage for Halter {
        fn name(&self) -> &'static str {
            "halter"
        }
        async fn run(&self, _state: &mut State) -> anyhow::Result<StageOutcome> {
            Ok(StageOutcome::Halt)
        }
    }

    fn state() -> State {
        State::new(1, "test".to_string(), 1000.0, Vec::new())
    }

    #[test]
    fn build_fails_when_requirement_unmet() {
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(Noop("b", &["a"]))];
        let result = PipelineGraph::build(stages, Arc::new(InMemoryCheckpointer::new()));
        assert!(result.is_err());
    }

    #[test]
    fn build_succeeds_when_requirement_provided_earlier() {
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(Noop("a", &[])), Arc::new(Noop("b", &["a"]))];
        let result = PipelineGraph::build(stages, Arc::new(InMemoryCheckpointer::new()));
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn halt_stops_remaining_stages() {
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(Halter), Arc::new(Noop("never", &[]))];
        let graph = PipelineGraph::build(stages, Arc::new(InMemoryCheckpointer::new())).unwrap();
        let mut s = state();
        graph.run(&mut s, "bot_1").await.unwrap();
    }

    #[tokio::test]
    async fn checkpointer_persists_after_each_stage() {
        let checkpointer = Arc::new(InMemoryCheckpointer::new());
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(Noop("a", &[]))];
        let graph = PipelineGraph::build(stages, checkpointer.clone()).unwrap();
        let mut s = state();
        graph.run(&mut s, "bot_1").await.unwrap();
        let loaded = checkpointer.load("bot_1").await.unwrap();
        assert!(loaded.is_some());
    }
}
