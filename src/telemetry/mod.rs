// =============================================================================
// Telemetry — tracing setup, failure-escalation, and a process heartbeat file
// =============================================================================
//
// §7: "logs are structured (level, component, bot_id, symbol); repeated
// failures escalate log level after three occurrences in a window." The
// status-file heartbeat is a supplemented ambient feature (original_source's
// `utils/status_file.py`) — a small periodic JSON snapshot external
// monitoring can tail without scraping logs.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

const ESCALATION_THRESHOLD: u32 = 3;
const ESCALATION_WINDOW: Duration = Duration::from_secs(300);

struct Occurrence {
    count: u32,
    window_started_at: Instant,
}

/// Tracks how often a named failure has recurred recently so callers can
/// decide whether to log at WARN (first couple of times) or ERROR (after the
/// threshold, within the window).
#[derive(Default)]
pub struct FailureEscalator {
    occurrences: Mutex<HashMap<String, Occurrence>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalatedLevel {
    Warn,
    Error,
}

impl FailureEscalator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `key` and return the level the caller should
    /// log this occurrence at.
    pub fn record(&self, key: &str) -> EscalatedLevel {
        let mut occurrences = self.occurrences.lock();
        let now = Instant::now();
        let entry = occurrences.entry(key.to_string()).or_insert(Occurrence {
            count: 0,
            window_started_at: now,
        });

        if now.duration_since(entry.window_started_at) > ESCALATION_WINDOW {
            entry.count = 0;
            entry.window_started_at = now;
        }

        entry.count += 1;
        if entry.count >= ESCALATION_THRESHOLD {
            EscalatedLevel::Error
        } else {
            EscalatedLevel::Warn
        }
    }

    pub fn reset(&self, key: &str) {
        self.occurrences.lock().remove(key);
    }
}

/// One supplemented feature (§B): a periodic heartbeat snapshot written to
/// disk so external monitoring can tail process health without scraping
/// structured logs.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub bot_id: i64,
    pub last_cycle_at: i64,
    pub last_cycle_ok: bool,
    pub consecutive_failures: u32,
    pub active_symbols: Vec<String>,
}

pub async fn write_status_file(path: &std::path::Path, snapshot: &StatusSnapshot) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(snapshot)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_after_threshold_occurrences() {
        let escalator = FailureEscalator::new();
        assert_eq!(escalator.record("ws_disconnect"), EscalatedLevel::Warn);
        assert_eq!(escalator.record("ws_disconnect"), EscalatedLevel::Warn);
        assert_eq!(escalator.record("ws_disconnect"), EscalatedLevel::Error);
        assert_eq!(escalator.record("ws_disconnect"), EscalatedLevel::Error);
    }

    #[test]
    fn distinct_keys_track_independently() {
        let escalator = FailureEscalator::new();
        escalator.record("a");
        escalator.record("a");
        escalator.record("a");
        assert_eq!(escalator.record("b"), EscalatedLevel::Warn);
    }

    #[test]
    fn reset_clears_the_counter() {
        let escalator = FailureEscalator::new();
        escalator.record("a");
        escalator.record("a");
        escalator.record("a");
        escalator.reset("a");
        assert_eq!(escalator.record("a"), EscalatedLevel::Warn);
    }
}
