use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Orchestrator tuning knobs. Every field has a default so a YAML file only
/// needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Finished chains kept for status queries before the oldest is evicted.
    pub history_limit: usize,
    /// Tasks allowed to run at the same time across all chains.
    pub max_concurrent_tasks: usize,
    /// Queue depth of each status subscription.
    pub observer_buffer: usize,
    /// How long the publisher waits on a full subscription before skipping it.
    pub observer_timeout_ms: u64,
    /// Upper bound on a single work function; `None` disables the timeout.
    pub task_timeout_secs: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            max_concurrent_tasks: 4,
            observer_buffer: 64,
            observer_timeout_ms: 200,
            task_timeout_secs: Some(60),
        }
    }
}

impl OrchestratorConfig {
    pub fn observer_timeout(&self) -> Duration {
        Duration::from_millis(self.observer_timeout_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}
