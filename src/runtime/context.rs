use tokio_util::sync::CancellationToken;
use anyhow::{Result, anyhow};
use crate::runtime::chain::ChainId;
use crate::runtime::task::TaskId;

/// 运行时上下文 (Runtime Context)
/// Handed to a work function; carries identity and the cooperative cancel signal.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub chain_id: ChainId,
    pub chain_name: String,
    pub task_id: TaskId,
    pub position: usize,
    cancel: CancellationToken,
}

impl WorkContext {
    pub fn new(chain_id: ChainId, chain_name: String, task_id: TaskId, position: usize, cancel: CancellationToken) -> Self {
        Self {
            chain_id,
            chain_name,
            task_id,
            position,
            cancel,
        }
    }

    /// Context for calling a worker outside any orchestrator, e.g. in tests.
    pub fn detached(chain_name: &str) -> Self {
        Self::new(uuid::Uuid::new_v4(), chain_name.to_string(), uuid::Uuid::new_v4(), 0, CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Safe point for long work: errors out if the chain was cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(anyhow!("cancelled"));
        }
        Ok(())
    }
}
