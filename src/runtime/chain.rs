use std::collections::BTreeSet;
use serde::{Serialize, Deserialize};
use uuid::Uuid;
use crate::runtime::task::{Task, TaskState};

pub type ChainId = Uuid;

/// What `submit` does when a chain with the same name is still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExistingChainPolicy {
    /// Cancel the active chain and everything queued behind it, then start.
    #[default]
    Replace,
    /// Reject the new chain.
    Keep,
    /// Run after the active chain finishes, whatever its outcome.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainState {
    Enqueued,
    Blocked,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ChainState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChainState::Succeeded | ChainState::Failed | ChainState::Cancelled)
    }

    /// Derives the chain state from its tasks.
    pub fn derive(tasks: &[Task]) -> Self {
        let has = |s: TaskState| tasks.iter().any(|t| t.state() == s);
        if has(TaskState::Failed) {
            ChainState::Failed
        } else if has(TaskState::Cancelled) {
            ChainState::Cancelled
        } else if tasks.iter().all(|t| t.state() == TaskState::Succeeded) {
            ChainState::Succeeded
        } else if has(TaskState::Blocked) {
            ChainState::Blocked
        } else if tasks.iter().all(|t| t.state() == TaskState::Queued) {
            ChainState::Enqueued
        } else {
            ChainState::Running
        }
    }
}

/// A validated, runnable chain. Built by [`crate::compiler::core::ChainCompiler`].
///
/// Tasks are fixed once compiled; their order is what the compiler checked.
///
/// ```compile_fail
/// # use workchain::runtime::chain::Chain;
/// fn reorder(chain: &mut Chain) {
///     chain.tasks.reverse();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Chain {
    pub id: ChainId,
    pub name: String,
    pub policy: ExistingChainPolicy,
    pub(crate) tasks: Vec<Task>,
}

impl Chain {
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn state(&self) -> ChainState {
        ChainState::derive(&self.tasks)
    }

    pub fn tags(&self) -> BTreeSet<String> {
        self.tasks.iter().flat_map(|t| t.tags.iter().cloned()).collect()
    }
}

/// Chain-level transition as published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub chain_id: ChainId,
    pub name: String,
    pub state: ChainState,
    pub tags: BTreeSet<String>,
}
