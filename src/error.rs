use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned synchronously by the orchestrator to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("invalid chain: {0}")]
    InvalidChain(String),

    #[error("a chain named `{0}` is already active")]
    NameConflict(String),

    #[error("orchestrator is shut down")]
    Shutdown,
}

impl OrchestratorError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidChain(msg.into())
    }
}

/// Failure of a single task's work function. Recorded on the task, never thrown
/// back to the submitter.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("task `{kind}` failed: {message}")]
pub struct TaskExecutionError {
    pub kind: String,
    pub message: String,
}

impl TaskExecutionError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}
