use std::collections::{BTreeMap, BTreeSet};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use uuid::Uuid;
use crate::error::TaskExecutionError;
use crate::runtime::chain::ChainId;
use crate::runtime::constraint::Constraint;

pub type TaskId = Uuid;

/// Key-value payload passed between tasks. Values are JSON primitives.
pub type Data = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Blocked,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled)
    }
}

/// 一个任务单元 (one unit of work inside a chain)
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: String,
    /// Static input declared at build time. Frozen once the task starts.
    pub input: Data,
    pub requires: BTreeSet<String>,
    pub produces: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub constraints: Vec<Constraint>,
    state: TaskState,
    output: Data,
    error: Option<TaskExecutionError>,
}

impl Task {
    pub(crate) fn new(
        kind: String,
        input: Data,
        requires: BTreeSet<String>,
        produces: BTreeSet<String>,
        tags: BTreeSet<String>,
        constraints: Vec<Constraint>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            input,
            requires,
            produces,
            tags,
            constraints,
            state: TaskState::Queued,
            output: Data::new(),
            error: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Empty unless the task has succeeded.
    pub fn output(&self) -> &Data {
        &self.output
    }

    pub fn error(&self) -> Option<&TaskExecutionError> {
        self.error.as_ref()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Moves to a non-terminal or cancelled state. Output is cleared so it can
    /// only ever be observed alongside `Succeeded`.
    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
        if state != TaskState::Succeeded {
            self.output.clear();
        }
    }

    pub(crate) fn succeed(&mut self, output: Data) {
        self.state = TaskState::Succeeded;
        self.output = output;
    }

    pub(crate) fn fail(&mut self, error: TaskExecutionError) {
        self.set_state(TaskState::Failed);
        self.error = Some(error);
    }
}

/// Read-only snapshot of a task as published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub chain_id: ChainId,
    pub chain_name: String,
    pub task_id: TaskId,
    pub position: usize,
    pub kind: String,
    pub tags: BTreeSet<String>,
    pub state: TaskState,
    pub output: Data,
    pub error: Option<TaskExecutionError>,
}

impl TaskStatus {
    pub(crate) fn of(chain_id: ChainId, chain_name: &str, position: usize, task: &Task) -> Self {
        Self {
            chain_id,
            chain_name: chain_name.to_string(),
            task_id: task.id,
            position,
            kind: task.kind.clone(),
            tags: task.tags.clone(),
            state: task.state,
            output: task.output.clone(),
            error: task.error.clone(),
        }
    }
}
