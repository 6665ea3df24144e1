use std::collections::{BTreeSet, HashSet};
use serde_json::Value;
use uuid::Uuid;
use crate::dsl::{ChainSpec, TaskSpec};
use crate::error::OrchestratorError;
use crate::runtime::chain::Chain;
use crate::runtime::task::{Data, Task};

/// Turns a [`ChainSpec`] into a runnable [`Chain`], rejecting malformed definitions.
#[derive(Debug, Default)]
pub struct ChainCompiler;

impl ChainCompiler {
    pub fn new() -> Self {
        Self
    }

    pub fn compile(&self, spec: ChainSpec) -> Result<Chain, OrchestratorError> {
        if spec.name.trim().is_empty() {
            return Err(OrchestratorError::invalid("chain name is empty"));
        }
        if spec.tasks.is_empty() {
            return Err(OrchestratorError::invalid(format!("chain `{}` has no tasks", spec.name)));
        }

        // Keys produced by tasks before the one being checked.
        let mut available: HashSet<String> = HashSet::new();
        let mut tasks = Vec::with_capacity(spec.tasks.len());

        for (position, task) in spec.tasks.into_iter().enumerate() {
            Self::check_task(&spec.name, position, &task, &available)?;
            available.extend(task.produces.iter().cloned());
            tasks.push(Self::transform_task(task));
        }

        Ok(Chain {
            id: Uuid::new_v4(),
            name: spec.name,
            policy: spec.policy,
            tasks,
        })
    }

    fn check_task(chain: &str, position: usize, task: &TaskSpec, available: &HashSet<String>) -> Result<(), OrchestratorError> {
        if task.kind.trim().is_empty() {
            return Err(OrchestratorError::invalid(format!("{}[{}]: task kind is empty", chain, position)));
        }

        if let Some((key, _)) = task.input.iter().find(|(_, v)| !is_primitive(v)) {
            return Err(OrchestratorError::invalid(format!(
                "{}[{}] `{}`: input `{}` is not a primitive value",
                chain, position, task.kind, key
            )));
        }

        for constraint in &task.constraints {
            constraint
                .check_syntax()
                .map_err(|e| OrchestratorError::invalid(format!("{}[{}] `{}`: {}", chain, position, task.kind, e)))?;
        }

        if let Some(missing) = task
            .requires
            .iter()
            .find(|k| !task.input.contains_key(*k) && !available.contains(*k))
        {
            return Err(OrchestratorError::invalid(format!(
                "{}[{}] `{}`: input `{}` is not produced by any earlier task",
                chain, position, task.kind, missing
            )));
        }
        Ok(())
    }

    fn transform_task(task: TaskSpec) -> Task {
        Task::new(
            task.kind,
            task.input.into_iter().collect::<Data>(),
            task.requires.into_iter().collect::<BTreeSet<_>>(),
            task.produces.into_iter().collect::<BTreeSet<_>>(),
            task.tags.into_iter().collect::<BTreeSet<_>>(),
            task.constraints,
        )
    }
}

impl TryFrom<ChainSpec> for Chain {
    type Error = OrchestratorError;

    fn try_from(spec: ChainSpec) -> Result<Self, Self::Error> {
        ChainCompiler::new().compile(spec)
    }
}

fn is_primitive(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}
