pub mod builder;

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use crate::runtime::chain::ExistingChainPolicy;
use crate::runtime::constraint::Constraint;

/// 原始 DSL 定义的 Chain (as written in YAML or by `ChainBuilder`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainSpec {
    pub name: String,
    #[serde(default)]
    pub policy: ExistingChainPolicy,
    pub tasks: Vec<TaskSpec>,
}

/// DSL 中的任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub kind: String,
    #[serde(default)]
    pub input: BTreeMap<String, Value>,
    /// Keys this task reads; each must come from its own input or an earlier task.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Keys this task writes on success.
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl TaskSpec {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            input: BTreeMap::new(),
            requires: Vec::new(),
            produces: Vec::new(),
            tags: Vec::new(),
            constraints: Vec::new(),
        }
    }
}
