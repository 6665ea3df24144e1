use crate::dsl::{ChainSpec, TaskSpec};
use crate::runtime::chain::ExistingChainPolicy;
use crate::runtime::constraint::Constraint;
use serde_json::Value;

pub struct ChainBuilder {
    name: String,
    policy: ExistingChainPolicy,
    pub tasks: Vec<TaskSpec>, // public so tests can tweak a built chain
}

impl ChainBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            policy: ExistingChainPolicy::default(),
            tasks: Vec::new(),
        }
    }

    pub fn policy(mut self, policy: ExistingChainPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn task(self, kind: &str) -> TaskBuilder {
        TaskBuilder {
            chain_builder: self,
            spec: TaskSpec::new(kind),
        }
    }

    /// Shorthand for a task with nothing declared.
    pub fn then(mut self, kind: &str) -> Self {
        self.tasks.push(TaskSpec::new(kind));
        self
    }

    pub fn build(self) -> ChainSpec {
        ChainSpec {
            name: self.name,
            policy: self.policy,
            tasks: self.tasks,
        }
    }
}

pub struct TaskBuilder {
    chain_builder: ChainBuilder,
    spec: TaskSpec,
}

impl TaskBuilder {
    pub fn input(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.spec.input.insert(key.to_string(), value.into());
        self
    }

    pub fn requires(mut self, key: &str) -> Self {
        self.spec.requires.push(key.to_string());
        self
    }

    pub fn produces(mut self, key: &str) -> Self {
        self.spec.produces.push(key.to_string());
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.spec.tags.push(tag.to_string());
        self
    }

    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.spec.constraints.push(constraint);
        self
    }

    pub fn build(mut self) -> ChainBuilder {
        self.chain_builder.tasks.push(self.spec);
        self.chain_builder
    }
}
