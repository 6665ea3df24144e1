use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use anyhow::{Result, anyhow};
use std::fmt::Debug;
use crate::runtime::context::WorkContext;
use crate::runtime::task::Data;

pub mod image;

/// 插件接口：所有任务种类必须实现此 Trait
/// Contract: either a full output map or an error, never partial output.
#[async_trait]
pub trait Worker: Send + Sync + Debug {
    /// Task kind this worker serves, e.g. "blur".
    fn name(&self) -> &str;
    fn validate(&self, _input: &Data) -> Result<()> {
        Ok(())
    }
    async fn execute(&self, input: Data, ctx: &WorkContext) -> Result<Data>;
}

/// Registry of workers keyed by task kind.
#[derive(Debug, Default, Clone)]
pub struct WorkExecutor {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.name().to_string(), worker);
    }

    pub fn with(mut self, worker: Arc<dyn Worker>) -> Self {
        self.register(worker);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.workers.contains_key(kind)
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Worker>> {
        self.workers
            .get(kind)
            .cloned()
            .ok_or_else(|| anyhow!("Worker not found: {}", kind))
    }

    pub async fn execute(&self, kind: &str, input: Data, ctx: &WorkContext) -> Result<Data> {
        let worker = self.get(kind)?;
        worker.validate(&input)?;
        worker.execute(input, ctx).await
    }
}
