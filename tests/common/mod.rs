#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use anyhow::{Result, anyhow};
use serde_json::Value;
use tokio::sync::Notify;
use workchain::actions::{WorkExecutor, Worker};
use workchain::compiler::core::ChainCompiler;
use workchain::dsl::ChainSpec;
use workchain::runtime::chain::{Chain, ChainId, ChainState};
use workchain::runtime::context::WorkContext;
use workchain::runtime::task::Data;
use workchain::{Orchestrator, OrchestratorConfig};

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Passes its input through and adds `<name> = true`.
#[derive(Debug)]
pub struct RecordingWorker {
    pub name: String,
    pub log: CallLog,
}

impl RecordingWorker {
    pub fn new(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), log: log.clone() })
    }
}

#[async_trait]
impl Worker for RecordingWorker {
    fn name(&self) -> &str { &self.name }
    async fn execute(&self, input: Data, _ctx: &WorkContext) -> Result<Data> {
        self.log.lock().unwrap().push(self.name.clone());
        let mut output = input;
        output.insert(self.name.clone(), Value::Bool(true));
        Ok(output)
    }
}

#[derive(Debug)]
pub struct FailWorker;

#[async_trait]
impl Worker for FailWorker {
    fn name(&self) -> &str { "fail" }
    async fn execute(&self, _input: Data, _ctx: &WorkContext) -> Result<Data> {
        Err(anyhow!("boom"))
    }
}

#[derive(Debug)]
pub struct PanicWorker;

#[async_trait]
impl Worker for PanicWorker {
    fn name(&self) -> &str { "panic" }
    async fn execute(&self, _input: Data, _ctx: &WorkContext) -> Result<Data> {
        panic!("worker blew up");
    }
}

/// Runs until released. A cooperative hold also stops when its chain is cancelled.
#[derive(Debug)]
pub struct HoldWorker {
    pub name: String,
    pub release: Arc<Notify>,
    pub cooperative: bool,
    pub log: CallLog,
}

impl HoldWorker {
    pub fn new(name: &str, cooperative: bool, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            release: Arc::new(Notify::new()),
            cooperative,
            log: log.clone(),
        })
    }
}

#[async_trait]
impl Worker for HoldWorker {
    fn name(&self) -> &str { &self.name }
    async fn execute(&self, _input: Data, ctx: &WorkContext) -> Result<Data> {
        if self.cooperative {
            tokio::select! {
                _ = self.release.notified() => {}
                _ = ctx.cancelled() => return Err(anyhow!("cancelled")),
            }
        } else {
            self.release.notified().await;
        }
        self.log.lock().unwrap().push(format!("{}-done", self.name));
        Ok(Data::from([(self.name.clone(), Value::from("held"))]))
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        task_timeout_secs: Some(5),
        ..OrchestratorConfig::default()
    }
}

pub fn orchestrator(executor: WorkExecutor) -> Orchestrator {
    Orchestrator::new(test_config(), executor)
}

pub fn compile(spec: ChainSpec) -> Chain {
    ChainCompiler::new().compile(spec).expect("chain should compile")
}

pub async fn wait_state(orchestrator: &Orchestrator, id: ChainId, target: ChainState) {
    let mut rx = orchestrator.watch_chain(id).expect("chain is tracked");
    let reached = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == target))
        .await
        .is_ok_and(|r| r.is_ok());
    assert!(reached, "chain never reached {:?}, last {:?}", target, *rx.borrow());
}

pub async fn wait_terminal(orchestrator: &Orchestrator, id: ChainId) -> ChainState {
    tokio::time::timeout(Duration::from_secs(2), orchestrator.wait_for_chain(id))
        .await
        .expect("chain did not finish in time")
        .expect("chain is tracked")
}

/// Waits until no task of the chain is still Running, e.g. after a cancel.
pub async fn wait_settled(orchestrator: &Orchestrator, id: ChainId) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while orchestrator
            .chain_status(id)
            .expect("chain is tracked")
            .iter()
            .any(|t| t.state == workchain::runtime::task::TaskState::Running)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("running task settles");
}
