use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use dashmap::DashMap;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use crate::actions::WorkExecutor;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, TaskExecutionError};
use crate::runtime::chain::{Chain, ChainId, ChainState, ChainStatus, ExistingChainPolicy};
use crate::runtime::constraint::{ConstraintEvaluator, Environment};
use crate::runtime::context::WorkContext;
use crate::runtime::environment::EnvironmentMonitor;
use crate::runtime::status::{StatusEvent, StatusFilter, StatusStream, StatusSubscription};
use crate::runtime::task::{Data, Task, TaskState, TaskStatus};

/// A submitted chain as tracked by the orchestrator.
struct ChainRun {
    id: ChainId,
    seq: u64,
    name: String,
    tags: BTreeSet<String>,
    tasks: RwLock<Vec<Task>>,
    state: watch::Sender<ChainState>,
    cancel: CancellationToken,
}

impl ChainRun {
    fn new(chain: Chain, seq: u64, cancel: CancellationToken) -> Self {
        let tags = chain.tags();
        let (state, _) = watch::channel(chain.state());
        Self {
            id: chain.id,
            seq,
            name: chain.name,
            tags,
            tasks: RwLock::new(chain.tasks),
            state,
            cancel,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Task>> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Task>> {
        self.tasks.write().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ChainState {
        *self.state.borrow()
    }

    fn task(&self, position: usize) -> Option<Task> {
        self.read().get(position).cloned()
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn chain_status(&self) -> ChainStatus {
        ChainStatus {
            chain_id: self.id,
            name: self.name.clone(),
            state: self.state(),
            tags: self.tags.clone(),
        }
    }

    fn snapshot(&self) -> Vec<TaskStatus> {
        self.read()
            .iter()
            .enumerate()
            .map(|(i, t)| TaskStatus::of(self.id, &self.name, i, t))
            .collect()
    }

    /// Applies `f` (which returns the positions it touched) and builds the
    /// resulting events. Callers hold the name lock, so the write is in place
    /// before anyone can see the events.
    fn mutate(&self, f: impl FnOnce(&mut [Task]) -> Vec<usize>) -> Vec<StatusEvent> {
        let mut tasks = self.write();
        let touched = f(&mut tasks);
        let mut events: Vec<StatusEvent> = touched
            .into_iter()
            .map(|i| StatusEvent::Task(TaskStatus::of(self.id, &self.name, i, &tasks[i])))
            .collect();
        let next = ChainState::derive(&tasks);
        drop(tasks);

        let changed = self.state.send_if_modified(|s| {
            if *s != next {
                *s = next;
                true
            } else {
                false
            }
        });
        if changed {
            events.push(StatusEvent::Chain(self.chain_status()));
        }
        events
    }
}

/// An unused slot: only the registry references it and it holds no chain.
fn idle_slot(slot: &Arc<Mutex<NameSlot>>) -> bool {
    Arc::strong_count(slot) == 1
        && slot
            .try_lock()
            .is_ok_and(|g| g.active.is_none() && g.pending.is_empty())
}

/// Chains sharing one name. Guarded by the per-name mutation lock.
#[derive(Default)]
struct NameSlot {
    active: Option<Arc<ChainRun>>,
    pending: VecDeque<Arc<ChainRun>>,
}

impl NameSlot {
    fn is_busy(&self) -> bool {
        self.active.as_ref().is_some_and(|r| !r.state().is_terminal()) || !self.pending.is_empty()
    }
}

struct Inner {
    config: OrchestratorConfig,
    executor: WorkExecutor,
    evaluator: ConstraintEvaluator,
    environment: EnvironmentMonitor,
    status: StatusStream,
    slots: DashMap<String, Arc<Mutex<NameSlot>>>,
    runs: DashMap<ChainId, Arc<ChainRun>>,
    history: StdMutex<VecDeque<ChainId>>,
    workers: Arc<Semaphore>,
    seq: AtomicU64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Owner of every submitted chain.
///
/// Create one per process and hand clones to whoever needs it; clones share
/// state. Call [`Orchestrator::shutdown`] before exit: it cancels all chains
/// and waits for every task the orchestrator spawned.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, executor: WorkExecutor) -> Self {
        Self::with_environment(config, executor, Environment::default())
    }

    pub fn with_environment(config: OrchestratorConfig, executor: WorkExecutor, environment: Environment) -> Self {
        let status = StatusStream::new(config.observer_buffer, config.observer_timeout());
        let workers = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                executor,
                evaluator: ConstraintEvaluator,
                environment: EnvironmentMonitor::new(environment),
                status,
                slots: DashMap::new(),
                runs: DashMap::new(),
                history: StdMutex::new(VecDeque::new()),
                workers,
                seq: AtomicU64::new(0),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Environment feed; updating it wakes blocked tasks.
    pub fn environment(&self) -> &EnvironmentMonitor {
        &self.inner.environment
    }

    pub fn subscribe(&self, filter: StatusFilter) -> StatusSubscription {
        self.inner.status.subscribe(filter)
    }

    /// Registers `chain` under its name, applying its policy if the name is busy.
    pub async fn submit(&self, chain: Chain) -> Result<ChainId, OrchestratorError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::Shutdown);
        }
        if chain.tasks.is_empty() {
            return Err(OrchestratorError::invalid(format!("chain `{}` has no tasks", chain.name)));
        }
        if let Some(task) = chain.tasks.iter().find(|t| !inner.executor.contains(&t.kind)) {
            return Err(OrchestratorError::invalid(format!("no worker registered for task kind `{}`", task.kind)));
        }

        let slot = inner.slot(&chain.name);
        let mut guard = slot.lock().await;

        let policy = chain.policy;
        let busy = guard.is_busy();
        if busy && policy == ExistingChainPolicy::Keep {
            warn!(chain = %chain.name, "Submission rejected, name is busy");
            return Err(OrchestratorError::NameConflict(chain.name));
        }

        let seq = inner.seq.fetch_add(1, Ordering::SeqCst);
        let run = Arc::new(ChainRun::new(chain, seq, inner.shutdown.child_token()));
        let mut events = Vec::new();

        if busy && policy == ExistingChainPolicy::Append {
            inner.runs.insert(run.id, run.clone());
            guard.pending.push_back(run.clone());
            info!(chain = %run.name, chain_id = %run.id, queued = guard.pending.len(), "Chain appended");
        } else {
            if busy {
                info!(chain = %run.name, "Replacing active chain");
                events.extend(inner.cancel_slot(&mut guard));
            }
            if policy == ExistingChainPolicy::Replace {
                inner.supersede(&run.name);
            }
            inner.runs.insert(run.id, run.clone());
            guard.active = Some(run.clone());
            info!(chain = %run.name, chain_id = %run.id, tasks = run.len(), "Chain submitted");
            inner.tracker.spawn(inner.clone().drive(run.clone()));
        }

        events.push(StatusEvent::Chain(run.chain_status()));
        inner.publish_all(&events).await;
        Ok(run.id)
    }

    /// Cancels the named chain and anything appended behind it. No-op when
    /// nothing under that name is still running.
    pub async fn cancel(&self, name: &str) {
        let Some(slot) = self.inner.slots.get(name).map(|s| s.value().clone()) else {
            debug!(chain = %name, "Cancel ignored, unknown name");
            return;
        };
        let mut guard = slot.lock().await;
        let events = self.inner.cancel_slot(&mut guard);
        if !events.is_empty() {
            info!(chain = %name, "Chain cancelled");
        }
        self.inner.publish_all(&events).await;
    }

    /// Tasks carrying `tag` across all retained chains, in submission order
    /// then position.
    pub fn status(&self, tag: &str) -> Vec<TaskStatus> {
        self.collect(|_, status| status.tags.contains(tag))
    }

    pub fn status_by_name(&self, name: &str) -> Vec<TaskStatus> {
        self.collect(|run, _| run.name == name)
    }

    /// Names that currently have a chain running or queued.
    pub fn tracked_names(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn chain_status(&self, id: ChainId) -> Option<Vec<TaskStatus>> {
        self.inner.runs.get(&id).map(|r| r.snapshot())
    }

    pub fn chain_state(&self, id: ChainId) -> Option<ChainState> {
        self.inner.runs.get(&id).map(|r| r.state())
    }

    pub fn watch_chain(&self, id: ChainId) -> Option<watch::Receiver<ChainState>> {
        self.inner.runs.get(&id).map(|r| r.state.subscribe())
    }

    /// Resolves once the chain is terminal. A chain blocked on constraints
    /// never resolves on its own; wrap in a timeout if that matters.
    pub async fn wait_for_chain(&self, id: ChainId) -> Option<ChainState> {
        let mut rx = self.watch_chain(id)?;
        let state = rx.wait_for(|s| s.is_terminal()).await.ok().map(|s| *s);
        state
    }

    /// Drops every finished chain from history. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut history = self.inner.lock_history();
        let removed = history.len();
        for id in history.drain(..) {
            self.inner.runs.remove(&id);
        }
        drop(history);
        self.inner.slots.retain(|_, slot| !idle_slot(slot));
        debug!(removed, "History pruned");
        removed
    }

    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.inner.shutdown.cancel();
        let slots: Vec<Arc<Mutex<NameSlot>>> = self.inner.slots.iter().map(|s| s.value().clone()).collect();
        for slot in slots {
            let mut guard = slot.lock().await;
            let events = self.inner.cancel_slot(&mut guard);
            self.inner.publish_all(&events).await;
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.status.close();
        info!("Orchestrator stopped");
    }

    fn collect(&self, keep: impl Fn(&ChainRun, &TaskStatus) -> bool) -> Vec<TaskStatus> {
        let mut runs: Vec<Arc<ChainRun>> = self.inner.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by_key(|r| r.seq);
        runs.iter()
            .flat_map(|run| run.snapshot().into_iter().filter(|s| keep(run.as_ref(), s)).collect::<Vec<_>>())
            .collect()
    }
}

impl Inner {
    fn slot(&self, name: &str) -> Arc<Mutex<NameSlot>> {
        self.slots.entry(name.to_string()).or_default().value().clone()
    }

    /// Forgets the name's slot when it is empty and nobody else holds it.
    fn release_slot(&self, name: &str) {
        if self.slots.remove_if(name, |_, slot| idle_slot(slot)).is_some() {
            debug!(chain = %name, "Name slot released");
        }
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<ChainId>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn publish_all(&self, events: &[StatusEvent]) {
        for event in events {
            self.status.publish(event).await;
        }
    }

    /// Signals `run` and marks its Queued/Blocked tasks Cancelled. A Running
    /// task is left to its runner, which discards the result.
    fn cancel_run(&self, run: &ChainRun) -> Vec<StatusEvent> {
        if run.state().is_terminal() {
            return Vec::new();
        }
        run.cancel.cancel();
        run.mutate(|tasks| {
            let mut touched = Vec::new();
            for (i, task) in tasks.iter_mut().enumerate() {
                if matches!(task.state(), TaskState::Queued | TaskState::Blocked) {
                    task.set_state(TaskState::Cancelled);
                    touched.push(i);
                }
            }
            touched
        })
    }

    fn cancel_slot(&self, slot: &mut NameSlot) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        if let Some(active) = &slot.active {
            events.extend(self.cancel_run(active));
        }
        for run in slot.pending.drain(..) {
            events.extend(self.cancel_run(&run));
            self.retire(&run);
        }
        events
    }

    /// Moves a finished run into bounded history, evicting the oldest.
    fn retire(&self, run: &ChainRun) {
        let mut history = self.lock_history();
        if history.contains(&run.id) {
            return;
        }
        history.push_back(run.id);
        while history.len() > self.config.history_limit {
            if let Some(old) = history.pop_front() {
                self.runs.remove(&old);
            }
        }
    }

    /// Forgets finished runs of `name`; a replacement supersedes them.
    fn supersede(&self, name: &str) {
        let mut history = self.lock_history();
        history.retain(|id| {
            let same = self.runs.get(id).is_some_and(|r| r.name == name);
            if same {
                self.runs.remove(id);
            }
            !same
        });
    }

    async fn transition(&self, run: &ChainRun, f: impl FnOnce(&mut [Task]) -> Vec<usize>) {
        let slot = self.slot(&run.name);
        let _guard = slot.lock().await;
        let events = run.mutate(f);
        self.publish_all(&events).await;
    }

    /// Runs `first`, then whatever was appended behind it under the same name.
    async fn drive(self: Arc<Self>, first: Arc<ChainRun>) {
        let mut current = Some(first);
        while let Some(run) = current.take() {
            self.execute_chain(&run).await;
            current = self.finish(&run).await;
        }
    }

    async fn finish(&self, run: &Arc<ChainRun>) -> Option<Arc<ChainRun>> {
        let slot = self.slot(&run.name);
        let mut guard = slot.lock().await;
        let events = self.cancel_run(run);
        self.retire(run);

        let next = if guard.active.as_ref().is_some_and(|a| a.id == run.id) {
            guard.active = guard.pending.pop_front();
            guard.active.clone()
        } else {
            None
        };
        info!(chain = %run.name, chain_id = %run.id, state = ?run.state(), "Chain finished");
        self.publish_all(&events).await;
        drop(guard);
        drop(slot);
        if next.is_none() {
            self.release_slot(&run.name);
        }
        next
    }

    async fn execute_chain(&self, run: &ChainRun) {
        let mut carried = Data::new();

        for position in 0..run.len() {
            if run.cancel.is_cancelled() {
                return;
            }
            let Some(task) = run.task(position) else { return };

            let Some(permit) = self.await_runnable(run, position, &task).await else {
                return;
            };

            let mut input = task.input.clone();
            input.extend(carried.iter().map(|(k, v)| (k.clone(), v.clone())));

            let cancel = &run.cancel;
            let frozen = input.clone();
            let mut started = false;
            self.transition(run, |tasks| {
                let t = &mut tasks[position];
                if cancel.is_cancelled() || t.state().is_terminal() {
                    return Vec::new();
                }
                t.input = frozen;
                t.set_state(TaskState::Running);
                started = true;
                vec![position]
            }).await;
            if !started {
                return;
            }

            info!(chain = %run.name, task_id = %task.id, kind = %task.kind, position, "Task started");
            let ctx = WorkContext::new(run.id, run.name.clone(), task.id, position, run.cancel.clone());
            let outcome = self.run_work(&task.kind, input, ctx).await;
            drop(permit);

            if let Err(e) = &outcome {
                error!(chain = %run.name, task_id = %task.id, error = %e, "Task failed");
            }

            let mut succeeded = false;
            self.transition(run, |tasks| {
                let t = &mut tasks[position];
                if t.state() != TaskState::Running {
                    return Vec::new();
                }
                if cancel.is_cancelled() {
                    t.set_state(TaskState::Cancelled);
                } else {
                    match outcome {
                        Ok(output) => {
                            carried.extend(output.iter().map(|(k, v)| (k.clone(), v.clone())));
                            t.succeed(output);
                            succeeded = true;
                        }
                        Err(e) => t.fail(e),
                    }
                }
                vec![position]
            }).await;

            if !succeeded {
                debug!(chain = %run.name, position, "Chain stopped");
                return;
            }
            debug!(chain = %run.name, task_id = %task.id, "Task succeeded");
        }
    }

    /// Waits until the task's constraints hold and a worker slot is free.
    /// Returns `None` if the chain is cancelled meanwhile.
    async fn await_runnable(&self, run: &ChainRun, position: usize, task: &Task) -> Option<OwnedSemaphorePermit> {
        let mut env_rx = self.environment.subscribe();
        loop {
            let satisfied = {
                let env = env_rx.borrow_and_update();
                self.evaluator.evaluate(task, &env)
            };

            if satisfied {
                let permit = tokio::select! {
                    _ = run.cancel.cancelled() => return None,
                    permit = self.workers.clone().acquire_owned() => permit.ok()?,
                };
                // The environment may have moved while waiting for a worker.
                if self.evaluator.evaluate(task, &self.environment.snapshot()) {
                    return Some(permit);
                }
                drop(permit);
                continue;
            }

            self.transition(run, |tasks| {
                if tasks[position].state() == TaskState::Queued {
                    tasks[position].set_state(TaskState::Blocked);
                    vec![position]
                } else {
                    Vec::new()
                }
            }).await;
            debug!(chain = %run.name, task_id = %task.id, "Task blocked on constraints");

            tokio::select! {
                _ = run.cancel.cancelled() => return None,
                changed = env_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Runs the work function in its own tracked task so a panic is recorded
    /// instead of tearing down the runner.
    async fn run_work(&self, kind: &str, input: Data, ctx: WorkContext) -> Result<Data, TaskExecutionError> {
        let worker = self
            .executor
            .get(kind)
            .map_err(|e| TaskExecutionError::new(kind, e.to_string()))?;

        let work = async move {
            if let Err(e) = worker.validate(&input) {
                return Err(e);
            }
            worker.execute(input, &ctx).await
        };
        let mut handle = self.tracker.spawn(work);

        let joined = match self.config.task_timeout() {
            Some(limit) => match timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(TaskExecutionError::new(kind, format!("timed out after {:?}", limit)));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(TaskExecutionError::new(kind, format!("{:#}", e))),
            Err(e) if e.is_panic() => Err(TaskExecutionError::new(kind, "worker panicked")),
            Err(e) => Err(TaskExecutionError::new(kind, e.to_string())),
        }
    }
}
