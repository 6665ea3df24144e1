mod common;

use std::time::Duration;
use common::*;
use serde_json::json;
use workchain::actions::WorkExecutor;
use workchain::dsl::builder::ChainBuilder;
use workchain::runtime::chain::{ChainState, ExistingChainPolicy};
use workchain::runtime::constraint::{Constraint, NetworkState};
use workchain::runtime::status::{StatusEvent, StatusFilter};
use workchain::runtime::task::TaskState;
use workchain::{Orchestrator, OrchestratorConfig, OrchestratorError};

fn states(orchestrator: &Orchestrator, id: workchain::runtime::chain::ChainId) -> Vec<TaskState> {
    orchestrator
        .chain_status(id)
        .expect("chain is tracked")
        .into_iter()
        .map(|s| s.state)
        .collect()
}

#[tokio::test]
async fn test_submit_does_not_complete_instantly() {
    let log = call_log();
    let orchestrator = orchestrator(WorkExecutor::new().with(RecordingWorker::new("step", &log)));

    let chain = compile(ChainBuilder::new("x").task("step").tag("t").build().build());
    let id = orchestrator.submit(chain).await.expect("submit");

    let status = orchestrator.status("t");
    assert_eq!(status.len(), 1);
    assert!(matches!(status[0].state, TaskState::Queued | TaskState::Running));
    assert!(status[0].output.is_empty());

    assert_eq!(wait_terminal(&orchestrator, id).await, ChainState::Succeeded);
    assert_eq!(orchestrator.status("t")[0].state, TaskState::Succeeded);
}

#[tokio::test]
async fn test_outputs_flow_into_later_tasks() {
    let log = call_log();
    let executor = WorkExecutor::new()
        .with(RecordingWorker::new("a", &log))
        .with(RecordingWorker::new("b", &log))
        .with(RecordingWorker::new("c", &log));
    let orchestrator = orchestrator(executor);

    let spec = ChainBuilder::new("pipe")
        .task("a").input("seed", 7).produces("a").build()
        .task("b").requires("a").produces("b").build()
        .task("c").requires("a").requires("b").input("extra", "x").build()
        .build();
    let id = orchestrator.submit(compile(spec)).await.unwrap();
    assert_eq!(wait_terminal(&orchestrator, id).await, ChainState::Succeeded);

    let tasks = orchestrator.chain_status(id).unwrap();
    let last = &tasks[2].output;
    assert_eq!(last.get("seed"), Some(&json!(7)));
    assert_eq!(last.get("a"), Some(&json!(true)));
    assert_eq!(last.get("b"), Some(&json!(true)));
    assert_eq!(last.get("extra"), Some(&json!("x")));
    assert_eq!(calls(&log), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_unknown_kind_is_rejected_without_side_effects() {
    let orchestrator = orchestrator(WorkExecutor::new());
    let chain = compile(ChainBuilder::new("x").then("nobody").build());

    let err = orchestrator.submit(chain).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidChain(_)));
    assert!(orchestrator.status_by_name("x").is_empty());
}

#[tokio::test]
async fn test_replace_cancels_prior_chain() {
    let log = call_log();
    let hold = HoldWorker::new("hold", true, &log);
    let executor = WorkExecutor::new()
        .with(hold.clone())
        .with(RecordingWorker::new("step", &log));
    let orchestrator = orchestrator(executor);

    let first = compile(ChainBuilder::new("x").then("hold").then("step").then("step").build());
    let first_id = orchestrator.submit(first).await.unwrap();
    wait_state(&orchestrator, first_id, ChainState::Running).await;

    let second = compile(
        ChainBuilder::new("x")
            .policy(ExistingChainPolicy::Replace)
            .then("step")
            .build(),
    );
    let second_id = orchestrator.submit(second).await.unwrap();

    assert_eq!(wait_terminal(&orchestrator, first_id).await, ChainState::Cancelled);
    assert_eq!(wait_terminal(&orchestrator, second_id).await, ChainState::Succeeded);
    wait_settled(&orchestrator, first_id).await;
    assert_eq!(
        states(&orchestrator, first_id),
        vec![TaskState::Cancelled, TaskState::Cancelled, TaskState::Cancelled]
    );
    assert_eq!(states(&orchestrator, second_id), vec![TaskState::Succeeded]);
    // Only the replacement ran "step".
    assert_eq!(calls(&log), vec!["step"]);
}

#[tokio::test]
async fn test_keep_rejects_busy_name() {
    let log = call_log();
    let hold = HoldWorker::new("hold", false, &log);
    let executor = WorkExecutor::new()
        .with(hold.clone())
        .with(RecordingWorker::new("step", &log));
    let orchestrator = orchestrator(executor);

    let first_id = orchestrator
        .submit(compile(ChainBuilder::new("x").then("hold").build()))
        .await
        .unwrap();
    wait_state(&orchestrator, first_id, ChainState::Running).await;

    let second = compile(ChainBuilder::new("x").policy(ExistingChainPolicy::Keep).then("step").build());
    let err = orchestrator.submit(second).await.unwrap_err();
    assert_eq!(err, OrchestratorError::NameConflict("x".to_string()));

    assert_eq!(orchestrator.chain_state(first_id), Some(ChainState::Running));
    assert_eq!(orchestrator.status_by_name("x").len(), 1);

    hold.release.notify_one();
    assert_eq!(wait_terminal(&orchestrator, first_id).await, ChainState::Succeeded);
    assert!(calls(&log).iter().all(|c| c != "step"));
}

#[tokio::test]
async fn test_keep_on_idle_name_runs() {
    let log = call_log();
    let orchestrator = orchestrator(WorkExecutor::new().with(RecordingWorker::new("step", &log)));

    let done = orchestrator
        .submit(compile(ChainBuilder::new("x").then("step").build()))
        .await
        .unwrap();
    wait_terminal(&orchestrator, done).await;

    let again = compile(ChainBuilder::new("x").policy(ExistingChainPolicy::Keep).then("step").build());
    let id = orchestrator.submit(again).await.expect("finished chains do not hold the name");
    assert_eq!(wait_terminal(&orchestrator, id).await, ChainState::Succeeded);
}

#[tokio::test]
async fn test_failure_freezes_remaining_tasks() {
    let log = call_log();
    let executor = WorkExecutor::new()
        .with(RecordingWorker::new("step", &log))
        .with(std::sync::Arc::new(FailWorker));
    let orchestrator = orchestrator(executor);

    let spec = ChainBuilder::new("x").then("step").then("fail").then("step").then("step").build();
    let id = orchestrator.submit(compile(spec)).await.unwrap();

    assert_eq!(wait_terminal(&orchestrator, id).await, ChainState::Failed);
    assert_eq!(
        states(&orchestrator, id),
        vec![TaskState::Succeeded, TaskState::Failed, TaskState::Queued, TaskState::Queued]
    );
    let tasks = orchestrator.chain_status(id).unwrap();
    let failed = &tasks[1];
    let error = failed.error.as_ref().expect("error recorded");
    assert_eq!(error.kind, "fail");
    assert!(error.message.contains("boom"));
    assert!(failed.output.is_empty());
    assert_eq!(calls(&log), vec!["step"]);

    // A failed chain is terminal; cancelling leaves the frozen tasks alone.
    orchestrator.cancel("x").await;
    assert_eq!(states(&orchestrator, id)[2], TaskState::Queued);
}

#[tokio::test]
async fn test_panicking_worker_is_recorded_as_failure() {
    let orchestrator = orchestrator(WorkExecutor::new().with(std::sync::Arc::new(PanicWorker)));
    let id = orchestrator
        .submit(compile(ChainBuilder::new("x").then("panic").build()))
        .await
        .unwrap();

    assert_eq!(wait_terminal(&orchestrator, id).await, ChainState::Failed);
    let status = orchestrator.chain_status(id).unwrap();
    assert_eq!(status[0].error.as_ref().unwrap().message, "worker panicked");
}

#[tokio::test]
async fn test_cancel_after_success_is_noop() {
    let log = call_log();
    let orchestrator = orchestrator(WorkExecutor::new().with(RecordingWorker::new("step", &log)));
    let id = orchestrator
        .submit(compile(ChainBuilder::new("x").then("step").then("step").build()))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&orchestrator, id).await, ChainState::Succeeded);

    let mut events = orchestrator.subscribe(StatusFilter::Chain("x".to_string()));
    orchestrator.cancel("x").await;
    orchestrator.cancel("x").await;

    assert_eq!(orchestrator.chain_state(id), Some(ChainState::Succeeded));
    assert_eq!(states(&orchestrator, id), vec![TaskState::Succeeded, TaskState::Succeeded]);
    assert!(events.try_recv().is_none());

    // Unknown names are fine too.
    orchestrator.cancel("never-submitted").await;
}

#[tokio::test]
async fn test_cancel_discards_result_of_uncooperative_task() {
    let log = call_log();
    let hold = HoldWorker::new("hold", false, &log);
    let executor = WorkExecutor::new()
        .with(hold.clone())
        .with(RecordingWorker::new("step", &log));
    let orchestrator = orchestrator(executor);

    let id = orchestrator
        .submit(compile(ChainBuilder::new("x").then("hold").then("step").build()))
        .await
        .unwrap();
    wait_state(&orchestrator, id, ChainState::Running).await;

    orchestrator.cancel("x").await;
    // Queued work is cancelled at once, so the chain already reports Cancelled.
    assert_eq!(orchestrator.chain_state(id), Some(ChainState::Cancelled));
    assert_eq!(states(&orchestrator, id), vec![TaskState::Running, TaskState::Cancelled]);

    hold.release.notify_one();
    wait_settled(&orchestrator, id).await;

    let status = orchestrator.chain_status(id).unwrap();
    assert_eq!(status[0].state, TaskState::Cancelled);
    assert!(status[0].output.is_empty(), "discarded result must not surface");
    assert_eq!(calls(&log), vec!["hold-done"]);
}

#[tokio::test]
async fn test_append_runs_after_active_chain() {
    let log = call_log();
    let hold = HoldWorker::new("hold", false, &log);
    let executor = WorkExecutor::new()
        .with(hold.clone())
        .with(RecordingWorker::new("step", &log));
    let orchestrator = orchestrator(executor);
    let mut events = orchestrator.subscribe(StatusFilter::Chain("x".to_string()));

    let first = compile(ChainBuilder::new("x").policy(ExistingChainPolicy::Append).then("hold").build());
    let first_id = orchestrator.submit(first).await.unwrap();
    wait_state(&orchestrator, first_id, ChainState::Running).await;

    let second = compile(ChainBuilder::new("x").policy(ExistingChainPolicy::Append).then("step").build());
    let second_id = orchestrator.submit(second).await.unwrap();
    assert_eq!(orchestrator.chain_state(second_id), Some(ChainState::Enqueued));

    hold.release.notify_one();
    assert_eq!(wait_terminal(&orchestrator, first_id).await, ChainState::Succeeded);
    assert_eq!(wait_terminal(&orchestrator, second_id).await, ChainState::Succeeded);
    assert_eq!(calls(&log), vec!["hold-done", "step"]);

    // The second chain's first task only started after the first chain finished.
    let mut first_done_at = None;
    let mut second_started_at = None;
    let mut index = 0;
    while let Some(event) = events.try_recv() {
        match &event {
            StatusEvent::Chain(c) if c.chain_id == first_id && c.state.is_terminal() => first_done_at = Some(index),
            StatusEvent::Task(t) if t.chain_id == second_id && t.state == TaskState::Running => {
                second_started_at = Some(index)
            }
            _ => {}
        }
        index += 1;
    }
    assert!(first_done_at.unwrap() < second_started_at.unwrap());
}

#[tokio::test]
async fn test_append_runs_even_after_failure() {
    let log = call_log();
    let executor = WorkExecutor::new()
        .with(RecordingWorker::new("step", &log))
        .with(std::sync::Arc::new(FailWorker));
    let orchestrator = orchestrator(executor);

    let first_id = orchestrator
        .submit(compile(ChainBuilder::new("x").then("fail").build()))
        .await
        .unwrap();
    let second_id = orchestrator
        .submit(compile(ChainBuilder::new("x").policy(ExistingChainPolicy::Append).then("step").build()))
        .await
        .unwrap();

    assert_eq!(wait_terminal(&orchestrator, first_id).await, ChainState::Failed);
    assert_eq!(wait_terminal(&orchestrator, second_id).await, ChainState::Succeeded);
}

#[tokio::test]
async fn test_cancel_also_drops_appended_chains() {
    let log = call_log();
    let hold = HoldWorker::new("hold", true, &log);
    let executor = WorkExecutor::new()
        .with(hold.clone())
        .with(RecordingWorker::new("step", &log));
    let orchestrator = orchestrator(executor);

    let first_id = orchestrator
        .submit(compile(ChainBuilder::new("x").then("hold").build()))
        .await
        .unwrap();
    wait_state(&orchestrator, first_id, ChainState::Running).await;
    let second_id = orchestrator
        .submit(compile(ChainBuilder::new("x").policy(ExistingChainPolicy::Append).then("step").build()))
        .await
        .unwrap();

    orchestrator.cancel("x").await;
    assert_eq!(orchestrator.chain_state(second_id), Some(ChainState::Cancelled));
    assert_eq!(wait_terminal(&orchestrator, first_id).await, ChainState::Cancelled);
    assert!(calls(&log).is_empty());
}

#[tokio::test]
async fn test_blocked_task_waits_for_environment() {
    let log = call_log();
    let orchestrator = orchestrator(WorkExecutor::new().with(RecordingWorker::new("step", &log)));

    let spec = ChainBuilder::new("net")
        .then("step")
        .task("step")
            .constraint(Constraint::Expression { expr: "network == \"unmetered\"".to_string() })
            .build()
        .build();
    let id = orchestrator.submit(compile(spec)).await.unwrap();
    wait_state(&orchestrator, id, ChainState::Blocked).await;
    assert_eq!(states(&orchestrator, id), vec![TaskState::Succeeded, TaskState::Blocked]);

    // An unrelated change wakes the task, which goes back to waiting.
    orchestrator.environment().set_network(NetworkState::Metered);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(orchestrator.chain_state(id), Some(ChainState::Blocked));

    orchestrator.environment().set_network(NetworkState::Unmetered);
    assert_eq!(wait_terminal(&orchestrator, id).await, ChainState::Succeeded);
    assert_eq!(calls(&log).len(), 2);
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrent_tasks() {
    let log = call_log();
    let a = HoldWorker::new("hold_a", false, &log);
    let b = HoldWorker::new("hold_b", false, &log);
    let config = OrchestratorConfig {
        max_concurrent_tasks: 1,
        ..test_config()
    };
    let orchestrator = Orchestrator::new(config, WorkExecutor::new().with(a.clone()).with(b.clone()));

    let a_id = orchestrator.submit(compile(ChainBuilder::new("a").then("hold_a").build())).await.unwrap();
    wait_state(&orchestrator, a_id, ChainState::Running).await;
    let b_id = orchestrator.submit(compile(ChainBuilder::new("b").then("hold_b").build())).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(states(&orchestrator, b_id), vec![TaskState::Queued]);

    a.release.notify_one();
    wait_state(&orchestrator, b_id, ChainState::Running).await;
    b.release.notify_one();
    assert_eq!(wait_terminal(&orchestrator, b_id).await, ChainState::Succeeded);
}

#[tokio::test]
async fn test_history_is_bounded_and_prunable() {
    let log = call_log();
    let config = OrchestratorConfig {
        history_limit: 1,
        ..test_config()
    };
    let orchestrator = Orchestrator::new(config, WorkExecutor::new().with(RecordingWorker::new("step", &log)));

    let first = orchestrator.submit(compile(ChainBuilder::new("a").then("step").build())).await.unwrap();
    wait_terminal(&orchestrator, first).await;
    let second = orchestrator.submit(compile(ChainBuilder::new("b").then("step").build())).await.unwrap();
    wait_terminal(&orchestrator, second).await;

    // wait_for_chain can resolve a moment before the runner retires the chain.
    tokio::time::timeout(Duration::from_secs(2), async {
        while orchestrator.chain_state(first).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("oldest chain evicted");
    assert_eq!(orchestrator.chain_state(second), Some(ChainState::Succeeded));

    assert_eq!(orchestrator.prune(), 1);
    assert!(orchestrator.chain_state(second).is_none());
}

#[tokio::test]
async fn test_replace_supersedes_finished_history() {
    let log = call_log();
    let orchestrator = orchestrator(WorkExecutor::new().with(RecordingWorker::new("step", &log)));

    let other = orchestrator.submit(compile(ChainBuilder::new("y").then("step").build())).await.unwrap();
    wait_terminal(&orchestrator, other).await;
    let first = orchestrator.submit(compile(ChainBuilder::new("x").then("step").build())).await.unwrap();
    wait_terminal(&orchestrator, first).await;
    // Let the runners retire both chains into history.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let replacement = orchestrator.submit(compile(ChainBuilder::new("x").then("step").build())).await.unwrap();
    assert!(orchestrator.chain_state(first).is_none(), "finished chain of the same name is superseded");
    assert!(orchestrator.chain_state(other).is_some(), "other names are untouched");
    assert_eq!(wait_terminal(&orchestrator, replacement).await, ChainState::Succeeded);
}

#[tokio::test]
async fn test_shutdown_cancels_blocked_chain() {
    let log = call_log();
    let orchestrator = orchestrator(WorkExecutor::new().with(RecordingWorker::new("step", &log)));

    let spec = ChainBuilder::new("x").task("step").constraint(Constraint::RequiresCharging).build().build();
    let id = orchestrator.submit(compile(spec)).await.unwrap();
    wait_state(&orchestrator, id, ChainState::Blocked).await;

    tokio::time::timeout(Duration::from_secs(2), orchestrator.shutdown())
        .await
        .expect("shutdown completes");
    assert_eq!(orchestrator.chain_state(id), Some(ChainState::Cancelled));

    let late = compile(ChainBuilder::new("late").then("step").build());
    assert_eq!(orchestrator.submit(late).await.unwrap_err(), OrchestratorError::Shutdown);
    assert!(calls(&log).is_empty());
}

#[tokio::test]
async fn test_finished_names_are_released() {
    let log = call_log();
    let orchestrator = orchestrator(WorkExecutor::new().with(RecordingWorker::new("step", &log)));

    let blocked = ChainBuilder::new("waiting").task("step").constraint(Constraint::RequiresCharging).build().build();
    let waiting = orchestrator.submit(compile(blocked)).await.unwrap();
    wait_state(&orchestrator, waiting, ChainState::Blocked).await;

    for i in 0..10 {
        let id = orchestrator
            .submit(compile(ChainBuilder::new(&format!("job-{}", i)).then("step").build()))
            .await
            .unwrap();
        wait_terminal(&orchestrator, id).await;
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        while orchestrator.tracked_names() > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("finished names released");
    assert_eq!(orchestrator.tracked_names(), 1);
    // Finished chains stay queryable after their name is released.
    assert_eq!(orchestrator.status_by_name("job-3").len(), 1);

    orchestrator.cancel("waiting").await;
    wait_terminal(&orchestrator, waiting).await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while orchestrator.tracked_names() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cancelled name released");
    assert_eq!(orchestrator.prune(), 11);
}
