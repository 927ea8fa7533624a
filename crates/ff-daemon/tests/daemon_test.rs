//! Scheduling loop behavior: ticks, completions and shutdown draining.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ff_agents::{Orchestrator, WorkOutcome, WorkRequest, Worker, WorkerError};
use ff_core::config::{AgentSpec, Config};
use ff_core::types::{AgentId, AgentStatus, Role, Severity, Task, TaskId, TaskStatus};
use ff_daemon::daemon::Daemon;

struct InstantWorker;

#[async_trait]
impl Worker for InstantWorker {
    async fn execute(&self, _request: WorkRequest) -> Result<WorkOutcome, WorkerError> {
        Ok(WorkOutcome::Completed {
            artifacts: Vec::new(),
            summary: String::new(),
        })
    }
}

struct NeverFinishes;

#[async_trait]
impl Worker for NeverFinishes {
    async fn execute(&self, _request: WorkRequest) -> Result<WorkOutcome, WorkerError> {
        std::future::pending().await
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.scheduler.tick_secs = 1;
    config.scheduler.drain_secs = 0;
    config.agents = vec![AgentSpec {
        id: "backend-dev-1".into(),
        name: "Alex".into(),
        roles: vec![Role::Backend],
    }];
    config
}

async fn daemon_with(worker: Arc<dyn Worker>) -> Arc<Daemon> {
    let config = config();
    let orchestrator = Orchestrator::in_memory(&config, worker)
        .await
        .expect("orchestrator");
    Arc::new(Daemon::with_orchestrator(config, Arc::new(orchestrator)))
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn loop_works_through_a_dependency_chain() {
    let daemon = daemon_with(Arc::new(InstantWorker)).await;
    let orchestrator = daemon.orchestrator().clone();
    orchestrator
        .create_tasks(vec![
            Task::new("a", "Schema", Role::Backend).with_phase(1, "P1. Core"),
            Task::new("b", "Endpoints", Role::Backend)
                .with_phase(1, "P1. Core")
                .with_dependencies(vec!["a".to_string()]),
        ])
        .await
        .expect("batch");

    let looping = daemon.clone();
    let handle = tokio::spawn(async move { looping.run_loop().await });

    let b = TaskId::new("b");
    wait_until(|| {
        // Nudge the loop so the test doesn't wait on the interval.
        let _ = daemon.loop_handle().request_tick();
        orchestrator.task(&b).is_ok_and(|t| t.status == TaskStatus::Completed)
    })
    .await;

    let agent = orchestrator.agent(&AgentId::new("backend-dev-1")).unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.completed_tasks, 2);

    daemon.shutdown();
    handle.await.unwrap().expect("clean loop exit");
    assert!(!daemon.loop_handle().is_running());
}

#[tokio::test]
async fn shutdown_aborts_hung_runs_without_recording_them() {
    let daemon = daemon_with(Arc::new(NeverFinishes)).await;
    let orchestrator = daemon.orchestrator().clone();
    orchestrator
        .create_task(Task::new("a", "Schema", Role::Backend).with_phase(1, "P1. Core"))
        .await
        .expect("create");

    let looping = daemon.clone();
    let handle = tokio::spawn(async move { looping.run_loop().await });

    let a = TaskId::new("a");
    wait_until(|| orchestrator.coordinator().running().len() == 1).await;

    daemon.shutdown();
    handle.await.unwrap().expect("clean loop exit");

    assert!(orchestrator.coordinator().running().is_empty());
    let task = orchestrator.task(&a).unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);

    // Nothing is recorded for the aborted run; the next start rebuilds the
    // agents idle and recovery resets the task.
    let agent = orchestrator.agent(&AgentId::new("backend-dev-1")).unwrap();
    assert_eq!(agent.status, AgentStatus::Working);
    assert_eq!(agent.current_task, Some(a.clone()));
    let history = orchestrator.task_history(&a).await.unwrap();
    assert!(history.iter().all(|e| e.severity != Severity::Error));
}

#[tokio::test]
async fn trigger_after_loop_exit_is_refused() {
    let daemon = daemon_with(Arc::new(InstantWorker)).await;
    let looping = daemon.clone();
    let handle = tokio::spawn(async move { looping.run_loop().await });

    daemon.shutdown();
    handle.await.unwrap().expect("clean loop exit");

    let err = daemon
        .loop_handle()
        .trigger_run(TaskId::new("a"))
        .await
        .unwrap_err();
    assert!(matches!(err, ff_daemon::daemon::LoopError::Stopped));
}
