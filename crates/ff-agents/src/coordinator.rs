//! Execution coordinator: starts runs, drives workers under a timeout,
//! records outcomes, applies operator overrides and reconciles interrupted
//! runs after a restart.
//!
//! Every cross-entity transition (task + agent + log event) is one
//! [`Commit`], written while holding the task gate and then the agent gate,
//! always in that order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use ff_core::db::{Commit, EventDraft};
use ff_core::types::{
    AgentId, AgentStatus, Severity, Task, TaskFilter, TaskId, TaskStatus, TransitionActor,
};
use ff_telemetry::tracing_setup::run_span;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};

use crate::error::{OrchestratorError, Result};
use crate::log_sink::LogSink;
use crate::registry::{unbind, AcquireMode, AgentRegistry};
use crate::task_store::{apply_status, TaskStore};
use crate::worker::{WorkOutcome, WorkRequest, Worker};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// A run that has been committed as in progress and still has to be driven.
///
/// Holds one concurrency permit until it is dropped. If it is dropped
/// without [`ExecutionCoordinator::drive`], the task stays in progress until
/// the next recovery pass.
#[derive(Debug)]
pub struct Started {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub attempt: u32,
    timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

/// How a driven run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub attempt: u32,
    /// Task status after the run was recorded.
    pub status: TaskStatus,
    /// The task was overridden while the worker ran, so the outcome was
    /// thrown away.
    pub discarded: bool,
}

/// What a recovery pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub reset_tasks: Vec<TaskId>,
    pub released_agents: Vec<AgentId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.reset_tasks.is_empty() && self.released_agents.is_empty()
    }
}

/// Whether a caller waits for a busy task gate or skips the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateMode {
    Wait,
    Skip,
}

enum RunEnd {
    Outcome(WorkOutcome),
    Error(String),
    Cancelled,
}

// ---------------------------------------------------------------------------
// ExecutionCoordinator
// ---------------------------------------------------------------------------

pub struct ExecutionCoordinator {
    store: Arc<TaskStore>,
    registry: Arc<AgentRegistry>,
    logs: Arc<LogSink>,
    worker: Arc<dyn Worker>,
    running: DashMap<TaskId, AbortHandle>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    default_timeout: Duration,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<TaskStore>,
        registry: Arc<AgentRegistry>,
        logs: Arc<LogSink>,
        worker: Arc<dyn Worker>,
        max_concurrent: usize,
        default_timeout: Duration,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            store,
            registry,
            logs,
            worker,
            running: DashMap::new(),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            default_timeout,
        }
    }

    /// Concurrency permits not held by a started run.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Tasks whose worker is currently executing.
    pub fn running(&self) -> Vec<TaskId> {
        self.running.iter().map(|e| e.key().clone()).collect()
    }

    /// Abort every executing worker without recording an outcome. Used on
    /// shutdown after the driving futures themselves have been dropped; the
    /// affected tasks stay in progress until the next recovery pass.
    pub fn abort_workers(&self) -> usize {
        let mut aborted = 0;
        self.running.retain(|_, handle| {
            handle.abort();
            aborted += 1;
            false
        });
        aborted
    }

    fn permit(&self) -> Result<OwnedSemaphorePermit> {
        self.slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| OrchestratorError::AtCapacity {
                limit: self.max_concurrent,
            })
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Start `task_id` on an idle agent with the required role.
    ///
    /// With [`AcquireMode::Wait`] a missing agent is retried on every
    /// release until the deadline; the task gate is not held while waiting.
    pub async fn dispatch(&self, task_id: &TaskId, mode: AcquireMode) -> Result<Started> {
        let deadline = match mode {
            AcquireMode::FailFast => None,
            AcquireMode::Wait(wait) => Some(Instant::now() + wait),
        };
        loop {
            let released = self.registry.released();
            match self.try_dispatch(task_id, GateMode::Wait).await {
                Ok(Some(started)) => return Ok(started),
                // Unreachable with GateMode::Wait.
                Ok(None) => continue,
                Err(OrchestratorError::NoAgentAvailable { .. })
                    if deadline.is_some_and(|d| Instant::now() < d) =>
                {
                    if let Some(d) = deadline {
                        let _ = tokio::time::timeout_at(d, released).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One dispatch attempt. `Ok(None)` means the task gate was busy and
    /// `gate` was [`GateMode::Skip`].
    pub(crate) async fn try_dispatch(
        &self,
        task_id: &TaskId,
        gate: GateMode,
    ) -> Result<Option<Started>> {
        let task_slot = self.store.slot(task_id)?;
        let task_guard = match gate {
            GateMode::Wait => task_slot.lock().await,
            GateMode::Skip => match task_slot.try_lock() {
                Some(guard) => guard,
                None => return Ok(None),
            },
        };
        let task = task_guard.current();
        if !task
            .status
            .can_transition_to(TaskStatus::InProgress, TransitionActor::Coordinator)
        {
            return Err(OrchestratorError::transition(
                task_id,
                task.status,
                TaskStatus::InProgress,
            ));
        }
        let waiting_on = self.store.waiting_on(&task);
        if !waiting_on.is_empty() {
            return Err(OrchestratorError::NotRunnable {
                id: task_id.clone(),
                waiting_on,
            });
        }
        let permit = self.permit()?;
        let agent_guard = self
            .registry
            .try_claim(task.required_role)
            .ok_or(OrchestratorError::NoAgentAvailable {
                role: task.required_role,
            })?;
        let agent = agent_guard.current();

        let mut next_task = apply_status(&task, TaskStatus::InProgress);
        next_task.assigned_agent = Some(agent.id.clone());
        next_task.attempts += 1;
        next_task.last_error = None;

        let mut next_agent = agent.as_ref().clone();
        next_agent.status = AgentStatus::Working;
        next_agent.current_task = Some(task_id.clone());
        next_agent.last_activity = Utc::now();

        let event = EventDraft::new(
            Severity::Info,
            Some(agent.id.clone()),
            Some(task_id.clone()),
            format!(
                "assigned to {} ({}), attempt {}",
                agent.name, agent.id, next_task.attempts
            ),
        );
        self.logs
            .commit(
                Commit::new()
                    .task(next_task.clone())
                    .agent(next_agent.clone())
                    .event(event),
            )
            .await?;
        task_guard.publish(next_task.clone());
        agent_guard.publish(next_agent);

        info!(task_id = %task_id, agent_id = %agent.id, attempt = next_task.attempts, "task dispatched");
        Ok(Some(Started {
            task_id: task_id.clone(),
            agent_id: agent.id.clone(),
            attempt: next_task.attempts,
            timeout: self.default_timeout,
            _permit: permit,
        }))
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Run `task_id` on an agent that was already acquired for it through
    /// [`AgentRegistry::acquire`]. If the run cannot start, the agent is
    /// released back to idle.
    pub async fn run(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        timeout: Duration,
    ) -> Result<RunReport> {
        let started = match self.start_bound(task_id, agent_id, timeout).await {
            Ok(started) => started,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                match self.release_if_bound(agent_id, task_id).await {
                    Err(release_err) if release_err.is_fatal() => return Err(release_err),
                    _ => {}
                }
                return Err(e);
            }
        };
        self.drive(started).await
    }

    async fn start_bound(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        timeout: Duration,
    ) -> Result<Started> {
        let task_slot = self.store.slot(task_id)?;
        let task_guard = task_slot.lock().await;
        let task = task_guard.current();
        if !task
            .status
            .can_transition_to(TaskStatus::InProgress, TransitionActor::Coordinator)
        {
            return Err(OrchestratorError::transition(
                task_id,
                task.status,
                TaskStatus::InProgress,
            ));
        }
        let waiting_on = self.store.waiting_on(&task);
        if !waiting_on.is_empty() {
            return Err(OrchestratorError::NotRunnable {
                id: task_id.clone(),
                waiting_on,
            });
        }
        let agent_slot = self.registry.slot(agent_id)?;
        let agent_guard = agent_slot.lock().await;
        let agent = agent_guard.current();
        if agent.status != AgentStatus::Working || agent.current_task.as_ref() != Some(task_id) {
            return Err(OrchestratorError::Validation(format!(
                "agent {agent_id} is not bound to task {task_id}"
            )));
        }
        if !agent.has_role(task.required_role) {
            return Err(OrchestratorError::Validation(format!(
                "agent {agent_id} lacks role `{}`",
                task.required_role
            )));
        }
        let permit = self.permit()?;

        let mut next_task = apply_status(&task, TaskStatus::InProgress);
        next_task.assigned_agent = Some(agent_id.clone());
        next_task.attempts += 1;
        next_task.last_error = None;
        let mut next_agent = agent.as_ref().clone();
        next_agent.last_activity = Utc::now();

        let event = EventDraft::new(
            Severity::Info,
            Some(agent_id.clone()),
            Some(task_id.clone()),
            format!("started by {} ({agent_id}), attempt {}", agent.name, next_task.attempts),
        );
        self.logs
            .commit(
                Commit::new()
                    .task(next_task.clone())
                    .agent(next_agent.clone())
                    .event(event),
            )
            .await?;
        task_guard.publish(next_task.clone());
        agent_guard.publish(next_agent);

        Ok(Started {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
            attempt: next_task.attempts,
            timeout,
            _permit: permit,
        })
    }

    async fn release_if_bound(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<()> {
        let agent_slot = self.registry.slot(agent_id)?;
        let guard = agent_slot.lock().await;
        let agent = guard.current();
        if agent.status != AgentStatus::Working || agent.current_task.as_ref() != Some(task_id) {
            return Ok(());
        }
        let next = unbind(&agent, AgentStatus::Idle, false);
        let event = EventDraft::new(
            Severity::Warning,
            Some(agent_id.clone()),
            Some(task_id.clone()),
            format!("{} released: run could not start", agent.name),
        );
        self.logs
            .commit(Commit::new().agent(next.clone()).event(event))
            .await?;
        guard.publish(next);
        drop(guard);
        self.registry.notify_released();
        Ok(())
    }

    /// Execute a started run to completion and record its outcome.
    pub async fn drive(&self, started: Started) -> Result<RunReport> {
        let (span, run_id) = run_span(
            started.task_id.as_str(),
            started.agent_id.as_str(),
            started.attempt,
        );
        async move {
            info!(run_id = %run_id, "run started");
            let end = self.execute(&started).await;
            let report = self.finish(&started, end).await?;
            info!(status = %report.status, discarded = report.discarded, "run finished");
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, started: &Started) -> RunEnd {
        let task = match self.store.get(&started.task_id) {
            Ok(task) => task,
            Err(e) => return RunEnd::Error(e.to_string()),
        };
        let request = WorkRequest::for_task(&task, &started.agent_id);
        let worker = self.worker.clone();
        let handle = tokio::spawn(async move { worker.execute(request).await });
        let abort = handle.abort_handle();
        self.running.insert(started.task_id.clone(), abort.clone());

        let end = match tokio::time::timeout(started.timeout, handle).await {
            Ok(Ok(Ok(outcome))) => RunEnd::Outcome(outcome.sanitized()),
            Ok(Ok(Err(e))) => RunEnd::Error(format!("worker error: {e}")),
            Ok(Err(join)) if join.is_cancelled() => RunEnd::Cancelled,
            Ok(Err(_)) => RunEnd::Error("worker panicked".into()),
            Err(_) => {
                abort.abort();
                RunEnd::Error(format!(
                    "worker timed out after {}s",
                    started.timeout.as_secs()
                ))
            }
        };
        self.running.remove(&started.task_id);
        end
    }

    async fn finish(&self, started: &Started, end: RunEnd) -> Result<RunReport> {
        let task_id = &started.task_id;
        let agent_id = &started.agent_id;
        let task_slot = self.store.slot(task_id)?;
        let task_guard = task_slot.lock().await;
        let task = task_guard.current();
        let agent_slot = self.registry.slot(agent_id)?;
        let agent_guard = agent_slot.lock().await;
        let agent = agent_guard.current();

        let task_bound = task.status == TaskStatus::InProgress
            && task.assigned_agent.as_ref() == Some(agent_id)
            && task.attempts == started.attempt;
        let agent_bound =
            agent.status == AgentStatus::Working && agent.current_task.as_ref() == Some(task_id);

        let mut report = RunReport {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
            attempt: started.attempt,
            status: task.status,
            discarded: !task_bound,
        };

        if !task_bound {
            // Overridden while running: keep the operator's state.
            let mut commit = Commit::new();
            if !matches!(end, RunEnd::Cancelled) {
                commit = commit.event(EventDraft::new(
                    Severity::Warning,
                    Some(agent_id.clone()),
                    Some(task_id.clone()),
                    format!(
                        "outcome of attempt {} discarded: task is now {}",
                        started.attempt, task.status
                    ),
                ));
            }
            let released = agent_bound.then(|| unbind(&agent, AgentStatus::Idle, false));
            if let Some(next) = &released {
                commit = commit.agent(next.clone());
            }
            self.logs.commit(commit).await?;
            if let Some(next) = released {
                agent_guard.publish(next);
                drop(agent_guard);
                self.registry.notify_released();
            }
            warn!(task_id = %task_id, status = %task.status, "run outcome discarded");
            return Ok(report);
        }

        let (status, severity, message) = match &end {
            RunEnd::Outcome(WorkOutcome::Completed { summary, .. }) => (
                TaskStatus::Completed,
                Severity::Success,
                if summary.is_empty() {
                    format!("completed by {}", agent.name)
                } else {
                    format!("completed by {}: {summary}", agent.name)
                },
            ),
            RunEnd::Outcome(WorkOutcome::Failed { reason }) | RunEnd::Error(reason) => {
                (TaskStatus::Failed, Severity::Error, format!("failed: {reason}"))
            }
            RunEnd::Outcome(WorkOutcome::Blocked { reason }) => {
                (TaskStatus::Blocked, Severity::Warning, format!("blocked: {reason}"))
            }
            RunEnd::Cancelled => (
                TaskStatus::Failed,
                Severity::Error,
                "failed: worker was cancelled".to_string(),
            ),
        };

        let mut next_task = apply_status(&task, status);
        match end {
            RunEnd::Outcome(WorkOutcome::Completed { artifacts, .. }) => {
                next_task.artifacts = artifacts;
            }
            RunEnd::Outcome(WorkOutcome::Failed { reason })
            | RunEnd::Outcome(WorkOutcome::Blocked { reason })
            | RunEnd::Error(reason) => next_task.last_error = Some(reason),
            RunEnd::Cancelled => next_task.last_error = Some("worker was cancelled".into()),
        }

        let mut commit = Commit::new().task(next_task.clone()).event(EventDraft::new(
            severity,
            Some(agent_id.clone()),
            Some(task_id.clone()),
            message,
        ));
        let released = agent_bound
            .then(|| unbind(&agent, AgentStatus::Idle, status == TaskStatus::Completed));
        if let Some(next) = &released {
            commit = commit.agent(next.clone());
        }
        self.logs.commit(commit).await?;
        task_guard.publish(next_task);
        if let Some(next) = released {
            agent_guard.publish(next);
            drop(agent_guard);
            self.registry.notify_released();
        }

        match status {
            TaskStatus::Completed => info!(task_id = %task_id, "task completed"),
            TaskStatus::Blocked => warn!(task_id = %task_id, "task blocked"),
            _ => error!(task_id = %task_id, "task failed"),
        }
        report.status = status;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Operator override
    // -----------------------------------------------------------------------

    /// Force a task into `status` on behalf of an operator.
    ///
    /// Overriding an in-progress task cancels its worker and releases its
    /// agent in the same commit as the status change.
    pub async fn override_status(&self, task_id: &TaskId, status: TaskStatus) -> Result<Task> {
        let task_slot = self.store.slot(task_id)?;
        let task_guard = task_slot.lock().await;
        let task = task_guard.current();
        if !task
            .status
            .can_transition_to(status, TransitionActor::Operator)
        {
            return Err(OrchestratorError::transition(task_id, task.status, status));
        }

        let next_task = apply_status(&task, status);
        let mut commit = Commit::new().task(next_task.clone()).event(EventDraft::new(
            Severity::Warning,
            task.assigned_agent.clone(),
            Some(task_id.clone()),
            format!("status overridden by operator: {} -> {status}", task.status),
        ));

        let mut release = None;
        if task.status == TaskStatus::InProgress {
            if let Some(agent_id) = &task.assigned_agent {
                let agent_slot = self.registry.slot(agent_id)?;
                let agent_guard = agent_slot.lock().await;
                let agent = agent_guard.current();
                if agent.status == AgentStatus::Working
                    && agent.current_task.as_ref() == Some(task_id)
                {
                    let next = unbind(&agent, AgentStatus::Idle, status == TaskStatus::Completed);
                    commit = commit.agent(next.clone());
                    release = Some((agent_guard, next));
                }
            }
        }

        self.logs.commit(commit).await?;
        task_guard.publish(next_task.clone());
        if let Some((agent_guard, next)) = release {
            agent_guard.publish(next);
            drop(agent_guard);
            self.registry.notify_released();
        }
        if let Some((_, handle)) = self.running.remove(task_id) {
            handle.abort();
        }
        warn!(task_id = %task_id, from = %task.status, to = %status, "status overridden");
        Ok(next_task)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Reconcile runs that were interrupted without recording an outcome.
    ///
    /// Resets every in-progress task whose agent is not working on it, and
    /// releases every working agent whose task is not in progress with it.
    /// Running it twice changes nothing the second time.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let in_progress = self
            .store
            .list(TaskFilter::status(TaskStatus::InProgress))
            .to_vec();
        for seen in in_progress {
            let task_slot = self.store.slot(&seen.id)?;
            let task_guard = task_slot.lock().await;
            let task = task_guard.current();
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let owned = task.assigned_agent.as_ref().is_some_and(|agent_id| {
                self.registry.get(agent_id).is_ok_and(|agent| {
                    agent.status == AgentStatus::Working
                        && agent.current_task.as_ref() == Some(&task.id)
                })
            });
            if owned {
                continue;
            }

            let next = apply_status(&task, TaskStatus::Pending);
            let previous = task
                .assigned_agent
                .as_ref()
                .map_or_else(|| "none".to_string(), |a| a.to_string());
            let event = EventDraft::new(
                Severity::Warning,
                task.assigned_agent.clone(),
                Some(task.id.clone()),
                format!(
                    "reset to pending: attempt {} was interrupted (agent {previous})",
                    task.attempts
                ),
            );
            self.logs
                .commit(Commit::new().task(next.clone()).event(event))
                .await?;
            task_guard.publish(next);
            warn!(task_id = %task.id, agent = %previous, "orphaned run reset to pending");
            report.reset_tasks.push(task.id.clone());
        }

        for seen in self.registry.list() {
            if seen.status != AgentStatus::Working {
                continue;
            }
            let agent_slot = self.registry.slot(&seen.id)?;
            let agent_guard = agent_slot.lock().await;
            let agent = agent_guard.current();
            if agent.status != AgentStatus::Working {
                continue;
            }
            let bound = agent.current_task.as_ref().is_some_and(|task_id| {
                self.store.get(task_id).is_ok_and(|task| {
                    task.status == TaskStatus::InProgress
                        && task.assigned_agent.as_ref() == Some(&agent.id)
                })
            });
            if bound {
                continue;
            }
            let next = unbind(&agent, AgentStatus::Idle, false);
            let event = EventDraft::new(
                Severity::Warning,
                Some(agent.id.clone()),
                agent.current_task.clone(),
                format!("{} released: no matching run in progress", agent.name),
            );
            self.logs
                .commit(Commit::new().agent(next.clone()).event(event))
                .await?;
            agent_guard.publish(next);
            warn!(agent_id = %agent.id, "orphaned agent released");
            report.released_agents.push(agent.id.clone());
        }

        if !report.released_agents.is_empty() {
            self.registry.notify_released();
        }
        if !report.is_empty() {
            info!(
                reset = report.reset_tasks.len(),
                released = report.released_agents.len(),
                "recovery pass finished"
            );
        }
        Ok(report)
    }
}
