//! Process-wide orchestration state.
//!
//! Built once at startup and shared by reference (`Arc<Orchestrator>`); the
//! scheduling loop, the HTTP API and tests all go through it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ff_core::config::{Config, SchedulerConfig};
use ff_core::db::{QueryResult, StateDb};
use ff_core::types::{Agent, AgentId, LogEvent, Task, TaskFilter, TaskId, TaskStats, TaskStatus};
use tracing::info;

use crate::coordinator::{ExecutionCoordinator, RecoveryReport, RunReport, Started};
use crate::error::{OrchestratorError, Result};
use crate::log_sink::{LogQuery, LogSink};
use crate::registry::{AcquireMode, AgentRegistry};
use crate::resolver::DependencyResolver;
use crate::task_store::{TaskList, TaskStore};
use crate::worker::Worker;

/// Row cap for the read-only query surface.
pub const MAX_QUERY_ROWS: usize = 1_000;

pub struct Orchestrator {
    scheduler: SchedulerConfig,
    query_timeout: Duration,
    logs: Arc<LogSink>,
    tasks: Arc<TaskStore>,
    agents: Arc<AgentRegistry>,
    coordinator: Arc<ExecutionCoordinator>,
    resolver: DependencyResolver,
    started_at: DateTime<Utc>,
}

impl Orchestrator {
    /// Open the on-disk store named in `config.store.path` and recover any
    /// interrupted runs.
    pub async fn open(config: &Config, worker: Arc<dyn Worker>) -> Result<Self> {
        let path = config.store.resolved_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                OrchestratorError::Storage(format!("create {}: {e}", parent.display()))
            })?;
        }
        let db = StateDb::new(&path).await?;
        info!(path = %path.display(), "state database opened");
        Self::with_db(Arc::new(db), config, worker).await
    }

    /// Orchestrator over a throwaway in-memory database.
    pub async fn in_memory(config: &Config, worker: Arc<dyn Worker>) -> Result<Self> {
        let db = StateDb::new_in_memory().await?;
        Self::with_db(Arc::new(db), config, worker).await
    }

    async fn with_db(db: Arc<StateDb>, config: &Config, worker: Arc<dyn Worker>) -> Result<Self> {
        let logs = Arc::new(LogSink::open(db, config.store.log_retain).await?);
        let tasks = Arc::new(TaskStore::load(logs.clone()).await?);
        let agents = Arc::new(AgentRegistry::from_catalog(&config.agents, logs.clone()).await?);
        let coordinator = Arc::new(ExecutionCoordinator::new(
            tasks.clone(),
            agents.clone(),
            logs.clone(),
            worker,
            config.scheduler.max_concurrent,
            config.scheduler.worker_timeout(),
        ));
        let resolver = DependencyResolver::new(tasks.clone(), coordinator.clone());
        let orchestrator = Self {
            scheduler: config.scheduler.clone(),
            query_timeout: config.store.query_timeout(),
            logs,
            tasks,
            agents,
            coordinator,
            resolver,
            started_at: Utc::now(),
        };

        let report = orchestrator.recover().await?;
        info!(
            tasks = orchestrator.tasks.len(),
            agents = orchestrator.agents.len(),
            reset = report.reset_tasks.len(),
            "orchestrator ready"
        );
        Ok(orchestrator)
    }

    // -----------------------------------------------------------------------
    // Components
    // -----------------------------------------------------------------------

    pub fn task_store(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn log_sink(&self) -> &Arc<LogSink> {
        &self.logs
    }

    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    pub async fn tick(&self) -> Result<Vec<Started>> {
        self.resolver.tick().await
    }

    /// Dashboard "run now": start one specific pending task.
    ///
    /// Of two concurrent triggers for the same task exactly one starts it;
    /// the other sees it in progress and gets `InvalidTransition`.
    pub async fn trigger_run(&self, task_id: &TaskId) -> Result<Started> {
        let mode = AcquireMode::from_wait(self.scheduler.acquire_wait());
        let started = self.coordinator.dispatch(task_id, mode).await?;
        info!(task_id = %task_id, agent_id = %started.agent_id, "run triggered");
        Ok(started)
    }

    pub async fn drive(&self, started: Started) -> Result<RunReport> {
        self.coordinator.drive(started).await
    }

    pub async fn override_status(&self, task_id: &TaskId, status: TaskStatus) -> Result<Task> {
        self.coordinator.override_status(task_id, status).await
    }

    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.coordinator.recover().await
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn create_task(&self, task: Task) -> Result<Task> {
        self.tasks.create(task).await
    }

    pub async fn create_tasks(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        self.tasks.create_batch(tasks).await
    }

    pub fn task(&self, id: &TaskId) -> Result<Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self, filter: TaskFilter) -> TaskList {
        self.tasks.list(filter)
    }

    pub fn stats(&self) -> TaskStats {
        self.tasks.stats(self.scheduler.stalled_after())
    }

    pub fn stalled(&self) -> Vec<Task> {
        self.tasks.stalled(self.scheduler.stalled_after())
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub fn agents(&self) -> Vec<Agent> {
        self.agents.list()
    }

    pub fn agent(&self, id: &AgentId) -> Result<Agent> {
        self.agents.get(id)
    }

    pub async fn hold_agent(&self, id: &AgentId) -> Result<Agent> {
        self.agents.hold(id).await
    }

    pub async fn unhold_agent(&self, id: &AgentId) -> Result<Agent> {
        self.agents.unhold(id).await
    }

    pub async fn retire_agent(&self, id: &AgentId) -> Result<Agent> {
        self.agents.retire(id).await
    }

    // -----------------------------------------------------------------------
    // Logs and queries
    // -----------------------------------------------------------------------

    pub fn logs(&self, query: &LogQuery) -> Vec<LogEvent> {
        self.logs.snapshot(query)
    }

    pub async fn task_history(&self, id: &TaskId) -> Result<Vec<LogEvent>> {
        self.tasks.get(id)?;
        self.logs.history(id).await
    }

    pub fn subscribe(&self) -> flume::Receiver<Arc<LogEvent>> {
        self.logs.subscribe()
    }

    /// Read-only SQL over the persisted state. Runs beside state changes,
    /// never ahead of them, and is cut off after `store.query_timeout_ms`.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        Ok(self
            .logs
            .db()
            .query_readonly(sql, MAX_QUERY_ROWS, self.query_timeout)
            .await?)
    }
}
