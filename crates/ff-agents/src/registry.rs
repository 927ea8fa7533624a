use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ff_core::config::AgentSpec;
use ff_core::db::{Commit, EventDraft};
use ff_core::types::{Agent, AgentId, AgentStatus, Role, Severity, TaskId};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::log_sink::LogSink;
use crate::slot::{Slot, SlotGuard};

/// How long an acquirer is prepared to wait for an idle agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    FailFast,
    Wait(Duration),
}

impl AcquireMode {
    pub fn from_wait(wait: Option<Duration>) -> Self {
        wait.map_or(AcquireMode::FailFast, AcquireMode::Wait)
    }
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// Fixed set of agents built from the role catalog.
///
/// Agents are kept in id order; every acquirer scans from the lowest id, so
/// assignment is deterministic for a given state.
pub struct AgentRegistry {
    agents: Vec<Arc<Slot<Agent>>>,
    index: HashMap<AgentId, usize>,
    released: Notify,
    logs: Arc<LogSink>,
}

impl AgentRegistry {
    /// Build the registry from the catalog, carrying persisted state over.
    ///
    /// The catalog decides which agents exist and their names and roles.
    /// For agents already on disk the completed-task count survives, as do
    /// operator holds (`Active`) and retirement (`Offline`). A persisted
    /// `Working` agent comes back idle: its run died with the previous
    /// process and the coordinator's recovery pass resets the task.
    pub async fn from_catalog(catalog: &[AgentSpec], logs: Arc<LogSink>) -> Result<Self> {
        let mut persisted: HashMap<AgentId, Agent> = logs
            .db()
            .load_agents()
            .await?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();

        let mut agents: Vec<Agent> = Vec::with_capacity(catalog.len());
        for spec in catalog {
            if spec.roles.is_empty() {
                return Err(OrchestratorError::Validation(format!(
                    "agent `{}` has no roles",
                    spec.id
                )));
            }
            if agents.iter().any(|a| a.id.as_str() == spec.id) {
                return Err(OrchestratorError::Validation(format!(
                    "duplicate agent id `{}`",
                    spec.id
                )));
            }
            let mut agent = Agent::new(
                spec.id.as_str(),
                spec.name.as_str(),
                spec.roles.iter().copied(),
            );
            if let Some(previous) = persisted.remove(&agent.id) {
                restore(&mut agent, &previous);
            }
            agents.push(agent);
        }
        if !persisted.is_empty() {
            debug!(
                dropped = persisted.len(),
                "persisted agents no longer in the catalog are ignored"
            );
        }
        agents.sort_by(|a, b| a.id.cmp(&b.id));

        let mut commit = Commit::new();
        for agent in &agents {
            commit = commit.agent(agent.clone());
        }
        logs.commit(commit).await?;

        let index = agents
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();
        debug!(count = agents.len(), "agent registry initialised");
        Ok(Self {
            agents: agents.into_iter().map(|a| Arc::new(Slot::new(a))).collect(),
            index,
            released: Notify::new(),
            logs,
        })
    }

    pub(crate) fn slot(&self, id: &AgentId) -> Result<&Arc<Slot<Agent>>> {
        self.index
            .get(id)
            .map(|&i| &self.agents[i])
            .ok_or_else(|| OrchestratorError::agent_not_found(id))
    }

    pub fn list(&self) -> Vec<Agent> {
        self.agents
            .iter()
            .map(|slot| slot.snapshot().as_ref().clone())
            .collect()
    }

    pub fn get(&self, id: &AgentId) -> Result<Agent> {
        Ok(self.slot(id)?.snapshot().as_ref().clone())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Resolves after the next release. Create it before checking for an
    /// idle agent so a release in between is not missed.
    pub(crate) fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    pub(crate) fn notify_released(&self) {
        self.released.notify_waiters();
    }

    /// Lock the first idle agent with `role` whose gate is free.
    pub(crate) fn try_claim(&self, role: Role) -> Option<SlotGuard<'_, Agent>> {
        self.agents.iter().find_map(|slot| {
            let seen = slot.snapshot();
            if seen.status != AgentStatus::Idle || !seen.has_role(role) {
                return None;
            }
            let guard = slot.try_lock()?;
            let current = guard.current();
            (current.status == AgentStatus::Idle && current.has_role(role)).then_some(guard)
        })
    }

    // -----------------------------------------------------------------------
    // Acquire / release
    // -----------------------------------------------------------------------

    /// Bind one idle agent with `role` to `task_id` and mark it working.
    pub async fn acquire(&self, role: Role, task_id: &TaskId) -> Result<AgentId> {
        let guard = self
            .try_claim(role)
            .ok_or(OrchestratorError::NoAgentAvailable { role })?;
        let mut agent = guard.current().as_ref().clone();
        agent.status = AgentStatus::Working;
        agent.current_task = Some(task_id.clone());
        agent.last_activity = Utc::now();

        let event = EventDraft::new(
            Severity::Info,
            Some(agent.id.clone()),
            Some(task_id.clone()),
            format!("{} acquired for {task_id}", agent.name),
        );
        self.logs
            .commit(Commit::new().agent(agent.clone()).event(event))
            .await?;
        guard.publish(agent.clone());
        info!(agent_id = %agent.id, task_id = %task_id, "agent acquired");
        Ok(agent.id)
    }

    /// [`acquire`](Self::acquire), optionally waiting for a release.
    pub async fn acquire_with(
        &self,
        role: Role,
        task_id: &TaskId,
        mode: AcquireMode,
    ) -> Result<AgentId> {
        let deadline = match mode {
            AcquireMode::FailFast => return self.acquire(role, task_id).await,
            AcquireMode::Wait(wait) => Instant::now() + wait,
        };
        loop {
            let released = self.released();
            match self.acquire(role, task_id).await {
                Err(OrchestratorError::NoAgentAvailable { .. }) if Instant::now() < deadline => {
                    let _ = tokio::time::timeout_at(deadline, released).await;
                }
                other => return other,
            }
        }
    }

    /// Unbind a working agent. `final_status` must be idle or offline.
    ///
    /// Releasing an agent that is not working is rejected, so a double
    /// release is reported rather than silently accepted.
    pub async fn release(&self, id: &AgentId, final_status: AgentStatus) -> Result<Agent> {
        if !matches!(final_status, AgentStatus::Idle | AgentStatus::Offline) {
            return Err(OrchestratorError::Validation(format!(
                "agents can only be released to idle or offline, not {final_status}"
            )));
        }
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        let current = guard.current();
        if current.status != AgentStatus::Working {
            return Err(OrchestratorError::NotFound {
                kind: "working agent",
                id: id.to_string(),
            });
        }
        let agent = unbind(&current, final_status, false);
        let event = EventDraft::new(
            Severity::Info,
            Some(id.clone()),
            current.current_task.clone(),
            format!("{} released ({final_status})", agent.name),
        );
        self.logs
            .commit(Commit::new().agent(agent.clone()).event(event))
            .await?;
        guard.publish(agent.clone());
        drop(guard);
        self.notify_released();
        info!(agent_id = %id, status = %final_status, "agent released");
        Ok(agent)
    }

    // -----------------------------------------------------------------------
    // Operator controls
    // -----------------------------------------------------------------------

    /// Idle -> Active: keep the agent online but out of automatic scheduling.
    pub async fn hold(&self, id: &AgentId) -> Result<Agent> {
        self.set_status(id, AgentStatus::Active).await
    }

    /// Active -> Idle.
    pub async fn unhold(&self, id: &AgentId) -> Result<Agent> {
        let agent = self.set_status(id, AgentStatus::Idle).await?;
        self.notify_released();
        Ok(agent)
    }

    /// Idle | Active -> Offline. Working agents must be released instead.
    pub async fn retire(&self, id: &AgentId) -> Result<Agent> {
        self.set_status(id, AgentStatus::Offline).await
    }

    async fn set_status(&self, id: &AgentId, status: AgentStatus) -> Result<Agent> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        let current = guard.current();
        if current.status == AgentStatus::Working || !current.status.can_transition_to(status) {
            return Err(OrchestratorError::transition(id, current.status, status));
        }
        let mut agent = current.as_ref().clone();
        agent.status = status;
        agent.last_activity = Utc::now();
        let event = EventDraft::new(
            Severity::Warning,
            Some(id.clone()),
            None,
            format!("{} set {} -> {status} by operator", agent.name, current.status),
        );
        self.logs
            .commit(Commit::new().agent(agent.clone()).event(event))
            .await?;
        guard.publish(agent.clone());
        info!(agent_id = %id, status = %status, "agent status changed");
        Ok(agent)
    }
}

/// Carry the state that outlives a process from `previous` onto `agent`.
fn restore(agent: &mut Agent, previous: &Agent) {
    agent.completed_tasks = previous.completed_tasks;
    agent.last_activity = previous.last_activity;
    match previous.status {
        AgentStatus::Active | AgentStatus::Offline => agent.status = previous.status,
        AgentStatus::Working => {
            info!(
                agent_id = %agent.id,
                task_id = previous.current_task.as_ref().map(|t| t.as_str()).unwrap_or("none"),
                "agent was working at shutdown, restored as idle"
            );
        }
        AgentStatus::Idle => {}
    }
}

/// Copy of `agent` unbound from its task.
pub(crate) fn unbind(agent: &Agent, status: AgentStatus, completed: bool) -> Agent {
    let mut next = agent.clone();
    next.status = status;
    next.current_task = None;
    next.last_activity = Utc::now();
    if completed {
        next.completed_tasks += 1;
    }
    next
}
