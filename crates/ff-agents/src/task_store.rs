use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use ff_core::db::{Commit, EventDraft};
use ff_core::types::{Severity, Task, TaskFilter, TaskId, TaskStats, TaskStatus, TransitionActor};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::log_sink::LogSink;
use crate::slot::Slot;

// ---------------------------------------------------------------------------
// TaskList
// ---------------------------------------------------------------------------

/// Point-in-time view of the store in scheduling order.
///
/// The filter is applied while iterating, and `iter()` may be called any
/// number of times over the same snapshot.
#[derive(Debug, Clone)]
pub struct TaskList {
    tasks: Vec<Arc<Task>>,
    filter: TaskFilter,
}

impl TaskList {
    pub fn iter(&self) -> impl Iterator<Item = &Task> + '_ {
        self.tasks
            .iter()
            .map(|t| t.as_ref())
            .filter(move |t| self.filter.matches(t))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn to_vec(&self) -> Vec<Task> {
        self.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Durable, concurrency-safe collection of tasks.
///
/// Each task lives in its own [`Slot`]; creation is serialized separately so
/// dependency validation sees a stable set of ids.
pub struct TaskStore {
    tasks: DashMap<TaskId, Arc<Slot<Task>>>,
    creation: Mutex<()>,
    logs: Arc<LogSink>,
}

impl TaskStore {
    /// Load every persisted task.
    pub async fn load(logs: Arc<LogSink>) -> Result<Self> {
        let tasks = DashMap::new();
        for task in logs.db().load_tasks().await? {
            tasks.insert(task.id.clone(), Arc::new(Slot::new(task)));
        }
        debug!(count = tasks.len(), "task store loaded");
        Ok(Self {
            tasks,
            creation: Mutex::new(()),
            logs,
        })
    }

    pub(crate) fn slot(&self, id: &TaskId) -> Result<Arc<Slot<Task>>> {
        self.tasks
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestratorError::task_not_found(id))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Insert a new pending task. Dependencies must already exist.
    pub async fn create(&self, task: Task) -> Result<Task> {
        let _creation = self.creation.lock().await;
        validate_shape(&task)?;
        if self.contains(&task.id) {
            return Err(OrchestratorError::Validation(format!(
                "task id `{}` already exists",
                task.id
            )));
        }
        for dep in &task.dependencies {
            if !self.contains(dep) {
                return Err(OrchestratorError::Validation(format!(
                    "task `{}` depends on unknown task `{dep}`",
                    task.id
                )));
            }
        }

        let event = EventDraft::new(
            Severity::Info,
            None,
            Some(task.id.clone()),
            format!("task created: {}", task.title),
        );
        self.logs
            .commit(Commit::new().task(task.clone()).event(event))
            .await?;
        self.tasks
            .insert(task.id.clone(), Arc::new(Slot::new(task.clone())));
        info!(task_id = %task.id, role = %task.required_role, "task created");
        Ok(task)
    }

    /// Insert a batch of new tasks all-or-nothing. Members may depend on each
    /// other in any order as long as the batch is acyclic.
    pub async fn create_batch(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        let _creation = self.creation.lock().await;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch_ids = HashSet::new();
        for task in &tasks {
            validate_shape(task)?;
            if self.contains(&task.id) || !batch_ids.insert(task.id.clone()) {
                return Err(OrchestratorError::Validation(format!(
                    "task id `{}` already exists",
                    task.id
                )));
            }
        }
        for task in &tasks {
            for dep in &task.dependencies {
                if !batch_ids.contains(dep) && !self.contains(dep) {
                    return Err(OrchestratorError::Validation(format!(
                        "task `{}` depends on unknown task `{dep}`",
                        task.id
                    )));
                }
            }
        }
        if let Some(cycle) = find_cycle(&tasks) {
            return Err(OrchestratorError::Validation(format!(
                "dependency cycle among: {}",
                cycle
                    .iter()
                    .map(TaskId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let mut commit = Commit::new().event(EventDraft::new(
            Severity::Info,
            None,
            None,
            format!("ingested {} tasks", tasks.len()),
        ));
        for task in &tasks {
            commit = commit.task(task.clone());
        }
        self.logs.commit(commit).await?;
        for task in &tasks {
            self.tasks
                .insert(task.id.clone(), Arc::new(Slot::new(task.clone())));
        }
        info!(count = tasks.len(), "task batch created");
        Ok(tasks)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &TaskId) -> Result<Task> {
        Ok(self.slot(id)?.snapshot().as_ref().clone())
    }

    pub fn list(&self, filter: TaskFilter) -> TaskList {
        let mut tasks: Vec<Arc<Task>> = self
            .tasks
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        tasks.sort_by(|a, b| a.schedule_key().cmp(&b.schedule_key()));
        TaskList { tasks, filter }
    }

    /// Dependencies of `task` that are not completed yet.
    pub fn waiting_on(&self, task: &Task) -> Vec<TaskId> {
        task.dependencies
            .iter()
            .filter(|dep| {
                self.tasks
                    .get(*dep)
                    .map_or(true, |slot| slot.snapshot().status != TaskStatus::Completed)
            })
            .cloned()
            .collect()
    }

    /// Pending tasks whose dependencies are all completed, in scheduling order.
    pub fn runnable(&self) -> Vec<Task> {
        self.list(TaskFilter::status(TaskStatus::Pending))
            .iter()
            .filter(|t| self.waiting_on(t).is_empty())
            .cloned()
            .collect()
    }

    pub fn stats(&self, stalled_after: std::time::Duration) -> TaskStats {
        let stalled_after = chrono::Duration::from_std(stalled_after)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let snapshot = self.list(TaskFilter::default());
        TaskStats::from_tasks(snapshot.iter(), stalled_after)
    }

    /// In-progress tasks whose run started longer ago than `threshold`.
    pub fn stalled(&self, threshold: std::time::Duration) -> Vec<Task> {
        let threshold =
            chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::MAX);
        let now = Utc::now();
        self.list(TaskFilter::status(TaskStatus::InProgress))
            .iter()
            .filter(|t| {
                let since = t.started_at.unwrap_or(t.updated_at);
                now.signed_duration_since(since) > threshold
            })
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Status changes
    // -----------------------------------------------------------------------

    /// Apply a legal status change for `actor` and persist it.
    ///
    /// Only changes that never involve an agent binding are accepted here.
    /// Moving a task into or out of `InProgress` binds or unbinds an agent in
    /// the same commit, so those go through the execution coordinator and are
    /// refused with `Validation`.
    pub async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        actor: TransitionActor,
    ) -> Result<Task> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        let current = guard.current();
        if current.status == TaskStatus::InProgress || status == TaskStatus::InProgress {
            return Err(OrchestratorError::Validation(format!(
                "task `{id}`: {} -> {status} changes an agent binding; \
                 use the execution coordinator",
                current.status
            )));
        }
        if !current.status.can_transition_to(status, actor) {
            return Err(OrchestratorError::transition(id, current.status, status));
        }

        let updated = apply_status(&current, status);
        let event = EventDraft::new(
            Severity::Info,
            None,
            Some(id.clone()),
            format!("status {} -> {}", current.status, status),
        );
        self.logs
            .commit(Commit::new().task(updated.clone()).event(event))
            .await?;
        guard.publish(updated.clone());
        info!(task_id = %id, from = %current.status, to = %status, "task status updated");
        Ok(updated)
    }
}

/// New record for `task` moved to `status`, keeping the binding rules:
/// the agent stays attached while in progress and after completion only.
pub(crate) fn apply_status(task: &Task, status: TaskStatus) -> Task {
    let now = Utc::now();
    let mut next = task.clone();
    next.status = status;
    next.updated_at = now;
    match status {
        TaskStatus::Pending => {
            next.assigned_agent = None;
            next.finished_at = None;
        }
        TaskStatus::InProgress => {
            next.started_at = Some(now);
            next.finished_at = None;
        }
        TaskStatus::Completed => {
            next.finished_at = Some(now);
            next.actual_hours = next
                .started_at
                .map(|s| now.signed_duration_since(s).num_seconds() as f64 / 3600.0);
        }
        TaskStatus::Failed | TaskStatus::Blocked => {
            next.assigned_agent = None;
            next.finished_at = Some(now);
            next.actual_hours = next
                .started_at
                .map(|s| now.signed_duration_since(s).num_seconds() as f64 / 3600.0);
        }
    }
    next
}

fn validate_shape(task: &Task) -> Result<()> {
    if task.id.as_str().trim().is_empty() {
        return Err(OrchestratorError::Validation("task id must not be empty".into()));
    }
    if task.title.trim().is_empty() {
        return Err(OrchestratorError::Validation(format!(
            "task `{}` has an empty title",
            task.id
        )));
    }
    if task.dependencies.contains(&task.id) {
        return Err(OrchestratorError::Validation(format!(
            "task `{}` depends on itself",
            task.id
        )));
    }
    if task.status != TaskStatus::Pending || task.assigned_agent.is_some() {
        return Err(OrchestratorError::Validation(format!(
            "task `{}` must be created pending and unassigned",
            task.id
        )));
    }
    Ok(())
}

/// Kahn's algorithm over the edges inside the batch. Returns the ids left on
/// a cycle, sorted, or `None` when the batch is acyclic.
fn find_cycle(tasks: &[Task]) -> Option<Vec<TaskId>> {
    let members: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
    let mut in_degree: BTreeMap<&TaskId, usize> = BTreeMap::new();
    let mut dependents: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
    for task in tasks {
        let inner = task
            .dependencies
            .iter()
            .filter(|d| members.contains_key(d))
            .collect::<Vec<_>>();
        in_degree.insert(&task.id, inner.len());
        for dep in inner {
            dependents.entry(dep).or_default().push(&task.id);
        }
    }

    let mut ready: VecDeque<&TaskId> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = ready.pop_front() {
        visited += 1;
        for next in dependents.get(id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push_back(*next);
                }
            }
        }
    }

    if visited == tasks.len() {
        None
    } else {
        Some(
            in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(id, _)| id.clone())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_core::types::Role;

    #[test]
    fn kahn_detects_cycles_inside_the_batch() {
        let a = Task::new("a", "A", Role::Backend).with_dependencies(["b"]);
        let b = Task::new("b", "B", Role::Backend).with_dependencies(["a"]);
        let c = Task::new("c", "C", Role::Backend);
        let cycle = find_cycle(&[a, b, c]).unwrap();
        assert_eq!(cycle, vec![TaskId::new("a"), TaskId::new("b")]);
    }

    #[test]
    fn kahn_accepts_forward_references() {
        let a = Task::new("a", "A", Role::Backend).with_dependencies(["b"]);
        let b = Task::new("b", "B", Role::Backend).with_dependencies(["existing"]);
        assert!(find_cycle(&[a, b]).is_none());
    }

    #[test]
    fn apply_status_clears_binding_on_failure() {
        let mut task = Task::new("a", "A", Role::Backend);
        task.status = TaskStatus::InProgress;
        task.assigned_agent = Some("backend-dev-1".into());
        task.started_at = Some(Utc::now());

        let failed = apply_status(&task, TaskStatus::Failed);
        assert!(failed.assigned_agent.is_none());
        assert!(failed.finished_at.is_some());

        let done = apply_status(&task, TaskStatus::Completed);
        assert_eq!(done.assigned_agent, task.assigned_agent);
        assert!(done.actual_hours.is_some());
    }
}
