use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable identifier of a roadmap task (e.g. `p1-02-player-data-etl`).
    TaskId
);
string_id!(
    /// Stable identifier of an agent from the role catalog (e.g. `backend-dev-1`).
    AgentId
);

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Specialization tag shared by agents (what they can do) and tasks (what
/// they need).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "backend")]
    Backend,
    #[serde(rename = "frontend")]
    Frontend,
    #[serde(rename = "data")]
    Data,
    #[serde(rename = "devops")]
    DevOps,
    #[serde(rename = "tech_lead")]
    TechLead,
    #[serde(rename = "qa")]
    Qa,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Backend,
        Role::Frontend,
        Role::Data,
        Role::DevOps,
        Role::TechLead,
        Role::Qa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Backend => "backend",
            Role::Frontend => "frontend",
            Role::Data => "data",
            Role::DevOps => "devops",
            Role::TechLead => "tech_lead",
            Role::Qa => "qa",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "backend" | "backend_developer" => Ok(Role::Backend),
            "frontend" | "frontend_developer" => Ok(Role::Frontend),
            "data" | "data_scientist" => Ok(Role::Data),
            "devops" | "devops_engineer" => Ok(Role::DevOps),
            "tech_lead" | "technical_lead" => Ok(Role::TechLead),
            "qa" | "qa_engineer" => Ok(Role::Qa),
            _ => Err(ParseEnumError::new("role", s)),
        }
    }
}

/// Returned when a status/role/severity string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

/// Who is asking for a status change. Legality depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionActor {
    /// The execution coordinator driving a run.
    Coordinator,
    /// A human acting through the dashboard or CLI.
    Operator,
    /// Startup reconciliation of orphaned runs.
    Recovery,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// `Completed` is terminal for the scheduler; only an operator reset can
    /// move it again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    /// Returns `true` when `actor` may move a task from `self` to `target`.
    ///
    /// - Pending    -> InProgress                  coordinator
    /// - InProgress -> Completed | Failed | Blocked coordinator, operator
    /// - InProgress -> Pending                     operator, recovery
    /// - Failed | Blocked | Completed -> Pending   operator
    pub fn can_transition_to(&self, target: TaskStatus, actor: TransitionActor) -> bool {
        use TaskStatus::*;
        use TransitionActor::*;
        matches!(
            (self, target, actor),
            (Pending, InProgress, Coordinator)
                | (InProgress, Completed | Failed | Blocked, Coordinator | Operator)
                | (InProgress, Pending, Operator | Recovery)
                | (Failed | Blocked | Completed, Pending, Operator)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "blocked" => Ok(TaskStatus::Blocked),
            _ => Err(ParseEnumError::new("task status", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub phase: u32,
    #[serde(default)]
    pub phase_name: String,
    #[serde(default)]
    pub priority: i32,
    pub required_role: Role,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub assigned_agent: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_hours: f64,
    #[serde(default)]
    pub actual_hours: Option<f64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>, required_role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            dependencies: BTreeSet::new(),
            phase: 0,
            phase_name: String::new(),
            priority: 0,
            required_role,
            status: TaskStatus::Pending,
            assigned_agent: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            estimated_hours: 0.0,
            actual_hours: None,
            attempts: 0,
            artifacts: Vec::new(),
            last_error: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_phase(mut self, phase: u32, name: impl Into<String>) -> Self {
        self.phase = phase;
        self.phase_name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimate(mut self, hours: f64) -> Self {
        self.estimated_hours = hours;
        self
    }

    /// Scheduling order: earliest phase, then highest priority (lowest
    /// number), then oldest, then id for a total order.
    pub fn schedule_key(&self) -> (u32, i32, DateTime<Utc>, &TaskId) {
        (self.phase, self.priority, self.created_at, &self.id)
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    /// Online but held out of automatic scheduling by an operator.
    Active,
    Working,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Active => "active",
            AgentStatus::Working => "working",
            AgentStatus::Offline => "offline",
        }
    }

    /// Valid transitions:
    /// - Idle    -> Working | Active | Offline
    /// - Working -> Idle | Offline
    /// - Active  -> Idle | Offline
    pub fn can_transition_to(&self, target: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, target),
            (Idle, Working | Active | Offline) | (Working, Idle | Offline) | (Active, Idle | Offline)
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "idle" => Ok(AgentStatus::Idle),
            "active" => Ok(AgentStatus::Active),
            "working" => Ok(AgentStatus::Working),
            "offline" => Ok(AgentStatus::Offline),
            _ => Err(ParseEnumError::new("agent status", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub roles: BTreeSet<Role>,
    pub status: AgentStatus,
    pub current_task: Option<TaskId>,
    #[serde(default)]
    pub completed_tasks: u32,
    pub last_activity: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        id: impl Into<AgentId>,
        name: impl Into<String>,
        roles: impl IntoIterator<Item = Role>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            roles: roles.into_iter().collect(),
            status: AgentStatus::Idle,
            current_task: None,
            completed_tasks: 0,
            last_activity: Utc::now(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// `current_task` is set exactly when the agent is working.
    pub fn is_consistent(&self) -> bool {
        self.current_task.is_some() == (self.status == AgentStatus::Working)
    }
}

// ---------------------------------------------------------------------------
// LogEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Success => "success",
        }
    }

    /// Importance used by minimum-severity filters (info < success < warning < error).
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Success => 1,
            Severity::Warning => 2,
            Severity::Error => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "success" => Ok(Severity::Success),
            _ => Err(ParseEnumError::new("severity", s)),
        }
    }
}

/// One immutable entry of the execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub agent_id: Option<AgentId>,
    pub task_id: Option<TaskId>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Queries over tasks
// ---------------------------------------------------------------------------

/// Conjunctive filter; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub phase: Option<u32>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub agent: Option<AgentId>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.phase.map_or(true, |p| task.phase == p)
            && self.role.map_or(true, |r| task.required_role == r)
            && self
                .agent
                .as_ref()
                .map_or(true, |a| task.assigned_agent.as_ref() == Some(a))
    }
}

/// Progress summary used by the dashboard header and the patrol loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub completion_percentage: f64,
    /// In progress for longer than the configured stall threshold.
    pub stalled: usize,
    pub completed_without_artifacts: usize,
    pub timestamp: DateTime<Utc>,
}

impl TaskStats {
    pub fn from_tasks<'a>(
        tasks: impl IntoIterator<Item = &'a Task>,
        stalled_after: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        let mut stats = TaskStats {
            timestamp: now,
            ..TaskStats::default()
        };
        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => {
                    stats.in_progress += 1;
                    let since = task.started_at.unwrap_or(task.updated_at);
                    if now.signed_duration_since(since) > stalled_after {
                        stats.stalled += 1;
                    }
                }
                TaskStatus::Completed => {
                    stats.completed += 1;
                    if task.artifacts.is_empty() {
                        stats.completed_without_artifacts += 1;
                    }
                }
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Blocked => stats.blocked += 1,
            }
        }
        if stats.total > 0 {
            stats.completion_percentage = stats.completed as f64 * 100.0 / stats.total as f64;
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_drives_the_forward_path_only() {
        let c = TransitionActor::Coordinator;
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress, c));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed, c));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Failed, c));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Blocked, c));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending, c));
        assert!(!TaskStatus::Blocked.can_transition_to(TaskStatus::Pending, c));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed, c));
    }

    #[test]
    fn operator_resets_failed_and_blocked() {
        let o = TransitionActor::Operator;
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Pending, o));
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::Pending, o));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Pending, o));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::InProgress, o));
    }

    #[test]
    fn completed_only_moves_by_operator_reset() {
        for actor in [TransitionActor::Coordinator, TransitionActor::Recovery] {
            for target in TaskStatus::ALL {
                assert!(
                    !TaskStatus::Completed.can_transition_to(target, actor),
                    "completed -> {target} allowed for {actor:?}"
                );
            }
        }
        let o = TransitionActor::Operator;
        assert!(TaskStatus::Completed.can_transition_to(TaskStatus::Pending, o));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed, o));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::InProgress, o));
    }

    #[test]
    fn recovery_only_resets_in_progress() {
        let r = TransitionActor::Recovery;
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Pending, r));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending, r));
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Failed, r));
    }

    #[test]
    fn status_parsing_accepts_dashboard_spellings() {
        assert_eq!("IN_PROGRESS".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert_eq!("in-progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert_eq!("Completed".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn role_parsing_accepts_catalog_names() {
        assert_eq!("backend_developer".parse::<Role>().unwrap(), Role::Backend);
        assert_eq!("technical_lead".parse::<Role>().unwrap(), Role::TechLead);
        assert_eq!("devops".parse::<Role>().unwrap(), Role::DevOps);
        let json = serde_json::to_string(&Role::DevOps).unwrap();
        assert_eq!(json, "\"devops\"");
    }

    #[test]
    fn agent_transitions() {
        assert!(AgentStatus::Idle.can_transition_to(AgentStatus::Working));
        assert!(AgentStatus::Working.can_transition_to(AgentStatus::Idle));
        assert!(!AgentStatus::Working.can_transition_to(AgentStatus::Active));
        assert!(!AgentStatus::Offline.can_transition_to(AgentStatus::Idle));
        assert!(!AgentStatus::Idle.can_transition_to(AgentStatus::Idle));
    }

    #[test]
    fn filter_is_conjunctive() {
        let task = Task::new("t1", "Build API", Role::Backend).with_phase(2, "P2");
        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::status(TaskStatus::Pending).matches(&task));
        let f = TaskFilter {
            status: Some(TaskStatus::Pending),
            phase: Some(1),
            ..TaskFilter::default()
        };
        assert!(!f.matches(&task));
    }

    #[test]
    fn stats_count_statuses_and_completion() {
        let mut done = Task::new("a", "A", Role::Backend);
        done.status = TaskStatus::Completed;
        let mut failed = Task::new("b", "B", Role::Backend);
        failed.status = TaskStatus::Failed;
        let pending = Task::new("c", "C", Role::Qa);
        let mut stuck = Task::new("d", "D", Role::Qa);
        stuck.status = TaskStatus::InProgress;
        stuck.started_at = Some(Utc::now() - chrono::Duration::hours(3));

        let tasks = [done, failed, pending, stuck];
        let stats = TaskStats::from_tasks(tasks.iter(), chrono::Duration::hours(2));
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.stalled, 1);
        assert_eq!(stats.completed_without_artifacts, 1);
        assert!((stats.completion_percentage - 25.0).abs() < f64::EPSILON);
    }
}
