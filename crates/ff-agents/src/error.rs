use ff_core::db::DbError;
use ff_core::types::{Role, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("task {id} is waiting on unfinished dependencies: {}", join_ids(.waiting_on))]
    NotRunnable { id: TaskId, waiting_on: Vec<TaskId> },

    #[error("no idle agent with role `{role}`")]
    NoAgentAvailable { role: Role },

    #[error("concurrency limit reached ({limit} runs in flight)")]
    AtCapacity { limit: usize },

    #[error("query rejected: {0}")]
    QueryRejected(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl OrchestratorError {
    pub(crate) fn task_not_found(id: &TaskId) -> Self {
        OrchestratorError::NotFound {
            kind: "task",
            id: id.to_string(),
        }
    }

    pub(crate) fn agent_not_found(id: impl ToString) -> Self {
        OrchestratorError::NotFound {
            kind: "agent",
            id: id.to_string(),
        }
    }

    pub(crate) fn transition(id: impl ToString, from: impl ToString, to: impl ToString) -> Self {
        OrchestratorError::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Worth retrying later without any change in input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::NoAgentAvailable { .. } | OrchestratorError::AtCapacity { .. }
        )
    }

    /// The scheduling loop must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestratorError::Storage(_))
    }
}

impl From<DbError> for OrchestratorError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Rejected(reason) => OrchestratorError::QueryRejected(reason),
            other => OrchestratorError::Storage(other.to_string()),
        }
    }
}
