use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use ff_agents::log_sink::LogQuery;
use ff_agents::Orchestrator;
use ff_core::db::QueryResult;
use ff_core::types::{
    Agent, AgentId, AgentStatus, LogEvent, Role, Severity, Task, TaskFilter, TaskId, TaskStats,
    TaskStatus,
};
use ff_telemetry::tracing_setup::request_id_middleware;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::api_error::ApiError;
use crate::daemon::{LoopHandle, RunTicket};
use crate::presentation::{agent_badge, severity_badge, task_badge, Badge};

const DEFAULT_LOG_LIMIT: usize = 200;

/// Shared state for all HTTP handlers.
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub loop_handle: LoopHandle,
    pub project_name: String,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>, loop_handle: LoopHandle) -> Self {
        Self {
            orchestrator,
            loop_handle,
            project_name: String::new(),
        }
    }

    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }
}

/// Build the dashboard API router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/batch", post(create_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/logs", get(get_task_logs))
        .route("/api/tasks/{id}/run", post(run_task))
        .route("/api/tasks/{id}/status", post(set_task_status))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{id}/status", post(set_agent_status))
        .route("/api/logs", get(list_logs))
        .route("/api/tick", post(request_tick))
        .route("/api/query", post(run_query))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub project: String,
    pub uptime_seconds: u64,
    pub agent_count: usize,
    pub working_agents: usize,
    pub running: usize,
    pub loop_running: bool,
    pub stats: TaskStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub phase: u32,
    #[serde(default)]
    pub phase_name: String,
    #[serde(default)]
    pub priority: i32,
    pub required_role: Role,
    #[serde(default)]
    pub estimated_hours: f64,
}

impl CreateTaskRequest {
    pub fn into_task(self) -> Task {
        Task::new(self.id, self.title, self.required_role)
            .with_description(self.description)
            .with_criteria(self.acceptance_criteria)
            .with_dependencies(self.dependencies)
            .with_phase(self.phase, self.phase_name)
            .with_priority(self.priority)
            .with_estimate(self.estimated_hours)
    }
}

impl From<&Task> for CreateTaskRequest {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            dependencies: task.dependencies.iter().map(|d| d.to_string()).collect(),
            phase: task.phase,
            phase_name: task.phase_name.clone(),
            priority: task.priority,
            required_role: task.required_role,
            estimated_hours: task.estimated_hours,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub tasks: Vec<CreateTaskRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub created: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
    pub phase: Option<u32>,
    pub role: Option<String>,
    pub agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogListQuery {
    pub agent: Option<String>,
    pub task: Option<String>,
    pub min_severity: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub badge: Badge,
    /// Dependencies that are not completed yet.
    pub waiting_on: Vec<TaskId>,
}

#[derive(Debug, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: Agent,
    pub badge: Badge,
}

#[derive(Debug, Serialize)]
pub struct LogView {
    #[serde(flatten)]
    pub event: LogEvent,
    pub badge: Badge,
}

fn parse_param<T: FromStr>(value: Option<&str>) -> Result<Option<T>, ApiError>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|v| T::from_str(v).map_err(|e| ApiError::BadRequest(e.to_string())))
        .transpose()
}

fn task_view(orchestrator: &Orchestrator, task: Task) -> TaskView {
    let waiting_on = orchestrator.task_store().waiting_on(&task);
    TaskView {
        badge: task_badge(task.status),
        waiting_on,
        task,
    }
}

fn agent_view(agent: Agent) -> AgentView {
    AgentView {
        badge: agent_badge(agent.status),
        agent,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let orchestrator = &state.orchestrator;
    let agents = orchestrator.agents();
    let uptime = Utc::now().signed_duration_since(orchestrator.started_at());
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        project: state.project_name.clone(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        agent_count: agents.len(),
        working_agents: agents
            .iter()
            .filter(|a| a.status == AgentStatus::Working)
            .count(),
        running: orchestrator.coordinator().running().len(),
        loop_running: state.loop_handle.is_running(),
        stats: orchestrator.stats(),
    })
}

async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let filter = TaskFilter {
        status: parse_param::<TaskStatus>(query.status.as_deref())?,
        phase: query.phase,
        role: parse_param::<Role>(query.role.as_deref())?,
        agent: query.agent.map(AgentId::from),
    };
    let orchestrator = &state.orchestrator;
    let views = orchestrator
        .tasks(filter)
        .iter()
        .cloned()
        .map(|task| task_view(orchestrator, task))
        .collect();
    Ok(Json(views))
}

async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.orchestrator.create_task(req.into_task()).await?;
    Ok((
        StatusCode::CREATED,
        Json(task_view(&state.orchestrator, task)),
    ))
}

async fn create_tasks(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<BatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = req.tasks.into_iter().map(CreateTaskRequest::into_task).collect();
    let created = state.orchestrator.create_tasks(tasks).await?;
    Ok((
        StatusCode::CREATED,
        Json(BatchResponse {
            created: created.len(),
        }),
    ))
}

async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let task = state.orchestrator.task(&TaskId::from(id))?;
    Ok(Json(task_view(&state.orchestrator, task)))
}

async fn get_task_logs(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LogView>>, ApiError> {
    let history = state.orchestrator.task_history(&TaskId::from(id)).await?;
    Ok(Json(history.into_iter().map(log_view).collect()))
}

async fn run_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RunTicket>), ApiError> {
    let ticket = state.loop_handle.trigger_run(TaskId::from(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

async fn set_task_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<StatusChange>,
) -> Result<Json<TaskView>, ApiError> {
    let status = TaskStatus::from_str(&req.status).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let task = state
        .orchestrator
        .override_status(&TaskId::from(id), status)
        .await?;
    Ok(Json(task_view(&state.orchestrator, task)))
}

async fn list_agents(State(state): State<Arc<ApiState>>) -> Json<Vec<AgentView>> {
    Json(state.orchestrator.agents().into_iter().map(agent_view).collect())
}

/// Operator hold / unhold / retire. Working agents are rejected; they are
/// freed by overriding their task instead.
async fn set_agent_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<StatusChange>,
) -> Result<Json<AgentView>, ApiError> {
    let id = AgentId::from(id);
    let target =
        AgentStatus::from_str(&req.status).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let orchestrator = &state.orchestrator;
    let agent = match target {
        AgentStatus::Active => orchestrator.hold_agent(&id).await?,
        AgentStatus::Idle => orchestrator.unhold_agent(&id).await?,
        AgentStatus::Offline => orchestrator.retire_agent(&id).await?,
        AgentStatus::Working => {
            return Err(ApiError::Unprocessable(
                "agents become working only by being assigned a task".into(),
            ))
        }
    };
    Ok(Json(agent_view(agent)))
}

fn log_view(event: LogEvent) -> LogView {
    LogView {
        badge: severity_badge(event.severity),
        event,
    }
}

async fn list_logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LogListQuery>,
) -> Result<Json<Vec<LogView>>, ApiError> {
    let log_query = LogQuery {
        agent: query.agent.map(AgentId::from),
        task: query.task.map(TaskId::from),
        min_severity: parse_param::<Severity>(query.min_severity.as_deref())?,
        limit: Some(query.limit.unwrap_or(DEFAULT_LOG_LIMIT)),
    };
    let events = state.orchestrator.logs(&log_query);
    Ok(Json(events.into_iter().map(log_view).collect()))
}

async fn request_tick(State(state): State<Arc<ApiState>>) -> Result<StatusCode, ApiError> {
    state.loop_handle.request_tick()?;
    Ok(StatusCode::ACCEPTED)
}

async fn run_query(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResult>, ApiError> {
    Ok(Json(state.orchestrator.query(&req.sql).await?))
}
