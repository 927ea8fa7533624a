//! Dashboard API tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use ff_agents::{Orchestrator, WorkOutcome, WorkRequest, Worker, WorkerError};
use ff_core::config::{AgentSpec, Config};
use ff_core::types::{Role, TaskId, TaskStatus};
use ff_daemon::daemon::Daemon;
use ff_daemon::http_api::api_router;
use serde_json::{json, Value};
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct InstantWorker;

#[async_trait]
impl Worker for InstantWorker {
    async fn execute(&self, request: WorkRequest) -> Result<WorkOutcome, WorkerError> {
        Ok(WorkOutcome::Completed {
            artifacts: vec![format!("{}.md", request.task_id)],
            summary: "done".into(),
        })
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.general.project_name = "test-project".into();
    config.scheduler.tick_secs = 3600;
    config.agents = vec![
        AgentSpec {
            id: "backend-dev-1".into(),
            name: "Alex".into(),
            roles: vec![Role::Backend],
        },
        AgentSpec {
            id: "qa-eng-1".into(),
            name: "Riley".into(),
            roles: vec![Role::Qa],
        },
    ];
    config
}

async fn test_daemon() -> Arc<Daemon> {
    let config = config();
    let orchestrator = Orchestrator::in_memory(&config, Arc::new(InstantWorker))
        .await
        .expect("orchestrator");
    Arc::new(Daemon::with_orchestrator(config, Arc::new(orchestrator)))
}

/// Daemon with its scheduling loop running in the background.
async fn running_daemon() -> (Router, Arc<Daemon>) {
    let daemon = test_daemon().await;
    let looping = daemon.clone();
    tokio::spawn(async move { looping.run_loop().await });
    (api_router(daemon.api_state()), daemon)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn task_json(id: &str, role: &str, deps: &[&str]) -> Value {
    json!({
        "id": id,
        "title": format!("Task {id}"),
        "required_role": role,
        "phase": 1,
        "phase_name": "P1. Core",
        "dependencies": deps,
    })
}

async fn wait_for_status(daemon: &Daemon, id: &str, status: TaskStatus) {
    for _ in 0..200 {
        let task = daemon.orchestrator().task(&TaskId::new(id)).unwrap();
        if task.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached {status}");
}

// ---------------------------------------------------------------------------
// Status and tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_reports_version_and_stats() {
    let daemon = test_daemon().await;
    let app = api_router(daemon.api_state());
    send(&app, "POST", "/api/tasks", Some(task_json("a", "backend", &[]))).await;

    let (status, body) = send(&app, "GET", "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["project"], "test-project");
    assert_eq!(body["agent_count"], 2);
    assert_eq!(body["stats"]["total"], 1);
    assert_eq!(body["stats"]["pending"], 1);
    assert_eq!(body["loop_running"], true);
}

#[tokio::test]
async fn create_get_and_filter_tasks() {
    let daemon = test_daemon().await;
    let app = api_router(daemon.api_state());

    let (status, body) = send(&app, "POST", "/api/tasks", Some(task_json("a", "backend", &[]))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["badge"]["css_class"], "status-pending");

    let (status, _) = send(&app, "POST", "/api/tasks", Some(task_json("b", "qa", &["a"]))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, "GET", "/api/tasks/b", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["required_role"], "qa");
    assert_eq!(body["waiting_on"], json!(["a"]));

    let (_, body) = send(&app, "GET", "/api/tasks?role=qa", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    let (_, body) = send(&app, "GET", "/api/tasks?status=pending", None).await;
    assert_eq!(body.as_array().unwrap().len(), 2);
    let (_, body) = send(&app, "GET", "/api/tasks?status=completed", None).await;
    assert!(body.as_array().unwrap().is_empty());

    let (status, body) = send(&app, "GET", "/api/tasks?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn create_rejects_invalid_tasks() {
    let daemon = test_daemon().await;
    let app = api_router(daemon.api_state());

    let (status, body) = send(&app, "POST", "/api/tasks", Some(task_json("a", "backend", &["ghost"]))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("ghost"));

    let (status, _) = send(&app, "GET", "/api/tasks/a", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn batch_with_cycle_is_rejected_whole() {
    let daemon = test_daemon().await;
    let app = api_router(daemon.api_state());

    let batch = json!({"tasks": [
        task_json("x", "backend", &["y"]),
        task_json("y", "backend", &["x"]),
        task_json("z", "backend", &[]),
    ]});
    let (status, body) = send(&app, "POST", "/api/tasks/batch", Some(batch)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("cycle"));
    assert!(daemon.orchestrator().task_store().is_empty());

    let batch = json!({"tasks": [task_json("y", "qa", &["x"]), task_json("x", "backend", &[])]});
    let (status, body) = send(&app, "POST", "/api/tasks/batch", Some(batch)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["created"], 2);
}

// ---------------------------------------------------------------------------
// Runs and overrides
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_endpoint_starts_and_completes_task() {
    let (app, daemon) = running_daemon().await;
    send(&app, "POST", "/api/tasks", Some(task_json("a", "backend", &[]))).await;
    send(&app, "POST", "/api/tasks", Some(task_json("b", "qa", &["a"]))).await;

    let (status, body) = send(&app, "POST", "/api/tasks/b/run", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("waiting on"));

    // The loop may already have picked `a` up on its first tick.
    let (status, body) = send(&app, "POST", "/api/tasks/a/run", None).await;
    match status {
        StatusCode::ACCEPTED => {
            assert_eq!(body["task_id"], "a");
            assert_eq!(body["agent_id"], "backend-dev-1");
        }
        StatusCode::CONFLICT => {}
        other => panic!("unexpected {other}: {body}"),
    }
    wait_for_status(&daemon, "a", TaskStatus::Completed).await;

    let (status, _) = send(&app, "POST", "/api/tasks/a/run", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&app, "GET", "/api/tasks/a/logs", None).await;
    assert_eq!(status, StatusCode::OK);
    let last = body.as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["severity"], "success");
    assert_eq!(last["badge"]["css_class"], "log-success");

    daemon.shutdown();
}

#[tokio::test]
async fn run_without_matching_agent_is_unavailable() {
    let (app, daemon) = running_daemon().await;
    send(&app, "POST", "/api/tasks", Some(task_json("ui", "frontend", &[]))).await;

    let (status, body) = send(&app, "POST", "/api/tasks/ui/run", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("frontend"));

    let (status, _) = send(&app, "POST", "/api/tasks/nope/run", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    daemon.shutdown();
}

#[tokio::test]
async fn run_after_shutdown_is_unavailable() {
    let daemon = test_daemon().await;
    let app = api_router(daemon.api_state());
    send(&app, "POST", "/api/tasks", Some(task_json("a", "backend", &[]))).await;
    daemon.shutdown();

    let (status, _) = send(&app, "POST", "/api/tasks/a/run", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, _) = send(&app, "POST", "/api/tick", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn status_override_follows_transition_table() {
    let daemon = test_daemon().await;
    let app = api_router(daemon.api_state());
    send(&app, "POST", "/api/tasks", Some(task_json("a", "backend", &[]))).await;

    let (status, _) = send(&app, "POST", "/api/tasks/a/status", Some(json!({"status": "completed"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, "POST", "/api/tasks/a/status", Some(json!({"status": "sideways"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", "/api/tasks/ghost/status", Some(json!({"status": "pending"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Agents, logs and queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agents_can_be_held_and_released_by_operator() {
    let daemon = test_daemon().await;
    let app = api_router(daemon.api_state());

    let (status, body) = send(&app, "GET", "/api/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    let agents = body.as_array().unwrap();
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0]["id"], "backend-dev-1");
    assert_eq!(agents[0]["badge"]["label"], "Idle");

    let (status, body) = send(
        &app,
        "POST",
        "/api/agents/backend-dev-1/status",
        Some(json!({"status": "active"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");

    let (status, _) = send(
        &app,
        "POST",
        "/api/agents/backend-dev-1/status",
        Some(json!({"status": "working"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(
        &app,
        "POST",
        "/api/agents/nobody/status",
        Some(json!({"status": "idle"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn logs_are_filtered_and_limited() {
    let daemon = test_daemon().await;
    let app = api_router(daemon.api_state());
    for id in ["a", "b", "c"] {
        send(&app, "POST", "/api/tasks", Some(task_json(id, "backend", &[]))).await;
    }

    let (status, body) = send(&app, "GET", "/api/logs?limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["task_id"], "c");
    assert!(events[0]["seq"].as_u64().unwrap() < events[1]["seq"].as_u64().unwrap());

    let (_, body) = send(&app, "GET", "/api/logs?task=b", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (_, body) = send(&app, "GET", "/api/logs?min_severity=error", None).await;
    assert!(body.as_array().unwrap().is_empty());

    let (status, _) = send(&app, "GET", "/api/logs?min_severity=loud", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn query_endpoint_is_read_only() {
    let daemon = test_daemon().await;
    let app = api_router(daemon.api_state());
    send(&app, "POST", "/api/tasks", Some(task_json("a", "backend", &[]))).await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/query",
        Some(json!({"sql": "SELECT id, status FROM tasks"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["columns"], json!(["id", "status"]));
    assert_eq!(body["rows"], json!([["a", "pending"]]));

    let (status, body) = send(
        &app,
        "POST",
        "/api/query",
        Some(json!({"sql": "DELETE FROM tasks"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().starts_with("query rejected"));
    assert_eq!(daemon.orchestrator().task_store().len(), 1);
}

#[tokio::test]
async fn responses_carry_request_id() {
    let daemon = test_daemon().await;
    let app = api_router(daemon.api_state());
    let req = Request::builder()
        .uri("/api/status")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-123");
}
