use std::sync::Arc;
use std::time::{Duration, Instant};

use ff_core::db::{Commit, DbError, EventDraft, StateDb};
use ff_core::types::*;

const LIMIT: Duration = Duration::from_secs(5);

/// Counts forever unless interrupted.
const ENDLESS: &str =
    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";

async fn db() -> StateDb {
    StateDb::new_in_memory().await.expect("in-memory db")
}

fn sample_task() -> Task {
    let mut task = Task::new("p1-01-api", "Build player API", Role::Backend)
        .with_description("REST endpoints for player stats")
        .with_criteria(["Endpoints return JSON", "p95 under 200ms"])
        .with_phase(1, "P1. Data Pipeline")
        .with_priority(1)
        .with_estimate(6.5);
    task.artifacts = vec!["src/api.rs".into()];
    task
}

#[tokio::test]
async fn commit_persists_all_parts_and_assigns_seq() {
    let db = db().await;
    let task = sample_task();
    let agent = Agent::new("backend-dev-1", "Alex", [Role::Backend, Role::Data]);

    let logged = db
        .commit(
            Commit::new()
                .task(task.clone())
                .agent(agent.clone())
                .event(EventDraft::new(Severity::Info, None, Some(task.id.clone()), "created"))
                .event(EventDraft::new(
                    Severity::Success,
                    Some(agent.id.clone()),
                    Some(task.id.clone()),
                    "done",
                )),
        )
        .await
        .unwrap();
    assert_eq!(logged.len(), 2);
    assert!(logged[0].seq < logged[1].seq);

    let loaded = db.get_task(&task.id).await.unwrap().expect("task stored");
    assert_eq!(loaded.title, task.title);
    assert_eq!(loaded.acceptance_criteria, task.acceptance_criteria);
    assert_eq!(loaded.phase_name, "P1. Data Pipeline");
    assert_eq!(loaded.required_role, Role::Backend);
    assert_eq!(loaded.artifacts, vec!["src/api.rs"]);
    assert_eq!(loaded.estimated_hours, 6.5);

    let agents = db.load_agents().await.unwrap();
    assert_eq!(agents.len(), 1);
    assert!(agents[0].has_role(Role::Data));
    assert_eq!(agents[0].status, AgentStatus::Idle);

    let history = db.events_for_task(&task.id).await.unwrap();
    assert_eq!(
        history.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(),
        vec!["created", "done"]
    );
}

#[tokio::test]
async fn commit_overwrites_existing_rows() {
    let db = db().await;
    let mut task = sample_task();
    db.commit(Commit::new().task(task.clone())).await.unwrap();

    task.status = TaskStatus::InProgress;
    task.assigned_agent = Some("backend-dev-1".into());
    task.attempts = 1;
    db.commit(Commit::new().task(task.clone())).await.unwrap();

    let tasks = db.load_tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::InProgress);
    assert_eq!(tasks[0].assigned_agent, Some(AgentId::new("backend-dev-1")));
    assert_eq!(tasks[0].attempts, 1);
}

#[tokio::test]
async fn empty_commit_is_a_noop() {
    let db = db().await;
    assert!(db.commit(Commit::new()).await.unwrap().is_empty());
    assert!(db.load_recent_events(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn recent_events_are_the_newest_oldest_first() {
    let db = db().await;
    for i in 0..5 {
        db.commit(Commit::new().event(EventDraft::new(
            Severity::Info,
            None,
            None,
            format!("event {i}"),
        )))
        .await
        .unwrap();
    }
    let recent = db.load_recent_events(3).await.unwrap();
    let messages: Vec<_> = recent.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["event 2", "event 3", "event 4"]);
}

#[tokio::test]
async fn on_disk_database_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.db");
    {
        let db = StateDb::new(&path).await.unwrap();
        db.commit(Commit::new().task(sample_task())).await.unwrap();
    }
    let db = StateDb::new(&path).await.unwrap();
    assert_eq!(db.load_tasks().await.unwrap().len(), 1);
}

#[tokio::test]
async fn readonly_query_returns_rows_and_caps() {
    let db = db().await;
    for i in 0..4 {
        let task = Task::new(format!("t{i}"), format!("Task {i}"), Role::Qa).with_priority(i);
        db.commit(Commit::new().task(task)).await.unwrap();
    }

    let result = db
        .query_readonly(
            "SELECT id, priority FROM tasks ORDER BY priority;",
            10,
            LIMIT,
        )
        .await
        .unwrap();
    assert_eq!(result.columns, vec!["id", "priority"]);
    assert_eq!(result.rows.len(), 4);
    assert_eq!(result.rows[3][1], serde_json::json!(3));
    assert!(!result.truncated);

    let capped = db
        .query_readonly("select id from tasks", 2, LIMIT)
        .await
        .unwrap();
    assert_eq!(capped.rows.len(), 2);
    assert!(capped.truncated);
}

#[tokio::test]
async fn readonly_query_rejects_writes_and_leaves_db_writable() {
    let db = db().await;
    db.commit(Commit::new().task(sample_task())).await.unwrap();

    for sql in [
        "UPDATE tasks SET status = 'completed'",
        "DROP TABLE tasks",
        "SELECT * FROM tasks; DROP TABLE tasks",
        "WITH t AS (SELECT 1) DELETE FROM tasks",
        "SELECT * FROM no_such_table",
        "   ",
    ] {
        let err = db.query_readonly(sql, 10, LIMIT).await.unwrap_err();
        assert!(matches!(err, DbError::Rejected(_)), "{sql:?} gave {err:?}");
    }

    assert_eq!(db.load_tasks().await.unwrap().len(), 1);
    db.commit(Commit::new().task(Task::new("other", "Other", Role::Qa)))
        .await
        .unwrap();
    assert_eq!(db.load_tasks().await.unwrap().len(), 2);
}

#[tokio::test]
async fn readonly_query_allows_semicolons_inside_literals() {
    let db = db().await;
    db.commit(Commit::new().event(EventDraft::new(Severity::Info, None, None, "a;b")))
        .await
        .unwrap();
    let result = db
        .query_readonly(
            "SELECT message FROM events WHERE message LIKE '%a;b%'",
            10,
            LIMIT,
        )
        .await
        .unwrap();
    assert_eq!(result.rows, vec![vec![serde_json::json!("a;b")]]);
}

#[tokio::test]
async fn readonly_query_is_interrupted_at_the_deadline() {
    let db = db().await;
    let started = Instant::now();
    let err = db
        .query_readonly(ENDLESS, 10, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Rejected(ref m) if m.contains("exceeded")), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(3));

    // The reader is usable again afterwards.
    let result = db.query_readonly("SELECT 1", 10, LIMIT).await.unwrap();
    assert_eq!(result.rows.len(), 1);
}

#[tokio::test]
async fn commits_do_not_wait_for_a_running_query() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(StateDb::new(dir.path().join("state.db")).await.unwrap());
    db.commit(Commit::new().task(sample_task())).await.unwrap();

    let reader = db.clone();
    let query = tokio::spawn(async move {
        reader
            .query_readonly(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                 SELECT count(*) FROM c, tasks",
                10,
                Duration::from_secs(2),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!query.is_finished());

    let write = db.commit(Commit::new().task(Task::new("other", "Other", Role::Qa)));
    tokio::time::timeout(Duration::from_millis(500), write)
        .await
        .expect("commit waited on the query")
        .unwrap();
    assert_eq!(db.load_tasks().await.unwrap().len(), 2);

    assert!(query.await.unwrap().is_err());
}

#[tokio::test]
async fn in_memory_commits_do_not_wait_for_a_running_query() {
    let db = Arc::new(db().await);
    let reader = db.clone();
    let query = tokio::spawn(async move {
        reader
            .query_readonly(ENDLESS, 10, Duration::from_secs(2))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let write = db.commit(Commit::new().task(sample_task()));
    tokio::time::timeout(Duration::from_millis(500), write)
        .await
        .expect("commit waited on the query")
        .unwrap();
    assert!(query.await.unwrap().is_err());
}
