use anyhow::Context;
use ff_core::roadmap::parse_roadmap;
use ff_core::types::Task;
use serde_json::{json, Value};

use super::{api_client, friendly_error, json_or_error};

/// Parse a roadmap locally and create its tasks as one batch.
pub async fn run(api_url: &str, path: &str, dry_run: bool) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {path}"))?;
    let tasks = parse_roadmap(&text).with_context(|| format!("failed to parse {path}"))?;

    if dry_run {
        for task in &tasks {
            println!(
                "{}  [phase {}, {}] {} deps",
                task.id,
                task.phase,
                task.required_role,
                task.dependencies.len()
            );
        }
        println!("{} tasks parsed (dry run, nothing created).", tasks.len());
        return Ok(());
    }

    let resp = api_client()
        .post(format!("{api_url}/api/tasks/batch"))
        .json(&batch_payload(&tasks))
        .send()
        .await
        .map_err(friendly_error)?;
    let body = json_or_error(resp, "Ingesting roadmap").await?;
    println!(
        "Created {} tasks from {path}.",
        body["created"].as_u64().unwrap_or(0)
    );
    Ok(())
}

fn batch_payload(tasks: &[Task]) -> Value {
    let tasks: Vec<Value> = tasks
        .iter()
        .map(|task| {
            json!({
                "id": task.id.as_str(),
                "title": task.title,
                "description": task.description,
                "acceptance_criteria": task.acceptance_criteria,
                "dependencies": task.dependencies.iter().map(|d| d.as_str()).collect::<Vec<_>>(),
                "phase": task.phase,
                "phase_name": task.phase_name,
                "priority": task.priority,
                "required_role": task.required_role.as_str(),
                "estimated_hours": task.estimated_hours,
            })
        })
        .collect();
    json!({ "tasks": tasks })
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::io::Write;

    use super::*;
    use crate::commands::test_support::serve;

    const ROADMAP: &str = "\
## Phase 0: Bootstrap
- [ ] Set up repository architecture

## Phase 1: Core Data (Target: Q3)
- [ ] Build projections API
- [x] Already shipped
";

    fn roadmap_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ROADMAP.as_bytes()).unwrap();
        file
    }

    #[test]
    fn payload_matches_create_request_shape() {
        let tasks = parse_roadmap(ROADMAP).unwrap();
        let payload = batch_payload(&tasks);
        let list = payload["tasks"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1]["required_role"], "backend");
        assert_eq!(list[1]["phase"], 1);
        assert_eq!(list[1]["dependencies"], json!([list[0]["id"].clone()]));
    }

    #[tokio::test]
    async fn ingest_posts_one_batch() {
        let app = Router::new().route(
            "/api/tasks/batch",
            post(|Json(body): Json<Value>| async move {
                let count = body["tasks"].as_array().map_or(0, Vec::len);
                (StatusCode::CREATED, Json(json!({ "created": count })))
            }),
        );
        let url = serve(app).await;
        let file = roadmap_file();
        let path = file.path().to_str().unwrap();
        assert!(run(&url, path, false).await.is_ok());
    }

    #[tokio::test]
    async fn dry_run_does_not_contact_daemon() {
        let file = roadmap_file();
        let path = file.path().to_str().unwrap();
        assert!(run("http://127.0.0.1:9", path, true).await.is_ok());
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = run("http://127.0.0.1:9", "/nonexistent/ROADMAP.md", true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
