use super::{api_client, friendly_error, json_or_error};

/// Ask the daemon to start a task now.
pub async fn run(api_url: &str, task_id: &str) -> anyhow::Result<()> {
    let resp = api_client()
        .post(format!("{api_url}/api/tasks/{task_id}/run"))
        .send()
        .await
        .map_err(friendly_error)?;
    let ticket = json_or_error(resp, &format!("Starting {task_id}")).await?;
    println!(
        "Started {task_id} on {} (attempt {}).",
        ticket["agent_id"].as_str().unwrap_or("?"),
        ticket["attempt"].as_u64().unwrap_or(0)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{extract::Path, http::StatusCode, routing::post, Json, Router};
    use serde_json::json;

    use super::*;
    use crate::commands::test_support::serve;

    fn app() -> Router {
        Router::new().route(
            "/api/tasks/{id}/run",
            post(|Path(id): Path<String>| async move {
                if id == "ready" {
                    (
                        StatusCode::ACCEPTED,
                        Json(json!({"task_id": id, "agent_id": "backend-dev-1", "attempt": 1})),
                    )
                } else {
                    (
                        StatusCode::CONFLICT,
                        Json(json!({"error": format!("task {id} is waiting on unfinished dependencies: a")})),
                    )
                }
            }),
        )
    }

    #[tokio::test]
    async fn accepted_run_succeeds() {
        let url = serve(app()).await;
        assert!(run(&url, "ready").await.is_ok());
    }

    #[tokio::test]
    async fn conflict_reports_reason() {
        let url = serve(app()).await;
        let err = run(&url, "blocked-one").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("waiting on unfinished dependencies"));
        assert!(msg.contains("409"));
    }
}
