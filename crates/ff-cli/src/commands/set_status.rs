use std::str::FromStr;

use ff_core::types::TaskStatus;
use serde_json::json;

use super::{api_client, friendly_error, json_or_error};

/// Operator override of a task's status.
pub async fn run(api_url: &str, task_id: &str, status: &str) -> anyhow::Result<()> {
    // Catch typos before the round trip.
    let status = TaskStatus::from_str(status)?;

    let resp = api_client()
        .post(format!("{api_url}/api/tasks/{task_id}/status"))
        .json(&json!({ "status": status.as_str() }))
        .send()
        .await
        .map_err(friendly_error)?;
    let task = json_or_error(resp, &format!("Setting {task_id} to {status}")).await?;
    println!(
        "Task {task_id} is now {}.",
        task["status"].as_str().unwrap_or(status.as_str())
    );
    Ok(())
}
