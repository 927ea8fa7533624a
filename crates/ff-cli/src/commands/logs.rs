use serde_json::Value;

use super::{api_client, friendly_error, json_or_error};

pub async fn run(
    api_url: &str,
    task: Option<&str>,
    agent: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
    if let Some(task) = task {
        query.push(("task", task.to_string()));
    }
    if let Some(agent) = agent {
        query.push(("agent", agent.to_string()));
    }

    let resp = api_client()
        .get(format!("{api_url}/api/logs"))
        .query(&query)
        .send()
        .await
        .map_err(friendly_error)?;
    let body = json_or_error(resp, "Fetching logs").await?;
    for event in body.as_array().into_iter().flatten() {
        println!("{}", line(event));
    }
    Ok(())
}

fn line(event: &Value) -> String {
    let mut out = format!(
        "#{:<6} {} {:<7}",
        event["seq"].as_u64().unwrap_or(0),
        event["timestamp"].as_str().unwrap_or(""),
        event["severity"].as_str().unwrap_or("info").to_uppercase(),
    );
    if let Some(agent) = event["agent_id"].as_str() {
        out.push_str(&format!(" [{agent}]"));
    }
    if let Some(task) = event["task_id"].as_str() {
        out.push_str(&format!(" {task}:"));
    }
    out.push(' ');
    out.push_str(event["message"].as_str().unwrap_or(""));
    out
}
