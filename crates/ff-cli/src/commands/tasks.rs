use serde_json::Value;

use super::{api_client, cell, friendly_error, json_or_error};

pub async fn run(api_url: &str, status: Option<&str>, phase: Option<u32>) -> anyhow::Result<()> {
    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(status) = status {
        query.push(("status", status.to_string()));
    }
    if let Some(phase) = phase {
        query.push(("phase", phase.to_string()));
    }

    let resp = api_client()
        .get(format!("{api_url}/api/tasks"))
        .query(&query)
        .send()
        .await
        .map_err(friendly_error)?;
    let body = json_or_error(resp, "Listing tasks").await?;
    let tasks = body.as_array().cloned().unwrap_or_default();

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!(
        "{} {} {} {} {}",
        cell("ID", 36),
        cell("PHASE", 5),
        cell("ROLE", 10),
        cell("STATUS", 12),
        "AGENT"
    );
    for task in &tasks {
        println!("{}", row(task));
    }
    Ok(())
}

fn row(task: &Value) -> String {
    let mut line = format!(
        "{} {} {} {} {}",
        cell(task["id"].as_str().unwrap_or("?"), 36),
        cell(&task["phase"].as_u64().unwrap_or(0).to_string(), 5),
        cell(task["required_role"].as_str().unwrap_or("?"), 10),
        cell(task["badge"]["label"].as_str().unwrap_or("?"), 12),
        task["assigned_agent"].as_str().unwrap_or("-"),
    );
    if let Some(waiting) = task["waiting_on"].as_array().filter(|w| !w.is_empty()) {
        line.push_str(&format!("  (waiting on {})", waiting.len()));
    }
    line
}
