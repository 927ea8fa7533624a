use serde_json::Value;

use super::{api_client, cell, friendly_error, json_or_error};

pub async fn run(api_url: &str) -> anyhow::Result<()> {
    let resp = api_client()
        .get(format!("{api_url}/api/agents"))
        .send()
        .await
        .map_err(friendly_error)?;
    let body = json_or_error(resp, "Listing agents").await?;

    println!(
        "{} {} {} {} {}",
        cell("ID", 18),
        cell("NAME", 12),
        cell("STATUS", 9),
        cell("DONE", 5),
        "TASK"
    );
    for agent in body.as_array().into_iter().flatten() {
        println!("{}", row(agent));
    }
    Ok(())
}

fn row(agent: &Value) -> String {
    format!(
        "{} {} {} {} {}",
        cell(agent["id"].as_str().unwrap_or("?"), 18),
        cell(agent["name"].as_str().unwrap_or("?"), 12),
        cell(agent["badge"]["label"].as_str().unwrap_or("?"), 9),
        cell(&agent["completed_tasks"].as_u64().unwrap_or(0).to_string(), 5),
        agent["current_task"].as_str().unwrap_or("-"),
    )
}
