use super::{api_client, friendly_error, json_or_error};

/// Run the `status` subcommand: call the API and pretty-print progress.
pub async fn run(api_url: &str) -> anyhow::Result<()> {
    let resp = api_client()
        .get(format!("{api_url}/api/status"))
        .send()
        .await
        .map_err(friendly_error)?;
    let status = json_or_error(resp, "Fetching status").await?;
    print!("{}", render(&status));
    Ok(())
}

fn render(status: &serde_json::Value) -> String {
    let stats = &status["stats"];
    let count = |key: &str| stats[key].as_u64().unwrap_or(0);
    let version = status["version"].as_str().unwrap_or("unknown");
    let project = status["project"].as_str().unwrap_or("");
    let loop_state = if status["loop_running"].as_bool().unwrap_or(false) {
        "running"
    } else {
        "stopped"
    };

    let mut out = String::new();
    out.push_str(&format!("ff status  {project} (v{version})\n"));
    out.push_str(&format!("{}\n", "-".repeat(40)));
    out.push_str(&format!(
        "Uptime:          {}s\n",
        status["uptime_seconds"].as_u64().unwrap_or(0)
    ));
    out.push_str(&format!("Scheduler:       {loop_state}\n"));
    out.push_str(&format!(
        "Agents:          {} ({} working)\n",
        status["agent_count"].as_u64().unwrap_or(0),
        status["working_agents"].as_u64().unwrap_or(0)
    ));
    out.push_str(&format!("Total tasks:     {}\n", count("total")));
    for key in ["pending", "in_progress", "completed", "failed", "blocked"] {
        out.push_str(&format!("  {:<14} {}\n", format!("{key}:"), count(key)));
    }
    out.push_str(&format!(
        "Completion:      {:.1}%\n",
        stats["completion_percentage"].as_f64().unwrap_or(0.0)
    ));
    let stalled = count("stalled");
    if stalled > 0 {
        out.push_str(&format!("Stalled:         {stalled}\n"));
    }
    out
}
