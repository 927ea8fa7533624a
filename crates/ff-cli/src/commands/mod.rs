pub mod agents;
pub mod ingest;
pub mod logs;
pub mod query;
pub mod run;
pub mod set_status;
pub mod status;
pub mod tasks;

use serde_json::Value;

pub fn api_client() -> reqwest::Client {
    reqwest::Client::new()
}

/// Map common reqwest errors to user-friendly messages.
pub fn friendly_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_connect() {
        anyhow::anyhow!(
            "Could not connect to the ff daemon. Is it running?\n  \
             (hint: start it with `ff-daemon` or check --api-url / FF_API_URL)"
        )
    } else if err.is_timeout() {
        anyhow::anyhow!("Request timed out. The daemon may be overloaded.")
    } else {
        anyhow::anyhow!("API request failed: {err}")
    }
}

/// Read a JSON body, turning non-2xx responses into an error carrying the
/// API's `{"error": ...}` message.
pub async fn json_or_error(resp: reqwest::Response, action: &str) -> anyhow::Result<Value> {
    let status = resp.status();
    // Some endpoints answer with an empty body.
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(body);
    }
    let err_msg = body["error"].as_str().unwrap_or("unknown error");
    anyhow::bail!("{action} failed: {err_msg} (HTTP {status})")
}

/// Fixed-width cell; longer values are cut with an ellipsis.
pub fn cell(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        format!("{value:<width$}")
    } else {
        let cut: String = value.chars().take(width.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
