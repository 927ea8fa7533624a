use serde_json::{json, Value};

use super::{api_client, friendly_error, json_or_error};

/// Run a read-only SQL query and print the result as a tab-separated table.
pub async fn run(api_url: &str, sql: &str) -> anyhow::Result<()> {
    let resp = api_client()
        .post(format!("{api_url}/api/query"))
        .json(&json!({ "sql": sql }))
        .send()
        .await
        .map_err(friendly_error)?;
    let result = json_or_error(resp, "Query").await?;
    print!("{}", render(&result));
    Ok(())
}

fn render(result: &Value) -> String {
    let mut out = String::new();
    let columns: Vec<&str> = result["columns"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .collect();
    out.push_str(&columns.join("\t"));
    out.push('\n');

    let rows = result["rows"].as_array().cloned().unwrap_or_default();
    for row in &rows {
        let cells: Vec<String> = row
            .as_array()
            .into_iter()
            .flatten()
            .map(|v| match v {
                Value::Null => "NULL".to_string(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    out.push_str(&format!("({} rows", rows.len()));
    if result["truncated"].as_bool().unwrap_or(false) {
        out.push_str(", truncated");
    }
    out.push_str(")\n");
    out
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, routing::post, Json, Router};

    use super::*;
    use crate::commands::test_support::serve;

    #[test]
    fn render_formats_nulls_and_numbers() {
        let out = render(&json!({
            "columns": ["id", "priority", "assigned_agent"],
            "rows": [["a", 1, null]],
            "truncated": true
        }));
        assert_eq!(out, "id\tpriority\tassigned_agent\na\t1\tNULL\n(1 rows, truncated)\n");
    }

    #[tokio::test]
    async fn rejected_query_is_an_error() {
        let app = Router::new().route(
            "/api/query",
            post(|| async {
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({"error": "query rejected: only SELECT statements are allowed"})),
                )
            }),
        );
        let url = serve(app).await;
        let err = run(&url, "DELETE FROM tasks").await.unwrap_err();
        assert!(err.to_string().contains("query rejected"));
    }
}
