use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

/// Generate a 32 hex character run/trace id.
pub fn generate_run_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Span wrapping one execution of a task by an agent. Every event logged
/// while the run is in flight carries the run id.
pub fn run_span(task_id: &str, agent_id: &str, attempt: u32) -> (tracing::Span, String) {
    let run_id = generate_run_id();
    let span = tracing::info_span!(
        "task_run",
        run_id = %run_id,
        task_id = %task_id,
        agent_id = %agent_id,
        attempt,
    );
    (span, run_id)
}

/// Axum middleware that injects `X-Request-Id` headers and creates a tracing
/// span for each request.
///
/// An incoming `X-Request-Id` is reused; otherwise a new id is generated.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_run_id);

    request.headers_mut().insert(
        "x-request-id",
        request_id
            .parse()
            .unwrap_or_else(|_| axum::http::HeaderValue::from_static("unknown")),
    );

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    tracing::debug!(parent: &span, "processing request");

    let mut response = tracing::Instrument::instrument(next.run(request), span).await;

    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert("x-request-id", val);
    }
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
