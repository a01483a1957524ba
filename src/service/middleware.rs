//! Request logging and metrics middleware.
//!
//! ## Metrics Exposed
//!
//! Emitted as `tracing` events on target `layout::metrics`:
//!
//! - `metric_type = "request"`: path pattern, method, status, latency
//!
//! Access logs go to `layout_service::access` with a correlation id taken
//! from `X-Cloud-Trace-Context` or `X-Request-Id`, or generated.

use std::sync::OnceLock;
use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use regex_lite::Regex;
use tracing::{info, info_span, Instrument};

/// Records request count and latency by normalized path.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());

    let response = next.run(request).await;

    info!(
        target: "layout::metrics",
        metric_type = "request",
        path = %path,
        method = %method,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "request_metric"
    );

    response
}

/// Wraps each request in a span carrying its correlation id.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let trace_id = correlation_id(&request);
    let method = request.method().clone();
    let uri = request.uri().path().to_string();

    let span = info_span!(
        "request",
        trace_id = %trace_id,
        method = %method,
        path = %uri,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let response = next.run(request).instrument(span.clone()).await;

    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    span.record("status", status);
    span.record("latency_ms", latency_ms);

    info!(
        target: "layout_service::access",
        trace_id = %trace_id,
        method = %method,
        path = %uri,
        status,
        latency_ms,
        "request completed"
    );

    response
}

fn correlation_id(request: &Request) -> String {
    let headers = request.headers();
    headers
        .get("X-Cloud-Trace-Context")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split('/').next())
        .or_else(|| headers.get("X-Request-Id").and_then(|v| v.to_str().ok()))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Replace run ids in paths so metrics keep a bounded cardinality.
fn normalize_path(path: &str) -> String {
    static UUID_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = UUID_RE.get_or_init(|| {
        Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").ok()
    });
    match re {
        Some(re) => re.replace_all(path, ":id").into_owned(),
        None => path.to_string(),
    }
}
