//! Prometheus metrics for clusterd.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::manager::Subsystem;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "clusterd_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "clusterd_http_request_duration_seconds";

/// Total RPC requests served (counter). Labels: method, status.
pub const RPC_REQUESTS_TOTAL: &str = "clusterd_rpc_requests_total";

/// Subsystem start attempts (counter). Labels: subsystem, result.
pub const SUBSYSTEM_STARTS_TOTAL: &str = "clusterd_subsystem_starts_total";

/// Subsystem stop attempts (counter). Labels: subsystem, result.
pub const SUBSYSTEM_STOPS_TOTAL: &str = "clusterd_subsystem_stops_total";

/// Join handshakes attempted (counter). Labels: result.
pub const JOIN_ATTEMPTS_TOTAL: &str = "clusterd_join_attempts_total";

/// Members currently known to this node (gauge).
pub const CLUSTER_MEMBERS: &str = "clusterd_cluster_members";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests).
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(RPC_REQUESTS_TOTAL, "Total RPC requests by method");
    describe_counter!(SUBSYSTEM_STARTS_TOTAL, "Subsystem start attempts");
    describe_counter!(SUBSYSTEM_STOPS_TOTAL, "Subsystem stop attempts");
    describe_counter!(JOIN_ATTEMPTS_TOTAL, "Cluster join handshakes attempted");
    describe_gauge!(CLUSTER_MEMBERS, "Cluster members known to this node");
}

// -- Recording helpers --------------------------------------------------------

fn outcome<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "error"
    }
}

pub fn record_start<T, E>(subsystem: Subsystem, result: &Result<T, E>) {
    counter!(SUBSYSTEM_STARTS_TOTAL, "subsystem" => subsystem.as_str(), "result" => outcome(result))
        .increment(1);
}

pub fn record_stop<T, E>(subsystem: Subsystem, result: &Result<T, E>) {
    counter!(SUBSYSTEM_STOPS_TOTAL, "subsystem" => subsystem.as_str(), "result" => outcome(result))
        .increment(1);
}

pub fn record_join(result: &'static str) {
    counter!(JOIN_ATTEMPTS_TOTAL, "result" => result).increment(1);
}

pub fn record_rpc(method: &'static str, status: &'static str) {
    counter!(RPC_REQUESTS_TOTAL, "method" => method, "status" => status).increment(1);
}

pub fn set_cluster_members(count: usize) {
    gauge!(CLUSTER_MEMBERS).set(count as f64);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    // Do not instrument the metrics endpoint itself.
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status
    )
    .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// This prevents high-cardinality labels from node ids and state keys.
///
/// Examples:
/// - `/liveness` -> `/liveness`
/// - `/cluster` -> `/cluster`
/// - `/cluster/node-7` -> `/cluster/{id}`
/// - `/state/indexes/books` -> `/state/{key}`
/// - `/nope/x` -> `/other`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/liveness" | "/readiness" | "/cluster" | "/metrics" => path.to_string(),
        _ => {
            let trimmed = path.trim_start_matches('/');
            match trimmed.split_once('/') {
                Some(("cluster", _)) => "/cluster/{id}".to_string(),
                Some(("state", _)) => "/state/{key}".to_string(),
                _ => "/other".to_string(),
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}

// -- Tests --------------------------------------------------------------------
