//! HTTP access logging.
//!
//! Access lines go to their own tracing target so they can be filtered or
//! routed independently of the application log, e.g.
//! `RUST_LOG=info,clusterd::access=off`.

use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

/// Tracing target of access log events.
pub const ACCESS_LOG_TARGET: &str = "clusterd::access";

/// Access log sink handed to the HTTP transport.
#[derive(Debug, Clone)]
pub struct AccessLogger {
    enabled: bool,
}

impl AccessLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(
        &self,
        method: &Method,
        path: &str,
        status: StatusCode,
        latency: Duration,
        request_id: &str,
    ) {
        if !self.enabled {
            return;
        }
        info!(
            target: ACCESS_LOG_TARGET,
            method = %method,
            path,
            status = status.as_u16(),
            latency_ms = latency.as_secs_f64() * 1000.0,
            request_id,
            "request"
        );
    }
}

impl Default for AccessLogger {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Middleware emitting one access log event per request.
pub async fn access_log_middleware(
    State(logger): State<AccessLogger>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !logger.is_enabled() {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;

    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    logger.record(&method, &path, response.status(), start.elapsed(), request_id);
    response
}
