//! HTTP transport serving an [`HttpRouter`] plus `/metrics`.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use axum::http::{HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tracing::info;

use super::access_log::access_log_middleware;
use super::{AccessLogger, HttpRouter, HttpTransport};
use crate::errors::generate_request_id;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::net::{BoundListener, Shutdown};

pub struct HttpServer {
    listener: BoundListener,
    router: Arc<dyn HttpRouter>,
    access_log: AccessLogger,
    shutdown: Shutdown,
}

impl HttpServer {
    /// Bind `listen_addr` and prepare to serve `router`.
    pub fn new(
        listen_addr: &str,
        router: Arc<dyn HttpRouter>,
        access_log: AccessLogger,
    ) -> anyhow::Result<Self> {
        let listener = BoundListener::bind(listen_addr)?;
        Ok(Self {
            listener,
            router,
            access_log,
            shutdown: Shutdown::new(),
        })
    }

    /// The full application: router routes, `/metrics`, and middleware.
    pub fn app(&self) -> Router {
        app(self.router.routes(), self.access_log.clone())
    }
}

fn app(routes: Router, access_log: AccessLogger) -> Router {
    // Layers run outermost-last: metrics wraps the access log, which sees
    // the request id set on the way out.
    routes
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(
            access_log,
            access_log_middleware,
        ))
        .layer(middleware::from_fn(metrics_middleware))
}

/// Echo the caller's `x-request-id`, or mint one.
async fn request_id_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .cloned()
        .or_else(|| HeaderValue::from_str(&generate_request_id()).ok());

    let mut response = next.run(req).await;
    if let Some(value) = request_id {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

impl HttpTransport for HttpServer {
    fn start(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let listener = self.listener.take()?;
            info!(addr = %self.local_addr(), "HTTP transport listening");
            axum::serve(listener, self.app())
                .with_graceful_shutdown(self.shutdown.wait())
                .await?;
            info!(addr = %self.local_addr(), "HTTP transport stopped");
            Ok(())
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.shutdown.trigger();
            Ok(())
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::time::Duration;
    use tower::ServiceExt;

    struct StaticRouter;

    impl HttpRouter for StaticRouter {
        fn routes(&self) -> Router {
            Router::new().route("/liveness", get(|| async { "alive" }))
        }

        fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn server() -> HttpServer {
        HttpServer::new("127.0.0.1:0", Arc::new(StaticRouter), AccessLogger::default()).unwrap()
    }

    #[tokio::test]
    async fn test_request_id_is_minted() {
        let response = server()
            .app()
            .oneshot(Request::get("/liveness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers()["x-request-id"].to_str().unwrap();
        assert_eq!(id.len(), 16);
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let response = server()
            .app()
            .oneshot(
                Request::get("/liveness")
                    .header("x-request-id", "trace-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "trace-42");
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let response = server()
            .app()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serves_until_stopped() {
        let server = Arc::new(server());
        let addr = server.local_addr();
        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };

        let body = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap()
            .get(format!("http://{addr}/liveness"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "alive");

        server.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("transport should stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_construction_fails_when_address_in_use() {
        let first = server();
        let taken = first.local_addr().to_string();
        assert!(HttpServer::new(&taken, Arc::new(StaticRouter), AccessLogger::disabled()).is_err());
    }
}
