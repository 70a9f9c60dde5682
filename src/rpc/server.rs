//! RPC transport: an axum listener in front of an [`RpcService`].

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{RpcRequest, RpcResponse, RpcService, RpcTransport};
use crate::errors::RpcError;
use crate::net::{BoundListener, Shutdown};

pub struct RpcServer {
    listener: BoundListener,
    service: Arc<dyn RpcService>,
    shutdown: Shutdown,
}

impl RpcServer {
    /// Bind `listen_addr` and prepare to dispatch to `service`.
    pub fn new(listen_addr: &str, service: Arc<dyn RpcService>) -> anyhow::Result<Self> {
        let listener = BoundListener::bind(listen_addr)?;
        Ok(Self {
            listener,
            service,
            shutdown: Shutdown::new(),
        })
    }
}

/// Build the RPC router for `service`.
pub fn router(service: Arc<dyn RpcService>) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/healthz", get(healthz))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}

/// `POST /rpc` -- decode the envelope and hand it to the service.
async fn handle_rpc(
    State(service): State<Arc<dyn RpcService>>,
    body: Bytes,
) -> Result<Json<RpcResponse>, RpcError> {
    let request: RpcRequest = serde_json::from_slice(&body)
        .map_err(|err| RpcError::invalid_argument(format!("malformed RPC request: {err}")))?;
    service.handle(request).await.map(Json)
}

/// `GET /healthz` -- transport-level health, independent of the service.
async fn healthz() -> &'static str {
    "ok"
}

impl RpcTransport for RpcServer {
    fn start(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let listener = self.listener.take()?;
            info!(addr = %self.local_addr(), "RPC transport listening");
            axum::serve(listener, router(self.service.clone()))
                .with_graceful_shutdown(self.shutdown.wait())
                .await?;
            info!(addr = %self.local_addr(), "RPC transport stopped");
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
