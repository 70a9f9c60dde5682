//! HTTP gateway: a JSON API over the node's own RPC surface.
//!
//! | Method   | Path            | RPC            |
//! |----------|-----------------|----------------|
//! | `GET`    | `/liveness`     | liveness probe |
//! | `GET`    | `/readiness`    | readiness probe|
//! | `GET`    | `/cluster`      | get cluster    |
//! | `GET`    | `/cluster/:id`  | get node       |
//! | `PUT`    | `/cluster/:id`  | set node       |
//! | `DELETE` | `/cluster/:id`  | delete node    |
//! | `GET`    | `/state/*key`   | get state      |
//! | `PUT`    | `/state/*key`   | set state      |
//! | `DELETE` | `/state/*key`   | delete state   |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::HttpRouter;
use crate::config::Metadata;
use crate::errors::RpcError;
use crate::rpc::client::HttpRpcClient;
use crate::rpc::ProbeState;

/// Shared state behind every gateway handler.
struct GatewayState {
    client: HttpRpcClient,
    closed: AtomicBool,
}

impl GatewayState {
    fn client(&self) -> Result<&HttpRpcClient, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RpcError::unavailable("HTTP router is closed"))
        } else {
            Ok(&self.client)
        }
    }
}

type AppState = Arc<GatewayState>;

/// Routes HTTP requests to the RPC transport at `rpc_addr`.
pub struct GatewayRouter {
    state: AppState,
}

impl GatewayRouter {
    pub fn new(rpc_addr: &str, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let client = HttpRpcClient::connect(rpc_addr, timeout)?;
        Ok(Self {
            state: Arc::new(GatewayState {
                client,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl HttpRouter for GatewayRouter {
    fn routes(&self) -> Router {
        Router::new()
            .route("/liveness", get(liveness))
            .route("/readiness", get(readiness))
            .route("/cluster", get(get_cluster))
            .route(
                "/cluster/:id",
                get(get_node).put(set_node).delete(delete_node),
            )
            .route(
                "/state/*key",
                get(get_state).put(set_state).delete(delete_state),
            )
            .with_state(self.state.clone())
    }

    fn close(&self) -> anyhow::Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            anyhow::bail!("HTTP router already closed");
        }
        self.state.client.close()?;
        Ok(())
    }
}

// -- Handlers -----------------------------------------------------------------

async fn liveness(State(state): State<AppState>) -> Result<Response, RpcError> {
    let probe = state.client()?.liveness().await?;
    Ok(probe_response(probe))
}

async fn readiness(State(state): State<AppState>) -> Result<Response, RpcError> {
    let probe = state.client()?.readiness().await?;
    Ok(probe_response(probe))
}

fn probe_response(probe: ProbeState) -> Response {
    let status = match probe {
        ProbeState::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        ProbeState::Alive | ProbeState::Ready => StatusCode::OK,
    };
    (status, Json(json!({ "state": probe }))).into_response()
}

async fn get_cluster(State(state): State<AppState>) -> Result<Response, RpcError> {
    let cluster = state.client()?.get_cluster().await?;
    Ok(Json(cluster).into_response())
}

async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, RpcError> {
    let node = state.client()?.get_node(&id).await?;
    Ok(Json(node).into_response())
}

/// `PUT /cluster/:id` -- the body is the node's metadata object.
async fn set_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, RpcError> {
    let client = state.client()?;
    let metadata = match parse_json(&body)? {
        Value::Object(map) => map,
        Value::Null => Metadata::new(),
        _ => {
            return Err(RpcError::invalid_argument(
                "node metadata must be a JSON object",
            ))
        }
    };
    client.set_node(&id, &metadata).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, RpcError> {
    state.client()?.delete_node(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn get_state(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, RpcError> {
    let value = state.client()?.get_state(&key).await?;
    Ok(Json(value).into_response())
}

async fn set_state(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Response, RpcError> {
    let client = state.client()?;
    let value = parse_json(&body)?;
    client.set_state(&key, value).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn delete_state(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, RpcError> {
    state.client()?.delete_state(&key).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// An empty body reads as `null`.
fn parse_json(body: &[u8]) -> Result<Value, RpcError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|err| RpcError::invalid_argument(format!("malformed JSON body: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::local::LocalConsensus;
    use crate::cluster::{ConsensusLayer, ConsensusParams};
    use crate::rpc::server::RpcServer;
    use crate::rpc::service::ClusterService;
    use crate::rpc::RpcTransport;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    /// A bootstrapped node's RPC transport, served in the background.
    async fn rpc_backend() -> Arc<RpcServer> {
        let mut metadata = Metadata::new();
        metadata.insert("grpc_addr".to_string(), json!("127.0.0.1:0"));
        let consensus = Arc::new(
            LocalConsensus::new(ConsensusParams {
                id: "node-1".to_string(),
                metadata,
                bootstrap: true,
                index_config: Metadata::new(),
            })
            .unwrap(),
        );
        consensus.start().await.unwrap();
        let service = Arc::new(ClusterService::new(consensus).unwrap());
        let server = Arc::new(RpcServer::new("127.0.0.1:0", service).unwrap());
        let runner = server.clone();
        tokio::spawn(async move { runner.start().await });
        server
    }

    async fn send(router: &GatewayRouter, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.routes().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn put(uri: &str, body: &str) -> Request<Body> {
        Request::put(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn delete(uri: &str) -> Request<Body> {
        Request::delete(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_probes() {
        let backend = rpc_backend().await;
        let router =
            GatewayRouter::new(&backend.local_addr().to_string(), Some(Duration::from_secs(5)))
                .unwrap();

        let (status, body) = send(&router, get("/liveness")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("alive"));

        let (status, body) = send(&router, get("/readiness")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("ready"));

        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_node_crud() {
        let backend = rpc_backend().await;
        let router =
            GatewayRouter::new(&backend.local_addr().to_string(), Some(Duration::from_secs(5)))
                .unwrap();

        let (status, _) = send(
            &router,
            put("/cluster/node-2", r#"{"grpc_addr":"10.0.0.2:5100"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&router, get("/cluster/node-2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["metadata"]["grpc_addr"], json!("10.0.0.2:5100"));

        let (status, body) = send(&router, get("/cluster")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["nodes"].get("node-1").is_some());
        assert!(body["nodes"].get("node-2").is_some());
        assert_eq!(body["leader"], json!("node-1"));

        let (status, _) = send(&router, delete("/cluster/node-2")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&router, get("/cluster/node-2")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("NotFound"));

        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_node_metadata_must_be_object() {
        let backend = rpc_backend().await;
        let router =
            GatewayRouter::new(&backend.local_addr().to_string(), Some(Duration::from_secs(5)))
                .unwrap();

        let (status, body) = send(&router, put("/cluster/node-2", "[1, 2]")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("InvalidArgument"));

        let (status, _) = send(&router, put("/cluster/node-2", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_with_nested_key() {
        let backend = rpc_backend().await;
        let router =
            GatewayRouter::new(&backend.local_addr().to_string(), Some(Duration::from_secs(5)))
                .unwrap();

        let (status, _) = send(
            &router,
            put("/state/indexes/books", r#"{"shards": 3}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&router, get("/state/indexes/books")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"shards": 3}));

        let (status, _) = send(&router, delete("/state/indexes/books")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&router, get("/state/indexes/books")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_router_is_unavailable() {
        let router = GatewayRouter::new("127.0.0.1:1", None).unwrap();
        router.close().unwrap();

        let (status, body) = send(&router, get("/cluster")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], json!("Unavailable"));

        assert!(router.close().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let router =
            GatewayRouter::new(&format!("127.0.0.1:{port}"), Some(Duration::from_secs(2)))
                .unwrap();

        let (status, _) = send(&router, get("/cluster")).await;
        assert!(
            status == StatusCode::BAD_GATEWAY || status == StatusCode::GATEWAY_TIMEOUT,
            "unexpected status {status}"
        );
    }
}
