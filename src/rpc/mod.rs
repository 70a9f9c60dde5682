//! Internal RPC surface of a node.
//!
//! Requests and responses travel as a small JSON envelope over HTTP:
//! `POST /rpc` with an [`RpcRequest`] body answers an [`RpcResponse`], or an
//! [`ErrorBody`](crate::errors::ErrorBody) with a non-2xx status.
//!
//! - [`service::ClusterService`] executes requests against the consensus layer.
//! - [`server::RpcServer`] is the transport listening for them.
//! - [`client::HttpRpcClient`] calls a remote node, and is what a joining
//!   node uses to register itself.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::{ClusterView, NodeRecord};
use crate::config::Metadata;
use crate::errors::RpcError;

pub mod client;
pub mod server;
pub mod service;

/// A cluster RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    LivenessProbe,
    ReadinessProbe,
    GetNode {
        id: String,
    },
    SetNode {
        id: String,
        #[serde(default)]
        metadata: Metadata,
    },
    DeleteNode {
        id: String,
    },
    GetCluster,
    GetState {
        key: String,
    },
    SetState {
        key: String,
        value: Value,
    },
    DeleteState {
        key: String,
    },
}

impl RpcRequest {
    /// Method name, used for logging and metric labels.
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::LivenessProbe => "liveness_probe",
            RpcRequest::ReadinessProbe => "readiness_probe",
            RpcRequest::GetNode { .. } => "get_node",
            RpcRequest::SetNode { .. } => "set_node",
            RpcRequest::DeleteNode { .. } => "delete_node",
            RpcRequest::GetCluster => "get_cluster",
            RpcRequest::GetState { .. } => "get_state",
            RpcRequest::SetState { .. } => "set_state",
            RpcRequest::DeleteState { .. } => "delete_state",
        }
    }

    /// Probes are answered even when the consensus layer is not ready.
    pub fn is_probe(&self) -> bool {
        matches!(
            self,
            RpcRequest::LivenessProbe | RpcRequest::ReadinessProbe
        )
    }
}

/// Result of a liveness or readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
    Alive,
    Ready,
    NotReady,
}

/// Successful RPC result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum RpcResponse {
    Probe(ProbeState),
    Node(NodeRecord),
    Cluster(ClusterView),
    State(Value),
    Empty,
}

/// RPC service contract: executes requests, and runs whatever background
/// work it needs between `start` and `stop`.
pub trait RpcService: Send + Sync + 'static {
    /// Run background work until `stop` is called.
    fn start(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Ask `start` to return.
    fn stop(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Execute a single request.
    fn handle(
        &self,
        request: RpcRequest,
    ) -> Pin<Box<dyn Future<Output = Result<RpcResponse, RpcError>> + Send + '_>>;
}

/// RPC transport contract: a listener dispatching requests to an
/// [`RpcService`].
pub trait RpcTransport: Send + Sync + 'static {
    /// Serve connections until `stop` is called.
    fn start(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Stop accepting connections and let `start` return.
    fn stop(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Address the transport is bound to.
    fn local_addr(&self) -> SocketAddr;
}

/// The slice of a remote node's RPC surface the join handshake needs.
pub trait RpcClient: Send + Sync {
    /// Register (or re-register) a node with the remote cluster.
    fn set_node(
        &self,
        id: &str,
        metadata: &Metadata,
    ) -> Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send + '_>>;

    /// Release the connection.
    fn close(&self) -> anyhow::Result<()>;
}
