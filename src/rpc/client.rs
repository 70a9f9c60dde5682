//! RPC client for talking to a node's RPC transport.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;

use super::{ProbeState, RpcClient, RpcRequest, RpcResponse};
use crate::cluster::{ClusterView, NodeRecord};
use crate::config::Metadata;
use crate::errors::{ErrorBody, RpcError};

/// JSON-over-HTTP RPC client.
///
/// Creating a client performs no I/O; the first request opens the
/// connection. Once closed, every call fails with `Unavailable`.
pub struct HttpRpcClient {
    addr: String,
    endpoint: String,
    http: reqwest::Client,
    closed: AtomicBool,
}

impl HttpRpcClient {
    /// Prepare a client for the node listening on `addr` (`host:port`, or a
    /// full `http://` base URL). `timeout` bounds every call.
    pub fn connect(addr: &str, timeout: Option<Duration>) -> Result<Self, RpcError> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(RpcError::invalid_argument("RPC address must not be empty"));
        }

        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };

        // Cluster traffic stays on the internal network: ignore proxy env vars.
        let mut builder = reqwest::Client::builder().no_proxy();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(transport_error)?;

        Ok(Self {
            addr: addr.to_string(),
            endpoint: format!("{base}/rpc"),
            http,
            closed: AtomicBool::new(false),
        })
    }

    /// Address this client was created for.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and decode the response envelope.
    pub async fn call(&self, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::unavailable(format!(
                "client for {} is closed",
                self.addr
            )));
        }

        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return response.json::<RpcResponse>().await.map_err(transport_error);
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        let body = serde_json::from_slice::<ErrorBody>(&bytes).unwrap_or_else(|_| ErrorBody {
            code: String::new(),
            message: String::from_utf8_lossy(&bytes).into_owned(),
            request_id: String::new(),
        });
        Err(RpcError::from_body(status, body))
    }

    pub async fn liveness(&self) -> Result<ProbeState, RpcError> {
        match self.call(&RpcRequest::LivenessProbe).await? {
            RpcResponse::Probe(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub async fn readiness(&self) -> Result<ProbeState, RpcError> {
        match self.call(&RpcRequest::ReadinessProbe).await? {
            RpcResponse::Probe(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_node(&self, id: &str) -> Result<NodeRecord, RpcError> {
        let request = RpcRequest::GetNode { id: id.to_string() };
        match self.call(&request).await? {
            RpcResponse::Node(node) => Ok(node),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_node(&self, id: &str, metadata: &Metadata) -> Result<(), RpcError> {
        let request = RpcRequest::SetNode {
            id: id.to_string(),
            metadata: metadata.clone(),
        };
        self.call(&request).await.map(drop)
    }

    pub async fn delete_node(&self, id: &str) -> Result<(), RpcError> {
        let request = RpcRequest::DeleteNode { id: id.to_string() };
        self.call(&request).await.map(drop)
    }

    pub async fn get_cluster(&self) -> Result<ClusterView, RpcError> {
        match self.call(&RpcRequest::GetCluster).await? {
            RpcResponse::Cluster(cluster) => Ok(cluster),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_state(&self, key: &str) -> Result<Value, RpcError> {
        let request = RpcRequest::GetState {
            key: key.to_string(),
        };
        match self.call(&request).await? {
            RpcResponse::State(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_state(&self, key: &str, value: Value) -> Result<(), RpcError> {
        let request = RpcRequest::SetState {
            key: key.to_string(),
            value,
        };
        self.call(&request).await.map(drop)
    }

    pub async fn delete_state(&self, key: &str) -> Result<(), RpcError> {
        let request = RpcRequest::DeleteState {
            key: key.to_string(),
        };
        self.call(&request).await.map(drop)
    }

    /// Close the client. Closing twice is an error.
    pub fn close(&self) -> Result<(), RpcError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(RpcError::unavailable(format!(
                "client for {} is already closed",
                self.addr
            )));
        }
        Ok(())
    }
}

impl RpcClient for HttpRpcClient {
    fn set_node(
        &self,
        id: &str,
        metadata: &Metadata,
    ) -> Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send + '_>> {
        let request = RpcRequest::SetNode {
            id: id.to_string(),
            metadata: metadata.clone(),
        };
        Box::pin(async move { self.call(&request).await.map(drop) })
    }

    fn close(&self) -> anyhow::Result<()> {
        HttpRpcClient::close(self).map_err(Into::into)
    }
}

fn transport_error(err: reqwest::Error) -> RpcError {
    if err.is_timeout() {
        RpcError::Timeout
    } else {
        RpcError::Transport {
            message: err.to_string(),
        }
    }
}

fn unexpected(response: RpcResponse) -> RpcError {
    RpcError::Transport {
        message: format!("unexpected RPC response: {response:?}"),
    }
}
