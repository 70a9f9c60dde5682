//! RPC service backed by the consensus layer.
//!
//! Besides answering requests, a running service keeps an address book of
//! the cluster's RPC endpoints in step with the consensus layer's
//! membership events.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::{ProbeState, RpcRequest, RpcResponse, RpcService};
use crate::cluster::{ClusterEvent, ConsensusLayer, NodeRecord};
use crate::config::GRPC_ADDR_KEY;
use crate::errors::RpcError;
use crate::metrics;
use crate::net::Shutdown;

pub struct ClusterService {
    consensus: Arc<dyn ConsensusLayer>,
    /// Node id -> RPC address, as last seen in the membership.
    peers: RwLock<BTreeMap<String, String>>,
    running: AtomicBool,
    shutdown: Shutdown,
}

impl ClusterService {
    pub fn new(consensus: Arc<dyn ConsensusLayer>) -> anyhow::Result<Self> {
        Ok(Self {
            consensus,
            peers: RwLock::new(BTreeMap::new()),
            running: AtomicBool::new(false),
            shutdown: Shutdown::new(),
        })
    }

    /// Current address book: node id -> RPC address.
    pub fn peers(&self) -> BTreeMap<String, String> {
        self.peers.read().expect("rwlock poisoned").clone()
    }

    async fn dispatch(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        if !request.is_probe() && !self.consensus.is_ready() {
            return Err(RpcError::unavailable("consensus layer is not ready"));
        }

        match request {
            RpcRequest::LivenessProbe => Ok(RpcResponse::Probe(ProbeState::Alive)),
            RpcRequest::ReadinessProbe => Ok(RpcResponse::Probe(if self.consensus.is_ready() {
                ProbeState::Ready
            } else {
                ProbeState::NotReady
            })),
            RpcRequest::GetNode { id } => {
                require("node id", &id)?;
                self.consensus
                    .get_node(&id)
                    .await?
                    .map(RpcResponse::Node)
                    .ok_or_else(|| RpcError::not_found(format!("node {id:?} not found")))
            }
            RpcRequest::SetNode { id, metadata } => {
                require("node id", &id)?;
                info!(node_id = %id, "registering node");
                self.consensus.set_node(NodeRecord { id, metadata }).await?;
                Ok(RpcResponse::Empty)
            }
            RpcRequest::DeleteNode { id } => {
                require("node id", &id)?;
                if self.consensus.delete_node(&id).await? {
                    info!(node_id = %id, "removed node");
                    Ok(RpcResponse::Empty)
                } else {
                    Err(RpcError::not_found(format!("node {id:?} not found")))
                }
            }
            RpcRequest::GetCluster => Ok(RpcResponse::Cluster(self.consensus.get_cluster().await?)),
            RpcRequest::GetState { key } => {
                require("state key", &key)?;
                self.consensus
                    .get_state(&key)
                    .await?
                    .map(RpcResponse::State)
                    .ok_or_else(|| RpcError::not_found(format!("state key {key:?} not found")))
            }
            RpcRequest::SetState { key, value } => {
                require("state key", &key)?;
                self.consensus.set_state(&key, value).await?;
                Ok(RpcResponse::Empty)
            }
            RpcRequest::DeleteState { key } => {
                require("state key", &key)?;
                if self.consensus.delete_state(&key).await? {
                    Ok(RpcResponse::Empty)
                } else {
                    Err(RpcError::not_found(format!("state key {key:?} not found")))
                }
            }
        }
    }

    /// Rebuild the address book from a full membership snapshot.
    async fn resync(&self) {
        if !self.consensus.is_ready() {
            return;
        }
        match self.consensus.get_cluster().await {
            Ok(cluster) => {
                let peers: BTreeMap<String, String> = cluster
                    .nodes
                    .values()
                    .map(|node| (node.id.clone(), rpc_addr(node)))
                    .collect();
                metrics::set_cluster_members(peers.len());
                *self.peers.write().expect("rwlock poisoned") = peers;
            }
            Err(err) => warn!(error = %err, "failed to read cluster membership"),
        }
    }

    fn apply(&self, event: ClusterEvent) {
        let mut peers = self.peers.write().expect("rwlock poisoned");
        match event {
            ClusterEvent::NodeUpdated(node) => {
                let addr = rpc_addr(&node);
                match peers.insert(node.id.clone(), addr.clone()) {
                    None => info!(node_id = %node.id, rpc_addr = %addr, "node joined the cluster"),
                    Some(previous) if previous != addr => {
                        info!(node_id = %node.id, rpc_addr = %addr, "node address changed")
                    }
                    Some(_) => debug!(node_id = %node.id, "node metadata updated"),
                }
            }
            ClusterEvent::NodeRemoved { id } => {
                if peers.remove(&id).is_some() {
                    info!(node_id = %id, "node left the cluster");
                }
            }
        }
        metrics::set_cluster_members(peers.len());
    }
}

fn require(what: &str, value: &str) -> Result<(), RpcError> {
    if value.trim().is_empty() {
        Err(RpcError::invalid_argument(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}

fn rpc_addr(node: &NodeRecord) -> String {
    node.metadata
        .get(GRPC_ADDR_KEY)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

impl RpcService for ClusterService {
    fn start(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.running.swap(true, Ordering::SeqCst) {
                anyhow::bail!("RPC service already started");
            }

            // Subscribe before the snapshot so no change falls in between.
            let mut events = self.consensus.watch_cluster();
            self.resync().await;

            let stopped = self.shutdown.wait();
            tokio::pin!(stopped);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    event = events.recv() => match event {
                        Ok(event) => self.apply(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "membership watcher fell behind, resynchronizing");
                            self.resync().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            info!("RPC service stopped");
            Ok(())
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.shutdown.trigger();
            Ok(())
        })
    }

    fn handle(
        &self,
        request: RpcRequest,
    ) -> Pin<Box<dyn Future<Output = Result<RpcResponse, RpcError>> + Send + '_>> {
        Box::pin(async move {
            let method = request.method();
            let result = self.dispatch(request).await;
            match &result {
                Ok(_) => metrics::record_rpc(method, "ok"),
                Err(err) => {
                    debug!(method, error = %err, "RPC failed");
                    metrics::record_rpc(method, err.code());
                }
            }
            result
        })
    }
}
