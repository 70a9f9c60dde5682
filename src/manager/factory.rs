//! Constructors for the subsystems a [`Manager`](super::Manager) owns.

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::local::LocalConsensus;
use crate::cluster::{ConsensusLayer, ConsensusParams};
use crate::http::router::GatewayRouter;
use crate::http::server::HttpServer;
use crate::http::{AccessLogger, HttpRouter, HttpTransport};
use crate::rpc::client::HttpRpcClient;
use crate::rpc::server::RpcServer;
use crate::rpc::service::ClusterService;
use crate::rpc::{RpcClient, RpcService, RpcTransport};

/// Builds the subsystems of a node, one constructor per collaborator.
///
/// Constructors may bind sockets but must not start serving; the manager
/// decides when each subsystem starts.
pub trait SubsystemFactory: Send + Sync + 'static {
    fn consensus_layer(&self, params: ConsensusParams) -> anyhow::Result<Arc<dyn ConsensusLayer>>;

    fn rpc_service(
        &self,
        consensus: Arc<dyn ConsensusLayer>,
    ) -> anyhow::Result<Arc<dyn RpcService>>;

    fn rpc_transport(
        &self,
        listen_addr: &str,
        service: Arc<dyn RpcService>,
    ) -> anyhow::Result<Arc<dyn RpcTransport>>;

    /// `rpc_addr` is the address the RPC transport actually bound.
    fn http_router(&self, rpc_addr: &str) -> anyhow::Result<Arc<dyn HttpRouter>>;

    fn http_transport(
        &self,
        listen_addr: &str,
        router: Arc<dyn HttpRouter>,
        access_log: AccessLogger,
    ) -> anyhow::Result<Arc<dyn HttpTransport>>;

    /// Client used once by the join handshake.
    fn rpc_client(
        &self,
        peer_addr: &str,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Box<dyn RpcClient>>;
}

/// Factory producing the in-crate implementations.
#[derive(Debug, Clone, Default)]
pub struct DefaultFactory {
    /// Per-call deadline for the HTTP router's upstream RPC client.
    pub router_timeout: Option<Duration>,
}

impl SubsystemFactory for DefaultFactory {
    fn consensus_layer(&self, params: ConsensusParams) -> anyhow::Result<Arc<dyn ConsensusLayer>> {
        Ok(Arc::new(LocalConsensus::new(params)?))
    }

    fn rpc_service(
        &self,
        consensus: Arc<dyn ConsensusLayer>,
    ) -> anyhow::Result<Arc<dyn RpcService>> {
        Ok(Arc::new(ClusterService::new(consensus)?))
    }

    fn rpc_transport(
        &self,
        listen_addr: &str,
        service: Arc<dyn RpcService>,
    ) -> anyhow::Result<Arc<dyn RpcTransport>> {
        Ok(Arc::new(RpcServer::new(listen_addr, service)?))
    }

    fn http_router(&self, rpc_addr: &str) -> anyhow::Result<Arc<dyn HttpRouter>> {
        Ok(Arc::new(GatewayRouter::new(rpc_addr, self.router_timeout)?))
    }

    fn http_transport(
        &self,
        listen_addr: &str,
        router: Arc<dyn HttpRouter>,
        access_log: AccessLogger,
    ) -> anyhow::Result<Arc<dyn HttpTransport>> {
        Ok(Arc::new(HttpServer::new(listen_addr, router, access_log)?))
    }

    fn rpc_client(
        &self,
        peer_addr: &str,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Box<dyn RpcClient>> {
        Ok(Box::new(HttpRpcClient::connect(peer_addr, timeout)?))
    }
}
