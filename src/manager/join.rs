//! Join handshake: register this node with an existing cluster member.
//!
//! One attempt, no retry. The client is closed exactly once after a
//! successful dial, on every exit path including cancellation.

use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use super::factory::SubsystemFactory;
use crate::config::Metadata;
use crate::errors::RpcError;
use crate::metrics;
use crate::rpc::RpcClient;

/// Closes the wrapped client when dropped.
struct ClientGuard<'a> {
    client: Box<dyn RpcClient>,
    peer_addr: &'a str,
}

impl Drop for ClientGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.client.close() {
            warn!(
                peer_addr = self.peer_addr,
                error = %format!("{err:#}"),
                "failed to close RPC client"
            );
        }
    }
}

pub(crate) async fn join_cluster(
    factory: &dyn SubsystemFactory,
    peer_addr: &str,
    id: &str,
    metadata: &Metadata,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    info!(peer_addr, node_id = id, "joining existing cluster");

    let client = match factory.rpc_client(peer_addr, timeout) {
        Ok(client) => client,
        Err(err) => {
            error!(peer_addr, error = %format!("{err:#}"), "failed to connect to cluster member");
            metrics::record_join("dial_error");
            return Err(err.context(format!("failed to connect to {peer_addr}")));
        }
    };
    let guard = ClientGuard { client, peer_addr };

    let call = guard.client.set_node(id, metadata);
    let result = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(RpcError::Timeout)),
        None => call.await,
    };
    drop(guard);

    match result {
        Ok(()) => {
            info!(peer_addr, node_id = id, "joined cluster");
            metrics::record_join("ok");
            Ok(())
        }
        Err(err) => {
            error!(peer_addr, node_id = id, error = %err, "cluster member rejected registration");
            metrics::record_join("error");
            Err(err).with_context(|| format!("SetNode({id}) on {peer_addr} failed"))
        }
    }
}
