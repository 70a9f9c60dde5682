//! Cluster membership and replicated configuration state.
//!
//! The [`ConsensusLayer`] trait is the contract the lifecycle manager and
//! the RPC service consume. [`local::LocalConsensus`] is the in-process
//! implementation used by default; a replicated engine plugs in behind the
//! same trait through a custom `SubsystemFactory`.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::{IndexConfig, Metadata};

pub mod local;

/// State key under which the founding member stores the index configuration.
pub const INDEX_CONFIG_KEY: &str = "index_config";

/// Parameters the consensus layer is constructed with.
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    /// This node's identifier.
    pub id: String,
    /// This node's metadata.
    pub metadata: Metadata,
    /// Whether this node founds a new cluster.
    pub bootstrap: bool,
    /// Opaque index configuration.
    pub index_config: IndexConfig,
}

/// A cluster member as recorded in the membership state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Snapshot of the membership state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    /// Members keyed by node id.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeRecord>,
    /// Current leader, if one is known.
    #[serde(default)]
    pub leader: Option<String>,
}

/// Membership change notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    /// A node was added or its metadata replaced.
    NodeUpdated(NodeRecord),
    /// A node was removed.
    NodeRemoved { id: String },
}

/// Consensus layer contract.
///
/// `start` must not return until the layer can serve reads and writes (or
/// has failed); everything downstream assumes it is ready.
pub trait ConsensusLayer: Send + Sync + 'static {
    /// Start the layer and wait until it is ready.
    fn start(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Stop the layer. Idempotent.
    fn stop(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Whether the layer currently serves requests.
    fn is_ready(&self) -> bool;

    /// Look up a member.
    fn get_node(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<NodeRecord>>> + Send + '_>>;

    /// Add a member or replace its metadata.
    fn set_node(
        &self,
        node: NodeRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Remove a member. Returns whether it existed.
    fn delete_node(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Snapshot the membership.
    fn get_cluster(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<ClusterView>> + Send + '_>>;

    /// Read a configuration value.
    fn get_state(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Value>>> + Send + '_>>;

    /// Write a configuration value.
    fn set_state(
        &self,
        key: &str,
        value: Value,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Delete a configuration value. Returns whether it existed.
    fn delete_state(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Subscribe to membership changes.
    fn watch_cluster(&self) -> broadcast::Receiver<ClusterEvent>;
}
