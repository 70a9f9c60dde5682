//! In-process consensus layer.
//!
//! Keeps membership and configuration state in memory behind an `RwLock`
//! and applies every write directly, as a single replica. There is no log,
//! no election and no persistence: the founding node simply considers
//! itself leader. Useful for single-node deployments and tests.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    ClusterEvent, ClusterView, ConsensusLayer, ConsensusParams, NodeRecord, INDEX_CONFIG_KEY,
};

/// Capacity of the membership event channel. Slow watchers that fall this
/// far behind resynchronize from a full snapshot.
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<String, NodeRecord>,
    state: BTreeMap<String, Value>,
    leader: Option<String>,
}

pub struct LocalConsensus {
    params: ConsensusParams,
    inner: RwLock<Inner>,
    started: AtomicBool,
    ready: AtomicBool,
    events: broadcast::Sender<ClusterEvent>,
}

impl LocalConsensus {
    pub fn new(params: ConsensusParams) -> anyhow::Result<Self> {
        if params.id.trim().is_empty() {
            anyhow::bail!("node id must not be empty");
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            params,
            inner: RwLock::new(Inner::default()),
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            events,
        })
    }

    fn ensure_ready(&self) -> anyhow::Result<()> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("consensus layer is not ready"))
        }
    }

    fn apply_set_node(&self, node: NodeRecord) {
        {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            inner.nodes.insert(node.id.clone(), node.clone());
        }
        debug!(node_id = %node.id, "membership updated");
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(ClusterEvent::NodeUpdated(node));
    }
}

impl ConsensusLayer for LocalConsensus {
    fn start(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.started.swap(true, Ordering::SeqCst) {
                anyhow::bail!("consensus layer already started");
            }

            if self.params.bootstrap {
                {
                    let mut inner = self.inner.write().expect("rwlock poisoned");
                    inner.leader = Some(self.params.id.clone());
                    inner.state.insert(
                        INDEX_CONFIG_KEY.to_string(),
                        Value::Object(self.params.index_config.clone()),
                    );
                }
                self.apply_set_node(NodeRecord {
                    id: self.params.id.clone(),
                    metadata: self.params.metadata.clone(),
                });
                info!(node_id = %self.params.id, "bootstrapped cluster membership");
            } else {
                info!(node_id = %self.params.id, "waiting to be registered by an existing member");
            }

            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.ready.swap(false, Ordering::SeqCst) {
                info!(node_id = %self.params.id, "consensus layer stopped");
            }
            Ok(())
        })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn get_node(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<NodeRecord>>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            self.ensure_ready()?;
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.nodes.get(&id).cloned())
        })
    }

    fn set_node(
        &self,
        node: NodeRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_ready()?;
            self.apply_set_node(node);
            Ok(())
        })
    }

    fn delete_node(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            self.ensure_ready()?;
            let existed = {
                let mut inner = self.inner.write().expect("rwlock poisoned");
                if inner.leader.as_deref() == Some(id.as_str()) {
                    inner.leader = None;
                }
                inner.nodes.remove(&id).is_some()
            };
            if existed {
                debug!(node_id = %id, "member removed");
                let _ = self.events.send(ClusterEvent::NodeRemoved { id });
            }
            Ok(existed)
        })
    }

    fn get_cluster(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ClusterView>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_ready()?;
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(ClusterView {
                nodes: inner.nodes.clone(),
                leader: inner.leader.clone(),
            })
        })
    }

    fn get_state(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Value>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.ensure_ready()?;
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.state.get(&key).cloned())
        })
    }

    fn set_state(
        &self,
        key: &str,
        value: Value,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.ensure_ready()?;
            let mut inner = self.inner.write().expect("rwlock poisoned");
            inner.state.insert(key, value);
            Ok(())
        })
    }

    fn delete_state(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.ensure_ready()?;
            let mut inner = self.inner.write().expect("rwlock poisoned");
            Ok(inner.state.remove(&key).is_some())
        })
    }

    fn watch_cluster(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}
