//! Recording fakes for manager tests.
//!
//! Every factory and subsystem call appends an event such as
//! `construct:rpc_service`, `start:consensus_layer`, `stop:http_transport`,
//! `close:http_router`, `dial:10.0.0.1:5100`, `set_node:node-2` or
//! `close:client`, so tests can assert on exact ordering.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{Subsystem, SubsystemFactory};
use crate::cluster::{ClusterEvent, ClusterView, ConsensusLayer, ConsensusParams, NodeRecord};
use crate::config::Metadata;
use crate::errors::RpcError;
use crate::http::{AccessLogger, HttpRouter, HttpTransport};
use crate::rpc::{RpcClient, RpcRequest, RpcResponse, RpcService, RpcTransport};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failures to inject.
#[derive(Debug, Clone, Default)]
pub(crate) struct Faults {
    pub fail_construct: Option<Subsystem>,
    pub fail_start: Option<Subsystem>,
    /// Start never returns.
    pub hang_start: Option<Subsystem>,
    pub fail_stop: Vec<Subsystem>,
    pub fail_dial: bool,
    pub fail_set_node: bool,
    /// `SetNode` never returns.
    pub hang_set_node: bool,
    pub fail_close: bool,
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    consensus_params: Mutex<Vec<ConsensusParams>>,
    set_node_calls: Mutex<Vec<(String, Metadata)>>,
}

impl Recorder {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().expect("mutex poisoned").push(event.into());
    }
}

pub(crate) struct MockFactory {
    recorder: Arc<Recorder>,
    faults: Arc<Faults>,
}

impl MockFactory {
    pub fn new(faults: Faults) -> Arc<Self> {
        Arc::new(Self {
            recorder: Arc::new(Recorder::default()),
            faults: Arc::new(faults),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.recorder.events.lock().expect("mutex poisoned").clone()
    }

    /// Events starting with `prefix`, in order.
    pub fn events_with(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn consensus_params(&self) -> Vec<ConsensusParams> {
        self.recorder
            .consensus_params
            .lock()
            .expect("mutex poisoned")
            .clone()
    }

    pub fn set_node_calls(&self) -> Vec<(String, Metadata)> {
        self.recorder
            .set_node_calls
            .lock()
            .expect("mutex poisoned")
            .clone()
    }

    /// Wait until `event` has been recorded by a background task.
    pub async fn wait_for(&self, event: &str) {
        for _ in 0..200 {
            if self.events().iter().any(|e| e == event) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("event {event:?} never recorded; saw {:?}", self.events());
    }

    fn part(&self, subsystem: Subsystem) -> anyhow::Result<Arc<MockSubsystem>> {
        self.recorder
            .push(format!("construct:{}", subsystem.as_str()));
        if self.faults.fail_construct == Some(subsystem) {
            anyhow::bail!("{subsystem} construction refused");
        }
        Ok(Arc::new(MockSubsystem {
            subsystem,
            recorder: self.recorder.clone(),
            faults: self.faults.clone(),
        }))
    }
}

impl SubsystemFactory for MockFactory {
    fn consensus_layer(&self, params: ConsensusParams) -> anyhow::Result<Arc<dyn ConsensusLayer>> {
        self.recorder
            .consensus_params
            .lock()
            .expect("mutex poisoned")
            .push(params);
        Ok(self.part(Subsystem::ConsensusLayer)?)
    }

    fn rpc_service(
        &self,
        _consensus: Arc<dyn ConsensusLayer>,
    ) -> anyhow::Result<Arc<dyn RpcService>> {
        Ok(self.part(Subsystem::RpcService)?)
    }

    fn rpc_transport(
        &self,
        _listen_addr: &str,
        _service: Arc<dyn RpcService>,
    ) -> anyhow::Result<Arc<dyn RpcTransport>> {
        Ok(self.part(Subsystem::RpcTransport)?)
    }

    fn http_router(&self, rpc_addr: &str) -> anyhow::Result<Arc<dyn HttpRouter>> {
        self.recorder.push(format!("router_upstream:{rpc_addr}"));
        Ok(self.part(Subsystem::HttpRouter)?)
    }

    fn http_transport(
        &self,
        _listen_addr: &str,
        _router: Arc<dyn HttpRouter>,
        _access_log: AccessLogger,
    ) -> anyhow::Result<Arc<dyn HttpTransport>> {
        Ok(self.part(Subsystem::HttpTransport)?)
    }

    fn rpc_client(
        &self,
        peer_addr: &str,
        _timeout: Option<Duration>,
    ) -> anyhow::Result<Box<dyn RpcClient>> {
        self.recorder.push(format!("dial:{peer_addr}"));
        if self.faults.fail_dial {
            anyhow::bail!("connection refused");
        }
        Ok(Box::new(MockClient {
            recorder: self.recorder.clone(),
            faults: self.faults.clone(),
        }))
    }
}

/// Stand-in for any of the five subsystems.
struct MockSubsystem {
    subsystem: Subsystem,
    recorder: Arc<Recorder>,
    faults: Arc<Faults>,
}

impl MockSubsystem {
    fn start_call(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.recorder
                .push(format!("start:{}", self.subsystem.as_str()));
            if self.faults.hang_start == Some(self.subsystem) {
                std::future::pending::<()>().await;
            }
            if self.faults.fail_start == Some(self.subsystem) {
                anyhow::bail!("{} failed to start", self.subsystem);
            }
            Ok(())
        })
    }

    fn stop_call(&self, verb: &str) -> anyhow::Result<()> {
        self.recorder
            .push(format!("{verb}:{}", self.subsystem.as_str()));
        if self.faults.fail_stop.contains(&self.subsystem) {
            anyhow::bail!("{} refused to {verb}", self.subsystem);
        }
        Ok(())
    }

    fn addr(&self) -> SocketAddr {
        match self.subsystem {
            Subsystem::HttpTransport => SocketAddr::from(([127, 0, 0, 1], 8100)),
            _ => SocketAddr::from(([0, 0, 0, 0], 5100)),
        }
    }
}

impl ConsensusLayer for MockSubsystem {
    fn start(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.start_call()
    }

    fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { self.stop_call("stop") })
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn get_node(&self, _id: &str) -> BoxFuture<'_, anyhow::Result<Option<NodeRecord>>> {
        Box::pin(async { Ok(None) })
    }

    fn set_node(&self, _node: NodeRecord) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn delete_node(&self, _id: &str) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async { Ok(false) })
    }

    fn get_cluster(&self) -> BoxFuture<'_, anyhow::Result<ClusterView>> {
        Box::pin(async { Ok(ClusterView::default()) })
    }

    fn get_state(&self, _key: &str) -> BoxFuture<'_, anyhow::Result<Option<Value>>> {
        Box::pin(async { Ok(None) })
    }

    fn set_state(&self, _key: &str, _value: Value) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn delete_state(&self, _key: &str) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async { Ok(false) })
    }

    fn watch_cluster(&self) -> broadcast::Receiver<ClusterEvent> {
        broadcast::channel(1).1
    }
}

impl RpcService for MockSubsystem {
    fn start(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.start_call()
    }

    fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { self.stop_call("stop") })
    }

    fn handle(&self, _request: RpcRequest) -> BoxFuture<'_, Result<RpcResponse, RpcError>> {
        Box::pin(async { Ok(RpcResponse::Empty) })
    }
}

impl RpcTransport for MockSubsystem {
    fn start(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.start_call()
    }

    fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { self.stop_call("stop") })
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr()
    }
}

impl HttpRouter for MockSubsystem {
    fn routes(&self) -> Router {
        Router::new()
    }

    fn close(&self) -> anyhow::Result<()> {
        self.stop_call("close")
    }
}

impl HttpTransport for MockSubsystem {
    fn start(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.start_call()
    }

    fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { self.stop_call("stop") })
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr()
    }
}

struct MockClient {
    recorder: Arc<Recorder>,
    faults: Arc<Faults>,
}

impl RpcClient for MockClient {
    fn set_node(&self, id: &str, metadata: &Metadata) -> BoxFuture<'_, Result<(), RpcError>> {
        let id = id.to_string();
        let metadata = metadata.clone();
        Box::pin(async move {
            self.recorder.push(format!("set_node:{id}"));
            self.recorder
                .set_node_calls
                .lock()
                .expect("mutex poisoned")
                .push((id, metadata));
            if self.faults.hang_set_node {
                std::future::pending::<()>().await;
            }
            if self.faults.fail_set_node {
                return Err(RpcError::unavailable("cluster has no leader"));
            }
            Ok(())
        })
    }

    fn close(&self) -> anyhow::Result<()> {
        self.recorder.push("close:client");
        if self.faults.fail_close {
            anyhow::bail!("connection reset");
        }
        Ok(())
    }
}
