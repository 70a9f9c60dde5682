//! Node lifecycle manager.
//!
//! A [`Manager`] owns the five subsystems of a node and sequences them:
//!
//! 1. consensus layer
//! 2. RPC service (backed by the consensus layer)
//! 3. RPC transport (serving the RPC service on `grpc_addr`)
//! 4. HTTP router (forwarding to the RPC transport)
//! 5. HTTP transport (serving the router on `http_addr`)
//!
//! `start` constructs them in that order, starts the consensus layer and
//! waits for it, then launches the other three starts as background tasks.
//! A node with a peer address then registers itself with that peer; a node
//! without one founds a new cluster. `stop` tears everything down in the
//! reverse order, attempting every step.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cluster::{ConsensusLayer, ConsensusParams};
use crate::config::{IndexConfig, LifecycleConfig, ListenAddrs, Metadata};
use crate::errors::{ManagerError, StopError, SubsystemFailure};
use crate::http::{AccessLogger, HttpRouter, HttpTransport};
use crate::metrics;
use crate::rpc::{RpcService, RpcTransport};

pub mod factory;
mod join;

#[cfg(test)]
mod testing;

pub use factory::{DefaultFactory, SubsystemFactory};

// -- Subsystems ---------------------------------------------------------------

/// The subsystems a manager owns, in construction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    ConsensusLayer,
    RpcService,
    RpcTransport,
    HttpRouter,
    HttpTransport,
}

impl Subsystem {
    /// Construction and start order. Teardown runs in reverse.
    pub const ALL: [Subsystem; 5] = [
        Subsystem::ConsensusLayer,
        Subsystem::RpcService,
        Subsystem::RpcTransport,
        Subsystem::HttpRouter,
        Subsystem::HttpTransport,
    ];

    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::ConsensusLayer => "consensus_layer",
            Subsystem::RpcService => "rpc_service",
            Subsystem::RpcTransport => "rpc_transport",
            Subsystem::HttpRouter => "http_router",
            Subsystem::HttpTransport => "http_transport",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Subsystem::ConsensusLayer => "consensus layer",
            Subsystem::RpcService => "RPC service",
            Subsystem::RpcTransport => "RPC transport",
            Subsystem::HttpRouter => "HTTP router",
            Subsystem::HttpTransport => "HTTP transport",
        })
    }
}

// -- Lifecycle ----------------------------------------------------------------

/// Where a manager is in its one-shot lifecycle.
///
/// `Created -> Starting -> Running -> Stopping -> Stopped`, with
/// `Starting -> Failed` when `start` aborts. A failed manager can still be
/// stopped to release whatever it constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        })
    }
}

/// How the node ended up relative to a cluster after `start`.
#[derive(Debug)]
pub enum JoinOutcome {
    /// No peer address: this node founded a new cluster.
    Bootstrapped,
    /// Registered with the cluster through `peer_addr`.
    Joined { peer_addr: String },
    /// The handshake failed. The node keeps running, unregistered.
    JoinFailed {
        peer_addr: String,
        error: anyhow::Error,
    },
}

/// A background start that returned an error.
#[derive(Debug)]
pub struct BackgroundFailure {
    pub subsystem: Subsystem,
    pub error: anyhow::Error,
}

/// Optional deadlines. `None` waits indefinitely.
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Bound on the `SetNode` call of the join handshake.
    pub join_timeout: Option<Duration>,
    /// Bound on the synchronous consensus layer start.
    pub consensus_start_timeout: Option<Duration>,
    /// How long `stop` waits for background start tasks before aborting them.
    pub stop_grace: Option<Duration>,
}

impl From<&LifecycleConfig> for ManagerOptions {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            join_timeout: config.join_timeout(),
            consensus_start_timeout: config.consensus_start_timeout(),
            stop_grace: config.stop_grace(),
        }
    }
}

// -- Manager ------------------------------------------------------------------

pub struct Manager {
    id: String,
    metadata: Metadata,
    peer_addr: String,
    index_config: IndexConfig,
    access_log: AccessLogger,
    options: ManagerOptions,
    factory: Arc<dyn SubsystemFactory>,
    state: LifecycleState,

    consensus: Option<Arc<dyn ConsensusLayer>>,
    rpc_service: Option<Arc<dyn RpcService>>,
    rpc_transport: Option<Arc<dyn RpcTransport>>,
    http_router: Option<Arc<dyn HttpRouter>>,
    http_transport: Option<Arc<dyn HttpTransport>>,

    background: Vec<(Subsystem, JoinHandle<()>)>,
    failures_tx: mpsc::UnboundedSender<BackgroundFailure>,
    failures_rx: Option<mpsc::UnboundedReceiver<BackgroundFailure>>,
}

impl Manager {
    /// Store the node's identity and configuration. Performs no I/O; the
    /// subsystems are built by [`Manager::start`].
    pub fn new(
        id: impl Into<String>,
        metadata: Metadata,
        peer_addr: impl Into<String>,
        index_config: IndexConfig,
        access_log: AccessLogger,
    ) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            id: id.into(),
            metadata,
            peer_addr: peer_addr.into(),
            index_config,
            access_log,
            options: ManagerOptions::default(),
            factory: Arc::new(DefaultFactory::default()),
            state: LifecycleState::Created,
            consensus: None,
            rpc_service: None,
            rpc_transport: None,
            http_router: None,
            http_transport: None,
            background: Vec::new(),
            failures_tx,
            failures_rx: Some(failures_rx),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn SubsystemFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// A node without a peer address founds a new cluster. Any non-empty
    /// address, even a blank one, means joining.
    pub fn is_bootstrap(&self) -> bool {
        self.peer_addr.is_empty()
    }

    /// Subsystems currently held, in construction order.
    pub fn constructed(&self) -> Vec<Subsystem> {
        let held = [
            self.consensus.is_some(),
            self.rpc_service.is_some(),
            self.rpc_transport.is_some(),
            self.http_router.is_some(),
            self.http_transport.is_some(),
        ];
        Subsystem::ALL
            .into_iter()
            .zip(held)
            .filter_map(|(subsystem, held)| held.then_some(subsystem))
            .collect()
    }

    /// Bound address of the RPC transport, once constructed.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_transport.as_ref().map(|t| t.local_addr())
    }

    /// Bound address of the HTTP transport, once constructed.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_transport.as_ref().map(|t| t.local_addr())
    }

    /// Failures reported by background starts. Can be taken once.
    pub fn take_background_failures(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<BackgroundFailure>> {
        self.failures_rx.take()
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[LifecycleState],
    ) -> Result<(), ManagerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ManagerError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    // -- Start ----------------------------------------------------------------

    /// Construct and start every subsystem, then join the cluster unless
    /// bootstrapping.
    ///
    /// Configuration, construction and consensus start errors abort the
    /// sequence and are returned; whatever was built before the failure
    /// stays held until [`Manager::stop`]. Background start failures and
    /// join failures do not fail `start`.
    pub async fn start(&mut self) -> Result<JoinOutcome, ManagerError> {
        self.expect_state("start", &[LifecycleState::Created])?;

        let addrs = match ListenAddrs::from_metadata(&self.metadata) {
            Ok(addrs) => addrs,
            Err(err) => {
                error!(node_id = %self.id, error = %err, "invalid node configuration");
                self.state = LifecycleState::Failed;
                return Err(err.into());
            }
        };

        self.state = LifecycleState::Starting;
        if let Err(err) = self.start_subsystems(&addrs).await {
            error!(node_id = %self.id, error = %err, "node start aborted");
            self.state = LifecycleState::Failed;
            return Err(err);
        }
        self.state = LifecycleState::Running;

        if self.is_bootstrap() {
            return Ok(JoinOutcome::Bootstrapped);
        }

        let peer_addr = self.peer_addr.clone();
        let outcome = match join::join_cluster(
            self.factory.as_ref(),
            &peer_addr,
            &self.id,
            &self.metadata,
            self.options.join_timeout,
        )
        .await
        {
            Ok(()) => JoinOutcome::Joined { peer_addr },
            Err(error) => JoinOutcome::JoinFailed { peer_addr, error },
        };
        Ok(outcome)
    }

    async fn start_subsystems(&mut self, addrs: &ListenAddrs) -> Result<(), ManagerError> {
        let bootstrap = self.is_bootstrap();
        if bootstrap {
            info!(node_id = %self.id, "no peer address, bootstrapping a new cluster");
        } else {
            info!(node_id = %self.id, peer_addr = %self.peer_addr, "joining an existing cluster");
        }

        let consensus = constructed(
            Subsystem::ConsensusLayer,
            self.factory.consensus_layer(ConsensusParams {
                id: self.id.clone(),
                metadata: self.metadata.clone(),
                bootstrap,
                index_config: self.index_config.clone(),
            }),
        )?;
        self.consensus = Some(consensus.clone());

        let rpc_service = constructed(
            Subsystem::RpcService,
            self.factory.rpc_service(consensus.clone()),
        )?;
        self.rpc_service = Some(rpc_service.clone());

        let rpc_transport = constructed(
            Subsystem::RpcTransport,
            self.factory.rpc_transport(&addrs.grpc_addr, rpc_service.clone()),
        )?;
        self.rpc_transport = Some(rpc_transport.clone());

        let rpc_addr = dial_addr(rpc_transport.local_addr()).to_string();
        let http_router = constructed(Subsystem::HttpRouter, self.factory.http_router(&rpc_addr))?;
        self.http_router = Some(http_router.clone());

        let http_transport = constructed(
            Subsystem::HttpTransport,
            self.factory.http_transport(&addrs.http_addr, http_router, self.access_log.clone()),
        )?;
        self.http_transport = Some(http_transport.clone());

        self.start_consensus(consensus.as_ref()).await?;

        self.spawn_start(Subsystem::RpcService, async move {
            rpc_service.start().await
        });
        self.spawn_start(Subsystem::RpcTransport, async move {
            rpc_transport.start().await
        });
        self.spawn_start(Subsystem::HttpTransport, async move {
            http_transport.start().await
        });
        Ok(())
    }

    async fn start_consensus(&self, consensus: &dyn ConsensusLayer) -> Result<(), ManagerError> {
        let subsystem = Subsystem::ConsensusLayer;
        let result = match self.options.consensus_start_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, consensus.start()).await {
                Ok(result) => result.map_err(|source| ManagerError::Start { subsystem, source }),
                Err(_) => Err(ManagerError::StartTimeout { subsystem, timeout }),
            },
            None => consensus
                .start()
                .await
                .map_err(|source| ManagerError::Start { subsystem, source }),
        };
        metrics::record_start(subsystem, &result);
        if result.is_ok() {
            info!("consensus layer started");
        }
        result
    }

    /// Launch a subsystem's start as a detached task. Failures are logged
    /// and forwarded on the background failure channel.
    fn spawn_start<F>(&mut self, subsystem: Subsystem, start: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let failures = self.failures_tx.clone();
        let handle = tokio::spawn(async move {
            let result = start.await;
            metrics::record_start(subsystem, &result);
            if let Err(error) = result {
                if subsystem == Subsystem::HttpTransport {
                    error!("HTTP transport failed");
                } else {
                    error!(%subsystem, error = %format!("{error:#}"), "subsystem failed");
                }
                // The receiver may have been dropped; the log line stands.
                let _ = failures.send(BackgroundFailure { subsystem, error });
            }
        });
        self.background.push((subsystem, handle));
    }

    // -- Stop -----------------------------------------------------------------

    /// Tear down every held subsystem in reverse construction order.
    ///
    /// Every step is attempted regardless of earlier failures; all failures
    /// are returned together as [`ManagerError::Stop`].
    pub async fn stop(&mut self) -> Result<(), ManagerError> {
        self.expect_state("stop", &[LifecycleState::Running, LifecycleState::Failed])?;
        self.state = LifecycleState::Stopping;
        info!(node_id = %self.id, "stopping node");

        let mut failures = Vec::new();
        if let Some(transport) = self.http_transport.take() {
            let result = transport.stop().await;
            record_stop(&mut failures, Subsystem::HttpTransport, result);
        }
        if let Some(router) = self.http_router.take() {
            let result = router.close();
            record_stop(&mut failures, Subsystem::HttpRouter, result);
        }
        if let Some(transport) = self.rpc_transport.take() {
            let result = transport.stop().await;
            record_stop(&mut failures, Subsystem::RpcTransport, result);
        }
        if let Some(service) = self.rpc_service.take() {
            let result = service.stop().await;
            record_stop(&mut failures, Subsystem::RpcService, result);
        }
        if let Some(consensus) = self.consensus.take() {
            let result = consensus.stop().await;
            record_stop(&mut failures, Subsystem::ConsensusLayer, result);
        }

        self.drain_background().await;
        self.state = LifecycleState::Stopped;

        if failures.is_empty() {
            info!(node_id = %self.id, "node stopped");
            Ok(())
        } else {
            Err(StopError { failures }.into())
        }
    }

    /// Wait for background start tasks to return, aborting those still
    /// running once the grace period is over.
    async fn drain_background(&mut self) {
        let deadline = self
            .options
            .stop_grace
            .map(|grace| tokio::time::Instant::now() + grace);

        for (subsystem, mut handle) in self.background.drain(..) {
            let joined = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, &mut handle).await,
                None => Ok((&mut handle).await),
            };
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%subsystem, error = %err, "background start task panicked"),
                Err(_) => {
                    warn!(%subsystem, "background start task still running, aborting");
                    handle.abort();
                }
            }
        }
    }
}

fn constructed<T>(subsystem: Subsystem, result: anyhow::Result<T>) -> Result<T, ManagerError> {
    match result {
        Ok(value) => {
            info!(%subsystem, "constructed");
            Ok(value)
        }
        Err(source) => Err(ManagerError::Construct { subsystem, source }),
    }
}

fn record_stop(
    failures: &mut Vec<SubsystemFailure>,
    subsystem: Subsystem,
    result: anyhow::Result<()>,
) {
    metrics::record_stop(subsystem, &result);
    match result {
        Ok(()) => info!(%subsystem, "stopped"),
        Err(error) => {
            error!(%subsystem, error = %format!("{error:#}"), "failed to stop");
            failures.push(SubsystemFailure { subsystem, error });
        }
    }
}

/// Address to reach a listener at. Wildcard binds are dialed on loopback.
fn dial_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
