//! External HTTP surface of a node.
//!
//! [`router::GatewayRouter`] maps HTTP requests onto RPC calls against the
//! node's own RPC transport, and [`server::HttpServer`] is the listener
//! serving it together with `/metrics`.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use axum::Router;

pub mod access_log;
pub mod router;
pub mod server;

pub use access_log::AccessLogger;

/// HTTP router contract.
pub trait HttpRouter: Send + Sync + 'static {
    /// Routes to serve. May be called more than once.
    fn routes(&self) -> Router;

    /// Release the router's upstream connection. Requests arriving after
    /// this fail with 503.
    fn close(&self) -> anyhow::Result<()>;
}

/// HTTP transport contract: a listener serving an [`HttpRouter`].
pub trait HttpTransport: Send + Sync + 'static {
    /// Serve connections until `stop` is called.
    fn start(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Stop accepting connections and let `start` return.
    fn stop(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Address the transport is bound to.
    fn local_addr(&self) -> SocketAddr;
}
