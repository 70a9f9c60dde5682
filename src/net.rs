//! Listener and shutdown plumbing shared by the RPC and HTTP transports.
//!
//! Both transports bind their socket when they are constructed, so an
//! address already in use surfaces as a construction error, and serve it
//! later from `start` until a shutdown flag flips.

use std::net::SocketAddr;
use std::sync::Mutex;

use anyhow::Context;
use tokio::sync::watch;

/// Bind a non-blocking TCP listener on `addr`.
pub fn bind(addr: &str) -> anyhow::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("failed to bind listener on {addr}"))?;
    listener
        .set_nonblocking(true)
        .with_context(|| format!("failed to make listener on {addr} non-blocking"))?;
    Ok(listener)
}

/// A listener bound at construction time and handed over exactly once to
/// the serving task.
pub struct BoundListener {
    local_addr: SocketAddr,
    listener: Mutex<Option<std::net::TcpListener>>,
}

impl BoundListener {
    pub fn bind(addr: &str) -> anyhow::Result<Self> {
        let listener = bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Convert the bound socket into a tokio listener. Fails on the second
    /// call: a transport serves its socket once.
    pub fn take(&self) -> anyhow::Result<tokio::net::TcpListener> {
        let listener = self
            .listener
            .lock()
            .expect("mutex poisoned")
            .take()
            .ok_or_else(|| anyhow::anyhow!("listener on {} already served", self.local_addr))?;
        Ok(tokio::net::TcpListener::from_std(listener)?)
    }
}

/// One-shot shutdown flag. `trigger` may be called before or after the
/// serving task starts waiting.
pub struct Shutdown {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Future that resolves once `trigger` has been called.
    pub fn wait(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
