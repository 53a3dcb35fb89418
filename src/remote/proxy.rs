//! Local proxy listeners
//!
//! A [`ProxyServer`] is an ephemeral `127.0.0.1` TCP listener. Every accepted
//! socket asks its [`Forwarder`] for a stream to the remote side and relays
//! bytes in both directions until either end closes.
//!
//! ```text
//! local client ──► 127.0.0.1:<ephemeral> ──► forward() ──► remote 127.0.0.1:<port>
//! ```
//!
//! Lifecycle is driven by a [`CancellationToken`] derived from the owner's
//! token: cancelling it stops the accept loop and tears down every relay.
//! A failed forward closes only the socket that asked for it.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::TunnelError;
use crate::ssh::RelayStream;

/// Opens the remote half of a tunnel
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, originator: SocketAddr) -> Result<Box<dyn RelayStream>, TunnelError>;
}

/// A bound local listener and its relays
#[derive(Debug)]
pub struct ProxyServer {
    local_addr: SocketAddr,
    token: CancellationToken,
    sockets: watch::Receiver<usize>,
}

impl ProxyServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of local sockets currently relaying
    pub fn active_sockets(&self) -> usize {
        *self.sockets.borrow()
    }

    /// Watch the active socket count
    pub fn subscribe_sockets(&self) -> watch::Receiver<usize> {
        self.sockets.clone()
    }

    /// Token cancelled when the listener shuts down
    pub fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop accepting and drop all relays
    pub fn close(&self) {
        self.token.cancel();
    }
}

/// Decrements the socket count when a relay ends
struct SocketGuard(Arc<watch::Sender<usize>>);

impl SocketGuard {
    fn new(counter: Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Debug, Default, Clone)]
pub struct ProxyServerProvider;

impl ProxyServerProvider {
    pub fn new() -> Self {
        Self
    }

    /// Bind an ephemeral local listener that forwards through `forwarder`.
    ///
    /// The listener lives until `parent` (or the returned server) is cancelled.
    pub async fn get_proxy_server(
        &self,
        forwarder: Arc<dyn Forwarder>,
        parent: &CancellationToken,
    ) -> Result<ProxyServer, TunnelError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let token = parent.child_token();
        let (counter, sockets) = watch::channel(0usize);
        let counter = Arc::new(counter);

        info!("[proxy] Listening on {}", local_addr);

        let accept_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            let guard = SocketGuard::new(counter.clone());
                            let forwarder = forwarder.clone();
                            let relay_token = accept_token.child_token();
                            tokio::spawn(async move {
                                relay(socket, peer, forwarder, relay_token).await;
                                drop(guard);
                            });
                        }
                        Err(e) => {
                            warn!("[proxy] Accept on {} failed: {}", local_addr, e);
                        }
                    }
                }
            }
            debug!("[proxy] Listener {} closed", local_addr);
        });

        Ok(ProxyServer {
            local_addr,
            token,
            sockets,
        })
    }
}

async fn relay(
    mut socket: TcpStream,
    peer: SocketAddr,
    forwarder: Arc<dyn Forwarder>,
    token: CancellationToken,
) {
    let remote = tokio::select! {
        _ = token.cancelled() => return,
        remote = forwarder.forward(peer) => remote,
    };

    let mut remote = match remote {
        Ok(remote) => remote,
        Err(e) => {
            debug!("[proxy] Proxy message rejected for {}: {}", peer, e);
            return;
        }
    };

    tokio::select! {
        _ = token.cancelled() => {
            debug!("[proxy] Relay for {} cancelled", peer);
        }
        result = tokio::io::copy_bidirectional(&mut socket, &mut remote) => match result {
            Ok((up, down)) => debug!("[proxy] Relay for {} done ({} up, {} down)", peer, up, down),
            Err(e) => debug!("[proxy] Relay for {} ended: {}", peer, e),
        }
    }
}
