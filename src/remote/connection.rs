//! Remote connection: one authenticated transport plus everything it backs
//!
//! A connection owns its transport exclusively. Its lifecycle token is a child
//! of the transport's close token, so a dropped SSH session and an explicit
//! [`RemoteConnection::dispose`] both fire it exactly once. Listeners and
//! tunnels built on the connection derive their tokens from it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::TunnelError;
use super::proxy::{Forwarder, ProxyServer};
use crate::ssh::{RelayStream, RemoteTransport};

pub struct RemoteConnection {
    id: String,
    transport: Arc<dyn RemoteTransport>,
    /// Port of the launched remote backend, 0 until known
    remote_port: AtomicU16,
    default_port: u16,
    token: CancellationToken,
    listeners: Mutex<Vec<ProxyServer>>,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("id", &self.id)
            .field("remote_port", &self.remote_port())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl RemoteConnection {
    pub fn new(id: String, transport: Arc<dyn RemoteTransport>, default_port: u16) -> Arc<Self> {
        let token = transport.closed().child_token();
        Arc::new(Self {
            id,
            transport,
            remote_port: AtomicU16::new(0),
            default_port,
            token,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &Arc<dyn RemoteTransport> {
        &self.transport
    }

    /// Port tunnels are forwarded to
    pub fn remote_port(&self) -> u16 {
        match self.remote_port.load(Ordering::Acquire) {
            0 => self.default_port,
            port => port,
        }
    }

    pub fn set_remote_port(&self, port: u16) {
        self.remote_port.store(port, Ordering::Release);
        info!("[remote] Connection {} backend on remote port {}", self.id, port);
    }

    /// Token fired once when the connection goes away
    pub fn disconnected(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Hand a listener to the connection; it is closed on dispose
    pub fn attach_listener(&self, server: ProxyServer) {
        if self.is_disposed() {
            server.close();
            return;
        }
        self.listeners.lock().push(server);
    }

    /// Address of the first listener attached to this connection
    pub fn primary_addr(&self) -> Option<SocketAddr> {
        self.listeners.lock().first().map(|s| s.local_addr())
    }

    /// Open a forwarded channel to the remote backend port
    pub async fn forward_out(
        &self,
        originator: SocketAddr,
    ) -> Result<Box<dyn RelayStream>, TunnelError> {
        if self.is_disposed() {
            return Err(TunnelError::ConnectionClosed(self.id.clone()));
        }
        let port = self.remote_port();
        let stream = tokio::select! {
            _ = self.token.cancelled() => {
                return Err(TunnelError::ConnectionClosed(self.id.clone()));
            }
            stream = self.transport.forward_out(originator, port) => stream?,
        };
        Ok(stream)
    }

    /// Forwarder that does not keep the connection alive
    pub fn forwarder(self: &Arc<Self>) -> Arc<dyn Forwarder> {
        Arc::new(ConnectionForwarder {
            id: self.id.clone(),
            connection: Arc::downgrade(self),
        })
    }

    /// Close listeners and tunnels now; the transport shuts down in the background
    pub fn dispose(&self) {
        if self.token.is_cancelled() && self.listeners.lock().is_empty() {
            return;
        }
        self.token.cancel();
        for server in self.listeners.lock().drain(..) {
            server.close();
        }
        info!("[remote] Connection {} disposed", self.id);

        let transport = self.transport.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            transport.close().await;
            debug!("[remote] Transport for {} closed", id);
        });
    }
}

struct ConnectionForwarder {
    id: String,
    connection: Weak<RemoteConnection>,
}

#[async_trait]
impl Forwarder for ConnectionForwarder {
    async fn forward(&self, originator: SocketAddr) -> Result<Box<dyn RelayStream>, TunnelError> {
        match self.connection.upgrade() {
            Some(connection) => connection.forward_out(originator).await,
            None => Err(TunnelError::ConnectionClosed(self.id.clone())),
        }
    }
}
