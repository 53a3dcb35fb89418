//! Remote Service: connect, provision and tunnel
//!
//! ```text
//! connect(host, user)
//!   ├── establish_connection   (auth negotiation)
//!   ├── ConnectionRegistry::register
//!   ├── RemoteSetupService::setup  ──► remote port
//!   ├── primary proxy listener      (owned by the connection)
//!   └── id
//!
//! open_session(id, session)
//!   └── RemoteSessionService::get_or_create_proxy_session
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use super::connection::RemoteConnection;
use super::proxy::ProxyServerProvider;
use super::registry::ConnectionRegistry;
use super::session::{RemoteSession, RemoteSessionService};
use crate::config::{RemoteConfig, SshOptions};
use crate::error::RemoteError;
use crate::setup::{RemoteSetupService, StatusReport};
use crate::ssh::{establish_connection, ConnectTarget, Prompter, RemoteTransport};

pub struct RemoteService {
    registry: Arc<ConnectionRegistry>,
    sessions: RemoteSessionService,
    setup: RemoteSetupService,
    proxies: ProxyServerProvider,
    ssh: SshOptions,
    default_remote_port: u16,
    prompter: Arc<dyn Prompter>,
}

impl RemoteService {
    pub fn new(
        config: &RemoteConfig,
        setup: RemoteSetupService,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let proxies = ProxyServerProvider::new();
        let idle_timeout = Duration::from_secs(config.server.session_idle_timeout_secs);
        Self {
            sessions: RemoteSessionService::new(registry.clone(), proxies.clone())
                .with_idle_timeout(idle_timeout),
            registry,
            setup,
            proxies,
            ssh: config.ssh.clone(),
            default_remote_port: config.setup.default_remote_port,
            prompter,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &RemoteSessionService {
        &self.sessions
    }

    /// Connect to `host` (`[user@]host[:port]`), provision it and return
    /// the new connection id
    pub async fn connect(
        &self,
        host: &str,
        user: &str,
        report: &StatusReport,
    ) -> Result<String, RemoteError> {
        let target = ConnectTarget::parse(host, user, self.ssh.port)?;
        report("Connecting to remote system...");
        let transport = establish_connection(&target, &self.ssh, self.prompter.as_ref()).await?;
        self.attach(Arc::new(transport), report).await
    }

    /// Register an authenticated transport, provision its host and bind the
    /// connection's primary proxy listener.
    ///
    /// On failure the connection is torn down and unregistered.
    pub async fn attach(
        &self,
        transport: Arc<dyn RemoteTransport>,
        report: &StatusReport,
    ) -> Result<String, RemoteError> {
        let id = self.registry.new_connection_id();
        let connection = RemoteConnection::new(id.clone(), transport, self.default_remote_port);
        let registration = self.registry.register(connection.clone())?;

        match self.ready(&connection, report).await {
            Ok(()) => Ok(id),
            Err(e) => {
                error!("[remote] Setup of connection {} failed: {}", id, e);
                connection.dispose();
                registration.dispose();
                Err(e)
            }
        }
    }

    async fn ready(
        &self,
        connection: &Arc<RemoteConnection>,
        report: &StatusReport,
    ) -> Result<(), RemoteError> {
        let state = self.setup.setup(connection.transport().as_ref(), report).await?;
        connection.set_remote_port(state.port);

        let server = self
            .proxies
            .get_proxy_server(connection.forwarder(), &connection.disconnected())
            .await?;
        let local = server.local_addr();
        connection.attach_listener(server);
        info!(
            "[remote] Connection {} ready ({}, remote port {}, local {})",
            connection.id(),
            state.platform,
            state.port,
            local
        );
        Ok(())
    }

    /// Local address of the connection's primary proxy listener
    pub fn primary_address(&self, id: &str) -> Option<SocketAddr> {
        self.registry
            .get(id)
            .filter(|connection| !connection.is_disposed())
            .and_then(|connection| connection.primary_addr())
    }

    pub fn is_connection_alive(&self, id: &str) -> bool {
        self.registry
            .get(id)
            .is_some_and(|connection| !connection.is_disposed())
    }

    /// Tunnel for one client session over an existing connection
    pub async fn open_session(
        &self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<Arc<RemoteSession>, RemoteError> {
        Ok(self
            .sessions
            .get_or_create_proxy_session(connection_id, session_id)
            .await?)
    }

    /// Dispose every connection (and with them, every tunnel)
    pub fn shutdown(&self) {
        info!("[remote] Shutting down {} connections", self.registry.len());
        self.registry.dispose_all();
    }
}
