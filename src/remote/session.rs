//! Session Multiplexer
//!
//! Maps `(connection id, session id)` to a reusable tunnel. The first request
//! for a key binds a new [`ProxyServer`] on the owning connection; later
//! requests get the same [`RemoteSession`] back.
//!
//! A session is removed when:
//! - its last subscriber socket disconnects (count drops from >0 to 0),
//! - no subscriber shows up within the idle timeout, or
//! - the owning connection disconnects, which also closes the listener.
//!
//! First creation is serialized per key; unrelated keys bind concurrently.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::connection::RemoteConnection;
use super::error::TunnelError;
use super::proxy::{ProxyServer, ProxyServerProvider};
use super::registry::ConnectionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub connection_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(connection_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            session_id: session_id.into(),
        }
    }
}

/// One multiplexed tunnel
#[derive(Debug)]
pub struct RemoteSession {
    key: SessionKey,
    server: ProxyServer,
    connection: Weak<RemoteConnection>,
}

impl RemoteSession {
    pub fn id(&self) -> &str {
        &self.key.session_id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn subscribers(&self) -> usize {
        self.server.active_sockets()
    }

    /// The owning connection, while it is alive
    pub fn connection(&self) -> Option<Arc<RemoteConnection>> {
        self.connection.upgrade().filter(|c| !c.is_disposed())
    }

    pub fn is_disposed(&self) -> bool {
        self.server.is_closed()
    }

    pub fn dispose(&self) {
        self.server.close();
    }
}

type SessionMap = Arc<DashMap<SessionKey, Arc<RemoteSession>>>;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RemoteSessionService {
    registry: Arc<ConnectionRegistry>,
    provider: ProxyServerProvider,
    sessions: SessionMap,
    /// Per-key creation locks, present only while a creation is in flight
    creating: DashMap<SessionKey, Arc<Mutex<()>>>,
    idle_timeout: Duration,
}

impl RemoteSessionService {
    pub fn new(registry: Arc<ConnectionRegistry>, provider: ProxyServerProvider) -> Self {
        Self {
            registry,
            provider,
            sessions: Arc::new(DashMap::new()),
            creating: DashMap::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Close tunnels that see no subscriber within `timeout`
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn live(&self, key: &SessionKey) -> Option<Arc<RemoteSession>> {
        self.sessions
            .get(key)
            .map(|s| s.value().clone())
            .filter(|s| !s.is_disposed())
    }

    pub async fn get_or_create_proxy_session(
        &self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<Arc<RemoteSession>, TunnelError> {
        let key = SessionKey::new(connection_id, session_id);
        if let Some(session) = self.live(&key) {
            return Ok(session);
        }

        let lock = self.creating.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            match self.live(&key) {
                Some(session) => Ok(session),
                None => self.create(key.clone()).await,
            }
        };
        // map + this handle: nobody else is waiting on the lock
        self.creating.remove_if(&key, |_, current| {
            Arc::ptr_eq(current, &lock) && Arc::strong_count(current) == 2
        });
        result
    }

    async fn create(&self, key: SessionKey) -> Result<Arc<RemoteSession>, TunnelError> {
        let connection_id = key.connection_id.as_str();
        let connection = self
            .registry
            .get(connection_id)
            .ok_or_else(|| TunnelError::ConnectionNotFound(connection_id.to_string()))?;
        if connection.is_disposed() {
            return Err(TunnelError::ConnectionClosed(connection_id.to_string()));
        }

        let server = self
            .provider
            .get_proxy_server(connection.forwarder(), &connection.disconnected())
            .await?;
        let session = Arc::new(RemoteSession {
            key: key.clone(),
            server,
            connection: Arc::downgrade(&connection),
        });
        self.sessions.insert(key.clone(), session.clone());
        info!(
            "[session] Session {}/{} on port {}",
            key.connection_id,
            key.session_id,
            session.port()
        );

        self.watch(session.clone());
        Ok(session)
    }

    /// Remove the session once its subscribers are gone or its listener closes
    fn watch(&self, session: Arc<RemoteSession>) {
        let sessions = self.sessions.clone();
        let closed = session.server.closed();
        let mut sockets = session.server.subscribe_sockets();
        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::spawn(async move {
            tokio::pin!(idle);
            let mut had_subscribers = false;
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = &mut idle, if !had_subscribers => {
                        debug!(
                            "[session] Session {}/{} idle, closing",
                            session.key.connection_id, session.key.session_id
                        );
                        break;
                    }
                    changed = sockets.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let count = *sockets.borrow_and_update();
                        if count > 0 {
                            had_subscribers = true;
                        } else if had_subscribers {
                            break;
                        }
                    }
                }
            }
            session.dispose();
            if sessions
                .remove_if(&session.key, |_, current| Arc::ptr_eq(current, &session))
                .is_some()
            {
                debug!(
                    "[session] Session {}/{} removed",
                    session.key.connection_id, session.key.session_id
                );
            }
        });
    }

    pub fn get(&self, connection_id: &str, session_id: &str) -> Option<Arc<RemoteSession>> {
        self.live(&SessionKey::new(connection_id, session_id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_echo_server, MockTransport};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Fixture {
        transport: Arc<MockTransport>,
        connection: Arc<RemoteConnection>,
        service: Arc<RemoteSessionService>,
        _registration: crate::remote::registry::Registration,
    }

    async fn fixture() -> Fixture {
        fixture_with_idle(Duration::from_secs(60)).await
    }

    async fn fixture_with_idle(idle: Duration) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let transport = Arc::new(MockTransport::new());
        transport.forward_to(spawn_echo_server().await);
        let connection = RemoteConnection::new("conn".into(), transport.clone(), 3000);
        let registration = registry.register(connection.clone()).unwrap();
        let service = Arc::new(
            RemoteSessionService::new(registry, ProxyServerProvider::new())
                .with_idle_timeout(idle),
        );
        Fixture {
            transport,
            connection,
            service,
            _registration: registration,
        }
    }

    async fn wait_until(f: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_same_key_reuses_tunnel() {
        let f = fixture().await;
        let a = f.service.get_or_create_proxy_session("conn", "s1").await.unwrap();
        let b = f.service.get_or_create_proxy_session("conn", "s1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.port(), b.port());

        let other = f.service.get_or_create_proxy_session("conn", "s2").await.unwrap();
        assert_ne!(other.port(), a.port());
        assert_eq!(f.service.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_share_tunnel() {
        let f = fixture().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = f.service.clone();
            handles.push(tokio::spawn(async move {
                service.get_or_create_proxy_session("conn", "race").await.unwrap()
            }));
        }
        let mut ports = Vec::new();
        for handle in handles {
            ports.push(handle.await.unwrap().port());
        }
        ports.dedup();
        assert_eq!(ports.len(), 1);
        assert_eq!(f.service.len(), 1);
        assert!(f.service.creating.is_empty());
    }

    #[tokio::test]
    async fn test_unused_session_expires() {
        let f = fixture_with_idle(Duration::from_millis(50)).await;
        let session = f.service.get_or_create_proxy_session("conn", "s1").await.unwrap();
        wait_until(|| f.service.is_empty()).await;
        assert!(session.is_disposed());
        assert!(!f.connection.is_disposed());
    }

    #[tokio::test]
    async fn test_subscribed_session_outlives_idle_timeout() {
        let f = fixture_with_idle(Duration::from_millis(50)).await;
        let session = f.service.get_or_create_proxy_session("conn", "s1").await.unwrap();
        let mut client = TcpStream::connect(session.local_addr()).await.unwrap();
        client.write_all(b"z").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!session.is_disposed());
        assert_eq!(f.service.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let f = fixture().await;
        let err = f
            .service
            .get_or_create_proxy_session("missing", "s1")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::ConnectionNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_subscriber_disconnect_disposes_session() {
        let f = fixture().await;
        let session = f.service.get_or_create_proxy_session("conn", "s1").await.unwrap();

        let mut client = TcpStream::connect(session.local_addr()).await.unwrap();
        client.write_all(b"z").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(session.subscribers(), 1);

        drop(client);
        wait_until(|| f.service.is_empty()).await;
        assert!(session.is_disposed());
        assert!(!f.connection.is_disposed());

        let fresh = f.service.get_or_create_proxy_session("conn", "s1").await.unwrap();
        assert!(!Arc::ptr_eq(&fresh, &session));
    }

    #[tokio::test]
    async fn test_connection_disconnect_cascades() {
        let f = fixture().await;
        let session = f.service.get_or_create_proxy_session("conn", "s1").await.unwrap();
        assert!(session.connection().is_some());

        f.transport.drop_connection();
        assert!(session.is_disposed());
        assert!(session.connection().is_none());
        wait_until(|| f.service.is_empty()).await;

        let refused = TcpStream::connect(session.local_addr()).await;
        if let Ok(mut stream) = refused {
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
    }
}
