//! Connection Registry
//!
//! Live connections keyed by their opaque id. Registering takes ownership:
//! the entry is removed when the returned [`Registration`] is disposed or when
//! the connection's disconnect token fires, whichever happens first.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::connection::RemoteConnection;
use super::error::RegistryError;

const CONNECTION_ID_LEN: usize = 10;

type ConnectionMap = Arc<DashMap<String, Arc<RemoteConnection>>>;

/// Handle removing one registration
#[derive(Debug)]
pub struct Registration {
    id: String,
    connection: Arc<RemoteConnection>,
    connections: ConnectionMap,
}

impl Registration {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remove the entry if it still refers to this connection
    pub fn dispose(self) {
        remove_if_same(&self.connections, &self.id, &self.connection);
    }
}

fn remove_if_same(connections: &ConnectionMap, id: &str, connection: &Arc<RemoteConnection>) {
    if connections
        .remove_if(id, |_, current| Arc::ptr_eq(current, connection))
        .is_some()
    {
        info!("[registry] Connection {} unregistered", id);
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: ConnectionMap,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh id not currently in use
    pub fn new_connection_id(&self) -> String {
        loop {
            let id: String = uuid::Uuid::new_v4()
                .simple()
                .to_string()
                .chars()
                .take(CONNECTION_ID_LEN)
                .collect();
            if !self.connections.contains_key(&id) {
                return id;
            }
        }
    }

    /// Store a connection under its id
    pub fn register(
        &self,
        connection: Arc<RemoteConnection>,
    ) -> Result<Registration, RegistryError> {
        let id = connection.id().to_string();
        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(connection.clone());
            }
        }
        info!("[registry] Connection {} registered", id);

        let connections = self.connections.clone();
        let watched = connection.clone();
        let watched_id = id.clone();
        let disconnected = connection.disconnected();
        tokio::spawn(async move {
            disconnected.cancelled().await;
            debug!("[registry] Connection {} disconnected", watched_id);
            remove_if_same(&connections, &watched_id, &watched);
        });

        Ok(Registration {
            id,
            connection,
            connections: self.connections.clone(),
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<RemoteConnection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Dispose every registered connection
    pub fn dispose_all(&self) {
        let all: Vec<Arc<RemoteConnection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        for connection in all {
            connection.dispose();
        }
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use std::time::Duration;

    fn connection(id: &str) -> (Arc<MockTransport>, Arc<RemoteConnection>) {
        let transport = Arc::new(MockTransport::new());
        let connection = RemoteConnection::new(id.to_string(), transport.clone(), 3000);
        (transport, connection)
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
    async fn test_register_and_get() {
        let registry = ConnectionRegistry::new();
        let (_, c) = connection("abc");
        let registration = registry.register(c.clone()).unwrap();
        assert_eq!(registration.id(), "abc");
        assert!(Arc::ptr_eq(&registry.get("abc").unwrap(), &c));
        assert!(registry.get("nope").is_none());

        registration.dispose();
        assert!(!registry.contains("abc"));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = ConnectionRegistry::new();
        let (_, first) = connection("same");
        let (_, second) = connection("same");
        let _registration = registry.register(first.clone()).unwrap();
        let err = registry.register(second).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(id) if id == "same"));
        assert!(Arc::ptr_eq(&registry.get("same").unwrap(), &first));
    }

    #[tokio::test]
    async fn test_stale_registration_does_not_remove_successor() {
        let registry = ConnectionRegistry::new();
        let (_, first) = connection("id");
        let old = registry.register(first.clone()).unwrap();
        // a manual removal followed by a new registration under the same id
        registry.connections.remove("id");
        let (_, second) = connection("id");
        let _new = registry.register(second.clone()).unwrap();

        old.dispose();
        assert!(Arc::ptr_eq(&registry.get("id").unwrap(), &second));
    }

    #[tokio::test]
    async fn test_disconnect_removes_entry() {
        let registry = ConnectionRegistry::new();
        let (transport, c) = connection("gone");
        let _registration = registry.register(c).unwrap();
        transport.drop_connection();
        wait_until(|| !registry.contains("gone")).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_new_connection_ids_are_distinct() {
        let registry = ConnectionRegistry::new();
        let a = registry.new_connection_id();
        let b = registry.new_connection_id();
        assert_eq!(a.len(), CONNECTION_ID_LEN);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_dispose_all() {
        let registry = ConnectionRegistry::new();
        let (_, a) = connection("a");
        let (_, b) = connection("b");
        let _ra = registry.register(a.clone()).unwrap();
        let _rb = registry.register(b.clone()).unwrap();
        registry.dispose_all();
        assert!(a.is_disposed() && b.is_disposed());
        assert_eq!(registry.len(), 0);
    }
}
