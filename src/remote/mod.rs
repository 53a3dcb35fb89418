//! Remote Module
//!
//! Connection registry, local proxy listeners, the session multiplexer and
//! the [`RemoteService`] facade tying them to provisioning.

pub mod connection;
pub mod error;
pub mod path;
pub mod proxy;
pub mod registry;
pub mod service;
pub mod session;

pub use connection::RemoteConnection;
pub use error::{RegistryError, TunnelError};
pub use proxy::{Forwarder, ProxyServer, ProxyServerProvider};
pub use registry::{ConnectionRegistry, Registration};
pub use service::RemoteService;
pub use session::{RemoteSession, RemoteSessionService, SessionKey};
