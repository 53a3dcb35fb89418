//! Connection registry and tunnel error types

use thiserror::Error;

use crate::ssh::TransportError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Connection id already registered: {0}")]
    DuplicateId(String),
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("No remote connection found for id {0}")]
    ConnectionNotFound(String),

    #[error("Remote connection {0} is closed")]
    ConnectionClosed(String),

    #[error("Failed to bind local listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Forward failed: {0}")]
    Forward(#[from] TransportError),
}
