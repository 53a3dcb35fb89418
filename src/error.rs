//! Top-level error type

use thiserror::Error;

use crate::config::ConfigError;
use crate::remote::error::{RegistryError, TunnelError};
use crate::setup::SetupError;
use crate::ssh::AuthError;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{0}")]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Tunnel(#[from] TunnelError),

    #[error("{0}")]
    Setup(#[from] SetupError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Server error: {0}")]
    Server(String),
}

impl serde::Serialize for RemoteError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_display_string() {
        let err = RemoteError::from(SetupError::Launch("boom".into()));
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            "\"Could not start remote system: boom\""
        );
    }
}
