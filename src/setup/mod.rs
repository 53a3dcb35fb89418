//! Remote Setup: bootstraps the runtime and application on a remote host.
//!
//! Workflow (see [`service::RemoteSetupService::setup`]):
//! 1. Detect the remote platform via `uname -s`
//! 2. Resolve the remote home directory and create the application directory
//! 3. Install the runtime unless its directory already exists
//! 4. Ship the application payload unless `lib/` already exists
//! 5. Launch the backend and wait for it to report its port
//!
//! Every step is idempotent, so running setup again against a provisioned
//! host only relaunches the backend.

pub mod copy;
pub mod exec;
pub mod platform;
pub mod runtime;
pub mod service;

pub use copy::{
    BackendCopyContribution, CopyContribution, CopyError, RemoteCopyRegistry, RemoteCopyService,
    RemoteFile,
};
pub use platform::RemotePlatform;
pub use runtime::RuntimeInstaller;
pub use service::{ProvisioningState, RemoteSetupService};

use crate::ssh::TransportError;

/// Progress callback receiving human-readable status lines
pub type StatusReport = dyn Fn(&str) + Send + Sync;

/// Provisioning errors. Any of these aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Failed to identify remote system: {stdout}\n{stderr}")]
    PlatformDetection { stdout: String, stderr: String },

    #[error("Failed to resolve remote home directory")]
    HomeDirectory,

    #[error("Failed to create directory: {0}")]
    CreateDirectory(String),

    #[error("Failed to unzip: {0}")]
    Unzip(String),

    #[error("Runtime download failed: {0}")]
    RuntimeDownload(String),

    #[error("Failed to copy application: {0}")]
    Copy(String),

    #[error("Could not start remote system: {0}")]
    Launch(String),

    #[error("Remote command failed: {0}")]
    Exec(String),

    #[error("Local I/O error: {0}")]
    LocalIo(String),
}

impl From<TransportError> for SetupError {
    fn from(e: TransportError) -> Self {
        SetupError::Exec(e.to_string())
    }
}

impl From<CopyError> for SetupError {
    fn from(e: CopyError) -> Self {
        SetupError::Copy(e.to_string())
    }
}
