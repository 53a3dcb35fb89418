//! Remote development over SSH
//!
//! Authenticates to a remote host, installs a runtime and the application
//! backend on it, launches the backend and tunnels local client sessions to
//! it over the one SSH connection.

pub mod config;
pub mod error;
pub mod native;
pub mod remote;
pub mod server;
pub mod setup;
pub mod ssh;

#[cfg(test)]
mod testing;

pub use error::RemoteError;
pub use remote::RemoteService;
