//! SSH Module
//!
//! Connection establishment, authentication negotiation and the
//! [`RemoteTransport`] abstraction the rest of the crate runs on.

pub mod auth;
pub mod client;
pub mod identity;
pub mod prompt;
pub mod transport;

pub use auth::{AuthError, AuthMethod, AuthNegotiator, AuthStep};
pub use client::{establish_connection, ConnectTarget};
pub use identity::IdentityCandidate;
pub use prompt::{PromptRequest, Prompter, StaticPrompter};
pub use transport::{ExecResult, RelayStream, RemoteTransport, SshTransport, TransportError};
