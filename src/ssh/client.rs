//! SSH client connection setup
//!
//! Connects to `user@host[:port]`, verifies the host key against
//! `~/.ssh/known_hosts`, then runs the [`AuthNegotiator`] over the session.
//! The resulting [`SshTransport`] carries a token that is cancelled when the
//! russh session task drops its handler, i.e. when the connection ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{check_known_hosts, PrivateKey, PublicKey};
use russh::MethodSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::auth::{
    authenticate, AuthBudget, AuthError, AuthMethod, AuthNegotiator, AuthOutcome, AuthSession,
    KeyboardPrompt, KeyboardReply,
};
use super::identity::gather_identities;
use super::prompt::Prompter;
use super::transport::SshTransport;
use crate::config::SshOptions;

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Parse `host`, `host:port`, `user@host`, `user@host:port` or `[v6]:port`.
    ///
    /// A user embedded in `host` wins over `default_user`.
    pub fn parse(host: &str, default_user: &str, default_port: u16) -> Result<Self, AuthError> {
        let host = host.trim();
        let (user, rest) = match host.rsplit_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (default_user.trim().to_string(), host),
        };

        let (host, port) = if let Some(v6) = rest.strip_prefix('[') {
            let (addr, tail) = v6
                .split_once(']')
                .ok_or_else(|| AuthError::InvalidTarget(rest.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if tail.is_empty() => default_port,
                None => return Err(AuthError::InvalidTarget(rest.to_string())),
            };
            (addr.to_string(), port)
        } else if rest.matches(':').count() == 1 {
            let (addr, port) = rest
                .split_once(':')
                .ok_or_else(|| AuthError::InvalidTarget(rest.to_string()))?;
            (addr.to_string(), parse_port(port)?)
        } else {
            (rest.to_string(), default_port)
        };

        if host.is_empty() {
            return Err(AuthError::InvalidTarget("missing host".to_string()));
        }
        if user.is_empty() {
            return Err(AuthError::InvalidTarget(format!("missing user for {}", host)));
        }
        Ok(Self { user, host, port })
    }

    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

fn parse_port(port: &str) -> Result<u16, AuthError> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| AuthError::InvalidTarget(format!("invalid port {}", port)))
}

/// russh event handler for one client connection
pub struct ClientHandler {
    host: String,
    port: u16,
    strict_host_key_checking: bool,
    closed: CancellationToken,
}

impl ClientHandler {
    pub fn new(target: &ConnectTarget, strict: bool, closed: CancellationToken) -> Self {
        Self {
            host: target.host.clone(),
            port: target.port,
            strict_host_key_checking: strict,
            closed,
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) if self.strict_host_key_checking => {
                warn!("[ssh-client] Host {} not in known_hosts, rejecting", self.host);
                Ok(false)
            }
            Ok(false) => {
                warn!(
                    "[ssh-client] Host {} not in known_hosts, accepting {}",
                    self.host,
                    server_public_key.fingerprint(russh::keys::ssh_key::HashAlg::Sha256)
                );
                Ok(true)
            }
            Err(russh::keys::Error::KeyChanged { line }) => {
                warn!(
                    "[ssh-client] Host key for {} changed (known_hosts line {}), rejecting",
                    self.host, line
                );
                Ok(false)
            }
            Err(e) => {
                warn!("[ssh-client] known_hosts check failed: {}", e);
                Ok(!self.strict_host_key_checking)
            }
        }
    }
}

fn methods_left(remaining: &MethodSet) -> Vec<AuthMethod> {
    remaining
        .iter()
        .filter_map(|kind| AuthMethod::parse(<&str>::from(kind)))
        .collect()
}

fn outcome(result: AuthResult) -> AuthOutcome {
    match result {
        AuthResult::Success => AuthOutcome::Success,
        AuthResult::Failure {
            remaining_methods, ..
        } => AuthOutcome::Failure {
            methods_left: methods_left(&remaining_methods),
        },
    }
}

fn keyboard_reply(response: KeyboardInteractiveAuthResponse) -> KeyboardReply {
    match response {
        KeyboardInteractiveAuthResponse::Success => KeyboardReply::Done(AuthOutcome::Success),
        KeyboardInteractiveAuthResponse::Failure {
            remaining_methods, ..
        } => KeyboardReply::Done(AuthOutcome::Failure {
            methods_left: methods_left(&remaining_methods),
        }),
        KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => KeyboardReply::Challenge(
            prompts
                .into_iter()
                .map(|p| KeyboardPrompt {
                    prompt: p.prompt,
                    echo: p.echo,
                })
                .collect(),
        ),
    }
}

#[async_trait]
impl AuthSession for Handle<ClientHandler> {
    async fn auth_none(&mut self, user: &str) -> Result<AuthOutcome, AuthError> {
        Ok(outcome(self.authenticate_none(user).await?))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: Arc<PrivateKey>,
    ) -> Result<AuthOutcome, AuthError> {
        let hash_alg = if key.algorithm().is_rsa() {
            self.best_supported_rsa_hash().await?.flatten()
        } else {
            None
        };
        let key = PrivateKeyWithHashAlg::new(key, hash_alg);
        Ok(outcome(self.authenticate_publickey(user, key).await?))
    }

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<AuthOutcome, AuthError> {
        Ok(outcome(self.authenticate_password(user, password).await?))
    }

    async fn auth_keyboard_start(&mut self, user: &str) -> Result<KeyboardReply, AuthError> {
        let response = self
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await?;
        Ok(keyboard_reply(response))
    }

    async fn auth_keyboard_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KeyboardReply, AuthError> {
        let response = self
            .authenticate_keyboard_interactive_respond(responses)
            .await?;
        Ok(keyboard_reply(response))
    }
}

/// Connect and authenticate, yielding a ready transport
pub async fn establish_connection(
    target: &ConnectTarget,
    options: &SshOptions,
    prompter: &dyn Prompter,
) -> Result<SshTransport, AuthError> {
    info!("[ssh-client] Connecting to {}", target.label());

    let config = Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let closed = CancellationToken::new();
    let handler = ClientHandler::new(target, options.strict_host_key_checking, closed.clone());

    let connect = client::connect(config, (target.host.as_str(), target.port), handler);
    let timeout = Duration::from_secs(options.connect_timeout_secs);
    let mut handle = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            return Err(AuthError::Connect {
                host: target.host.clone(),
                message: e.to_string(),
            })
        }
        Err(_) => return Err(AuthError::Timeout(target.label())),
    };

    let identities = gather_identities(&options.identity_files).await;
    let budget = AuthBudget {
        password: options.password_retry_count,
        passphrase: options.passphrase_retry_count,
        keyboard_interactive: options.keyboard_interactive_retry_count,
    };
    let mut negotiator = AuthNegotiator::new(identities, budget);

    let result = authenticate(
        &mut handle,
        &mut negotiator,
        prompter,
        &target.user,
        &target.host,
    )
    .await;
    // Remaining candidates (and any key material) go away here
    drop(negotiator);

    if let Err(e) = result {
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await;
        return Err(e);
    }

    info!("[ssh-client] Connected to ssh host {}", target.label());
    Ok(SshTransport::new(handle, closed, target.label()))
}
