//! SSH Authentication Negotiation
//!
//! Method selection is a pure state machine:
//!
//! ```text
//! Start ──► None probe ──► PublicKey(i) ──► Password(n) ──► KeyboardInteractive(n)
//!                              │                │                   │
//!                              └────────────────┴───────────────────┴──► Authenticated | Rejected
//! ```
//!
//! On every server reply the negotiator receives the methods the server still
//! accepts and only ever picks from that list. Retry budgets live in the
//! [`AuthNegotiator`] value so the policy can be tested without a network.
//! [`authenticate`] drives the machine against an [`AuthSession`], resolving
//! passphrases and prompts along the way.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PrivateKey;
use tracing::{debug, info, warn};

use super::identity::{IdentityCandidate, UnlockError};
use super::prompt::{PromptRequest, Prompter};

/// Authentication method names as advertised by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    None,
    PublicKey,
    Password,
    KeyboardInteractive,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PublicKey => "publickey",
            Self::Password => "password",
            Self::KeyboardInteractive => "keyboard-interactive",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "publickey" => Some(Self::PublicKey),
            "password" => Some(Self::Password),
            "keyboard-interactive" => Some(Self::KeyboardInteractive),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the negotiator wants to try next
#[derive(Debug)]
pub enum AuthStep {
    /// Probe with `none` to learn the server's method list
    None,
    PublicKey(IdentityCandidate),
    /// `first` is set on the first password attempt
    Password { first: bool },
    KeyboardInteractive { first: bool },
    /// Nothing left to try
    Reject,
}

/// Retry budgets for the interactive methods
#[derive(Debug, Clone, Copy)]
pub struct AuthBudget {
    pub password: u32,
    pub passphrase: u32,
    pub keyboard_interactive: u32,
}

impl Default for AuthBudget {
    fn default() -> Self {
        Self {
            password: 3,
            passphrase: 3,
            keyboard_interactive: 3,
        }
    }
}

/// Pure method-selection state
#[derive(Debug)]
pub struct AuthNegotiator {
    identities: VecDeque<IdentityCandidate>,
    budget: AuthBudget,
    password_left: u32,
    keyboard_left: u32,
    probed: bool,
}

impl AuthNegotiator {
    pub fn new(identities: Vec<IdentityCandidate>, budget: AuthBudget) -> Self {
        Self {
            identities: identities.into(),
            budget,
            password_left: budget.password,
            keyboard_left: budget.keyboard_interactive,
            probed: false,
        }
    }

    pub fn passphrase_budget(&self) -> u32 {
        self.budget.passphrase
    }

    pub fn password_attempts_left(&self) -> u32 {
        self.password_left
    }

    pub fn keyboard_attempts_left(&self) -> u32 {
        self.keyboard_left
    }

    pub fn identities_left(&self) -> usize {
        self.identities.len()
    }

    /// Pick the next method.
    ///
    /// `methods_left` is `None` until the server has answered once.
    pub fn next(&mut self, methods_left: Option<&[AuthMethod]>) -> AuthStep {
        let Some(methods) = methods_left else {
            if self.probed {
                return AuthStep::Reject;
            }
            self.probed = true;
            return AuthStep::None;
        };

        if methods.contains(&AuthMethod::PublicKey) {
            if let Some(identity) = self.identities.pop_front() {
                return AuthStep::PublicKey(identity);
            }
        }

        if methods.contains(&AuthMethod::Password) && self.password_left > 0 {
            let first = self.password_left == self.budget.password;
            self.password_left -= 1;
            return AuthStep::Password { first };
        }

        if methods.contains(&AuthMethod::KeyboardInteractive) && self.keyboard_left > 0 {
            let first = self.keyboard_left == self.budget.keyboard_interactive;
            self.keyboard_left -= 1;
            return AuthStep::KeyboardInteractive { first };
        }

        AuthStep::Reject
    }

    /// Spend one attempt on a follow-up challenge round. `false` once exhausted.
    pub fn take_keyboard_round(&mut self) -> bool {
        if self.keyboard_left == 0 {
            return false;
        }
        self.keyboard_left -= 1;
        true
    }

    /// A keyboard-interactive prompt was cancelled: the method is finished
    pub fn cancel_keyboard_interactive(&mut self) {
        self.keyboard_left = 0;
    }
}

/// Server verdict for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Failure { methods_left: Vec<AuthMethod> },
}

/// One keyboard-interactive prompt
#[derive(Debug, Clone)]
pub struct KeyboardPrompt {
    pub prompt: String,
    pub echo: bool,
}

/// Reply to a keyboard-interactive start/respond call
#[derive(Debug, Clone)]
pub enum KeyboardReply {
    Done(AuthOutcome),
    Challenge(Vec<KeyboardPrompt>),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("All authentication methods failed")]
    Rejected,

    #[error("Authentication cancelled")]
    Cancelled,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Failed to connect to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("SSH error: {0}")]
    Transport(String),
}

impl From<russh::Error> for AuthError {
    fn from(e: russh::Error) -> Self {
        AuthError::Transport(e.to_string())
    }
}

/// Authentication primitives of an SSH session
#[async_trait]
pub trait AuthSession: Send {
    async fn auth_none(&mut self, user: &str) -> Result<AuthOutcome, AuthError>;

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: Arc<PrivateKey>,
    ) -> Result<AuthOutcome, AuthError>;

    async fn auth_password(&mut self, user: &str, password: &str)
        -> Result<AuthOutcome, AuthError>;

    async fn auth_keyboard_start(&mut self, user: &str) -> Result<KeyboardReply, AuthError>;

    async fn auth_keyboard_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KeyboardReply, AuthError>;
}

/// Resolve a candidate's key, prompting for a passphrase when needed.
///
/// `None` means skip to the next candidate.
async fn resolve_identity(
    identity: &mut IdentityCandidate,
    prompter: &dyn Prompter,
    passphrase_budget: u32,
) -> Option<Arc<PrivateKey>> {
    if !tokio::fs::try_exists(&identity.path).await.unwrap_or(false) {
        debug!(
            "[ssh-auth] Identity {} no longer exists, skipping",
            identity.path.display()
        );
        return None;
    }

    if let Some(key) = &identity.key {
        return Some(key.clone());
    }

    if !identity.encrypted {
        return None;
    }

    let mut left = passphrase_budget;
    while left > 0 {
        let passphrase = prompter
            .input(PromptRequest::passphrase(identity.path.clone()))
            .await;
        let Some(passphrase) = passphrase.filter(|p| !p.is_empty()) else {
            break;
        };
        left -= 1;
        match identity.unlock(&passphrase) {
            Ok(key) => return Some(key),
            Err(UnlockError::WrongPassphrase) => {
                warn!(
                    "[ssh-auth] Wrong passphrase for {} ({} attempts left)",
                    identity.path.display(),
                    left
                );
            }
            Err(UnlockError::NotEncrypted) => return None,
        }
    }
    None
}

/// Run a keyboard-interactive exchange until the server settles.
///
/// Every challenge round after the first spends one keyboard-interactive
/// attempt. `None` means the method was abandoned (cancelled or out of
/// attempts) without a server verdict.
async fn keyboard_interactive<S: AuthSession + ?Sized>(
    session: &mut S,
    negotiator: &mut AuthNegotiator,
    prompter: &dyn Prompter,
    user: &str,
    host: &str,
) -> Result<Option<AuthOutcome>, AuthError> {
    let mut reply = session.auth_keyboard_start(user).await?;
    let mut first_round = true;
    loop {
        let prompts = match reply {
            KeyboardReply::Done(outcome) => return Ok(Some(outcome)),
            KeyboardReply::Challenge(prompts) => prompts,
        };

        if !first_round && !negotiator.take_keyboard_round() {
            warn!("[ssh-auth] Keyboard-interactive attempts exhausted for {}@{}", user, host);
            return Ok(None);
        }
        first_round = false;

        let mut responses = Vec::with_capacity(prompts.len());
        for prompt in &prompts {
            let request = PromptRequest::keyboard_interactive(user, host, &prompt.prompt, prompt.echo);
            match prompter.input(request).await {
                Some(response) => responses.push(response.to_string()),
                None => {
                    debug!("[ssh-auth] Keyboard-interactive prompt cancelled");
                    negotiator.cancel_keyboard_interactive();
                    return Ok(None);
                }
            }
        }
        reply = session.auth_keyboard_respond(responses).await?;
    }
}

/// Drive the negotiator against a session until it succeeds or rejects
pub async fn authenticate<S: AuthSession + ?Sized>(
    session: &mut S,
    negotiator: &mut AuthNegotiator,
    prompter: &dyn Prompter,
    user: &str,
    host: &str,
) -> Result<(), AuthError> {
    let mut methods_left: Option<Vec<AuthMethod>> = None;

    loop {
        let outcome = match negotiator.next(methods_left.as_deref()) {
            AuthStep::None => {
                debug!("[ssh-auth] Trying none authentication");
                session.auth_none(user).await?
            }
            AuthStep::PublicKey(mut identity) => {
                let budget = negotiator.passphrase_budget();
                let Some(key) = resolve_identity(&mut identity, prompter, budget).await else {
                    continue;
                };
                info!(
                    "[ssh-auth] Trying publickey authentication: {} {} {}",
                    identity.path.display(),
                    key.algorithm().as_str(),
                    identity.fingerprint.as_deref().unwrap_or("")
                );
                session.auth_publickey(user, key).await?
            }
            AuthStep::Password { first } => {
                if first {
                    info!("[ssh-auth] Trying password authentication");
                }
                let password = prompter.input(PromptRequest::password(user, host)).await;
                match password.filter(|p| !p.is_empty()) {
                    Some(password) => session.auth_password(user, &password).await?,
                    None => return Err(AuthError::Cancelled),
                }
            }
            AuthStep::KeyboardInteractive { first } => {
                if first {
                    info!("[ssh-auth] Trying keyboard-interactive authentication");
                }
                match keyboard_interactive(session, negotiator, prompter, user, host).await? {
                    Some(outcome) => outcome,
                    None => continue,
                }
            }
            AuthStep::Reject => {
                warn!("[ssh-auth] No authentication methods left for {}@{}", user, host);
                return Err(AuthError::Rejected);
            }
        };

        match outcome {
            AuthOutcome::Success => {
                info!("[ssh-auth] Authenticated {}@{}", user, host);
                return Ok(());
            }
            AuthOutcome::Failure { methods_left: left } => {
                debug!(
                    "[ssh-auth] Methods left: {}",
                    left.iter().map(AuthMethod::as_str).collect::<Vec<_>>().join(",")
                );
                methods_left = Some(left);
            }
        }
    }
}
