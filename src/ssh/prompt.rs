//! Interactive credential prompts
//!
//! Authentication asks a [`Prompter`] for passwords, key passphrases and
//! keyboard-interactive responses. `None` means the user cancelled.

use async_trait::async_trait;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// What is being asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptKind {
    Password,
    Passphrase { key_path: PathBuf },
    KeyboardInteractive { prompt: String, echo: bool },
}

/// A single prompt shown to the user
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub title: String,
    pub kind: PromptKind,
}

impl PromptRequest {
    pub fn password(user: &str, host: &str) -> Self {
        Self {
            title: format!("Enter password for {}@{}", user, host),
            kind: PromptKind::Password,
        }
    }

    pub fn passphrase(key_path: PathBuf) -> Self {
        Self {
            title: format!("Enter passphrase for {}", key_path.display()),
            kind: PromptKind::Passphrase { key_path },
        }
    }

    pub fn keyboard_interactive(user: &str, host: &str, prompt: &str, echo: bool) -> Self {
        Self {
            title: format!("({}@{}) {}", user, host, prompt),
            kind: PromptKind::KeyboardInteractive {
                prompt: prompt.to_string(),
                echo,
            },
        }
    }

    /// Whether the answer should be masked
    pub fn is_secret(&self) -> bool {
        match &self.kind {
            PromptKind::Password | PromptKind::Passphrase { .. } => true,
            PromptKind::KeyboardInteractive { echo, .. } => !echo,
        }
    }
}

/// Source of interactive answers
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn input(&self, request: PromptRequest) -> Option<Zeroizing<String>>;
}

/// Non-interactive prompter answering from preconfigured secrets.
///
/// Keyboard-interactive prompts that hide input are answered with the
/// password, which covers the common PAM `Password:` challenge.
#[derive(Default)]
pub struct StaticPrompter {
    password: Option<Zeroizing<String>>,
    passphrase: Option<Zeroizing<String>>,
}

impl StaticPrompter {
    pub fn new(password: Option<String>, passphrase: Option<String>) -> Self {
        Self {
            password: password.map(Zeroizing::new),
            passphrase: passphrase.map(Zeroizing::new),
        }
    }

    /// Read `OXIDE_REMOTE_PASSWORD` / `OXIDE_REMOTE_PASSPHRASE`
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("OXIDE_REMOTE_PASSWORD").ok(),
            std::env::var("OXIDE_REMOTE_PASSPHRASE").ok(),
        )
    }
}

#[async_trait]
impl Prompter for StaticPrompter {
    async fn input(&self, request: PromptRequest) -> Option<Zeroizing<String>> {
        match &request.kind {
            PromptKind::Passphrase { .. } => self.passphrase.clone(),
            _ if request.is_secret() => self.password.clone(),
            _ => None,
        }
    }
}
