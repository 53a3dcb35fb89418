//! Identity candidates for public-key authentication
//!
//! Candidates are collected once per connection attempt. Unencrypted keys are
//! parsed up front; encrypted keys keep their file contents until a passphrase
//! is supplied. Files that vanish between collection and use are skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::ssh_key::{self, HashAlg};
use russh::keys::{decode_secret_key, PrivateKey};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Default key files, in the order OpenSSH tries them
const DEFAULT_IDENTITY_FILES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// A local private key considered for public-key auth
pub struct IdentityCandidate {
    pub path: PathBuf,
    /// Parsed key, `None` while a passphrase is pending or the file was unreadable
    pub key: Option<Arc<PrivateKey>>,
    /// `SHA256:...` fingerprint of the public half, when known
    pub fingerprint: Option<String>,
    pub encrypted: bool,
    contents: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for IdentityCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCandidate")
            .field("path", &self.path)
            .field("loaded", &self.key.is_some())
            .field("fingerprint", &self.fingerprint)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

/// Result of trying to unlock an encrypted candidate
#[derive(Debug)]
pub enum UnlockError {
    WrongPassphrase,
    NotEncrypted,
}

impl IdentityCandidate {
    /// Candidate for a path whose contents could not be read
    pub fn missing(path: PathBuf) -> Self {
        Self {
            path,
            key: None,
            fingerprint: None,
            encrypted: false,
            contents: None,
        }
    }

    /// Parse a key file's contents
    pub fn from_contents(path: PathBuf, contents: Zeroizing<String>) -> Self {
        let fingerprint = ssh_key::PrivateKey::from_openssh(contents.as_bytes())
            .ok()
            .map(|k| k.public_key().fingerprint(HashAlg::Sha256).to_string());

        match decode_secret_key(&contents, None) {
            Ok(key) => {
                let fingerprint = fingerprint
                    .or_else(|| Some(key.public_key().fingerprint(HashAlg::Sha256).to_string()));
                Self {
                    path,
                    key: Some(Arc::new(key)),
                    fingerprint,
                    encrypted: false,
                    contents: None,
                }
            }
            Err(russh::keys::Error::KeyIsEncrypted) => Self {
                path,
                key: None,
                fingerprint,
                encrypted: true,
                contents: Some(contents),
            },
            Err(e) => {
                warn!("[ssh-identity] Unable to parse {}: {}", path.display(), e);
                Self::missing(path)
            }
        }
    }

    /// Whether this candidate can be offered without a passphrase
    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        self.key.is_some()
    }

    /// Decrypt an encrypted candidate in place
    pub fn unlock(&mut self, passphrase: &str) -> Result<Arc<PrivateKey>, UnlockError> {
        let contents = self.contents.as_ref().ok_or(UnlockError::NotEncrypted)?;
        match decode_secret_key(contents, Some(passphrase)) {
            Ok(key) => {
                let key = Arc::new(key);
                self.key = Some(key.clone());
                self.contents = None;
                Ok(key)
            }
            Err(russh::keys::Error::KeyIsEncrypted) => Err(UnlockError::WrongPassphrase),
            // Bad passphrases typically surface as decryption/padding errors
            Err(e) => {
                debug!(
                    "[ssh-identity] Unlock of {} failed: {}",
                    self.path.display(),
                    e
                );
                Err(UnlockError::WrongPassphrase)
            }
        }
    }
}

/// Expand a leading `~/` against the local home directory
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Resolve the identity file list: configured paths, or the OpenSSH defaults
pub fn identity_paths(configured: &[String]) -> Vec<PathBuf> {
    if !configured.is_empty() {
        return configured.iter().map(|p| expand_home(p)).collect();
    }
    match dirs::home_dir() {
        Some(home) => DEFAULT_IDENTITY_FILES
            .iter()
            .map(|name| home.join(".ssh").join(name))
            .collect(),
        None => Vec::new(),
    }
}

/// Load one candidate from disk
pub async fn load_identity(path: &Path) -> Option<IdentityCandidate> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Some(IdentityCandidate::from_contents(
            path.to_path_buf(),
            Zeroizing::new(contents),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("[ssh-identity] Unable to read {}: {}", path.display(), e);
            None
        }
    }
}

/// Gather all candidates that exist on disk, preserving order
pub async fn gather_identities(configured: &[String]) -> Vec<IdentityCandidate> {
    let mut identities = Vec::new();
    for path in identity_paths(configured) {
        if let Some(candidate) = load_identity(&path).await {
            debug!(
                "[ssh-identity] Found {} (encrypted: {})",
                candidate.path.display(),
                candidate.encrypted
            );
            identities.push(candidate);
        }
    }
    identities
}
