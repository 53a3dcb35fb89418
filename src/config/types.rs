//! Configuration Types
//!
//! Data structures for the remote-development configuration file. Every field
//! carries a serde default so a partial (or missing) file is always valid.

use serde::{Deserialize, Serialize};

/// Current configuration version
pub const CONFIG_VERSION: u32 = 1;

/// Root of `remote.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Configuration version
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub server: ServerOptions,

    #[serde(default)]
    pub ssh: SshOptions,

    #[serde(default)]
    pub runtime: RuntimeOptions,

    #[serde(default)]
    pub application: ApplicationOptions,

    #[serde(default)]
    pub native: NativeOptions,

    #[serde(default)]
    pub setup: SetupOptions,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            server: ServerOptions::default(),
            ssh: SshOptions::default(),
            runtime: RuntimeOptions::default(),
            application: ApplicationOptions::default(),
            native: NativeOptions::default(),
            setup: SetupOptions::default(),
        }
    }
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

/// Local HTTP endpoint options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Address the `/ssh/connect` endpoint binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Seconds a tunnel may wait for its first subscriber before it is closed
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            session_idle_timeout_secs: default_session_idle_timeout(),
        }
    }
}

fn default_session_idle_timeout() -> u64 {
    60
}

fn default_listen_addr() -> String {
    "127.0.0.1:3030".to_string()
}

/// SSH connection and authentication options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshOptions {
    /// SSH port used when the target does not name one
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Identity files tried for public-key auth, in order.
    /// Empty means the usual `~/.ssh/id_*` set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity_files: Vec<String>,

    /// Password prompts before giving up
    #[serde(default = "default_retry_count")]
    pub password_retry_count: u32,

    /// Passphrase prompts per encrypted key
    #[serde(default = "default_retry_count")]
    pub passphrase_retry_count: u32,

    /// Keyboard-interactive challenge rounds
    #[serde(default = "default_retry_count")]
    pub keyboard_interactive_retry_count: u32,

    /// Reject hosts missing from known_hosts
    #[serde(default)]
    pub strict_host_key_checking: bool,

    /// TCP connect + handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            identity_files: Vec::new(),
            password_retry_count: default_retry_count(),
            passphrase_retry_count: default_retry_count(),
            keyboard_interactive_retry_count: default_retry_count(),
            strict_host_key_checking: false,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_retry_count() -> u32 {
    3
}

fn default_connect_timeout() -> u64 {
    30
}

/// Remote runtime (Node.js) options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Runtime version installed on the remote host.
    /// Native dependencies are built against it.
    #[serde(default = "default_runtime_version")]
    pub version: String,

    #[serde(default = "default_runtime_base_url")]
    pub download_base_url: String,

    /// Architecture suffix used in archive names
    #[serde(default = "default_arch")]
    pub arch: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            version: default_runtime_version(),
            download_base_url: default_runtime_base_url(),
            arch: default_arch(),
        }
    }
}

fn default_runtime_version() -> String {
    "18.12.1".to_string()
}

fn default_runtime_base_url() -> String {
    "https://nodejs.org/dist".to_string()
}

fn default_arch() -> String {
    "x64".to_string()
}

/// The application payload shipped to the remote host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationOptions {
    #[serde(default = "default_app_name")]
    pub name: String,

    #[serde(default = "default_app_version")]
    pub version: String,

    /// Local root that copy contributions resolve their paths against
    #[serde(default = "default_project_path")]
    pub project_path: String,

    /// Entry point, relative to the remote application directory
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
}

impl Default for ApplicationOptions {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
            project_path: default_project_path(),
            entry_point: default_entry_point(),
        }
    }
}

fn default_app_name() -> String {
    "theia".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_project_path() -> String {
    ".".to_string()
}

fn default_entry_point() -> String {
    "lib/backend/main.js".to_string()
}

/// Prebuilt native dependency downloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeOptions {
    #[serde(default = "default_native_base_url")]
    pub download_base_url: String,

    /// Release tag the prebuilt binaries are published under
    #[serde(default = "default_app_version")]
    pub version: String,

    #[serde(default = "default_ripgrep_base_url")]
    pub ripgrep_base_url: String,
}

impl Default for NativeOptions {
    fn default() -> Self {
        Self {
            download_base_url: default_native_base_url(),
            version: default_app_version(),
            ripgrep_base_url: default_ripgrep_base_url(),
        }
    }
}

fn default_native_base_url() -> String {
    "https://github.com/eclipse-theia/theia/releases/download".to_string()
}

fn default_ripgrep_base_url() -> String {
    "https://github.com/microsoft/ripgrep-prebuilt/releases/download/v13.0.0-8/ripgrep-v13.0.0-8"
        .to_string()
}

/// How the payload reaches the remote host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStrategy {
    /// Single gzip tarball, extracted remotely
    #[default]
    Archive,
    /// One transfer per file
    Files,
}

/// Provisioning options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupOptions {
    /// Attempts for probe commands that come back completely empty
    #[serde(default = "default_exec_retry_limit")]
    pub exec_retry_limit: u32,

    /// Remote port tunnels target until the launched backend reports its own
    #[serde(default = "default_remote_port")]
    pub default_remote_port: u16,

    #[serde(default)]
    pub copy_strategy: CopyStrategy,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            exec_retry_limit: default_exec_retry_limit(),
            default_remote_port: default_remote_port(),
            copy_strategy: CopyStrategy::default(),
        }
    }
}

fn default_exec_retry_limit() -> u32 {
    20
}

fn default_remote_port() -> u16 {
    3000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: RemoteConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.password_retry_count, 3);
        assert_eq!(config.setup.exec_retry_limit, 20);
        assert_eq!(config.setup.default_remote_port, 3000);
        assert_eq!(config.setup.copy_strategy, CopyStrategy::Archive);
        assert_eq!(config.application.entry_point, "lib/backend/main.js");
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: RemoteConfig =
            serde_json::from_str(r#"{"ssh":{"port":2222},"setup":{"copy_strategy":"files"}}"#)
                .unwrap();
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.ssh.keyboard_interactive_retry_count, 3);
        assert_eq!(config.setup.copy_strategy, CopyStrategy::Files);
        assert_eq!(config.setup.exec_retry_limit, 20);
    }
}
