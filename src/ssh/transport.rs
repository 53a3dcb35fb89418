//! Remote Transport: exec, copy and port forwarding over one SSH connection
//!
//! Everything above the SSH layer talks to a [`RemoteTransport`]:
//!
//! - `exec` runs a command to completion and collects stdout/stderr
//! - `exec_partial` returns as soon as accumulated stdout satisfies a tester,
//!   leaving the remote process running
//! - `copy` uploads a local file through the SFTP subsystem
//! - `forward_out` opens a `direct-tcpip` channel to a port on the remote host
//!
//! The transport owns a [`CancellationToken`] that fires once when the SSH
//! connection goes away, whichever side closed it.

use std::net::SocketAddr;
use std::path::Path;

use async_trait::async_trait;
use russh::client::Handle;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientHandler;

/// Output of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Both streams empty
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("Port forward to {port} failed: {message}")]
    Forward { port: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for TransportError {
    fn from(e: russh::Error) -> Self {
        match e {
            russh::Error::Disconnect => TransportError::Closed,
            other => TransportError::Channel(other.to_string()),
        }
    }
}

/// Byte stream carried by a forwarded channel
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

/// Stdout predicate for [`RemoteTransport::exec_partial`]
pub type OutputTester = dyn Fn(&str) -> bool + Send + Sync;

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run a command and wait for the channel to close
    async fn exec(&self, command: &str) -> Result<ExecResult, TransportError>;

    /// Run a command until `tester` accepts stdout or the channel closes
    async fn exec_partial(
        &self,
        command: &str,
        tester: &OutputTester,
    ) -> Result<ExecResult, TransportError>;

    /// Upload a local file to `remote`
    async fn copy(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Open a forwarded channel to `127.0.0.1:<remote_port>` on the remote host
    async fn forward_out(
        &self,
        originator: SocketAddr,
        remote_port: u16,
    ) -> Result<Box<dyn RelayStream>, TransportError>;

    /// Token cancelled when the connection is gone
    fn closed(&self) -> CancellationToken;

    /// Tear the connection down
    async fn close(&self);
}

/// [`RemoteTransport`] over a russh client session
pub struct SshTransport {
    handle: Handle<ClientHandler>,
    closed: CancellationToken,
    label: String,
}

impl SshTransport {
    pub fn new(handle: Handle<ClientHandler>, closed: CancellationToken, label: String) -> Self {
        Self {
            handle,
            closed,
            label,
        }
    }

    async fn open_exec(
        &self,
        command: &str,
    ) -> Result<russh::Channel<russh::client::Msg>, TransportError> {
        if self.closed.is_cancelled() || self.handle.is_closed() {
            return Err(TransportError::Closed);
        }
        let channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;
        debug!("[ssh-transport] {} exec: {}", self.label, command);
        Ok(channel)
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn exec(&self, command: &str) -> Result<ExecResult, TransportError> {
        let mut channel = self.open_exec(command).await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    stderr.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("[ssh-transport] exit status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        Ok(ExecResult::new(
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr),
        ))
    }

    async fn exec_partial(
        &self,
        command: &str,
        tester: &OutputTester,
    ) -> Result<ExecResult, TransportError> {
        let mut channel = self.open_exec(command).await?;
        let mut stdout = OutputBuffer::default();
        let mut stderr = OutputBuffer::default();

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    stdout.push(&data);
                    if tester(&stdout.text()) {
                        // Keep reading in the background: dropping the channel
                        // would close it and stop the remote process
                        let label = self.label.clone();
                        tokio::spawn(async move {
                            while let Some(msg) = channel.wait().await {
                                if let ChannelMsg::ExtendedData { data, ext: 1 } = msg {
                                    for line in String::from_utf8_lossy(&data).lines() {
                                        debug!("[remote-stderr] {} {}", label, line);
                                    }
                                }
                            }
                            debug!("[ssh-transport] {} background channel ended", label);
                        });
                        return Ok(ExecResult::new(stdout.text(), stderr.text()));
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.push(&data),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        Ok(ExecResult::new(stdout.text(), stderr.text()))
    }

    async fn copy(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let channel = self.handle.channel_open_session().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| TransportError::Sftp(format!("subsystem unavailable: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::Sftp(e.to_string()))?;

        let mut source = tokio::fs::File::open(local).await?;
        let mut target = sftp
            .create(remote)
            .await
            .map_err(|e| TransportError::Sftp(format!("{}: {}", remote, e)))?;
        let bytes = tokio::io::copy(&mut source, &mut target).await?;
        target.shutdown().await?;

        if let Err(e) = sftp.close().await {
            debug!("[ssh-transport] SFTP close: {}", e);
        }
        info!(
            "[ssh-transport] {} copied {} -> {} ({} bytes)",
            self.label,
            local.display(),
            remote,
            bytes
        );
        Ok(())
    }

    async fn forward_out(
        &self,
        originator: SocketAddr,
        remote_port: u16,
    ) -> Result<Box<dyn RelayStream>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                "127.0.0.1",
                remote_port as u32,
                originator.ip().to_string(),
                originator.port() as u32,
            )
            .await
            .map_err(|e| TransportError::Forward {
                port: remote_port,
                message: e.to_string(),
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            warn!("[ssh-transport] {} disconnect: {}", self.label, e);
        }
        self.closed.cancel();
    }
}

/// Raw channel output, decoded as a whole so multibyte characters split
/// across packets survive
#[derive(Debug, Default)]
struct OutputBuffer(Vec<u8>);

impl OutputBuffer {
    fn push(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}
