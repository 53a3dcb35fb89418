//! Test doubles shared across module tests

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::remote::error::TunnelError;
use crate::remote::proxy::Forwarder;
use crate::ssh::transport::OutputTester;
use crate::ssh::{ExecResult, RelayStream, RemoteTransport, TransportError};

/// TCP server echoing every byte back
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    addr
}

/// Forwarder connecting straight to a local address
pub struct EchoForwarder {
    target: SocketAddr,
}

impl EchoForwarder {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Forwarder for EchoForwarder {
    async fn forward(&self, _: SocketAddr) -> Result<Box<dyn RelayStream>, TunnelError> {
        let stream = TcpStream::connect(self.target)
            .await
            .map_err(TransportError::from)?;
        Ok(Box::new(stream))
    }
}

/// A file received through [`RemoteTransport::copy`]
#[derive(Debug, Clone)]
pub struct CopiedFile {
    pub remote: String,
    pub contents: Vec<u8>,
}

struct Rule {
    pattern: String,
    responses: VecDeque<ExecResult>,
}

/// Scripted transport.
///
/// Responses are matched by substring, first rule wins. A rule's last
/// response repeats forever; commands with no rule get empty output.
#[derive(Default)]
pub struct MockTransport {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    copies: Mutex<Vec<CopiedFile>>,
    forwarded: Mutex<Vec<u16>>,
    forward_target: Mutex<Option<SocketAddr>>,
    closed: CancellationToken,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for commands containing `pattern`
    pub fn on(&self, pattern: &str, stdout: &str, stderr: &str) -> &Self {
        let result = ExecResult::new(stdout, stderr);
        let mut rules = self.rules.lock();
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.responses.push_back(result),
            None => rules.push(Rule {
                pattern: pattern.to_string(),
                responses: VecDeque::from([result]),
            }),
        }
        self
    }

    /// Send forwarded channels to `addr`
    pub fn forward_to(&self, addr: SocketAddr) {
        *self.forward_target.lock() = Some(addr);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Number of commands containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.commands.lock().iter().filter(|c| c.contains(pattern)).count()
    }

    pub fn copies(&self) -> Vec<CopiedFile> {
        self.copies.lock().clone()
    }

    pub fn forwarded_ports(&self) -> Vec<u16> {
        self.forwarded.lock().clone()
    }

    /// Simulate the remote side dropping the connection
    pub fn drop_connection(&self) {
        self.closed.cancel();
    }

    fn respond(&self, command: &str) -> ExecResult {
        self.commands.lock().push(command.to_string());
        let mut rules = self.rules.lock();
        match rules.iter_mut().find(|r| command.contains(&r.pattern)) {
            Some(rule) if rule.responses.len() > 1 => {
                rule.responses.pop_front().unwrap_or_default()
            }
            Some(rule) => rule.responses.front().cloned().unwrap_or_default(),
            None => ExecResult::default(),
        }
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn exec(&self, command: &str) -> Result<ExecResult, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(self.respond(command))
    }

    async fn exec_partial(
        &self,
        command: &str,
        _tester: &OutputTester,
    ) -> Result<ExecResult, TransportError> {
        self.exec(command).await
    }

    async fn copy(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let contents = tokio::fs::read(local).await?;
        self.copies.lock().push(CopiedFile {
            remote: remote.to_string(),
            contents,
        });
        Ok(())
    }

    async fn forward_out(
        &self,
        _originator: SocketAddr,
        remote_port: u16,
    ) -> Result<Box<dyn RelayStream>, TransportError> {
        self.forwarded.lock().push(remote_port);
        let target = *self.forward_target.lock();
        match target {
            Some(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
            None => Err(TransportError::Forward {
                port: remote_port,
                message: "no forward target".to_string(),
            }),
        }
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
