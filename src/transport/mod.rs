//! Protocol transport collaborators.
//!
//! The wire-level SSH and WinRM implementations live outside this crate.
//! The engine consumes them through the narrow traits defined here: open a
//! session, execute a command on a channel, transfer a file, open a gateway
//! tunnel. A production embedding binds these traits to its protocol stack;
//! [`mock`] provides scriptable in-memory implementations for tests.

pub mod mock;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credential::SecretSet;
use crate::error::Result;

// ============================================================================
// SSH
// ============================================================================

/// Keepalive settings forwarded when opening an SSH session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keepalive {
    /// Interval between keepalive probes.
    pub interval: Duration,
    /// Probes without an answer before the session is considered dead.
    pub count_max: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            count_max: 3,
        }
    }
}

/// Everything a transport needs to open one SSH session or gateway.
#[derive(Debug, Clone)]
pub struct SshOpenParams {
    /// Target hostname or address.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Username to authenticate as.
    pub user: String,
    /// Decrypted secrets for authentication.
    pub secrets: SecretSet,
    /// Keepalive settings for the session.
    pub keepalive: Keepalive,
}

/// One event drained from an execution channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A chunk of standard output.
    Stdout(Vec<u8>),
    /// A chunk of standard error.
    Stderr(Vec<u8>),
    /// The remote exit status.
    ExitStatus(i32),
    /// Remote end sent EOF; more events may still follow.
    Eof,
    /// Channel closed; no further events.
    Closed,
}

/// A running remote command: input goes in, events are drained until
/// [`ChannelEvent::Closed`].
#[async_trait]
pub trait ExecChannel: Send {
    /// Write bytes to the remote command's stdin.
    async fn send_input(&mut self, data: &[u8]) -> Result<()>;

    /// Next channel event, or `None` once the channel is fully drained.
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>>;
}

/// An established SSH session to one host.
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Start a command, optionally under a pseudo-terminal.
    async fn execute(&self, command: &str, pty: bool) -> Result<Box<dyn ExecChannel>>;

    /// Copy a local file to the remote path.
    async fn upload(&self, local: &Path, remote: &Path) -> Result<()>;

    /// Copy a remote file to the local path.
    async fn download(&self, remote: &Path, local: &Path) -> Result<()>;

    /// Whether the underlying stream is still open.
    fn is_open(&self) -> bool;

    /// Tear the session down.
    async fn close(&self) -> Result<()>;
}

/// An open tunnel endpoint on an intermediate host.
#[async_trait]
pub trait SshGateway: Send + Sync {
    /// Open a session to the final target through this gateway.
    async fn tunnel(&self, params: &SshOpenParams) -> Result<Box<dyn SshSession>>;

    /// Whether the gateway session is still alive.
    fn is_active(&self) -> bool;

    /// Tear the gateway session down.
    async fn close(&self) -> Result<()>;
}

/// Factory for SSH sessions and gateways.
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Open a direct session.
    async fn open(&self, params: &SshOpenParams) -> Result<Box<dyn SshSession>>;

    /// Open a gateway for tunneling.
    async fn open_gateway(&self, params: &SshOpenParams) -> Result<Box<dyn SshGateway>>;
}

// ============================================================================
// WinRM
// ============================================================================

/// Remote shell variant used for one WinRM command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    /// cmd.exe
    Cmd,
    /// PowerShell in the connected user's context.
    PowerShell,
    /// PowerShell with elevation.
    ElevatedPowerShell,
}

/// Output of one WinRM command.
#[derive(Debug, Clone, Default)]
pub struct WinRmOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code.
    pub exit_code: i32,
}

/// An established WinRM session: command shells plus the file-manager
/// surface (upload/download/exists).
#[async_trait]
pub trait WinRmSession: Send + Sync {
    /// Run one command in the given shell variant, blocking until done.
    async fn run(&self, shell: ShellKind, command: &str) -> Result<WinRmOutput>;

    /// Copy a local file to the remote path.
    async fn upload(&self, local: &Path, remote: &Path) -> Result<()>;

    /// Copy a remote file to the local path.
    async fn download(&self, remote: &Path, local: &Path) -> Result<()>;

    /// Whether the remote path exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Whether the session is still usable.
    fn is_open(&self) -> bool;

    /// Tear the session down.
    async fn close(&self) -> Result<()>;
}

/// Factory for WinRM sessions.
#[async_trait]
pub trait WinRmTransport: Send + Sync {
    /// Open a session against an endpoint URL, e.g.
    /// `http://host:5985/wsman`.
    async fn open(
        &self,
        endpoint: &str,
        user: &str,
        password: Option<&str>,
    ) -> Result<Box<dyn WinRmSession>>;
}

/// The transport pair handed to pools and connections.
#[derive(Clone)]
pub struct Transports {
    /// SSH transport.
    pub ssh: Arc<dyn SshTransport>,
    /// WinRM transport.
    pub winrm: Arc<dyn WinRmTransport>,
}

impl Transports {
    /// Bundle an SSH and a WinRM transport.
    pub fn new(ssh: Arc<dyn SshTransport>, winrm: Arc<dyn WinRmTransport>) -> Self {
        Self { ssh, winrm }
    }
}

impl std::fmt::Debug for Transports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transports").finish_non_exhaustive()
    }
}
