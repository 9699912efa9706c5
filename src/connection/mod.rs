//! Connection layer: protocol-agnostic remote execution and transfer.
//!
//! A [`Connection`] owns a lazily established session to one host and
//! exposes run/upload/download/exists operations. Two implementations
//! exist, selected by a factory keyed on [`Protocol`] when the owning pool
//! is built: [`ssh::SshConnection`] and [`winrm::WinRmConnection`]. Every
//! operation entry re-checks whether the live session is still current
//! (closed stream, host identity drift, rotated credentials, dead gateway)
//! and rebuilds it when it is not, so a pooled connection never keeps
//! using revoked credentials.

pub mod gateway;
pub mod probe;
pub(crate) mod retry;
pub mod ssh;
pub mod winrm;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Auth;
use crate::error::{Error, Result};
use crate::result::ExecResult;
use crate::transport::Transports;

/// Default attempt budget for one logical command or transfer.
pub const DEFAULT_RETRIES: u32 = 8;

/// Remote-shell protocol spoken with a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Unix-style secure shell.
    Ssh,
    /// Windows remote management.
    Winrm,
}

impl Protocol {
    /// The protocol's well-known port.
    pub fn well_known_port(&self) -> u16 {
        match self {
            Protocol::Ssh => probe::SSH_PORT,
            Protocol::Winrm => probe::WINRM_PORT,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ssh => write!(f, "ssh"),
            Protocol::Winrm => write!(f, "winrm"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ssh" => Ok(Protocol::Ssh),
            "winrm" => Ok(Protocol::Winrm),
            other => Err(Error::Transport(format!("Unknown protocol: {}", other))),
        }
    }
}

/// Callback over an output chunk.
pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback over a finished result.
pub type ResultCallback = Arc<dyn Fn(&ExecResult) + Send + Sync>;

/// Options for [`Connection::run`] and [`Connection::run_script`].
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Run with privilege escalation.
    pub sudo: bool,
    /// Allocate a pseudo-terminal.
    pub pty: bool,
    /// Attempt budget; defaults to [`DEFAULT_RETRIES`].
    pub retries: Option<u32>,
    /// Bytes written to the command's stdin after start.
    pub input: Option<String>,
    /// Exit codes classified as success; defaults to `[0]`.
    pub accepted_exit_codes: Option<Vec<i32>>,
    /// Fired for each stdout chunk as it arrives.
    pub on_stdout: Option<ChunkCallback>,
    /// Fired for each stderr chunk as it arrives.
    pub on_stderr: Option<ChunkCallback>,
    /// Fired for each chunk of either stream as it arrives.
    pub on_output: Option<ChunkCallback>,
    /// Fired once when the result classifies as success.
    pub on_success: Option<ResultCallback>,
    /// Fired once when the result classifies as failure.
    pub on_error: Option<ResultCallback>,
    /// Always fired last, success or failure.
    pub on_complete: Option<ResultCallback>,
}

impl RunOptions {
    /// New options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable privilege escalation.
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Request a pseudo-terminal.
    pub fn pty(mut self) -> Self {
        self.pty = true;
        self
    }

    /// Set the attempt budget.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set stdin input.
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Set the accepted exit-code set.
    pub fn accepted_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.accepted_exit_codes = Some(codes);
        self
    }

    /// Set the stdout-chunk callback.
    pub fn on_stdout(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stdout = Some(Arc::new(f));
        self
    }

    /// Set the stderr-chunk callback.
    pub fn on_stderr(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stderr = Some(Arc::new(f));
        self
    }

    /// Set the any-chunk callback.
    pub fn on_output(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_output = Some(Arc::new(f));
        self
    }

    /// Set the success callback.
    pub fn on_success(mut self, f: impl Fn(&ExecResult) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Set the failure callback.
    pub fn on_error(mut self, f: impl Fn(&ExecResult) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Set the completion callback.
    pub fn on_complete(mut self, f: impl Fn(&ExecResult) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    /// Attempt budget with the default applied.
    pub fn retry_budget(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES).max(1)
    }

    /// Accepted exit codes with the default applied.
    pub fn accepted(&self) -> Vec<i32> {
        self.accepted_exit_codes
            .clone()
            .unwrap_or_else(|| crate::result::DEFAULT_ACCEPTED_EXIT_CODES.to_vec())
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("sudo", &self.sudo)
            .field("pty", &self.pty)
            .field("retries", &self.retries)
            .field("input", &self.input.as_ref().map(|_| ".."))
            .field("accepted_exit_codes", &self.accepted_exit_codes)
            .finish_non_exhaustive()
    }
}

/// Options for [`Connection::upload`] and [`Connection::download`].
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Stage through a privileged move/copy.
    pub sudo: bool,
    /// Owner applied with the privileged move (upload only).
    pub owner: Option<String>,
    /// Group applied with the privileged move (upload only).
    pub group: Option<String>,
    /// Mode bits applied with the privileged move (upload only).
    pub mode: Option<u32>,
    /// Attempt budget; defaults to [`DEFAULT_RETRIES`].
    pub retries: Option<u32>,
}

impl TransferOptions {
    /// New options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage through a privileged move/copy.
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Set the owner.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set the group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the mode bits.
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the attempt budget.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Attempt budget with the default applied.
    pub fn retry_budget(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES).max(1)
    }
}

/// What a connection knows about the pool that owns it: target identity,
/// free-form metadata (gateway configuration included), the credential
/// resolver, and the transports. Shared by every connection in one pool.
/// Metadata is mutable behind a lock so gateway reconfiguration reaches
/// pooled connections, which re-read it on every reconnect check.
pub struct PoolContext {
    /// Target hostname.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Protocol selected for the pool.
    pub protocol: Protocol,
    /// Free-form pool metadata.
    pub metadata: parking_lot::RwLock<HashMap<String, Value>>,
    /// Credential resolver.
    pub auth: Arc<Auth>,
    /// Protocol transports.
    pub transports: Transports,
}

impl PoolContext {
    /// Metadata value for a key, if present.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.metadata.read().get(key).cloned()
    }

    /// Replace one metadata value.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.metadata.write().insert(key.into(), value);
    }

    /// Gateway configuration, when `gateway_host` is present in metadata.
    pub fn gateway(&self) -> Option<gateway::GatewayConfig> {
        gateway::GatewayConfig::from_metadata(&self.metadata.read())
    }
}

impl fmt::Debug for PoolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolContext")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("metadata", &*self.metadata.read())
            .finish_non_exhaustive()
    }
}

/// The capability surface shared by both protocol variants.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The protocol this connection speaks.
    fn protocol(&self) -> Protocol;

    /// Target hostname.
    fn host(&self) -> &str;

    /// Target port.
    fn port(&self) -> u16;

    /// Whether the target port currently accepts connections.
    async fn port_open(&self) -> bool;

    /// Execute a command with positional arguments.
    async fn run(&self, command: &str, args: &[&str], options: &RunOptions)
        -> Result<ExecResult>;

    /// Upload a local script, make it runnable, and execute it with
    /// arguments; the same options are forwarded to all three steps.
    async fn run_script(
        &self,
        local: &Path,
        remote: &Path,
        args: &[&str],
        options: &RunOptions,
    ) -> Result<ExecResult>;

    /// Upload a file, returning the remote path written.
    async fn upload(
        &self,
        local: &Path,
        remote: &Path,
        options: &TransferOptions,
    ) -> Result<PathBuf>;

    /// Download a file, returning the local path written.
    async fn download(
        &self,
        remote: &Path,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<PathBuf>;

    /// Whether a remote path exists.
    async fn file_exists(&self, path: &Path, options: &RunOptions) -> Result<bool>;

    /// Tear down the live session. Not terminal: the next operation
    /// rebuilds.
    async fn close(&self) -> Result<()>;
}

/// Build the connection variant for the context's protocol.
pub fn build_connection(ctx: Arc<PoolContext>) -> Arc<dyn Connection> {
    match ctx.protocol {
        Protocol::Ssh => Arc::new(ssh::SshConnection::new(ctx)),
        Protocol::Winrm => Arc::new(winrm::WinRmConnection::new(ctx)),
    }
}

/// Assemble a full command line from a base command and positional
/// arguments, quoting each argument.
pub(crate) fn assemble_command(command: &str, args: &[&str]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!(
            "{} {}",
            command,
            shell_words::join(args.iter().copied())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_round_trip() {
        assert_eq!("ssh".parse::<Protocol>().unwrap(), Protocol::Ssh);
        assert_eq!("WinRM".parse::<Protocol>().unwrap(), Protocol::Winrm);
        assert!("telnet".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Ssh.to_string(), "ssh");
    }

    #[test]
    fn test_well_known_ports() {
        assert_eq!(Protocol::Ssh.well_known_port(), 22);
        assert_eq!(Protocol::Winrm.well_known_port(), 5985);
    }

    #[test]
    fn test_assemble_command_quotes_arguments() {
        assert_eq!(assemble_command("hostname", &[]), "hostname");
        assert_eq!(
            assemble_command("ls", &["-l", "/var/log/my app"]),
            "ls -l '/var/log/my app'"
        );
    }

    #[test]
    fn test_run_options_defaults() {
        let options = RunOptions::new();
        assert_eq!(options.retry_budget(), DEFAULT_RETRIES);
        assert_eq!(options.accepted(), vec![0]);
        assert!(!options.sudo);
        assert!(!options.pty);
    }

    #[test]
    fn test_run_options_debug_hides_input() {
        let options = RunOptions::new().input("secret-stdin");
        assert!(!format!("{:?}", options).contains("secret-stdin"));
    }
}
