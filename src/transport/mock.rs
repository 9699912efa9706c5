//! Scriptable in-memory transports.
//!
//! These back the integration tests and let downstream code exercise the
//! engine without real servers. Each transport keeps a shared state bag: a
//! remote filesystem map, scripted command handlers, fault-injection
//! counters, and journals of opens, commands, and inputs.
//!
//! The built-in command interpreter understands just enough POSIX (`test`,
//! `mv`, `cp`, `rm`, `chown`, `chmod`, `echo`, `&&` chains, and the sudo
//! wrapper the engine emits) to make upload/download/exists flows behave
//! like a real host. Unknown commands succeed with empty output; scripted
//! handlers take precedence.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ChannelEvent, ExecChannel, ShellKind, SshGateway, SshOpenParams, SshSession, SshTransport,
    WinRmOutput, WinRmSession, WinRmTransport,
};
use crate::error::{Error, Result};

/// Output a scripted handler produces for one command.
#[derive(Debug, Clone, Default)]
pub struct MockExec {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code.
    pub exit_code: i32,
}

impl MockExec {
    /// Successful execution with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Failed execution with the given exit code and stderr.
    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Default::default()
        }
    }
}

type CommandHandler = Arc<dyn Fn(&str) -> Option<MockExec> + Send + Sync>;

// ============================================================================
// Shared mock state
// ============================================================================

#[derive(Default)]
struct MockState {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    handlers: Mutex<Vec<CommandHandler>>,
    expected_password: Mutex<Option<String>>,
    auth_failures: AtomicUsize,
    closed_stream_failures: AtomicUsize,
    session_generation: AtomicUsize,
    gateway_generation: AtomicUsize,
    opens: Mutex<Vec<SshOpenParams>>,
    gateway_opens: Mutex<Vec<SshOpenParams>>,
    tunnels: Mutex<Vec<SshOpenParams>>,
    commands: Mutex<Vec<String>>,
    inputs: Mutex<Vec<Vec<u8>>>,
    winrm_runs: Mutex<Vec<(ShellKind, String)>>,
    winrm_opens: Mutex<Vec<(String, String)>>,
}

impl MockState {
    fn check_auth(&self, target: &str, password: Option<&str>) -> Result<()> {
        if take_one(&self.auth_failures) {
            return Err(Error::authentication(target, "mock: injected auth failure"));
        }
        if let Some(expected) = self.expected_password.lock().as_deref() {
            if password != Some(expected) {
                return Err(Error::authentication(target, "mock: password rejected"));
            }
        }
        Ok(())
    }

    fn run_command(&self, command: &str) -> MockExec {
        self.commands.lock().push(command.to_string());
        for handler in self.handlers.lock().iter() {
            if let Some(exec) = handler(command) {
                return exec;
            }
        }
        interpret(command, &self.files)
    }
}

/// Decrement a fault counter, reporting whether a fault was consumed.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ============================================================================
// Built-in command interpreter
// ============================================================================

fn interpret(command: &str, files: &Mutex<HashMap<PathBuf, Vec<u8>>>) -> MockExec {
    // Unwrap the engine's sudo prefix and re-interpret the inner command.
    let tokens = match shell_words::split(command) {
        Ok(tokens) => tokens,
        Err(_) => return MockExec::fail(2, "mock: unparseable command\n"),
    };
    if tokens.first().map(String::as_str) == Some("sudo") {
        if let Some(pos) = tokens.iter().position(|t| t == "-c") {
            if let Some(inner) = tokens.get(pos + 1) {
                return interpret(inner, files);
            }
        }
        return MockExec::default();
    }

    // `a && b && c` chains: stop at the first failure.
    let mut last = MockExec::default();
    for step in command.split(" && ") {
        last = interpret_one(step.trim(), files);
        if last.exit_code != 0 {
            return last;
        }
    }
    last
}

fn interpret_one(command: &str, files: &Mutex<HashMap<PathBuf, Vec<u8>>>) -> MockExec {
    let tokens = match shell_words::split(command) {
        Ok(tokens) => tokens,
        Err(_) => return MockExec::fail(2, "mock: unparseable command\n"),
    };
    let words: Vec<&str> = tokens.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["test", "-e", path] => {
            if files.lock().contains_key(Path::new(path)) {
                MockExec::default()
            } else {
                MockExec::fail(1, "")
            }
        }
        ["mv", "-f", src, dst] => {
            let mut files = files.lock();
            match files.remove(Path::new(src)) {
                Some(content) => {
                    files.insert(PathBuf::from(dst), content);
                    MockExec::default()
                }
                None => MockExec::fail(1, format!("mv: cannot stat '{}'\n", src)),
            }
        }
        ["cp", "-f", src, dst] => {
            let mut files = files.lock();
            match files.get(Path::new(src)).cloned() {
                Some(content) => {
                    files.insert(PathBuf::from(dst), content);
                    MockExec::default()
                }
                None => MockExec::fail(1, format!("cp: cannot stat '{}'\n", src)),
            }
        }
        ["rm", "-f", path] => {
            files.lock().remove(Path::new(path));
            MockExec::default()
        }
        ["chown" | "chmod", ..] => MockExec::default(),
        ["echo", rest @ ..] => MockExec::ok(format!("{}\n", rest.join(" "))),
        // PowerShell verbs the WinRM staging dance emits.
        ["Move-Item", "-Force", src, dst] => {
            let mut files = files.lock();
            match files.remove(Path::new(src)) {
                Some(content) => {
                    files.insert(PathBuf::from(dst), content);
                    MockExec::default()
                }
                None => MockExec::fail(1, format!("Move-Item: cannot find '{}'\n", src)),
            }
        }
        ["Copy-Item", "-Force", src, dst] => {
            let mut files = files.lock();
            match files.get(Path::new(src)).cloned() {
                Some(content) => {
                    files.insert(PathBuf::from(dst), content);
                    MockExec::default()
                }
                None => MockExec::fail(1, format!("Copy-Item: cannot find '{}'\n", src)),
            }
        }
        ["Remove-Item", "-Force", path] => {
            files.lock().remove(Path::new(path));
            MockExec::default()
        }
        _ => MockExec::default(),
    }
}

// ============================================================================
// SSH mock
// ============================================================================

/// Scriptable SSH transport.
#[derive(Default)]
pub struct MockSshTransport {
    state: Arc<MockState>,
}

impl MockSshTransport {
    /// New transport with an empty remote filesystem and no scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler consulted before the built-in interpreter.
    /// The first handler returning `Some` wins.
    pub fn on_command<F>(&self, handler: F)
    where
        F: Fn(&str) -> Option<MockExec> + Send + Sync + 'static,
    {
        self.state.handlers.lock().push(Arc::new(handler));
    }

    /// Script an exact-match command to produce the given stdout.
    pub fn respond(&self, command: &str, stdout: &str) {
        let command = command.to_string();
        let stdout = stdout.to_string();
        self.on_command(move |c| (c == command).then(|| MockExec::ok(stdout.clone())));
    }

    /// Reject any open or tunnel whose password differs from `password`.
    pub fn expect_password(&self, password: &str) {
        *self.state.expected_password.lock() = Some(password.to_string());
    }

    /// Fail the next `n` opens/tunnels with an authentication error.
    pub fn fail_auth_times(&self, n: usize) {
        self.state.auth_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` executes/uploads/downloads with a closed-stream
    /// error, killing the session they ran on.
    pub fn fail_closed_stream_times(&self, n: usize) {
        self.state.closed_stream_failures.store(n, Ordering::SeqCst);
    }

    /// Invalidate every open session, as a dropped TCP stream would.
    pub fn kill_sessions(&self) {
        self.state.session_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Invalidate every open gateway.
    pub fn kill_gateways(&self) {
        self.state.gateway_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Seed a file on the mock remote host.
    pub fn put_remote_file(&self, path: impl Into<PathBuf>, content: &[u8]) {
        self.state.files.lock().insert(path.into(), content.to_vec());
    }

    /// Content of a mock remote file, if present.
    pub fn remote_file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state.files.lock().get(path.as_ref()).cloned()
    }

    /// Every remote path currently present.
    pub fn remote_paths(&self) -> Vec<PathBuf> {
        self.state.files.lock().keys().cloned().collect()
    }

    /// Journal of session opens.
    pub fn opens(&self) -> Vec<SshOpenParams> {
        self.state.opens.lock().clone()
    }

    /// Journal of gateway opens.
    pub fn gateway_opens(&self) -> Vec<SshOpenParams> {
        self.state.gateway_opens.lock().clone()
    }

    /// Journal of tunnel opens through gateways.
    pub fn tunnels(&self) -> Vec<SshOpenParams> {
        self.state.tunnels.lock().clone()
    }

    /// Journal of executed commands, sudo wrapper included.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().clone()
    }

    /// Journal of bytes written to command stdin.
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.state.inputs.lock().clone()
    }
}

#[async_trait]
impl SshTransport for MockSshTransport {
    async fn open(&self, params: &SshOpenParams) -> Result<Box<dyn SshSession>> {
        self.state.opens.lock().push(params.clone());
        self.state
            .check_auth(&params.host, params.secrets.password.as_deref())?;
        Ok(Box::new(MockSshSession::new(self.state.clone())))
    }

    async fn open_gateway(&self, params: &SshOpenParams) -> Result<Box<dyn SshGateway>> {
        self.state.gateway_opens.lock().push(params.clone());
        self.state
            .check_auth(&params.host, params.secrets.password.as_deref())?;
        Ok(Box::new(MockSshGateway {
            state: self.state.clone(),
            generation: self.state.gateway_generation.load(Ordering::SeqCst),
            open: AtomicBool::new(true),
        }))
    }
}

struct MockSshSession {
    state: Arc<MockState>,
    generation: usize,
    open: AtomicBool,
}

impl MockSshSession {
    fn new(state: Arc<MockState>) -> Self {
        let generation = state.session_generation.load(Ordering::SeqCst);
        Self {
            state,
            generation,
            open: AtomicBool::new(true),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ClosedStream("mock: session is closed".into()));
        }
        if take_one(&self.state.closed_stream_failures) {
            self.open.store(false, Ordering::SeqCst);
            return Err(Error::ClosedStream("mock: injected stream closure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SshSession for MockSshSession {
    async fn execute(&self, command: &str, pty: bool) -> Result<Box<dyn ExecChannel>> {
        self.ensure_open()?;
        let exec = self.state.run_command(command);

        let mut events = VecDeque::new();
        if pty {
            // A real pty echoes what was typed before any command output.
            events.push_back(ChannelEvent::Stdout(b"mock-pty-echo\r\n".to_vec()));
        }
        if !exec.stdout.is_empty() {
            events.push_back(ChannelEvent::Stdout(exec.stdout.into_bytes()));
        }
        if !exec.stderr.is_empty() {
            events.push_back(ChannelEvent::Stderr(exec.stderr.into_bytes()));
        }
        events.push_back(ChannelEvent::ExitStatus(exec.exit_code));
        events.push_back(ChannelEvent::Eof);
        events.push_back(ChannelEvent::Closed);

        Ok(Box::new(MockExecChannel {
            state: self.state.clone(),
            events,
        }))
    }

    async fn upload(&self, local: &Path, remote: &Path) -> Result<()> {
        self.ensure_open()?;
        let content = tokio::fs::read(local).await?;
        self.state.files.lock().insert(remote.to_path_buf(), content);
        Ok(())
    }

    async fn download(&self, remote: &Path, local: &Path) -> Result<()> {
        self.ensure_open()?;
        let content = self
            .state
            .files
            .lock()
            .get(remote)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("mock: no such file {}", remote.display())))?;
        tokio::fs::write(local, content).await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self.generation == self.state.session_generation.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MockExecChannel {
    state: Arc<MockState>,
    events: VecDeque<ChannelEvent>,
}

#[async_trait]
impl ExecChannel for MockExecChannel {
    async fn send_input(&mut self, data: &[u8]) -> Result<()> {
        self.state.inputs.lock().push(data.to_vec());
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<ChannelEvent>> {
        Ok(self.events.pop_front())
    }
}

struct MockSshGateway {
    state: Arc<MockState>,
    generation: usize,
    open: AtomicBool,
}

#[async_trait]
impl SshGateway for MockSshGateway {
    async fn tunnel(&self, params: &SshOpenParams) -> Result<Box<dyn SshSession>> {
        if !self.is_active() {
            return Err(Error::ClosedStream("mock: gateway is closed".into()));
        }
        self.state.tunnels.lock().push(params.clone());
        self.state
            .check_auth(&params.host, params.secrets.password.as_deref())?;
        Ok(Box::new(MockSshSession::new(self.state.clone())))
    }

    fn is_active(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self.generation == self.state.gateway_generation.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// WinRM mock
// ============================================================================

/// Scriptable WinRM transport.
#[derive(Default)]
pub struct MockWinRmTransport {
    state: Arc<MockState>,
}

impl MockWinRmTransport {
    /// New transport with an empty remote filesystem and no scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler consulted before the built-in interpreter.
    pub fn on_command<F>(&self, handler: F)
    where
        F: Fn(&str) -> Option<MockExec> + Send + Sync + 'static,
    {
        self.state.handlers.lock().push(Arc::new(handler));
    }

    /// Reject any open whose password differs from `password`.
    pub fn expect_password(&self, password: &str) {
        *self.state.expected_password.lock() = Some(password.to_string());
    }

    /// Fail the next `n` opens with an authentication error.
    pub fn fail_auth_times(&self, n: usize) {
        self.state.auth_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` runs/transfers with a closed-stream error.
    pub fn fail_closed_stream_times(&self, n: usize) {
        self.state.closed_stream_failures.store(n, Ordering::SeqCst);
    }

    /// Seed a file on the mock remote host.
    pub fn put_remote_file(&self, path: impl Into<PathBuf>, content: &[u8]) {
        self.state.files.lock().insert(path.into(), content.to_vec());
    }

    /// Content of a mock remote file, if present.
    pub fn remote_file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state.files.lock().get(path.as_ref()).cloned()
    }

    /// Journal of (shell, command) runs.
    pub fn runs(&self) -> Vec<(ShellKind, String)> {
        self.state.winrm_runs.lock().clone()
    }

    /// Journal of session opens as (endpoint, user).
    pub fn opens(&self) -> Vec<(String, String)> {
        self.state.winrm_opens.lock().clone()
    }
}

#[async_trait]
impl WinRmTransport for MockWinRmTransport {
    async fn open(
        &self,
        endpoint: &str,
        user: &str,
        password: Option<&str>,
    ) -> Result<Box<dyn WinRmSession>> {
        self.state
            .winrm_opens
            .lock()
            .push((endpoint.to_string(), user.to_string()));
        self.state.check_auth(endpoint, password)?;
        Ok(Box::new(MockWinRmSession {
            state: self.state.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct MockWinRmSession {
    state: Arc<MockState>,
    open: AtomicBool,
}

impl MockWinRmSession {
    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::ClosedStream("mock: session is closed".into()));
        }
        if take_one(&self.state.closed_stream_failures) {
            self.open.store(false, Ordering::SeqCst);
            return Err(Error::ClosedStream("mock: injected stream closure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WinRmSession for MockWinRmSession {
    async fn run(&self, shell: ShellKind, command: &str) -> Result<WinRmOutput> {
        self.ensure_open()?;
        self.state.winrm_runs.lock().push((shell, command.to_string()));
        let exec = self.state.run_command(command);
        Ok(WinRmOutput {
            stdout: exec.stdout,
            stderr: exec.stderr,
            exit_code: exec.exit_code,
        })
    }

    async fn upload(&self, local: &Path, remote: &Path) -> Result<()> {
        self.ensure_open()?;
        let content = tokio::fs::read(local).await?;
        self.state.files.lock().insert(remote.to_path_buf(), content);
        Ok(())
    }

    async fn download(&self, remote: &Path, local: &Path) -> Result<()> {
        self.ensure_open()?;
        let content = self
            .state
            .files
            .lock()
            .get(remote)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("mock: no such file {}", remote.display())))?;
        tokio::fs::write(local, content).await?;
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.state.files.lock().contains_key(path))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
