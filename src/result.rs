//! The result of executing a remote command or transfer.
//!
//! [`ExecResult`] is an immutable record of what a command produced.
//! Non-zero exits never raise implicitly; callers opt into strict checking
//! with [`ExecResult::error`].

use crate::error::{Error, Result};

/// Exit codes treated as success when the caller does not say otherwise.
pub const DEFAULT_ACCEPTED_EXIT_CODES: &[i32] = &[0];

/// Immutable record of a command's output and exit classification.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The command that was executed, as sent to the remote shell.
    pub command: String,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// Combined stdout and stderr, accumulated in arrival order.
    pub output: String,
    /// Exit code reported by the remote side.
    pub exit_code: i32,
    /// Exit codes classified as success for this result.
    pub accepted_exit_codes: Vec<i32>,
}

impl ExecResult {
    /// Create a result for a command that has not produced output yet.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdout: String::new(),
            stderr: String::new(),
            output: String::new(),
            exit_code: 0,
            accepted_exit_codes: DEFAULT_ACCEPTED_EXIT_CODES.to_vec(),
        }
    }

    /// Replace the accepted exit-code set.
    pub fn with_accepted_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.accepted_exit_codes = codes;
        self
    }

    /// Append a stdout chunk, keeping the combined output in arrival order.
    pub fn push_stdout(&mut self, chunk: &str) {
        self.stdout.push_str(chunk);
        self.output.push_str(chunk);
    }

    /// Append a stderr chunk, keeping the combined output in arrival order.
    pub fn push_stderr(&mut self, chunk: &str) {
        self.stderr.push_str(chunk);
        self.output.push_str(chunk);
    }

    /// Whether the exit code is in the accepted set.
    pub fn success(&self) -> bool {
        self.accepted_exit_codes.contains(&self.exit_code)
    }

    /// Strict check: no-op on success, [`Error::CommandFailed`] otherwise.
    pub fn error(&self) -> Result<()> {
        if self.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: self.command.clone(),
                exit_code: self.exit_code,
                output: self.output.clone(),
            })
        }
    }
}
