//! Error types for Muster.
//!
//! One enum covers the whole engine: credential resolution, pool lifecycle,
//! transport faults, and command classification. The retry layer keys off
//! [`Error::is_auth_failure`] and [`Error::is_closed_stream`]; everything
//! else propagates to the caller untouched.

use thiserror::Error;

/// Result type alias for Muster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Muster.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Pool Errors
    // ========================================================================
    /// Neither well-known port answered, so the host's protocol could not
    /// be determined.
    #[error("Could not determine host type for '{host}': no answer on SSH or WinRM port")]
    HostTypeDetermination {
        /// Target host
        host: String,
    },

    /// No free connection slot became available within the pool timeout.
    #[error("Timed out after {timeout_secs} seconds waiting for a connection to '{host}'")]
    PoolTimeout {
        /// Target host
        host: String,
        /// Borrow timeout in seconds
        timeout_secs: u64,
    },

    /// A metadata key collides with a built-in pool operation name.
    #[error("Invalid metadata key '{key}': collides with a reserved pool operation")]
    InvalidMetadataKey {
        /// The offending key, as supplied
        key: String,
    },

    // ========================================================================
    // Credential Errors
    // ========================================================================
    /// A credential was rejected by the remote host or by sudo.
    #[error("Authentication failed for '{target}': {message}")]
    Authentication {
        /// Host (or gateway) the credential was presented to
        target: String,
        /// Error message
        message: String,
    },

    /// No configured store produced a credential for the target.
    #[error("No credential found for '{target}'")]
    MissingCredential {
        /// Target host
        target: String,
    },

    /// A credential store did not implement `credential`. This is a
    /// programming-contract violation, not a runtime condition.
    #[error("Credential store '{store}' does not implement credential lookup")]
    MissingOverride {
        /// Store name
        store: String,
    },

    /// Elevation was requested but no usable password is available.
    #[error("Sudo requested for '{target}' but no password is available")]
    MissingSudoPassword {
        /// Target host
        target: String,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Pseudo-terminal allocation was refused by the remote side.
    #[error("PTY allocation failed: {0}")]
    Pty(String),

    /// Command or transfer exited outside the accepted exit-code set.
    /// Raised only when the caller opts into strict checking.
    #[error("Command '{command}' failed with exit code {exit_code}: {output}")]
    CommandFailed {
        /// The command that ran
        command: String,
        /// Its exit code
        exit_code: i32,
        /// Combined output, for diagnostics
        output: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// The underlying stream was closed mid-operation. Retryable: the
    /// connection is rebuilt and the operation re-attempted with backoff.
    #[error("Stream closed: {0}")]
    ClosedStream(String),

    /// Any other transport-level failure. Not retried.
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error during connection operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Secret sealing or unsealing failed.
    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl Error {
    /// Creates an authentication error.
    pub fn authentication(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Creates a missing-credential error.
    pub fn missing_credential(target: impl Into<String>) -> Self {
        Self::MissingCredential {
            target: target.into(),
        }
    }

    /// True for credential rejections, which the retry layer answers by
    /// evicting the cached credential and retrying immediately.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Authentication { .. })
    }

    /// True for closed-stream transport faults, which the retry layer
    /// answers by rebuilding the connection and backing off.
    pub fn is_closed_stream(&self) -> bool {
        matches!(self, Error::ClosedStream(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::authentication("web01", "bad password").is_auth_failure());
        assert!(Error::ClosedStream("EOF".into()).is_closed_stream());
        assert!(!Error::Transport("refused".into()).is_closed_stream());
        assert!(!Error::Pty("refused".into()).is_auth_failure());
    }

    #[test]
    fn test_command_failed_message_names_command_and_code() {
        let err = Error::CommandFailed {
            command: "systemctl restart app".into(),
            exit_code: 5,
            output: String::new(),
        };
        let message = err.to_string();
        assert!(message.contains("systemctl restart app"));
        assert!(message.contains('5'));
    }
}
