//! Host client errors

use thiserror::Error;

/// Errors raised while talking to a cluster host
#[derive(Debug, Error)]
pub enum HostError {
    /// Local process spawning or pipe error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The SSH connection could not be established or was lost
    #[error("Connection to {address} failed: {message}")]
    Connect {
        /// Host address
        address: String,
        /// Error detail
        message: String,
    },

    /// A remote command exited non-zero
    #[error("Command failed on {address} (exit {code}): {command}: {stderr}")]
    Exec {
        /// Host address
        address: String,
        /// Command line
        command: String,
        /// Exit code
        code: i32,
        /// Captured standard error
        stderr: String,
    },

    /// Command output could not be parsed
    #[error("Decode error: {0}")]
    Decode(String),

    /// Host is known to be unreachable
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// Deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl HostError {
    /// Failures of the channel itself rather than of a command
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            HostError::Connect { .. } | HostError::Unreachable(_) | HostError::Timeout(_)
        )
    }
}
