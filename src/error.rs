//! SSH Error types

use thiserror::Error;

/// Errors reported through operation completions and `Session::last_error`.
///
/// Variants are cloneable so the most recent failure can be retained on the
/// session while the original is delivered to the caller.
#[derive(Error, Debug, Clone)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out: {0}")]
    Timeout(String),

    /// Operation invoked in a lifecycle state that forbids it.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Key error: {0}")]
    KeyError(String),

    /// The server presented a key that differs from the stored entry.
    /// Possible MITM; escalated by callers from a `Mismatch` verification.
    #[error("Host key for {host} changed: expected {expected}, got {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("Host key for {0} not found in known hosts")]
    HostKeyNotFound(String),

    #[error("Known hosts store error: {0}")]
    HostKeyStore(String),

    /// Operation aborted because disconnect was requested.
    #[error("Operation cancelled by disconnect")]
    Cancelled,

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),

    #[error("IO error: {0}")]
    Io(String),

    /// The session worker is gone; the owning `Session` was dropped.
    #[error("Disconnected")]
    Disconnected,
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::Io(err.to_string())
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
