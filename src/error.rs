//! Relay error types

use thiserror::Error;

/// Errors produced while building or running a forwarding bridge.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Missing or invalid configuration, malformed request payload, or an
    /// unsupported request type.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Policy denied the operation (missing agent, agent-forward denial).
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The upstream user's key or certificate was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The downstream host presented a key the cluster does not trust.
    #[error("untrusted host key: {0}")]
    HostKey(String),

    /// TCP dial failure or handshake I/O error.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A dial or protocol operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// SSH library error on channel open, request, or reply.
    #[error("SSH protocol error: {0}")]
    Protocol(String),

    /// The forwarded agent failed to answer or sign.
    #[error("agent error: {0}")]
    Agent(String),

    /// Session registry or session service failure.
    #[error("session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer went away; the owning task has shut down.
    #[error("disconnected")]
    Disconnected,
}

impl From<russh::Error> for RelayError {
    fn from(err: russh::Error) -> Self {
        RelayError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for RelayError {
    fn from(err: russh::keys::Error) -> Self {
        RelayError::Agent(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;
