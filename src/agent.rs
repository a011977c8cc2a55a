//! Forwarded-agent access
//!
//! The end user's authentication agent is the bridge's only credential for
//! the downstream host. The recording proxy makes it reachable through an
//! [`AgentConnector`], which can open any number of fresh byte streams
//! speaking the SSH agent protocol (in practice each stream is relayed to
//! the user's real agent over the proxy's own connection back to them).
//!
//! The bridge uses the agent twice:
//! - locally at dial time, enumerating identities and signing the
//!   downstream handshake through an [`AgentClient`];
//! - remotely after `auth-agent-req@openssh.com`, splicing agent channels
//!   opened by the downstream host onto fresh connector streams.

use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::agent::client::AgentClient;
use russh::keys::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{RelayError, Result};

/// Byte stream speaking the SSH agent protocol.
pub trait AgentTransport: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static> AgentTransport for T {}

/// Boxed agent protocol stream.
pub type AgentStream = Box<dyn AgentTransport>;

/// Source of connections to the user's agent.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Open a fresh stream to the agent.
    async fn connect(&self) -> Result<AgentStream>;
}

/// Handle to the forwarded agent, shared across the bridge.
#[derive(Clone)]
pub struct ForwardedAgent {
    connector: Arc<dyn AgentConnector>,
}

impl ForwardedAgent {
    pub fn new(connector: Arc<dyn AgentConnector>) -> Self {
        Self { connector }
    }

    /// Open an agent protocol client on a fresh stream.
    pub async fn client(&self) -> Result<AgentClient<AgentStream>> {
        let stream = self.connector.connect().await?;
        Ok(AgentClient::connect(stream))
    }

    /// Raw stream to the agent, for splicing onto a remote agent channel.
    pub async fn stream(&self) -> Result<AgentStream> {
        self.connector.connect().await
    }

    /// Public keys the agent can currently sign with.
    pub async fn signers(&self) -> Result<Vec<PublicKey>> {
        let mut client = self.client().await?;
        let identities = client
            .request_identities()
            .await
            .map_err(|e| RelayError::Agent(format!("failed to list agent identities: {e}")))?;
        Ok(identities)
    }
}

impl std::fmt::Debug for ForwardedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedAgent").finish_non_exhaustive()
    }
}

/// Connector for an agent listening on a local Unix socket, typically the
/// one named by `SSH_AUTH_SOCK`.
#[cfg(unix)]
pub struct LocalAgent {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl LocalAgent {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Connector for the socket named by the `SSH_AUTH_SOCK` environment
    /// variable.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os("SSH_AUTH_SOCK")
            .ok_or_else(|| RelayError::Agent("SSH_AUTH_SOCK is not set".into()))?;
        Ok(Self::new(std::path::PathBuf::from(path)))
    }
}

#[cfg(unix)]
#[async_trait]
impl AgentConnector for LocalAgent {
    async fn connect(&self) -> Result<AgentStream> {
        let stream = tokio::net::UnixStream::connect(&self.path)
            .await
            .map_err(|e| {
                RelayError::Agent(format!(
                    "failed to connect to agent at {}: {e}",
                    self.path.display()
                ))
            })?;
        Ok(Box::new(stream))
    }
}
