//! Downstream connection
//!
//! Dials the destination host as an SSH client, authenticating with the
//! forwarded agent's keys, and hands back two controllers built on the
//! single-owner pattern: exactly one task owns the russh `Handle` and
//! exactly one task owns the session channel. Every other component talks
//! to them through cloneable controllers over mpsc commands, which
//! serializes all protocol-level operations on the shared session.
//!
//! The session owner correlates `want_reply` requests with the
//! SUCCESS/FAILURE answers of the remote host through a FIFO of pending
//! acks, so callers observe the downstream's actual boolean reply.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Pty};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::addr::NetAddr;
use crate::agent::ForwardedAgent;
use crate::auth::AuthHandlers;
use crate::defaults::{DIAL_TIMEOUT, IDLE_TIMEOUT};
use crate::error::{RelayError, Result};
use crate::idle::IdleTimeoutStream;

/// Output of the downstream session, streamed to the upstream session
/// handler.
#[derive(Debug)]
pub enum RemoteEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    Eof,
    Closed,
}

/// Channels the downstream host opens back through the bridge.
pub enum RemoteConnEvent {
    /// `auth-agent@openssh.com`: the host wants to talk to the user's agent.
    AgentChannel(Channel<client::Msg>),
    /// `forwarded-tcpip`: a connection arrived on a remotely-forwarded port.
    ForwardedTcpip {
        channel: Channel<client::Msg>,
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
    },
}

/// Everything `connect_remote_session` establishes.
pub struct RemoteHandles {
    pub client: RemoteClient,
    pub session: RemoteSession,
    /// Session output; consumed by the upstream session handler.
    pub events: mpsc::UnboundedReceiver<RemoteEvent>,
    /// Channels opened by the host back toward the user.
    pub conn_events: mpsc::UnboundedReceiver<RemoteConnEvent>,
}

enum ClientCommand {
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32>>,
    },
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

/// Controller for connection-level operations on the downstream client.
#[derive(Clone)]
pub struct RemoteClient {
    cmd_tx: mpsc::Sender<ClientCommand>,
    agent_enabled: Arc<AtomicBool>,
}

impl RemoteClient {
    /// Forward a `tcpip-forward` global request and return the bound port.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| RelayError::Disconnected)?;
        reply_rx.await.map_err(|_| RelayError::Disconnected)?
    }

    /// Forward a `cancel-tcpip-forward` global request.
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| RelayError::Disconnected)?;
        reply_rx.await.map_err(|_| RelayError::Disconnected)?
    }

    /// Allow the host to open agent channels back through the bridge.
    pub fn enable_agent_forwarding(&self) {
        self.agent_enabled.store(true, Ordering::SeqCst);
    }

    /// Disconnect the downstream client. Idempotent.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }
}

enum SessionCommand {
    Exec {
        command: Vec<u8>,
        reply_tx: oneshot::Sender<bool>,
    },
    Shell {
        reply_tx: oneshot::Sender<bool>,
    },
    RequestPty {
        term: String,
        col_width: u32,
        row_height: u32,
        modes: Vec<(Pty, u32)>,
        reply_tx: oneshot::Sender<bool>,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
    },
    Setenv {
        name: String,
        value: String,
    },
    Subsystem {
        name: String,
        reply_tx: oneshot::Sender<bool>,
    },
    AgentForward {
        reply_tx: oneshot::Sender<bool>,
    },
    Data {
        data: Vec<u8>,
    },
    Eof,
    Close,
}

/// Controller for the single downstream session channel.
#[derive(Clone)]
pub struct RemoteSession {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl RemoteSession {
    async fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| RelayError::Disconnected)
    }

    async fn send_acked(
        &self,
        build: impl FnOnce(oneshot::Sender<bool>) -> SessionCommand,
    ) -> Result<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(build(reply_tx)).await?;
        reply_rx.await.map_err(|_| RelayError::Disconnected)
    }

    /// Start a remote command. Returns the host's accept/deny reply.
    pub async fn exec(&self, command: &[u8]) -> Result<bool> {
        let command = command.to_vec();
        self.send_acked(move |reply_tx| SessionCommand::Exec { command, reply_tx })
            .await
    }

    /// Start a remote shell.
    pub async fn shell(&self) -> Result<bool> {
        self.send_acked(|reply_tx| SessionCommand::Shell { reply_tx })
            .await
    }

    /// Allocate a remote pseudo-terminal.
    pub async fn request_pty(
        &self,
        term: &str,
        col_width: u32,
        row_height: u32,
        modes: Vec<(Pty, u32)>,
    ) -> Result<bool> {
        let term = term.to_string();
        self.send_acked(move |reply_tx| SessionCommand::RequestPty {
            term,
            col_width,
            row_height,
            modes,
            reply_tx,
        })
        .await
    }

    /// Propagate a terminal size change. No reply is defined for it.
    pub async fn window_change(&self, col_width: u32, row_height: u32) -> Result<()> {
        self.send(SessionCommand::WindowChange {
            col_width,
            row_height,
        })
        .await
    }

    /// Set an environment variable on the remote session. The host is free
    /// to ignore it; failures are not reported.
    pub async fn setenv(&self, name: &str, value: &str) -> Result<()> {
        self.send(SessionCommand::Setenv {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Start a remote subsystem. Returns the host's accept/deny reply.
    pub async fn subsystem(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.send_acked(move |reply_tx| SessionCommand::Subsystem { name, reply_tx })
            .await
    }

    /// Advertise agent availability with `auth-agent-req@openssh.com`.
    pub async fn request_agent_forward(&self) -> Result<bool> {
        self.send_acked(|reply_tx| SessionCommand::AgentForward { reply_tx })
            .await
    }

    /// Write to the remote session's stdin.
    pub async fn data(&self, data: &[u8]) -> Result<()> {
        self.send(SessionCommand::Data {
            data: data.to_vec(),
        })
        .await
    }

    /// Signal end of input.
    pub async fn eof(&self) -> Result<()> {
        self.send(SessionCommand::Eof).await
    }

    /// Close the session channel. Idempotent.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Close).await;
    }
}

struct RemoteHandler {
    hostname: String,
    auth_handlers: Arc<AuthHandlers>,
    conn_events: mpsc::UnboundedSender<RemoteConnEvent>,
    agent_enabled: Arc<AtomicBool>,
}

impl client::Handler for RemoteHandler {
    type Error = RelayError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool> {
        self.auth_handlers
            .host_key_auth(&self.hostname, server_public_key)
            .await?;
        Ok(true)
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<client::Msg>,
        _session: &mut client::Session,
    ) -> Result<()> {
        if !self.agent_enabled.load(Ordering::SeqCst) {
            warn!("host opened an agent channel before forwarding was granted, closing it");
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
            return Ok(());
        }
        let _ = self
            .conn_events
            .send(RemoteConnEvent::AgentChannel(channel));
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<()> {
        let _ = self.conn_events.send(RemoteConnEvent::ForwardedTcpip {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        });
        Ok(())
    }
}

/// Dial the destination host and open the one session the bridge reuses
/// for the lifetime of the connection.
///
/// The forwarded agent is the sole credential: without it the dial fails
/// with `AccessDenied` before any TCP activity.
pub async fn connect_remote_session(
    dst: &NetAddr,
    system_login: &str,
    agent: Option<&ForwardedAgent>,
    auth_handlers: Arc<AuthHandlers>,
) -> Result<RemoteHandles> {
    let agent = agent.ok_or_else(|| {
        RelayError::AccessDenied("agent must be forwarded to the proxy".to_string())
    })?;

    debug!(%dst, login = system_login, "dialing downstream host");
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((dst.host.as_str(), dst.port)))
        .await
        .map_err(|_| RelayError::Timeout(format!("dialing {dst} timed out")))?
        .map_err(|e| RelayError::ConnectionFailed(format!("failed to dial {dst}: {e}")))?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {e}");
    }
    let stream = IdleTimeoutStream::new(stream, IDLE_TIMEOUT);

    let (conn_events_tx, conn_events_rx) = mpsc::unbounded_channel();
    let agent_enabled = Arc::new(AtomicBool::new(false));
    let handler = RemoteHandler {
        hostname: dst.host.clone(),
        auth_handlers,
        conn_events: conn_events_tx,
        agent_enabled: agent_enabled.clone(),
    };

    let config = Arc::new(client::Config {
        nodelay: true,
        ..Default::default()
    });
    let mut handle = tokio::time::timeout(DIAL_TIMEOUT, client::connect_stream(config, stream, handler))
        .await
        .map_err(|_| RelayError::Timeout(format!("SSH handshake with {dst} timed out")))??;

    authenticate_with_agent(&mut handle, system_login, agent).await?;
    info!(%dst, login = system_login, "downstream connection established");

    let channel = handle.channel_open_session().await?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = spawn_session_owner(channel, events_tx);
    let client = spawn_client_owner(handle, agent_enabled);

    Ok(RemoteHandles {
        client,
        session,
        events: events_rx,
        conn_events: conn_events_rx,
    })
}

/// Try every identity the agent offers, letting the agent sign the
/// handshake challenge for each until the host accepts one.
async fn authenticate_with_agent(
    handle: &mut Handle<RemoteHandler>,
    system_login: &str,
    agent: &ForwardedAgent,
) -> Result<()> {
    let mut agent_client = agent.client().await?;
    let identities = agent_client
        .request_identities()
        .await
        .map_err(|e| RelayError::Agent(format!("failed to list agent identities: {e}")))?;
    if identities.is_empty() {
        return Err(RelayError::Unauthorized(
            "forwarded agent holds no identities".to_string(),
        ));
    }

    for key in identities {
        let result = handle
            .authenticate_publickey_with(system_login, key, None, &mut agent_client)
            .await
            .map_err(|e| RelayError::Agent(format!("agent signing failed: {e}")))?;
        if result.success() {
            return Ok(());
        }
    }
    Err(RelayError::Unauthorized(format!(
        "host rejected every agent key for login {system_login:?}"
    )))
}

fn spawn_client_owner(
    handle: Handle<RemoteHandler>,
    agent_enabled: Arc<AtomicBool>,
) -> RemoteClient {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ClientCommand>(16);

    tokio::spawn(async move {
        let mut handle = handle;
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ClientCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle
                        .tcpip_forward(address.as_str(), port)
                        .await
                        .map_err(RelayError::from);
                    let _ = reply_tx.send(result);
                }
                ClientCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle
                        .cancel_tcpip_forward(address.as_str(), port)
                        .await
                        .map_err(RelayError::from);
                    let _ = reply_tx.send(result);
                }
                ClientCommand::Disconnect => break,
            }
        }

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "session ended", "en")
            .await;
        debug!("downstream client owner task terminated");
    });

    RemoteClient {
        cmd_tx,
        agent_enabled,
    }
}

fn spawn_session_owner(
    channel: Channel<client::Msg>,
    events_tx: mpsc::UnboundedSender<RemoteEvent>,
) -> RemoteSession {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(64);

    tokio::spawn(async move {
        let mut channel = channel;
        // Replies to want-reply requests arrive in request order.
        let mut pending_acks: VecDeque<oneshot::Sender<bool>> = VecDeque::new();

        loop {
            tokio::select! {
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            let _ = events_tx.send(RemoteEvent::Stdout(data.to_vec()));
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            let _ = events_tx.send(RemoteEvent::Stderr(data.to_vec()));
                        }
                        Some(ChannelMsg::ExtendedData { .. }) => {}
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            let _ = events_tx.send(RemoteEvent::ExitStatus(exit_status));
                        }
                        Some(ChannelMsg::Success) => {
                            if let Some(ack) = pending_acks.pop_front() {
                                let _ = ack.send(true);
                            }
                        }
                        Some(ChannelMsg::Failure) => {
                            if let Some(ack) = pending_acks.pop_front() {
                                let _ = ack.send(false);
                            }
                        }
                        Some(ChannelMsg::Eof) => {
                            let _ = events_tx.send(RemoteEvent::Eof);
                        }
                        Some(ChannelMsg::Close) | None => {
                            let _ = events_tx.send(RemoteEvent::Closed);
                            break;
                        }
                        Some(_) => {}
                    }
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let result = match cmd {
                        SessionCommand::Exec { command, reply_tx } => {
                            pending_acks.push_back(reply_tx);
                            channel.exec(true, command).await
                        }
                        SessionCommand::Shell { reply_tx } => {
                            pending_acks.push_back(reply_tx);
                            channel.request_shell(true).await
                        }
                        SessionCommand::RequestPty {
                            term,
                            col_width,
                            row_height,
                            modes,
                            reply_tx,
                        } => {
                            pending_acks.push_back(reply_tx);
                            channel
                                .request_pty(true, &term, col_width, row_height, 0, 0, &modes)
                                .await
                        }
                        SessionCommand::WindowChange {
                            col_width,
                            row_height,
                        } => channel.window_change(col_width, row_height, 0, 0).await,
                        SessionCommand::Setenv { name, value } => {
                            channel.set_env(false, name, value).await
                        }
                        SessionCommand::Subsystem { name, reply_tx } => {
                            pending_acks.push_back(reply_tx);
                            channel.request_subsystem(true, &name).await
                        }
                        SessionCommand::AgentForward { reply_tx } => {
                            pending_acks.push_back(reply_tx);
                            channel.agent_forward(true).await
                        }
                        SessionCommand::Data { data } => channel.data(&data[..]).await,
                        SessionCommand::Eof => channel.eof().await,
                        SessionCommand::Close => {
                            let _ = channel.close().await;
                            break;
                        }
                    };
                    if let Err(e) = result {
                        warn!("downstream session operation failed: {e}");
                        let _ = events_tx.send(RemoteEvent::Closed);
                        break;
                    }
                }
            }
        }

        // Unblock callers still waiting on a reply.
        for ack in pending_acks {
            let _ = ack.send(false);
        }
        debug!("downstream session owner task terminated");
    });

    RemoteSession { cmd_tx }
}
