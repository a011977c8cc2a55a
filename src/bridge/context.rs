//! Per-channel server context
//!
//! Each accepted `session` or `direct-tcpip` channel gets a context
//! scoping everything the handler may touch: the resolved login, the
//! downstream controllers, the forwarded agent, result channels, and the
//! closer set. Closing the context fires every registered closer exactly
//! once.
//!
//! The closer set is intentionally coarse: both channel kinds register
//! the upstream connection and the downstream session and client, so any
//! channel ending tears down the whole bridge. The bridge serves exactly
//! one end-user session, and its lifetime is that session's lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::agent::ForwardedAgent;
use crate::error::{RelayError, Result};
use crate::registry::SessionRegistry;
use crate::remote::{RemoteClient, RemoteSession};

/// Something that must be released exactly once at context teardown.
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close_resource(&self);
}

#[async_trait]
impl Closer for RemoteSession {
    async fn close_resource(&self) {
        self.close().await;
    }
}

#[async_trait]
impl Closer for RemoteClient {
    async fn close_resource(&self) {
        self.disconnect().await;
    }
}

/// Closer for the upstream SSH connection. Disconnecting it also EOFs
/// both halves of the in-memory pair, since the server side of the pipe
/// is owned by the connection's I/O task.
pub struct UpstreamConn {
    handle: russh::server::Handle,
}

impl UpstreamConn {
    pub fn new(handle: russh::server::Handle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Closer for UpstreamConn {
    async fn close_resource(&self) {
        let _ = self
            .handle
            .disconnect(
                russh::Disconnect::ByApplication,
                "session ended".to_string(),
                String::new(),
            )
            .await;
    }
}

/// Result of a finished remote exec, delivered on the context's exec
/// result channel.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub command: String,
    pub code: u32,
}

/// Result of a finished remote subsystem.
#[derive(Debug)]
pub struct SubsystemResult {
    pub name: String,
    pub err: Option<RelayError>,
}

/// What the session channel currently has running downstream.
#[derive(Debug, Clone)]
pub enum ActiveRequest {
    Exec(String),
    Shell,
    Subsystem(String),
}

struct SessionSlot {
    session_id: Option<String>,
    party_id: Option<String>,
}

pub struct ServerContext {
    /// Login resolved by the upstream auth handshake.
    pub login: String,
    /// The end user's address, as reported by the upstream connection.
    pub user_addr: String,
    /// The bridge-side address of the upstream connection.
    pub local_addr: String,

    remote_session: RemoteSession,
    remote_client: RemoteClient,
    agent: Option<ForwardedAgent>,
    registry: Arc<SessionRegistry>,

    slot: Mutex<SessionSlot>,
    env: Mutex<HashMap<String, String>>,
    active: Mutex<Option<ActiveRequest>>,

    exec_result_tx: mpsc::Sender<ExecResult>,
    exec_result_rx: Mutex<Option<mpsc::Receiver<ExecResult>>>,
    subsystem_result_tx: mpsc::Sender<SubsystemResult>,
    subsystem_result_rx: Mutex<Option<mpsc::Receiver<SubsystemResult>>>,

    closers: Mutex<Vec<Arc<dyn Closer>>>,
    closed: AtomicBool,
    exit_status_sent: AtomicBool,
}

impl ServerContext {
    pub fn new(
        login: String,
        user_addr: String,
        local_addr: String,
        remote_session: RemoteSession,
        remote_client: RemoteClient,
        agent: Option<ForwardedAgent>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let (exec_result_tx, exec_result_rx) = mpsc::channel(1);
        let (subsystem_result_tx, subsystem_result_rx) = mpsc::channel(1);
        Self {
            login,
            user_addr,
            local_addr,
            remote_session,
            remote_client,
            agent,
            registry,
            slot: Mutex::new(SessionSlot {
                session_id: None,
                party_id: None,
            }),
            env: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            exec_result_tx,
            exec_result_rx: Mutex::new(Some(exec_result_rx)),
            subsystem_result_tx,
            subsystem_result_rx: Mutex::new(Some(subsystem_result_rx)),
            closers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            exit_status_sent: AtomicBool::new(false),
        }
    }

    pub fn remote_session(&self) -> &RemoteSession {
        &self.remote_session
    }

    pub fn remote_client(&self) -> &RemoteClient {
        &self.remote_client
    }

    pub fn agent(&self) -> Option<&ForwardedAgent> {
        self.agent.as_ref()
    }

    pub fn add_closer(&self, closer: Arc<dyn Closer>) {
        self.closers.lock().push(closer);
    }

    /// Drop every registered closer without firing it. Used by channels
    /// whose end must not take the bridge with them (the resize feed).
    pub fn detach_closers(&self) {
        self.closers.lock().clear();
    }

    /// Record an environment variable requested by the client. Also used
    /// to pick up the session identifier a joining client advertises.
    pub fn set_env(&self, name: &str, value: &str) {
        self.env
            .lock()
            .insert(name.to_string(), value.to_string());
    }

    pub fn env(&self, name: &str) -> Option<String> {
        self.env.lock().get(name).cloned()
    }

    /// Attach this context to a session record, joining the session the
    /// client asked for or creating a fresh one. Idempotent.
    pub async fn create_or_join_session(&self) -> Result<String> {
        if let Some(id) = self.slot.lock().session_id.clone() {
            return Ok(id);
        }
        let requested = self.env(crate::registry::SESSION_ENV_VAR);
        let (session_id, party_id) = self
            .registry
            .create_or_join(requested.as_deref(), &self.login, &self.user_addr)
            .await?;
        let mut slot = self.slot.lock();
        slot.session_id = Some(session_id.clone());
        slot.party_id = Some(party_id);
        Ok(session_id)
    }

    pub fn session_id(&self) -> Option<String> {
        self.slot.lock().session_id.clone()
    }

    pub fn set_active(&self, request: ActiveRequest) {
        *self.active.lock() = Some(request);
    }

    pub fn active(&self) -> Option<ActiveRequest> {
        self.active.lock().clone()
    }

    /// Post an exec completion. The session handler relays it upstream as
    /// `exit-status` and closes the channel.
    pub fn send_exec_result(&self, result: ExecResult) {
        let _ = self.exec_result_tx.try_send(result);
    }

    pub fn send_subsystem_result(&self, result: SubsystemResult) {
        let _ = self.subsystem_result_tx.try_send(result);
    }

    pub fn take_exec_result_rx(&self) -> Option<mpsc::Receiver<ExecResult>> {
        self.exec_result_rx.lock().take()
    }

    pub fn take_subsystem_result_rx(&self) -> Option<mpsc::Receiver<SubsystemResult>> {
        self.subsystem_result_rx.lock().take()
    }

    /// `exit-status` must go out at most once per channel; first caller
    /// wins.
    pub fn may_send_exit_status(&self) -> bool {
        !self.exit_status_sent.swap(true, Ordering::SeqCst)
    }

    /// Release everything scoped to this context. Fires each registered
    /// closer exactly once across all calls.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (session_id, party_id) = {
            let slot = self.slot.lock();
            (slot.session_id.clone(), slot.party_id.clone())
        };
        if let (Some(sid), Some(pid)) = (session_id, party_id) {
            self.registry.leave(&sid, &pid).await;
        }
        let closers: Vec<_> = self.closers.lock().drain(..).collect();
        for closer in closers {
            closer.close_resource().await;
        }
        debug!(login = %self.login, "closed server context");
    }
}
