//! Forwarding bridge server
//!
//! An in-memory SSH server bound to one pre-accepted connection from the
//! recording proxy. It authenticates the user's certificate, dials the
//! destination host with the forwarded agent as the credential, and
//! bridges every channel and global request between the two, emitting
//! audit events along the way.
//!
//! ```ignore
//! let server = Arc::new(Server::new(config)?);
//! let conn = server.dial()?;             // use like a socket to the target
//! tokio::spawn(server.clone().serve());  // handshakes + dispatch
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::server;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn, Instrument};

use crate::addr::NetAddr;
use crate::agent::ForwardedAgent;
use crate::audit::{AuditEvent, AuditLog};
use crate::auth::AuthHandlers;
use crate::cluster::{AccessPoint, AuthClient, SessionService};
use crate::defaults::{COMPONENT_FORWARDING_NODE, FORWARDING_NODE_ID, NAMESPACE};
use crate::error::{RelayError, Result};
use crate::pipe::{dual_pipe, PipeConn};
use crate::registry::SessionRegistry;
use crate::remote::{connect_remote_session, RemoteClient, RemoteEvent, RemoteSession};
use crate::term::TermHandlers;

pub mod context;
mod handler;
mod session;
mod tcpip;

use context::{ServerContext, UpstreamConn};
use handler::BridgeHandler;

/// How long rejected clients get to observe channel-open failures before
/// a failed bridge disconnects them.
const REJECT_GRACE: Duration = Duration::from_secs(10);

/// Configuration for one forwarding bridge. All fields are required.
#[derive(Clone)]
pub struct ServerConfig {
    /// Audit sink, access point, and session service in one bundle.
    pub auth_client: Option<AuthClient>,
    /// The end user's forwarded authentication agent.
    pub user_agent: Option<ForwardedAgent>,
    /// Address of the client peer, `host:port`.
    pub source: String,
    /// Address of the target SSH server, `host:port`.
    pub destination: String,
    /// Cluster-issued signer presented to the client as this bridge's
    /// host key.
    pub host_certificate: Option<russh::keys::PrivateKey>,
}

impl ServerConfig {
    fn check(&self) -> Result<()> {
        if self.auth_client.is_none() {
            return Err(RelayError::BadParameter("auth client required".into()));
        }
        if self.user_agent.is_none() {
            return Err(RelayError::BadParameter(
                "user agent required to connect to remote host".into(),
            ));
        }
        if self.source.is_empty() {
            return Err(RelayError::BadParameter(
                "source address required to identify client".into(),
            ));
        }
        if self.destination.is_empty() {
            return Err(RelayError::BadParameter(
                "destination address required to connect to remote host".into(),
            ));
        }
        if self.host_certificate.is_none() {
            return Err(RelayError::BadParameter(
                "host certificate required to act on behalf of remote host".into(),
            ));
        }
        Ok(())
    }
}

/// State of the downstream dial, watched by the connection handler.
#[derive(Clone, Debug)]
enum DialState {
    Pending,
    Ready,
    Failed(String),
}

/// Controllers for the established downstream connection.
#[derive(Clone)]
pub(crate) struct RemoteShared {
    pub(crate) client: RemoteClient,
    pub(crate) session: RemoteSession,
}

/// A forwarding bridge serving exactly one upstream SSH connection.
pub struct Server {
    src_addr: NetAddr,
    dst_addr: NetAddr,

    server_conn: Mutex<Option<PipeConn>>,
    client_conn: Mutex<Option<PipeConn>>,

    agent: Option<ForwardedAgent>,
    host_certificate: russh::keys::PrivateKey,

    auth_handlers: Arc<AuthHandlers>,
    term_handlers: Arc<TermHandlers>,
    registry: Arc<SessionRegistry>,

    access_point: Arc<dyn AccessPoint>,
    audit_log: Arc<dyn AuditLog>,
    session_service: Arc<dyn SessionService>,

    remote_state: watch::Sender<DialState>,
    remote: Mutex<Option<RemoteShared>>,
    remote_events: Mutex<Option<mpsc::UnboundedReceiver<RemoteEvent>>>,

    served: AtomicBool,
}

impl Server {
    /// Build an unstarted bridge: validates the configuration and creates
    /// the in-memory pair, but performs no network activity and no
    /// handshake. Only [`Server::serve`] does.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.check()?;
        let auth_client = config.auth_client.expect("checked above");
        let agent = config.user_agent;
        let host_certificate = config.host_certificate.expect("checked above");

        let src_addr: NetAddr = config.source.parse()?;
        let dst_addr: NetAddr = config.destination.parse()?;
        let (server_conn, client_conn) = dual_pipe(src_addr.clone(), dst_addr.clone());

        let registry = Arc::new(SessionRegistry::new(
            NAMESPACE,
            auth_client.session_service.clone(),
            auth_client.audit_log.clone(),
        ));
        let auth_handlers = Arc::new(AuthHandlers::new(auth_client.access_point.clone()));
        let term_handlers = Arc::new(TermHandlers::new(registry.clone()));

        let (remote_state, _) = watch::channel(DialState::Pending);

        Ok(Self {
            src_addr,
            dst_addr,
            server_conn: Mutex::new(Some(server_conn)),
            client_conn: Mutex::new(Some(client_conn)),
            agent,
            host_certificate,
            auth_handlers,
            term_handlers,
            registry,
            access_point: auth_client.access_point,
            audit_log: auth_client.audit_log,
            session_service: auth_client.session_service,
            remote_state,
            remote: Mutex::new(None),
            remote_events: Mutex::new(None),
            served: AtomicBool::new(false),
        })
    }

    /// Forwarding bridges are not distinct nodes in the cluster
    /// inventory.
    pub fn id(&self) -> &'static str {
        FORWARDING_NODE_ID
    }

    pub fn namespace(&self) -> &'static str {
        NAMESPACE
    }

    pub fn component(&self) -> &'static str {
        COMPONENT_FORWARDING_NODE
    }

    /// The decision whether to read user environment files rests with
    /// the downstream host.
    pub fn permit_user_environment(&self) -> bool {
        false
    }

    /// Address of the remote host this bridge is connected to: the
    /// client pipe's remote address, which equals the destination.
    pub fn advertise_addr(&self) -> String {
        self.dst_addr.to_string()
    }

    pub fn audit_log(&self) -> Arc<dyn AuditLog> {
        self.audit_log.clone()
    }

    pub fn access_point(&self) -> Arc<dyn AccessPoint> {
        self.access_point.clone()
    }

    pub fn session_service(&self) -> Arc<dyn SessionService> {
        self.session_service.clone()
    }

    pub fn session_registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub(crate) fn auth_handlers(&self) -> Arc<AuthHandlers> {
        self.auth_handlers.clone()
    }

    pub(crate) fn term_handlers(&self) -> Arc<TermHandlers> {
        self.term_handlers.clone()
    }

    /// The client side of the in-memory pair. The proxy uses it as if it
    /// had dialed the destination host; may be taken once.
    pub fn dial(&self) -> Result<PipeConn> {
        self.client_conn
            .lock()
            .take()
            .ok_or_else(|| RelayError::BadParameter("bridge connection already dialed".into()))
    }

    pub(crate) async fn emit_audit_event(&self, event: AuditEvent) {
        if let Err(e) = self.audit_log.emit_audit_event(event).await {
            error!("failed to emit audit event: {e}");
        }
    }

    /// Block until the downstream dial settles. Returns the controllers
    /// on success; channel opens are rejected with the dial error
    /// otherwise.
    pub(crate) async fn wait_remote_ready(&self) -> Result<RemoteShared> {
        let mut rx = self.remote_state.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                DialState::Ready => {
                    return self
                        .remote
                        .lock()
                        .clone()
                        .ok_or(RelayError::Disconnected);
                }
                DialState::Failed(message) => {
                    return Err(RelayError::ConnectionFailed(message));
                }
                DialState::Pending => {
                    if rx.changed().await.is_err() {
                        return Err(RelayError::Disconnected);
                    }
                }
            }
        }
    }

    /// Downstream session output, consumed by the first session channel.
    pub(crate) fn take_remote_events(&self) -> Option<mpsc::UnboundedReceiver<RemoteEvent>> {
        self.remote_events.lock().take()
    }

    pub(crate) fn new_context(
        &self,
        login: String,
        remote_session: RemoteSession,
        remote_client: RemoteClient,
        upstream: server::Handle,
    ) -> ServerContext {
        let ctx = ServerContext::new(
            login,
            self.src_addr.to_string(),
            self.dst_addr.to_string(),
            remote_session.clone(),
            remote_client.clone(),
            self.agent.clone(),
            self.registry.clone(),
        );
        // Coarse on purpose: when any channel's context closes, the whole
        // bridge goes with it.
        ctx.add_closer(Arc::new(UpstreamConn::new(upstream)));
        ctx.add_closer(Arc::new(remote_session));
        ctx.add_closer(Arc::new(remote_client));
        ctx
    }

    /// Run the bridge: upstream server handshake, downstream dial under
    /// the authenticated login, then event dispatch until either side
    /// disconnects. Consumes the one upstream connection; calling it a
    /// second time is an error.
    pub async fn serve(self: Arc<Self>) {
        let span = tracing::info_span!(
            "forward",
            src = %self.src_addr,
            dst = %self.dst_addr,
        );
        self.serve_inner().instrument(span).await
    }

    async fn serve_inner(self: Arc<Self>) {
        if self.served.swap(true, Ordering::SeqCst) {
            warn!("serve called more than once, ignoring");
            return;
        }
        let Some(server_conn) = self.server_conn.lock().take() else {
            error!("bridge has no server connection");
            return;
        };

        let russh_config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![self.host_certificate.clone()],
            ..Default::default()
        });

        let (login_tx, login_rx) = oneshot::channel();
        let bridge_handler = BridgeHandler::new(self.clone(), login_tx);

        let mut running = match server::run_stream(russh_config, server_conn, bridge_handler).await
        {
            Ok(running) => running,
            Err(e) => {
                error!("unable to create server connection: {e}");
                drop(self.client_conn.lock().take());
                return;
            }
        };
        let upstream = running.handle();

        // The dispatch loop is already consuming the connection; wait for
        // the user to finish authenticating before dialing out as them.
        let login = tokio::select! {
            login = login_rx => match login {
                Ok(login) => login,
                Err(_) => {
                    // Auth never completed; wait out the handshake task.
                    let result = (&mut running).await;
                    info!("connection closed before authentication: {result:?}");
                    return;
                }
            },
            result = &mut running => {
                info!("connection closed during handshake: {result:?}");
                return;
            }
        };

        debug!(%login, "creating remote connection");
        match connect_remote_session(
            &self.dst_addr,
            &login,
            self.agent.as_ref(),
            self.auth_handlers.clone(),
        )
        .await
        {
            Ok(handles) => {
                *self.remote.lock() = Some(RemoteShared {
                    client: handles.client,
                    session: handles.session,
                });
                *self.remote_events.lock() = Some(handles.events);
                tcpip::spawn_conn_event_bridge(
                    handles.conn_events,
                    upstream.clone(),
                    self.agent.clone(),
                );
                let _ = self.remote_state.send(DialState::Ready);
            }
            Err(e) => {
                error!("unable to create remote connection: {e}");
                let _ = self.remote_state.send(DialState::Failed(e.to_string()));

                // Let the client observe channel-open rejections, then
                // drop the connection.
                tokio::select! {
                    result = &mut running => {
                        debug!("connection closed after failed dial: {result:?}");
                        return;
                    }
                    _ = tokio::time::sleep(REJECT_GRACE) => {
                        let _ = upstream
                            .disconnect(
                                russh::Disconnect::ByApplication,
                                "unable to connect to remote host".to_string(),
                                String::new(),
                            )
                            .await;
                    }
                }
                let result = (&mut running).await;
                debug!("connection closed after failed dial: {result:?}");
                return;
            }
        }

        // russh dispatches channel opens and requests to the handler from
        // here on; this future completes when the peer disconnects or a
        // context closer fires.
        let result = (&mut running).await;
        match result {
            Ok(()) => info!("connection closed"),
            Err(e) => info!("connection closed: {e}"),
        }

        let remote = self.remote.lock().clone();
        if let Some(remote) = remote {
            remote.session.close().await;
            remote.client.disconnect().await;
        }
    }
}
