//! Upstream connection handler
//!
//! Implements the server side of the bridge: certificate authentication
//! through the auth handlers, the channel-type whitelist, request
//! relaying into per-channel contexts, and global request forwarding to
//! the downstream connection.

use std::collections::HashMap;
use std::sync::Arc;

use russh::keys::ssh_key::Certificate;
use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bridge::context::ServerContext;
use crate::bridge::session::{dispatch_request, spawn_session_channel, SessionRequest};
use crate::bridge::{tcpip, Server};
use crate::error::{RelayError, Result};

pub(crate) struct BridgeHandler {
    server: Arc<Server>,
    login: Option<String>,
    login_tx: Option<oneshot::Sender<String>>,
    contexts: HashMap<ChannelId, Arc<ServerContext>>,
}

impl BridgeHandler {
    pub(crate) fn new(server: Arc<Server>, login_tx: oneshot::Sender<String>) -> Self {
        Self {
            server,
            login: None,
            login_tx: Some(login_tx),
            contexts: HashMap::new(),
        }
    }

    /// Build the per-channel context once the downstream is up; answers
    /// `None` (reject the channel) while the downstream is unavailable.
    async fn open_context(&mut self, session: &mut Session) -> Option<Arc<ServerContext>> {
        let login = match &self.login {
            Some(login) => login.clone(),
            None => {
                warn!("channel open before authentication completed");
                return None;
            }
        };
        let remote = match self.server.wait_remote_ready().await {
            Ok(remote) => remote,
            Err(e) => {
                info!("rejecting channel open: {e}");
                return None;
            }
        };
        let ctx = Arc::new(self.server.new_context(
            login,
            remote.session.clone(),
            remote.client.clone(),
            session.handle(),
        ));
        Some(ctx)
    }

    async fn dispatch(
        &mut self,
        id: ChannelId,
        session: &mut Session,
        request: SessionRequest,
    ) {
        let Some(ctx) = self.contexts.get(&id).cloned() else {
            debug!(channel = ?id, "request on a channel with no session context");
            let _ = session.channel_failure(id);
            return;
        };
        let server = self.server.clone();
        dispatch_request(&server, &ctx, id, session, request).await;
    }
}

impl server::Handler for BridgeHandler {
    type Error = RelayError;

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth> {
        match self
            .server
            .auth_handlers()
            .user_key_auth(user, certificate)
            .await
        {
            Ok(permissions) => {
                self.login = Some(permissions.login);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(user, "rejecting user certificate: {e}");
                Ok(Auth::reject())
            }
        }
    }

    async fn auth_publickey(&mut self, user: &str, _key: &PublicKey) -> Result<Auth> {
        // Only cluster-issued certificates authenticate users; a bare
        // public key carries no identity the access point can resolve.
        warn!(user, "rejecting bare public key: certificate required");
        Ok(Auth::reject())
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<()> {
        if let (Some(login), Some(tx)) = (self.login.clone(), self.login_tx.take()) {
            let _ = tx.send(login);
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool> {
        let Some(ctx) = self.open_context(session).await else {
            return Ok(false);
        };
        debug!(channel = ?channel.id(), "session channel opened");
        self.contexts.insert(channel.id(), ctx.clone());
        let remote_events = self.server.take_remote_events();
        spawn_session_channel(ctx, channel, session.handle(), remote_events);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool> {
        let Some(ctx) = self.open_context(session).await else {
            return Ok(false);
        };
        debug!(
            "direct-tcpip channel to {host_to_connect}:{port_to_connect} from {originator_address}:{originator_port}"
        );
        tokio::spawn(tcpip::handle_direct_tcpip(
            self.server.clone(),
            ctx,
            channel,
            host_to_connect.to_string(),
            port_to_connect,
        ));
        Ok(true)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        info!(
            "rejecting x11 channel from {originator_address}:{originator_port}: unsupported channel type"
        );
        Ok(false)
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        _channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool> {
        info!("rejecting direct-streamlocal channel to {socket_path:?}: unsupported channel type");
        Ok(false)
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        self.contexts.remove(&channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let request = SessionRequest::Exec(data.to_vec());
        self.dispatch(channel, session, request).await;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<()> {
        let request = SessionRequest::Pty {
            term: term.to_string(),
            col_width,
            row_height,
            modes: modes.to_vec(),
        };
        self.dispatch(channel, session, request).await;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        self.dispatch(channel, session, SessionRequest::Shell).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<()> {
        let request = SessionRequest::WindowChange {
            col_width,
            row_height,
        };
        self.dispatch(channel, session, request).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<()> {
        let request = SessionRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.dispatch(channel, session, request).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        let request = SessionRequest::Subsystem(name.to_string());
        self.dispatch(channel, session, request).await;
        Ok(())
    }

    async fn agent_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<bool> {
        self.dispatch(channel, session, SessionRequest::AgentForward)
            .await;
        Ok(true)
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<()> {
        debug!(?signal, "unsupported signal request");
        self.dispatch(channel, session, SessionRequest::Unsupported("signal"))
            .await;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<()> {
        self.dispatch(channel, session, SessionRequest::Unsupported("x11-req"))
            .await;
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool> {
        let remote = match self.server.wait_remote_ready().await {
            Ok(remote) => remote,
            Err(e) => {
                info!("rejecting tcpip-forward: {e}");
                return Ok(false);
            }
        };
        match remote.client.tcpip_forward(address, *port).await {
            Ok(bound_port) => {
                debug!(address, requested = *port, bound_port, "forwarded tcpip-forward");
                *port = bound_port;
                Ok(true)
            }
            Err(e) => {
                warn!("failed to forward tcpip-forward request: {e}");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        let remote = match self.server.wait_remote_ready().await {
            Ok(remote) => remote,
            Err(e) => {
                info!("rejecting cancel-tcpip-forward: {e}");
                return Ok(false);
            }
        };
        match remote.client.cancel_tcpip_forward(address, port).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("failed to forward cancel-tcpip-forward request: {e}");
                Ok(false)
            }
        }
    }
}
