//! Session channel handling
//!
//! Two halves cooperate per `session` channel:
//!
//! - request dispatch runs inside the connection's handler callbacks, so
//!   each request is answered (success/failure) before the next one is
//!   looked at;
//! - a pump task owns the upstream channel and multiplexes its data
//!   stream with the downstream session's output and the context's
//!   exec/subsystem result channels, sending `exit-status` and driving
//!   teardown when any of them finishes.

use std::sync::Arc;

use russh::server::{self, Handle};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Pty};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::context::{ActiveRequest, ExecResult, ServerContext, SubsystemResult};
use crate::bridge::Server;
use crate::defaults::REMOTE_COMMAND_FAILURE;
use crate::error::{RelayError, Result};
use crate::remote::RemoteEvent;
use crate::subsystem::{parse_subsystem_request, RESIZE_EVENTS_SUBSYSTEM};

/// A request relayed from a handler callback.
pub(crate) enum SessionRequest {
    Exec(Vec<u8>),
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    WindowChange {
        col_width: u32,
        row_height: u32,
    },
    Env {
        name: String,
        value: String,
    },
    Subsystem(String),
    AgentForward,
    Unsupported(&'static str),
}

/// Handle one session request and answer it. Any dispatch error is
/// reported to the client (stderr plus a failure reply) and winds the
/// bridge down, since the bridge serves a single user session.
pub(crate) async fn dispatch_request(
    server: &Arc<Server>,
    ctx: &Arc<ServerContext>,
    id: ChannelId,
    session: &mut server::Session,
    request: SessionRequest,
) {
    // The resize-events subscription never touches the downstream; wire
    // it straight to the registry. Its channel closing must not end the
    // user's session, so it gives up the coarse closer set.
    if let SessionRequest::Subsystem(name) = &request {
        if name == RESIZE_EVENTS_SUBSYSTEM {
            ctx.detach_closers();
            server
                .session_registry()
                .push_term_size_to_party(session.handle(), id);
            let _ = session.channel_success(id);
            return;
        }
    }

    match dispatch(server, ctx, request).await {
        Ok(()) => {
            let _ = session.channel_success(id);
        }
        Err(RelayError::Session(message)) => {
            // Session setup failed: tell the user, report a canonical
            // remote-command failure, and end the session.
            warn!(%message, "unable to set up session");
            let _ = session.extended_data(id, 1, CryptoVec::from_slice(message.as_bytes()));
            if ctx.may_send_exit_status() {
                let _ = session.exit_status_request(id, REMOTE_COMMAND_FAILURE);
            }
            let _ = session.close(id);
            spawn_context_close(ctx.clone());
        }
        Err(err) => {
            reply_error(session, id, &err);
            spawn_context_close(ctx.clone());
        }
    }
}

async fn dispatch(
    server: &Arc<Server>,
    ctx: &Arc<ServerContext>,
    request: SessionRequest,
) -> Result<()> {
    match request {
        SessionRequest::Exec(command) => {
            ensure_session(ctx).await?;
            server.term_handlers().handle_exec(ctx, &command).await
        }
        SessionRequest::Pty {
            term,
            col_width,
            row_height,
            modes,
        } => {
            server
                .term_handlers()
                .handle_pty_req(ctx, &term, col_width, row_height, modes)
                .await
        }
        SessionRequest::Shell => {
            ensure_session(ctx).await?;
            server.term_handlers().handle_shell(ctx).await
        }
        SessionRequest::WindowChange {
            col_width,
            row_height,
        } => {
            server
                .term_handlers()
                .handle_win_change(ctx, col_width, row_height)
                .await
        }
        SessionRequest::Env { name, value } => {
            ctx.set_env(&name, &value);
            // The downstream host decides whether to honor it; failures
            // are logged and dropped.
            if let Err(e) = ctx.remote_session().setenv(&name, &value).await {
                debug!(%name, "unable to set environment variable: {e}");
            }
            Ok(())
        }
        SessionRequest::Subsystem(name) => {
            ensure_session(ctx).await?;
            let subsystem = parse_subsystem_request(&name)?;
            subsystem.start(ctx).await
        }
        SessionRequest::AgentForward => {
            // Agent forwarding must never fail the session; OpenSSH
            // clients treat a failure here as fatal.
            if let Err(e) = handle_agent_forward(server, ctx).await {
                info!("agent forwarding not enabled: {e}");
            }
            Ok(())
        }
        SessionRequest::Unsupported(kind) => Err(RelayError::BadParameter(format!(
            "{} doesn't support request type '{kind}'",
            server.component()
        ))),
    }
}

async fn ensure_session(ctx: &Arc<ServerContext>) -> Result<()> {
    ctx.create_or_join_session()
        .await
        .map_err(|e| RelayError::Session(format!("unable to update context: {e}")))?;
    Ok(())
}

async fn handle_agent_forward(server: &Arc<Server>, ctx: &Arc<ServerContext>) -> Result<()> {
    server.auth_handlers().check_agent_forward(&ctx.login).await?;

    // Let the host open agent channels back through the bridge, then
    // advertise agent availability on the session.
    ctx.remote_client().enable_agent_forwarding();
    if !ctx.remote_session().request_agent_forward().await? {
        warn!("host ignored the agent forwarding advertisement");
    }
    Ok(())
}

/// Report an error to the client: human-readable text on stderr plus a
/// failure reply when one was requested.
pub(crate) fn reply_error(session: &mut server::Session, id: ChannelId, err: &RelayError) {
    warn!(channel = ?id, "session request failed: {err}");
    let message = err.to_string();
    let _ = session.extended_data(id, 1, CryptoVec::from_slice(message.as_bytes()));
    let _ = session.channel_failure(id);
}

fn spawn_context_close(ctx: Arc<ServerContext>) {
    tokio::spawn(async move {
        ctx.close().await;
    });
}

/// Pump task for one session channel. Multiplexes four sources and ends
/// the channel when any of them completes:
///
/// - the upstream channel itself (stdin data, EOF, close);
/// - the downstream session's output stream;
/// - the context's exec result channel (send `exit-status`, close);
/// - the context's subsystem result channel (close).
pub(crate) fn spawn_session_channel(
    ctx: Arc<ServerContext>,
    channel: Channel<server::Msg>,
    handle: Handle,
    remote_events: Option<mpsc::UnboundedReceiver<RemoteEvent>>,
) {
    tokio::spawn(async move {
        let id = channel.id();
        let mut channel = channel;

        let mut exec_result_rx = ctx.take_exec_result_rx();
        let mut subsystem_result_rx = ctx.take_subsystem_result_rx();
        // A second session channel on the same bridge has no downstream
        // output stream to consume; park on a never-closing placeholder.
        let (_events_guard, placeholder_rx) = mpsc::unbounded_channel();
        let mut remote_events = remote_events.unwrap_or(placeholder_rx);

        loop {
            tokio::select! {
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if ctx.remote_session().data(&data).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) => {
                            let _ = ctx.remote_session().eof().await;
                        }
                        Some(ChannelMsg::Close) | None => {
                            debug!("session channel closed by client");
                            break;
                        }
                        Some(_) => {}
                    }
                }
                event = remote_events.recv() => {
                    match event {
                        Some(RemoteEvent::Stdout(data)) => {
                            if handle.data(id, CryptoVec::from_slice(&data)).await.is_err() {
                                break;
                            }
                        }
                        Some(RemoteEvent::Stderr(data)) => {
                            if handle
                                .extended_data(id, 1, CryptoVec::from_slice(&data))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(RemoteEvent::ExitStatus(code)) => {
                            match ctx.active() {
                                Some(ActiveRequest::Exec(command)) => {
                                    ctx.send_exec_result(ExecResult { command, code });
                                }
                                Some(ActiveRequest::Shell) => {
                                    ctx.send_exec_result(ExecResult {
                                        command: String::new(),
                                        code,
                                    });
                                }
                                _ => {}
                            }
                        }
                        Some(RemoteEvent::Eof) => {
                            let _ = handle.eof(id).await;
                        }
                        Some(RemoteEvent::Closed) | None => {
                            if let Some(ActiveRequest::Subsystem(name)) = ctx.active() {
                                ctx.send_subsystem_result(SubsystemResult { name, err: None });
                                // Fall through: the subsystem branch ends
                                // the loop.
                                continue;
                            }
                            // An exit status that arrived just before the
                            // close must still reach the client.
                            if let Some(result) =
                                exec_result_rx.as_mut().and_then(|rx| rx.try_recv().ok())
                            {
                                if ctx.may_send_exit_status() {
                                    let _ = handle.exit_status_request(id, result.code).await;
                                }
                            }
                            break;
                        }
                    }
                }
                result = recv_exec_result(&mut exec_result_rx) => {
                    if let Some(result) = result {
                        debug!(command = %result.command, code = result.code, "exec complete");
                        if ctx.may_send_exit_status() {
                            let _ = handle.exit_status_request(id, result.code).await;
                        }
                    }
                    break;
                }
                result = recv_subsystem_result(&mut subsystem_result_rx) => {
                    if let Some(result) = result {
                        debug!(name = %result.name, err = ?result.err, "subsystem finished");
                    }
                    break;
                }
            }
        }

        let _ = handle.close(id).await;
        ctx.close().await;
        debug!("closed session channel handler");
    });
}

async fn recv_exec_result(rx: &mut Option<mpsc::Receiver<ExecResult>>) -> Option<ExecResult> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_subsystem_result(
    rx: &mut Option<mpsc::Receiver<SubsystemResult>>,
) -> Option<SubsystemResult> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
