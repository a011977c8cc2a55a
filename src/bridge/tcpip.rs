//! TCP channel bridging
//!
//! `direct-tcpip` channels dial their target straight from the bridge
//! host; `forwarded-tcpip` and agent channels opened by the downstream
//! are spliced onto their upstream counterparts. All of them reduce to
//! the same two concurrent copies: when one direction finishes, its
//! writer is shut down so EOF propagates, and the handler waits for the
//! other direction before returning.

use std::sync::Arc;

use russh::server::{self, Handle};
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::agent::ForwardedAgent;
use crate::audit::{self, AuditEvent};
use crate::bridge::context::ServerContext;
use crate::bridge::Server;
use crate::remote::RemoteConnEvent;

/// Copy bytes both ways until each direction has finished.
pub(crate) async fn join_streams<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let copied = tokio::io::copy(&mut a_read, &mut b_write).await.unwrap_or(0);
        let _ = b_write.shutdown().await;
        copied
    };
    let b_to_a = async {
        let copied = tokio::io::copy(&mut b_read, &mut a_write).await.unwrap_or(0);
        let _ = a_write.shutdown().await;
        copied
    };
    tokio::join!(a_to_b, b_to_a)
}

/// Handle one `direct-tcpip` channel: dial the target, emit the
/// port-forward audit event, bridge bytes, and tear the context down
/// when the forward ends.
pub(crate) async fn handle_direct_tcpip(
    server: Arc<Server>,
    ctx: Arc<ServerContext>,
    channel: Channel<server::Msg>,
    host: String,
    port: u32,
) {
    let addr = format!("{host}:{port}");
    info!(%addr, login = %ctx.login, "direct-tcpip channel opened");

    let conn = match TcpStream::connect(&addr).await {
        Ok(conn) => conn,
        Err(e) => {
            info!(%addr, "failed to connect port-forward target: {e}");
            let _ = channel.close().await;
            ctx.close().await;
            return;
        }
    };
    let _ = conn.set_nodelay(true);

    server
        .emit_audit_event(
            AuditEvent::new(audit::PORT_FORWARD_EVENT)
                .with(audit::PORT_FORWARD_ADDR, addr.clone())
                .with(audit::EVENT_LOGIN, ctx.login.clone())
                .with(audit::LOCAL_ADDR, ctx.local_addr.clone())
                .with(audit::REMOTE_ADDR, ctx.user_addr.clone()),
        )
        .await;

    let (sent, received) = join_streams(channel.into_stream(), conn).await;
    debug!(%addr, sent, received, "direct-tcpip channel finished");
    ctx.close().await;
}

/// Consume channels the downstream host opens back toward the user:
/// agent channels are spliced onto fresh agent streams, forwarded-tcpip
/// channels onto matching channels opened to the upstream client.
pub(crate) fn spawn_conn_event_bridge(
    mut conn_events: tokio::sync::mpsc::UnboundedReceiver<RemoteConnEvent>,
    upstream: Handle,
    agent: Option<ForwardedAgent>,
) {
    tokio::spawn(async move {
        while let Some(event) = conn_events.recv().await {
            match event {
                RemoteConnEvent::AgentChannel(channel) => {
                    let Some(agent) = agent.clone() else {
                        warn!("host opened an agent channel but no agent is forwarded");
                        tokio::spawn(async move {
                            let _ = channel.close().await;
                        });
                        continue;
                    };
                    tokio::spawn(async move {
                        match agent.stream().await {
                            Ok(stream) => {
                                debug!("serving forwarded agent to the host");
                                join_streams(channel.into_stream(), stream).await;
                            }
                            Err(e) => {
                                warn!("unable to reach the forwarded agent: {e}");
                                let _ = channel.close().await;
                            }
                        }
                    });
                }
                RemoteConnEvent::ForwardedTcpip {
                    channel,
                    connected_address,
                    connected_port,
                    originator_address,
                    originator_port,
                } => {
                    let upstream = upstream.clone();
                    tokio::spawn(async move {
                        match upstream
                            .channel_open_forwarded_tcpip(
                                connected_address.clone(),
                                connected_port,
                                originator_address,
                                originator_port,
                            )
                            .await
                        {
                            Ok(up_channel) => {
                                debug!(
                                    "bridging forwarded-tcpip connection for {connected_address}:{connected_port}"
                                );
                                join_streams(channel.into_stream(), up_channel.into_stream())
                                    .await;
                            }
                            Err(e) => {
                                warn!("unable to relay forwarded-tcpip channel upstream: {e}");
                                let _ = channel.close().await;
                            }
                        }
                    });
                }
            }
        }
        debug!("downstream channel bridge finished");
    });
}
