//! Terminal request handlers
//!
//! The handlers for `exec`, `pty-req`, `shell`, and `window-change`. Each
//! is a thin translation onto the downstream session: the hard part —
//! where stdout goes, when exit-status is sent — lives in the session
//! channel handler, which watches the remote event stream.

use std::sync::Arc;

use russh::Pty;
use tracing::debug;

use crate::bridge::context::{ActiveRequest, ServerContext};
use crate::error::{RelayError, Result};
use crate::registry::{SessionRegistry, TermSize};

pub struct TermHandlers {
    registry: Arc<SessionRegistry>,
}

impl TermHandlers {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Start a remote command. Completion arrives later on the context's
    /// exec result channel.
    pub async fn handle_exec(&self, ctx: &ServerContext, command: &[u8]) -> Result<()> {
        let cmd_display = String::from_utf8_lossy(command).to_string();
        debug!(command = %cmd_display, "starting remote exec");
        ctx.set_active(ActiveRequest::Exec(cmd_display.clone()));
        if !ctx.remote_session().exec(command).await? {
            return Err(RelayError::Protocol(format!(
                "remote host refused to execute {cmd_display:?}"
            )));
        }
        Ok(())
    }

    /// Allocate a pseudo-terminal on the downstream session and record
    /// the initial size.
    pub async fn handle_pty_req(
        &self,
        ctx: &ServerContext,
        term: &str,
        col_width: u32,
        row_height: u32,
        modes: Vec<(Pty, u32)>,
    ) -> Result<()> {
        debug!(term, col_width, row_height, "requesting remote pty");
        if !ctx
            .remote_session()
            .request_pty(term, col_width, row_height, modes)
            .await?
        {
            return Err(RelayError::Protocol(
                "remote host refused the pty request".to_string(),
            ));
        }
        if let Some(session_id) = ctx.session_id() {
            self.registry
                .notify_resize(
                    &session_id,
                    TermSize {
                        cols: col_width,
                        rows: row_height,
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Start a remote shell.
    pub async fn handle_shell(&self, ctx: &ServerContext) -> Result<()> {
        debug!("starting remote shell");
        ctx.set_active(ActiveRequest::Shell);
        if !ctx.remote_session().shell().await? {
            return Err(RelayError::Protocol(
                "remote host refused the shell request".to_string(),
            ));
        }
        Ok(())
    }

    /// Propagate a terminal size change downstream and to resize
    /// subscribers.
    pub async fn handle_win_change(
        &self,
        ctx: &ServerContext,
        col_width: u32,
        row_height: u32,
    ) -> Result<()> {
        ctx.remote_session()
            .window_change(col_width, row_height)
            .await?;
        if let Some(session_id) = ctx.session_id() {
            self.registry
                .notify_resize(
                    &session_id,
                    TermSize {
                        cols: col_width,
                        rows: row_height,
                    },
                )
                .await;
        }
        Ok(())
    }
}
