//! Subsystem dispatch
//!
//! Subsystem requests either name a remote subsystem (sftp and friends),
//! which is started on the downstream session with its stdio flowing
//! through the already-bridged channel, or the reserved resize-events
//! name, which subscribes the channel to the registry's terminal-size
//! feed instead of touching the downstream at all.

use tracing::debug;

use crate::bridge::context::{ActiveRequest, ServerContext, SubsystemResult};
use crate::error::{RelayError, Result};

/// Reserved subsystem name a web terminal uses to receive terminal-size
/// notifications. Carried as a subsystem request because SSH libraries
/// whitelist channel types; the wire name is kept for compatibility with
/// clients that knew it as a channel type.
pub const RESIZE_EVENTS_SUBSYSTEM: &str = "x-teleport-request-resize-events";

/// A subsystem to be run on the downstream session.
pub struct RemoteSubsystem {
    name: String,
}

/// Validate a subsystem request.
pub fn parse_subsystem_request(name: &str) -> Result<RemoteSubsystem> {
    if name.is_empty() {
        return Err(RelayError::BadParameter(
            "subsystem request is missing a name".to_string(),
        ));
    }
    Ok(RemoteSubsystem {
        name: name.to_string(),
    })
}

impl RemoteSubsystem {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the subsystem remotely. On failure the result is posted to
    /// the context immediately as well as returned, so the session loop
    /// winds down either way. On success the session handler posts the
    /// result when the remote side finishes.
    pub async fn start(&self, ctx: &ServerContext) -> Result<()> {
        debug!(name = %self.name, "starting remote subsystem");
        ctx.set_active(ActiveRequest::Subsystem(self.name.clone()));
        let accepted = match ctx.remote_session().subsystem(&self.name).await {
            Ok(accepted) => accepted,
            Err(e) => {
                ctx.send_subsystem_result(SubsystemResult {
                    name: self.name.clone(),
                    err: Some(RelayError::Protocol(e.to_string())),
                });
                return Err(e);
            }
        };
        if !accepted {
            let message = format!("remote host refused subsystem {:?}", self.name);
            ctx.send_subsystem_result(SubsystemResult {
                name: self.name.clone(),
                err: Some(RelayError::Protocol(message.clone())),
            });
            return Err(RelayError::Protocol(message));
        }
        Ok(())
    }
}
