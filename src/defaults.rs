//! Cluster-wide defaults shared by the forwarding bridge.

use std::time::Duration;

/// Upper bound on establishing the downstream TCP connection and handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// A downstream connection silent for this long is closed; in-flight
/// operations fail.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Exit code reported upstream when the remote command could not be run at
/// all (session setup failure, as opposed to a command's own exit code).
pub const REMOTE_COMMAND_FAILURE: u32 = 255;

/// Namespace forwarding nodes report membership in.
pub const NAMESPACE: &str = "default";

/// Component tag used in logs and audit events.
pub const COMPONENT_FORWARDING_NODE: &str = "forwarding-node";

/// Forwarding nodes are not distinct entries in the cluster inventory and
/// all share this identifier.
pub const FORWARDING_NODE_ID: &str = "0";

/// Buffer size of each direction of the in-memory connection pair.
pub const PIPE_BUFFER_SIZE: usize = 256 * 1024;
