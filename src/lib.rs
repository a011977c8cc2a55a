//! Session-recording SSH forwarder
//!
//! An in-memory SSH server that terminates a single pre-accepted
//! connection from a trusted recording proxy, authenticates the user's
//! certificate against cluster policy, opens a second SSH connection to
//! the destination host using the user's forwarded agent as the
//! credential, and bridges every channel and request between them. The
//! point of sitting in the middle is observability: session traffic,
//! port-forward activity, and lifecycle events are all captured at the
//! bridge and handed to the cluster's audit log, without either endpoint
//! cooperating.
//!
//! The proxy drives a bridge like this:
//!
//! ```ignore
//! use std::sync::Arc;
//! use sshrelay::{Server, ServerConfig};
//!
//! let server = Arc::new(Server::new(ServerConfig {
//!     auth_client: Some(auth_client),
//!     user_agent: Some(agent),
//!     source: client_addr,
//!     destination: target_addr,
//!     host_certificate: Some(host_signer),
//! })?);
//!
//! // The client half of the in-memory pair behaves like a freshly
//! // dialed socket to the destination host.
//! let conn = server.dial()?;
//! tokio::spawn(server.clone().serve());
//! ```

pub mod addr;
pub mod agent;
pub mod audit;
pub mod auth;
pub mod bridge;
pub mod cluster;
pub mod defaults;
pub mod error;
pub mod idle;
pub mod pipe;
pub mod registry;
pub mod remote;
pub mod subsystem;
pub mod term;

pub use addr::NetAddr;
pub use agent::{AgentConnector, AgentStream, ForwardedAgent};
pub use audit::{AuditEvent, AuditLog};
pub use bridge::{Server, ServerConfig};
pub use cluster::{AccessPoint, AuthClient, Permissions, SessionService};
pub use error::{RelayError, Result};
pub use pipe::{dual_pipe, PipeConn};
pub use registry::SessionRegistry;
