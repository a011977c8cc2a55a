//! Cluster collaborator interfaces
//!
//! The bridge never decides identity or policy questions itself; it asks
//! the cluster through these traits. A single auth client object usually
//! implements all of them, bundled as [`AuthClient`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::keys::PublicKey;
use serde::{Deserialize, Serialize};

use crate::audit::AuditLog;
use crate::error::Result;

/// Permissions resolved for an authenticated user.
#[derive(Debug, Clone)]
pub struct Permissions {
    /// System login the user may assume on the destination host.
    pub login: String,
}

/// Read access to cluster identity and policy state.
///
/// Implementations may cache; the bridge calls these on every relevant
/// protocol event.
#[async_trait]
pub trait AccessPoint: Send + Sync {
    /// Certificate authorities trusted to sign end-user certificates.
    async fn user_certificate_authorities(&self) -> Result<Vec<PublicKey>>;

    /// Keys the cluster trusts for the given downstream host: keys of
    /// CA-issued host certificates and any directly-registered host keys.
    async fn trusted_host_keys(&self, hostname: &str) -> Result<Vec<PublicKey>>;

    /// Whether the given login's roles permit agent forwarding.
    async fn permit_agent_forward(&self, login: &str) -> Result<bool>;
}

/// A party attached to an interactive session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub id: String,
    pub user_addr: String,
    pub joined_at: DateTime<Utc>,
}

/// Metadata for one interactive session, mirrored to the cluster so other
/// proxies can list and join it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub namespace: String,
    pub login: String,
    pub parties: Vec<Party>,
}

/// Interactive session metadata service.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Create or update a session record.
    async fn upsert_session(&self, record: SessionRecord) -> Result<()>;

    /// Remove a session record once its last party has left.
    async fn remove_session(&self, namespace: &str, id: &str) -> Result<()>;
}

/// The capability bundle the recording proxy hands to the bridge: audit
/// sink, policy access point, and session service. Usually all three are
/// one auth client object.
#[derive(Clone)]
pub struct AuthClient {
    pub access_point: Arc<dyn AccessPoint>,
    pub audit_log: Arc<dyn AuditLog>,
    pub session_service: Arc<dyn SessionService>,
}

impl AuthClient {
    /// Bundle a single object implementing all three capabilities.
    pub fn from_single<C>(client: Arc<C>) -> Self
    where
        C: AccessPoint + AuditLog + SessionService + 'static,
    {
        Self {
            access_point: client.clone(),
            audit_log: client.clone(),
            session_service: client,
        }
    }
}
