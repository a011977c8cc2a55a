//! Authentication handlers
//!
//! Three checks used by the two handshakes: the upstream user's
//! certificate (server role), the downstream host's key (client role), and
//! the agent-forwarding policy. The handlers carry no per-connection
//! state; identity and policy live behind the [`AccessPoint`].

use std::sync::Arc;

use russh::keys::ssh_key::certificate::{CertType, Certificate};
use russh::keys::{HashAlg, PublicKey};
use tracing::{debug, warn};

use crate::cluster::{AccessPoint, Permissions};
use crate::error::{RelayError, Result};

pub struct AuthHandlers {
    access_point: Arc<dyn AccessPoint>,
}

impl AuthHandlers {
    pub fn new(access_point: Arc<dyn AccessPoint>) -> Self {
        Self { access_point }
    }

    /// Validate the certificate an upstream user authenticated with and
    /// resolve the login it grants. Used by the upstream server handshake.
    pub async fn user_key_auth(&self, login: &str, cert: &Certificate) -> Result<Permissions> {
        if cert.cert_type() != CertType::User {
            return Err(RelayError::Unauthorized(format!(
                "certificate for {login:?} is not a user certificate"
            )));
        }

        let authorities = self.access_point.user_certificate_authorities().await?;
        let fingerprints: Vec<_> = authorities
            .iter()
            .map(|ca| ca.fingerprint(HashAlg::Sha256))
            .collect();
        cert.validate(&fingerprints).map_err(|e| {
            RelayError::Unauthorized(format!("certificate for {login:?} is not valid: {e}"))
        })?;

        if !cert.valid_principals().iter().any(|p| p == login) {
            return Err(RelayError::Unauthorized(format!(
                "certificate does not permit login as {login:?}"
            )));
        }

        debug!(login, key_id = cert.key_id(), "user certificate accepted");
        Ok(Permissions {
            login: login.to_string(),
        })
    }

    /// Validate the key presented by the downstream host against cluster
    /// trust. Used by the downstream client handshake.
    pub async fn host_key_auth(&self, hostname: &str, presented: &PublicKey) -> Result<()> {
        let trusted = self.access_point.trusted_host_keys(hostname).await?;
        let fingerprint = presented.fingerprint(HashAlg::Sha256);
        if trusted
            .iter()
            .any(|key| key.fingerprint(HashAlg::Sha256) == fingerprint)
        {
            debug!(%hostname, %fingerprint, "host key accepted");
            return Ok(());
        }
        warn!(%hostname, %fingerprint, "host presented an untrusted key");
        Err(RelayError::HostKey(format!(
            "host {hostname} presented untrusted key {fingerprint}"
        )))
    }

    /// Check whether the resolved login's roles allow agent forwarding.
    pub async fn check_agent_forward(&self, login: &str) -> Result<()> {
        if self.access_point.permit_agent_forward(login).await? {
            Ok(())
        } else {
            Err(RelayError::AccessDenied(format!(
                "agent forwarding is not permitted for {login:?}"
            )))
        }
    }
}
