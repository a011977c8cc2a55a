//! Session registry
//!
//! Tracks the interactive sessions served by this bridge, the parties
//! joined to them, and the latest terminal size of each. Membership is
//! mirrored to the cluster's session service so other proxies can list
//! and join, and size changes are fanned out to subscribed parties (the
//! web terminal's resize feed).

use std::sync::Arc;

use dashmap::DashMap;
use russh::server;
use russh::{ChannelId, CryptoVec};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEvent, AuditLog};
use crate::cluster::{Party, SessionRecord, SessionService};
use crate::error::{RelayError, Result};

/// Environment variable a joining client uses to name the session it
/// wants to attach to.
pub const SESSION_ENV_VAR: &str = "TELEPORT_SESSION";

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u32,
    pub rows: u32,
}

impl std::fmt::Display for TermSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.cols, self.rows)
    }
}

/// One frame of the resize feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeNotification {
    pub event: String,
    pub session_id: String,
    pub width: u32,
    pub height: u32,
}

struct SessionEntry {
    login: String,
    parties: Vec<Party>,
    size: Option<TermSize>,
}

pub struct SessionRegistry {
    namespace: String,
    sessions: DashMap<String, SessionEntry>,
    session_service: Arc<dyn SessionService>,
    audit_log: Arc<dyn AuditLog>,
    resize_tx: broadcast::Sender<ResizeNotification>,
}

impl SessionRegistry {
    pub fn new(
        namespace: impl Into<String>,
        session_service: Arc<dyn SessionService>,
        audit_log: Arc<dyn AuditLog>,
    ) -> Self {
        let (resize_tx, _) = broadcast::channel(64);
        Self {
            namespace: namespace.into(),
            sessions: DashMap::new(),
            session_service,
            audit_log,
            resize_tx,
        }
    }

    /// Join the requested session if it exists on this bridge, otherwise
    /// create a new one. Returns `(session id, party id)`.
    pub async fn create_or_join(
        &self,
        requested: Option<&str>,
        login: &str,
        user_addr: &str,
    ) -> Result<(String, String)> {
        let party = Party {
            id: Uuid::new_v4().to_string(),
            user_addr: user_addr.to_string(),
            joined_at: chrono::Utc::now(),
        };
        let party_id = party.id.clone();

        let (session_id, joined) = match requested {
            Some(id) if self.sessions.contains_key(id) => {
                let mut entry = self
                    .sessions
                    .get_mut(id)
                    .ok_or_else(|| RelayError::Session(format!("session {id} disappeared")))?;
                entry.parties.push(party);
                (id.to_string(), true)
            }
            _ => {
                let id = requested
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                self.sessions.insert(
                    id.clone(),
                    SessionEntry {
                        login: login.to_string(),
                        parties: vec![party],
                        size: None,
                    },
                );
                (id, false)
            }
        };

        self.mirror(&session_id).await?;

        let kind = if joined {
            audit::SESSION_JOIN_EVENT
        } else {
            audit::SESSION_START_EVENT
        };
        self.emit(
            AuditEvent::new(kind)
                .with(audit::SESSION_ID, session_id.clone())
                .with(audit::EVENT_LOGIN, login)
                .with(audit::REMOTE_ADDR, user_addr),
        )
        .await;

        debug!(session = %session_id, login, joined, "party attached to session");
        Ok((session_id, party_id))
    }

    /// Detach a party; ends and unregisters the session when the last
    /// party leaves.
    pub async fn leave(&self, session_id: &str, party_id: &str) {
        let (emptied, login) = match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.parties.retain(|p| p.id != party_id);
                (entry.parties.is_empty(), entry.login.clone())
            }
            None => return,
        };

        if emptied {
            self.sessions.remove(session_id);
            if let Err(e) = self
                .session_service
                .remove_session(&self.namespace, session_id)
                .await
            {
                warn!(session = %session_id, "failed to unregister session: {e}");
            }
            self.emit(
                AuditEvent::new(audit::SESSION_END_EVENT)
                    .with(audit::SESSION_ID, session_id)
                    .with(audit::EVENT_LOGIN, login),
            )
            .await;
        } else if let Err(e) = self.mirror(session_id).await {
            warn!(session = %session_id, "failed to update session record: {e}");
        }
    }

    /// Record a new terminal size for the session and fan it out to
    /// resize subscribers.
    pub async fn notify_resize(&self, session_id: &str, size: TermSize) {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => entry.size = Some(size),
            None => {
                debug!(session = %session_id, "resize for unknown session");
                return;
            }
        }
        let _ = self.resize_tx.send(ResizeNotification {
            event: "resize".to_string(),
            session_id: session_id.to_string(),
            width: size.cols,
            height: size.rows,
        });
        self.emit(
            AuditEvent::new(audit::RESIZE_EVENT)
                .with(audit::SESSION_ID, session_id)
                .with(audit::TERMINAL_SIZE, size.to_string()),
        )
        .await;
    }

    /// Latest known size of a session.
    pub fn term_size(&self, session_id: &str) -> Option<TermSize> {
        self.sessions.get(session_id).and_then(|entry| entry.size)
    }

    pub fn subscribe_term_sizes(&self) -> broadcast::Receiver<ResizeNotification> {
        self.resize_tx.subscribe()
    }

    /// Serve the resize feed to a party over its dedicated channel: one
    /// newline-delimited JSON frame per size change, preceded by a frame
    /// for every size already known. Runs until the channel or the feed
    /// closes.
    pub fn push_term_size_to_party(self: &Arc<Self>, handle: server::Handle, id: ChannelId) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut feed = registry.subscribe_term_sizes();

            let known: Vec<ResizeNotification> = registry
                .sessions
                .iter()
                .filter_map(|entry| {
                    entry.value().size.map(|size| ResizeNotification {
                        event: "resize".to_string(),
                        session_id: entry.key().clone(),
                        width: size.cols,
                        height: size.rows,
                    })
                })
                .collect();
            for frame in known {
                if push_frame(&handle, id, &frame).await.is_err() {
                    return;
                }
            }

            loop {
                match feed.recv().await {
                    Ok(frame) => {
                        if push_frame(&handle, id, &frame).await.is_err() {
                            debug!("resize subscriber went away");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "resize subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = handle.close(id).await;
                        return;
                    }
                }
            }
        });
    }

    async fn mirror(&self, session_id: &str) -> Result<()> {
        let record = match self.sessions.get(session_id) {
            Some(entry) => SessionRecord {
                id: session_id.to_string(),
                namespace: self.namespace.clone(),
                login: entry.login.clone(),
                parties: entry.parties.clone(),
            },
            None => return Ok(()),
        };
        self.session_service.upsert_session(record).await
    }

    async fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.audit_log.emit_audit_event(event).await {
            warn!("failed to emit audit event: {e}");
        }
    }
}

async fn push_frame(
    handle: &server::Handle,
    id: ChannelId,
    frame: &ResizeNotification,
) -> std::result::Result<(), ()> {
    let mut payload = serde_json::to_vec(frame).map_err(|_| ())?;
    payload.push(b'\n');
    handle
        .data(id, CryptoVec::from_slice(&payload))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        records: Mutex<Vec<SessionRecord>>,
        removed: Mutex<Vec<String>>,
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl SessionService for RecordingBackend {
        async fn upsert_session(&self, record: SessionRecord) -> Result<()> {
            self.records.lock().push(record);
            Ok(())
        }

        async fn remove_session(&self, _namespace: &str, id: &str) -> Result<()> {
            self.removed.lock().push(id.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl AuditLog for RecordingBackend {
        async fn emit_audit_event(&self, event: AuditEvent) -> Result<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    fn registry() -> (Arc<SessionRegistry>, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        let registry = Arc::new(SessionRegistry::new(
            "default",
            backend.clone(),
            backend.clone(),
        ));
        (registry, backend)
    }

    #[tokio::test]
    async fn create_then_join_then_leave() {
        let (registry, backend) = registry();

        let (sid, party_a) = registry
            .create_or_join(None, "alice", "10.0.0.1:40000")
            .await
            .unwrap();
        let (sid_b, party_b) = registry
            .create_or_join(Some(&sid), "alice", "10.0.0.2:40001")
            .await
            .unwrap();
        assert_eq!(sid, sid_b);
        assert_ne!(party_a, party_b);

        let kinds: Vec<String> = backend
            .events
            .lock()
            .iter()
            .map(|e| e.kind.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                audit::SESSION_START_EVENT.to_string(),
                audit::SESSION_JOIN_EVENT.to_string()
            ]
        );

        registry.leave(&sid, &party_a).await;
        assert!(backend.removed.lock().is_empty());
        registry.leave(&sid, &party_b).await;
        assert_eq!(backend.removed.lock().as_slice(), &[sid.clone()]);

        let last = backend.events.lock().last().unwrap().kind.clone();
        assert_eq!(last, audit::SESSION_END_EVENT);
    }

    #[tokio::test]
    async fn unknown_requested_session_creates_it() {
        let (registry, _backend) = registry();
        let (sid, _) = registry
            .create_or_join(Some("55e2f3a0-aaaa-bbbb-cccc-000000000000"), "alice", "a:1")
            .await
            .unwrap();
        assert_eq!(sid, "55e2f3a0-aaaa-bbbb-cccc-000000000000");
    }

    #[tokio::test]
    async fn resize_updates_subscribers_and_state() {
        let (registry, backend) = registry();
        let (sid, _) = registry
            .create_or_join(None, "alice", "a:1")
            .await
            .unwrap();

        let mut feed = registry.subscribe_term_sizes();
        registry
            .notify_resize(&sid, TermSize { cols: 120, rows: 40 })
            .await;

        let frame = feed.recv().await.unwrap();
        assert_eq!(frame.session_id, sid);
        assert_eq!(frame.width, 120);
        assert_eq!(frame.height, 40);
        assert_eq!(
            registry.term_size(&sid),
            Some(TermSize { cols: 120, rows: 40 })
        );

        let resize = backend
            .events
            .lock()
            .iter()
            .find(|e| e.kind == audit::RESIZE_EVENT)
            .cloned()
            .unwrap();
        assert_eq!(resize.fields[audit::TERMINAL_SIZE], "120:40");
    }
}
