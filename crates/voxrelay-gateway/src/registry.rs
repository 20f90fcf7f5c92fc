//! Session registry.
//!
//! The only cross-session shared structure. Every operation takes the lock
//! for its whole duration, so create, lookup and remove are serialized. Only
//! lifecycle metadata lives here; each session's media and inference state
//! is owned by its pipeline task.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use voxrelay_core::error::{Result, VoxRelayError};
use voxrelay_core::session::{AuthKind, MediaParams, Session, SessionId};

struct Entry {
    session: Session,
    /// Cancels the session's pipeline and every stage link under it.
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct SessionRegistry {
    entries: Arc<RwLock<HashMap<SessionId, Entry>>>,
    max_sessions: usize,
}

fn fresh_id(taken: &HashMap<SessionId, Entry>) -> SessionId {
    let mut rng = rand::rng();
    loop {
        let candidate = SessionId(rng.random::<u32>());
        if candidate.0 != 0 && !taken.contains_key(&candidate) {
            return candidate;
        }
    }
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Register a new session in `Handshaking`.
    pub async fn create(
        &self,
        conn_id: &str,
        auth: AuthKind,
        params: MediaParams,
        cancel: CancellationToken,
    ) -> Result<Session> {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_sessions {
            return Err(VoxRelayError::Admission(format!(
                "session limit of {} reached",
                self.max_sessions
            )));
        }

        let id = fresh_id(&entries);
        let session = Session::new(id, conn_id.to_string(), auth, params);
        entries.insert(
            id,
            Entry {
                session: session.clone(),
                cancel,
            },
        );
        debug!(session_id = %id, conn_id, "Session registered");
        Ok(session)
    }

    pub async fn activate(&self, id: SessionId) -> Result<Session> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| VoxRelayError::Session(format!("unknown session {id}")))?;
        entry.session.activate()?;
        Ok(entry.session.clone())
    }

    pub async fn begin_drain(&self, id: SessionId) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| VoxRelayError::Session(format!("unknown session {id}")))?;
        entry.session.begin_drain()
    }

    pub async fn touch(&self, id: SessionId) {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.session.touch();
        }
    }

    pub async fn lookup(&self, id: SessionId) -> Option<Session> {
        self.entries.read().await.get(&id).map(|e| e.session.clone())
    }

    /// Deregister and cancel a session. Returns the closed session the first
    /// time, `None` on every later call.
    pub async fn remove(&self, id: SessionId) -> Option<Session> {
        let mut entry = self.entries.write().await.remove(&id)?;
        entry.cancel.cancel();
        entry.session.close();
        Some(entry.session)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Cancel every session. Each pipeline then runs its own teardown and
    /// deregisters itself.
    pub async fn shutdown_all(&self) -> usize {
        let entries = self.entries.read().await;
        for entry in entries.values() {
            entry.cancel.cancel();
        }
        if !entries.is_empty() {
            info!(sessions = entries.len(), "Cancelling all sessions");
        }
        entries.len()
    }
}
