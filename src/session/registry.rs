// Concurrent session registry.
//
// Process-wide map of live sessions, walked by the reaper and diagnostics.
// Sessions are created on demand and removed exactly once, on terminate.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{OjpError, Result};

use super::{ConnHash, Session};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, client_uuid: Uuid, conn_hash: ConnHash, is_xa: bool) -> Arc<Session> {
        let session = Arc::new(Session::new(client_uuid, conn_hash, is_xa));
        self.sessions.insert(session.session_uuid(), Arc::clone(&session));
        session
    }

    pub fn get(&self, session_uuid: &Uuid) -> Result<Arc<Session>> {
        self.sessions
            .get(session_uuid)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| OjpError::StaleSession(session_uuid.to_string()))
    }

    pub fn lookup(&self, session_uuid: &Uuid) -> Option<Arc<Session>> {
        self.sessions.get(session_uuid).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, session_uuid: &Uuid) -> Option<Arc<Session>> {
        self.sessions.remove(session_uuid).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Sessions idle beyond `timeout`, as of this scan.
    pub fn stale_sessions(&self, timeout: Duration) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|s| s.value().idle_for() > timeout)
            .map(|s| Arc::clone(s.value()))
            .collect()
    }
}
