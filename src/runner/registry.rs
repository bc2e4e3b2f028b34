//! Registry of in-flight sessions, keyed by request id.
//!
//! One mutex guards the whole map. Every critical section is a single
//! lookup, insert or delete; the lock is never held across an await.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::SessionControl;
use crate::sandbox::SandboxId;

/// What `stop` needs to reach a running session.
#[derive(Debug, Clone)]
pub(crate) struct ActiveSession {
    pub sandbox: SandboxId,
    pub control: Arc<SessionControl>,
    pub started_at: DateTime<Utc>,
    pub language: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, ActiveSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request_id: &str, session: ActiveSession) {
        self.lock().insert(request_id.to_string(), session);
    }

    /// A copy of the entry, so callers can await without holding the lock.
    pub fn get(&self, request_id: &str) -> Option<ActiveSession> {
        self.lock().get(request_id).cloned()
    }

    /// Remove an entry. Removing an absent id is a no-op.
    pub fn remove(&self, request_id: &str) -> Option<ActiveSession> {
        self.lock().remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveSession>> {
        // Entries stay consistent even if a holder panicked mid-operation
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
