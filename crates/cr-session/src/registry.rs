//! Concurrent session id to handle map.

use std::sync::Arc;

use cr_core::{Error, Result, SessionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Thread-safe registry of live sessions.
///
/// This map is the only state shared between sessions. Handles are cloned
/// out, so no shard lock is ever held across an await point.
pub struct SessionRegistry<H> {
    sessions: Arc<DashMap<SessionId, H>>,
}

impl<H> Clone for SessionRegistry<H> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<H> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }
}

impl<H: Clone> SessionRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle. Fails with [`Error::Conflict`] if `id` is taken.
    pub fn create(&self, id: SessionId, handle: H) -> Result<()> {
        match self.sessions.entry(id) {
            Entry::Occupied(_) => Err(Error::Conflict(format!("session {id} already exists"))),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                tracing::debug!(session_id = %id, "Registered session");
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Result<H> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found("session", id))
    }

    pub fn remove(&self, id: &SessionId) -> Result<H> {
        self.sessions
            .remove(id)
            .map(|(_, handle)| {
                tracing::debug!(session_id = %id, "Unregistered session");
                handle
            })
            .ok_or_else(|| Error::not_found("session", id))
    }

    /// Snapshot of every registered handle.
    pub fn list(&self) -> Vec<H> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
