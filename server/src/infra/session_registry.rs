//! Concurrent store of terminal sessions keyed by session id

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::domain::session::TerminalSession;
use crate::error::{Error, Result};

/// How long the reason a session ended stays visible to late attaches
const RETIRED_TTL: Duration = Duration::from_secs(300);

/// Why a session ended, kept after it leaves the registry
struct Retired {
    reason: Error,
    at: Instant,
}

/// Registry of terminal sessions
pub struct SessionRegistry {
    /// Map of session_id -> session
    sessions: DashMap<String, Arc<TerminalSession>>,
    /// Map of session_id -> end reason for recently failed sessions
    retired: DashMap<String, Retired>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            retired: DashMap::new(),
        }
    }

    /// Generate a fresh, collision-resistant session id
    pub fn generate_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Register a new pending session
    pub fn create(&self, id: &str) -> Result<Arc<TerminalSession>> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => Err(Error::SessionAlreadyExists(id.to_string())),
            Entry::Vacant(vacant) => {
                let session = Arc::new(TerminalSession::new(id));
                vacant.insert(session.clone());
                self.retired.remove(id);
                info!("Terminal session registered: {}", id);
                Ok(session)
            }
        }
    }

    /// Look up a session.
    ///
    /// A session that recently ended with an error reports that error
    /// instead of `SessionNotFound`.
    pub fn get(&self, id: &str) -> Result<Arc<TerminalSession>> {
        if let Some(entry) = self.sessions.get(id) {
            return Ok(entry.value().clone());
        }

        match self.retired.get(id) {
            Some(retired) if retired.at.elapsed() < RETIRED_TTL => Err(retired.reason.clone()),
            _ => Err(Error::SessionNotFound(id.to_string())),
        }
    }

    /// Remove a session and close it. Removing an absent id is a no-op.
    pub async fn delete(&self, id: &str) {
        // Guard is released before awaiting
        let removed = self.sessions.remove(id);

        if let Some((_, session)) = removed {
            let previous = session.status().await;
            session.close(None).await;
            let lifetime = Utc::now() - session.created_at();
            info!(
                "Terminal session removed: {} (was {}, lifetime {}s)",
                id,
                previous.as_str(),
                lifetime.num_seconds()
            );
        }
    }

    /// Remove a session that ended with `reason`, keeping the reason for
    /// clients that arrive afterwards
    pub async fn retire(&self, id: &str, reason: Error) {
        self.retired.retain(|_, retired| retired.at.elapsed() < RETIRED_TTL);

        if let Some(session) = self.sessions.get(id).map(|entry| entry.value().clone()) {
            session.close(Some(reason.clone())).await;
        }
        self.retired.insert(
            id.to_string(),
            Retired {
                reason,
                at: Instant::now(),
            },
        );
        self.delete(id).await;
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
