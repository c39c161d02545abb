//! Per-session conversation isolation
//!
//! The map lock is only held to look up or insert an entry. Each conversation
//! has its own mutex, held by the caller for a whole turn, so sessions never
//! wait on each other.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::conversation::Conversation;

pub type SessionHandle = Arc<Mutex<Conversation>>;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    preamble: Option<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// New sessions start with this system preamble
    pub fn with_preamble(preamble: impl Into<String>) -> Self {
        Self {
            sessions: RwLock::default(),
            preamble: Some(preamble.into()),
        }
    }

    pub fn preamble(&self) -> Option<&str> {
        self.preamble.as_deref()
    }

    pub async fn get_or_create(&self, id: &str) -> SessionHandle {
        if let Some(handle) = self.sessions.read().await.get(id) {
            return Arc::clone(handle);
        }

        let mut sessions = self.sessions.write().await;
        let handle = sessions.entry(id.to_string()).or_insert_with(|| {
            tracing::info!(session = %id, "Creating session");
            let conversation = match &self.preamble {
                Some(preamble) => Conversation::new().with_preamble(preamble.clone()),
                None => Conversation::new(),
            };
            Arc::new(Mutex::new(conversation))
        });
        Arc::clone(handle)
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Forget a session. Returns false when there was nothing to remove.
    pub async fn clear(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            tracing::info!(session = %id, "Cleared session");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
