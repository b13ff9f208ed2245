//! Session facts lookup: the read side the report executor depends on.

mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use playreport_ai::SessionFacts;
use playreport_core::SessionId;

pub use postgres::PostgresSessionFacts;

/// Loads the facts a report is generated from.
#[async_trait]
pub trait SessionFactsProvider: Send + Sync {
    /// `Ok(None)` when the session does not exist.
    async fn session_facts(
        &self,
        session_id: SessionId,
    ) -> Result<Option<SessionFacts>, SessionFactsError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionFactsError {
    #[error("session lookup failed: {0}")]
    Storage(String),
}

/// In-memory facts source for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySessionFacts {
    sessions: RwLock<HashMap<SessionId, SessionFacts>>,
}

impl InMemorySessionFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, facts: SessionFacts) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.insert(facts.session_id, facts);
    }
}

#[async_trait]
impl SessionFactsProvider for InMemorySessionFacts {
    async fn session_facts(
        &self,
        session_id: SessionId,
    ) -> Result<Option<SessionFacts>, SessionFactsError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| SessionFactsError::Storage("session map lock poisoned".to_string()))?;
        Ok(sessions.get(&session_id).cloned())
    }
}
