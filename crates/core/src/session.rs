//! Session storage boundary.
//!
//! Persistence lives outside the pipeline; the pipeline only reads a
//! snapshot and appends the new user turn once per turn.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::conversation::ConversationTurn;
use crate::domain::role::Role;
use crate::errors::SessionStoreError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub protocol_ids: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default = "all_roles")]
    pub enabled_roles: BTreeSet<Role>,
}

fn all_roles() -> BTreeSet<Role> {
    Role::ALL.into_iter().collect()
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<SessionSnapshot, SessionStoreError>;
    async fn append_turn(
        &self,
        session_id: &str,
        turn: ConversationTurn,
    ) -> Result<(), SessionStoreError>;
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, SessionSnapshot>>>,
}

impl InMemorySessionStore {
    pub fn insert(&self, snapshot: SessionSnapshot) {
        let mut sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.insert(snapshot.session_id.clone(), snapshot);
    }

    pub fn history(&self, session_id: &str) -> Option<Vec<ConversationTurn>> {
        let sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.get(session_id).map(|snapshot| snapshot.history.clone())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<SessionSnapshot, SessionStoreError> {
        let sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))
    }

    async fn append_turn(
        &self,
        session_id: &str,
        turn: ConversationTurn,
    ) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let snapshot = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionStoreError::NotFound(session_id.to_string()))?;
        snapshot.history.push(turn);
        Ok(())
    }
}
