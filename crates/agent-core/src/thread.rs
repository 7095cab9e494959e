//! Conversation Threads
//!
//! Persisted, ordered message history for one conversation, and the store
//! contract the run controller loads from and appends to.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::identity::IdentityContext;
use crate::message::Message;

/// Unique conversation identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The caller a thread belongs to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadOwner {
    pub user_id: String,
    pub organization_id: Option<String>,
}

impl ThreadOwner {
    pub fn of(identity: &IdentityContext) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            organization_id: identity.organization_id.clone(),
        }
    }

    pub fn matches(&self, identity: &IdentityContext) -> bool {
        self.user_id == identity.user_id && self.organization_id == identity.organization_id
    }
}

/// A conversation and its append-only history
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: ConversationId,
    pub owner: ThreadOwner,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationThread {
    pub fn new(id: ConversationId, owner: ThreadOwner) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Thread store trait for persistence
///
/// Threads belong to the identity that created them. Loading or deleting a
/// thread owned by someone else reports `ThreadNotFound`, the same as a
/// missing thread.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Create an empty thread owned by `owner`
    async fn create_thread(&self, id: &ConversationId, owner: &IdentityContext) -> Result<()>;

    /// Load a thread's messages
    async fn load_thread(
        &self,
        id: &ConversationId,
        owner: &IdentityContext,
    ) -> Result<Vec<Message>>;

    /// Append messages in order
    async fn append_messages(&self, id: &ConversationId, messages: Vec<Message>) -> Result<()>;

    /// Delete a thread; deleting an unknown thread is a no-op
    async fn delete_thread(&self, id: &ConversationId, owner: &IdentityContext) -> Result<()>;
}

/// In-memory thread store (for development/testing)
#[derive(Default)]
pub struct MemoryThreadStore {
    threads: RwLock<HashMap<ConversationId, ConversationThread>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full thread record, including timestamps
    pub async fn get(&self, id: &ConversationId) -> Option<ConversationThread> {
        self.threads.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.threads.read().await.len()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn create_thread(&self, id: &ConversationId, owner: &IdentityContext) -> Result<()> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .entry(id.clone())
            .or_insert_with(|| ConversationThread::new(id.clone(), ThreadOwner::of(owner)));
        if thread.owner.matches(owner) {
            Ok(())
        } else {
            Err(AgentError::ThreadStore(format!(
                "conversation '{id}' already exists"
            )))
        }
    }

    async fn load_thread(
        &self,
        id: &ConversationId,
        owner: &IdentityContext,
    ) -> Result<Vec<Message>> {
        self.threads
            .read()
            .await
            .get(id)
            .filter(|t| t.owner.matches(owner))
            .map(|t| t.messages.clone())
            .ok_or_else(|| AgentError::ThreadNotFound(id.to_string()))
    }

    async fn append_messages(&self, id: &ConversationId, messages: Vec<Message>) -> Result<()> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(id)
            .ok_or_else(|| AgentError::ThreadNotFound(id.to_string()))?;
        thread.messages.extend(messages);
        thread.touch();
        Ok(())
    }

    async fn delete_thread(&self, id: &ConversationId, owner: &IdentityContext) -> Result<()> {
        let mut threads = self.threads.write().await;
        match threads.get(id) {
            None => Ok(()),
            Some(thread) if thread.owner.matches(owner) => {
                threads.remove(id);
                Ok(())
            }
            Some(_) => Err(AgentError::ThreadNotFound(id.to_string())),
        }
    }
}
