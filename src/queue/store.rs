//! Queue storage interface and implementations
//!
//! This module defines the interface for persisting per-server queue documents,
//! with an in-memory implementation that also publishes change notifications.

use crate::error::{MatchmakingError, Result};
use crate::types::{ModeQueues, ServerId, ServerQueueState, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

/// What part of a server document a write touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Whole-document write: user commands, preferences, configuration
    Document,
    /// Queue-only write, as done by a matchmaking commit
    Queues,
}

/// Notification emitted after every successful write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueChange {
    pub server_id: ServerId,
    pub kind: ChangeKind,
}

/// Mutation applied by [`QueueStore::modify_queue`]
pub type QueueMutation<'a> = &'a mut (dyn FnMut(&mut ServerQueueState) -> Result<()> + Send);

/// Trait for queue document storage
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Load a server's queue document
    async fn load_queue(&self, server_id: &str) -> Result<Option<ServerQueueState>>;

    /// Store a whole server document, replacing any existing one
    async fn save_queue(&self, state: ServerQueueState) -> Result<()>;

    /// Replace only the queues of an existing document
    async fn save_queues(&self, server_id: &str, queues: ModeQueues) -> Result<()>;

    /// Apply a read-modify-write to one document atomically.
    ///
    /// A missing document is created with `server_name` before the mutation runs.
    /// Nothing is written when the mutation fails.
    async fn modify_queue(
        &self,
        server_id: &str,
        server_name: &str,
        mutation: QueueMutation<'_>,
    ) -> Result<ServerQueueState>;

    /// Remove every queue slot held by the given users, leaving the rest of the
    /// document untouched. Returns the number of slots removed.
    async fn remove_players(&self, server_id: &str, user_ids: &HashSet<UserId>) -> Result<usize>;

    /// Ids of every stored server
    async fn list_servers(&self) -> Result<Vec<ServerId>>;

    /// Subscribe to write notifications
    fn subscribe(&self) -> broadcast::Receiver<QueueChange>;
}

/// In-memory queue storage implementation
#[derive(Debug)]
pub struct InMemoryQueueStore {
    documents: RwLock<HashMap<ServerId, ServerQueueState>>,
    changes: broadcast::Sender<QueueChange>,
}

impl InMemoryQueueStore {
    /// Create a new in-memory store whose change channel buffers `capacity` notifications
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            documents: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn notify(&self, server_id: &str, kind: ChangeKind) {
        // No subscribers is fine
        let _ = self.changes.send(QueueChange {
            server_id: server_id.to_string(),
            kind,
        });
    }

    fn lock_error(operation: &str) -> MatchmakingError {
        MatchmakingError::InternalError {
            message: format!("Failed to acquire queue store {} lock", operation),
        }
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn load_queue(&self, server_id: &str) -> Result<Option<ServerQueueState>> {
        let documents = self
            .documents
            .read()
            .map_err(|_| Self::lock_error("read"))?;

        Ok(documents.get(server_id).cloned())
    }

    async fn save_queue(&self, state: ServerQueueState) -> Result<()> {
        let server_id = state.server_id.clone();
        {
            let mut documents = self
                .documents
                .write()
                .map_err(|_| Self::lock_error("write"))?;
            documents.insert(server_id.clone(), state);
        }

        debug!("Saved queue document for server {}", server_id);
        self.notify(&server_id, ChangeKind::Document);
        Ok(())
    }

    async fn save_queues(&self, server_id: &str, queues: ModeQueues) -> Result<()> {
        {
            let mut documents = self
                .documents
                .write()
                .map_err(|_| Self::lock_error("write"))?;
            let document =
                documents
                    .get_mut(server_id)
                    .ok_or_else(|| MatchmakingError::ServerNotFound {
                        server_id: server_id.to_string(),
                    })?;
            document.queues = queues;
        }

        self.notify(server_id, ChangeKind::Queues);
        Ok(())
    }

    async fn modify_queue(
        &self,
        server_id: &str,
        server_name: &str,
        mutation: QueueMutation<'_>,
    ) -> Result<ServerQueueState> {
        let updated = {
            let mut documents = self
                .documents
                .write()
                .map_err(|_| Self::lock_error("write"))?;

            let mut working = documents
                .get(server_id)
                .cloned()
                .unwrap_or_else(|| ServerQueueState::new(server_id, server_name));
            mutation(&mut working)?;
            documents.insert(server_id.to_string(), working.clone());
            working
        };

        self.notify(server_id, ChangeKind::Document);
        Ok(updated)
    }

    async fn remove_players(&self, server_id: &str, user_ids: &HashSet<UserId>) -> Result<usize> {
        if user_ids.is_empty() {
            return Ok(0);
        }

        let removed = {
            let mut documents = self
                .documents
                .write()
                .map_err(|_| Self::lock_error("write"))?;
            match documents.get_mut(server_id) {
                Some(document) => document.queues.remove_users(user_ids),
                None => {
                    return Err(MatchmakingError::ServerNotFound {
                        server_id: server_id.to_string(),
                    }
                    .into())
                }
            }
        };

        if removed > 0 {
            self.notify(server_id, ChangeKind::Queues);
        }
        Ok(removed)
    }

    async fn list_servers(&self) -> Result<Vec<ServerId>> {
        let documents = self
            .documents
            .read()
            .map_err(|_| Self::lock_error("read"))?;

        let mut servers: Vec<ServerId> = documents.keys().cloned().collect();
        servers.sort();
        Ok(servers)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueChange> {
        self.changes.subscribe()
    }
}
