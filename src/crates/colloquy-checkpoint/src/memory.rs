//! In-memory checkpoint backend
//!
//! [`InMemoryCheckpointSaver`] is the reference [`CheckpointSaver`] implementation.
//! It keeps every session's checkpoint in a process-local map and is the right
//! choice for tests and development; nothing survives a restart. For durable
//! storage use [`FileCheckpointSaver`](crate::file::FileCheckpointSaver) or a
//! custom backend.
//!
//! # Example
//!
//! ```rust
//! use colloquy_checkpoint::{CheckpointSaver, InMemoryCheckpointSaver};
//!
//! # #[tokio::main]
//! # async fn main() -> colloquy_checkpoint::Result<()> {
//! let saver = InMemoryCheckpointSaver::new();
//! saver.save("user-1", b"state".to_vec()).await?;
//! assert_eq!(saver.load("user-1").await?, Some(b"state".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! Cloning is shallow: clones share the same underlying storage, so a saver can
//! be handed to the scheduler and inspected from a test at the same time.

use crate::{error::Result, traits::CheckpointSaver};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Thread-safe in-memory checkpoint storage
type CheckpointStorage = Arc<RwLock<HashMap<String, Vec<u8>>>>;

/// In-memory checkpoint saver implementation
///
/// Suitable for development, testing, and single-process deployments where
/// restart survival is not required.
#[derive(Debug, Clone)]
pub struct InMemoryCheckpointSaver {
    storage: CheckpointStorage,
}

impl InMemoryCheckpointSaver {
    /// Create a new in-memory checkpoint saver
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the number of sessions being tracked
    pub async fn session_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Clear all checkpoints (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

impl Default for InMemoryCheckpointSaver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn load(&self, session_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.storage.read().await.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, data: Vec<u8>) -> Result<()> {
        self.storage
            .write()
            .await
            .insert(session_id.to_string(), data);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.storage.write().await.remove(session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut sessions: Vec<String> = self.storage.read().await.keys().cloned().collect();
        sessions.sort();
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let saver = InMemoryCheckpointSaver::new();

        saver.save("session-1", vec![1, 2, 3]).await.unwrap();

        assert_eq!(saver.load("session-1").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(saver.load("session-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_replaces_previous() {
        let saver = InMemoryCheckpointSaver::new();

        saver.save("session-1", vec![1]).await.unwrap();
        saver.save("session-1", vec![2]).await.unwrap();

        assert_eq!(saver.load("session-1").await.unwrap(), Some(vec![2]));
        assert_eq!(saver.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let saver = InMemoryCheckpointSaver::new();

        saver.save("session-1", vec![1]).await.unwrap();
        saver.delete("session-1").await.unwrap();
        saver.delete("session-1").await.unwrap();

        assert_eq!(saver.load("session-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_sessions_sorted() {
        let saver = InMemoryCheckpointSaver::new();

        saver.save("b", vec![]).await.unwrap();
        saver.save("a", vec![]).await.unwrap();

        assert_eq!(saver.list_sessions().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let saver = InMemoryCheckpointSaver::new();
        let clone = saver.clone();

        saver.save("session-1", vec![9]).await.unwrap();

        assert_eq!(clone.load("session-1").await.unwrap(), Some(vec![9]));
    }
}
