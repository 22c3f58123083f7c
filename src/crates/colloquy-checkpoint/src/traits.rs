//! Extensible checkpoint storage trait for custom backend implementations
//!
//! This module defines the **[`CheckpointSaver`]** trait - the core abstraction for
//! persisting dialogue session state. The trait enables downstream projects to back
//! colloquy with any storage system (PostgreSQL, SQLite, Redis, S3, etc.) while
//! keeping the scheduler agnostic of where checkpoints live.
//!
//! # Overview
//!
//! The checkpoint system provides:
//!
//! - **State Persistence** - Save and restore complete dialogue state per session
//! - **Restart Survival** - Conversations resume after process restarts
//! - **Session Isolation** - Each session key owns an independent checkpoint
//!
//! # Contract
//!
//! A checkpoint is an opaque byte payload keyed by an opaque session id. Payloads
//! are produced by a [`CheckpointCodec`](crate::CheckpointCodec); backends never
//! interpret the bytes. The scheduler reads once at the start of a turn and
//! writes once at the end, so backends only need simple get/put semantics.
//!
//! # Implementing a Custom Backend
//!
//! ```rust,no_run
//! use colloquy_checkpoint::{CheckpointSaver, Result};
//! use async_trait::async_trait;
//!
//! struct RedisCheckpointSaver {
//!     // connection pool ...
//! }
//!
//! #[async_trait]
//! impl CheckpointSaver for RedisCheckpointSaver {
//!     async fn load(&self, session_id: &str) -> Result<Option<Vec<u8>>> {
//!         // GET colloquy:checkpoint:{session_id}
//!         Ok(None)
//!     }
//!
//!     async fn save(&self, session_id: &str, data: Vec<u8>) -> Result<()> {
//!         // SET colloquy:checkpoint:{session_id} data
//!         Ok(())
//!     }
//!
//!     async fn delete(&self, session_id: &str) -> Result<()> {
//!         // DEL colloquy:checkpoint:{session_id}
//!         Ok(())
//!     }
//!
//!     async fn list_sessions(&self) -> Result<Vec<String>> {
//!         // SCAN colloquy:checkpoint:*
//!         Ok(vec![])
//!     }
//! }
//! ```
//!
//! # Thread Safety
//!
//! All implementations must be `Send + Sync`. Different sessions may be
//! checkpointed concurrently; the scheduler serializes writes *within* a session,
//! so backends never see concurrent writes for the same key.
//!
//! # See Also
//!
//! - [`InMemoryCheckpointSaver`](crate::memory::InMemoryCheckpointSaver) - Reference implementation
//! - [`FileCheckpointSaver`](crate::file::FileCheckpointSaver) - Durable filesystem backend

use crate::error::Result;
use async_trait::async_trait;

/// Core trait for implementing checkpoint storage backends
///
/// `CheckpointSaver` stores one opaque payload per session key. The scheduler
/// performs exactly one `load` and at most one `save` per processed turn, and
/// `delete` when a session is externally reset.
///
/// Implementations must be thread-safe (`Send + Sync`) to support concurrent
/// sessions.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch the checkpoint payload for a session
    ///
    /// Returns `Ok(None)` when the session has no checkpoint yet (a new
    /// conversation), not an error.
    async fn load(&self, session_id: &str) -> Result<Option<Vec<u8>>>;

    /// Store the checkpoint payload for a session, replacing any previous one
    ///
    /// Write failures must propagate: the scheduler fails the turn rather than
    /// acknowledge un-persisted progress.
    async fn save(&self, session_id: &str, data: Vec<u8>) -> Result<()>;

    /// Remove a session's checkpoint
    ///
    /// Deleting a missing session is a no-op.
    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Enumerate session ids that currently have a checkpoint
    async fn list_sessions(&self) -> Result<Vec<String>>;
}
