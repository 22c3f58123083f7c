//! # colloquy-checkpoint - State Persistence for Dialogue Sessions
//!
//! **Trait-based checkpoint abstractions and implementations** for persisting and
//! restoring per-session dialogue state. Checkpointing is what lets a multi-turn
//! conversation survive process restarts: the scheduler reads one checkpoint at
//! the start of a turn and writes one at the end, and the next turn reconstructs
//! everything from that snapshot.
//!
//! ## Core Concepts
//!
//! ### 1. CheckpointSaver Trait
//!
//! The [`CheckpointSaver`] trait defines the interface for persistence backends.
//! Implementors provide:
//!
//! - **`load()`** - Fetch the checkpoint payload for a session
//! - **`save()`** - Replace the checkpoint payload for a session
//! - **`delete()`** - Drop a session entirely
//! - **`list_sessions()`** - Enumerate known sessions
//!
//! Backends store opaque bytes and never interpret them.
//!
//! ### 2. Envelope Codecs
//!
//! Payloads are produced by a [`CheckpointCodec`], which wraps the serialized
//! state in a small self-describing envelope (magic, layout version, format
//! tag). A payload written with a different codec, truncated on disk, or
//! produced by a newer release is reported as the specific
//! [`CheckpointError`] it is - not as generic deserialization noise - which
//! is what lets the engine distinguish "new session" from "corrupt session".
//! [`JsonCodec`] is the default; [`BincodeCodec`] is the compact option.
//!
//! ### 3. Provided Backends
//!
//! - [`InMemoryCheckpointSaver`] - Reference implementation for tests and
//!   development; nothing survives a restart
//! - [`FileCheckpointSaver`] - One file per session with atomic replace;
//!   the default durable backend for CLI deployments
//!
//! For production, implement [`CheckpointSaver`] over your preferred store
//! (PostgreSQL, SQLite, Redis, S3, ...).
//!
//! ## Quick Start
//!
//! ```rust
//! use colloquy_checkpoint::{
//!     CheckpointCodec, CheckpointSaver, InMemoryCheckpointSaver, JsonCodec,
//! };
//!
//! # #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
//! # struct DialogueState { turn_count: u64 }
//! # #[tokio::main]
//! # async fn main() -> colloquy_checkpoint::Result<()> {
//! let saver = InMemoryCheckpointSaver::new();
//! let codec = JsonCodec::new();
//!
//! let state = DialogueState { turn_count: 3 };
//! saver.save("user-42", codec.encode(&state)?).await?;
//!
//! let payload = saver.load("user-42").await?.expect("just saved");
//! let restored: DialogueState = codec.decode(&payload)?;
//! assert_eq!(restored, state);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod file;
pub mod memory;
pub mod traits;

pub use codec::{
    BincodeCodec, CheckpointCodec, CheckpointFormat, JsonCodec, CHECKPOINT_MAGIC, ENVELOPE_VERSION,
};
pub use error::{CheckpointError, Result};
pub use file::FileCheckpointSaver;
pub use memory::InMemoryCheckpointSaver;
pub use traits::CheckpointSaver;
