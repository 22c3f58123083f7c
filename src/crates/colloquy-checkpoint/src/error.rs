//! Checkpoint failure modes
//!
//! Every variant here is something a caller can act on: reject the session
//! key, treat the session as corrupt until reset, or retry the store. The
//! envelope-related variants ([`NotACheckpoint`](CheckpointError::NotACheckpoint),
//! [`UnsupportedVersion`](CheckpointError::UnsupportedVersion),
//! [`FormatMismatch`](CheckpointError::FormatMismatch)) exist so that a
//! payload written by a different codec or a newer release is reported
//! precisely instead of as generic deserialization noise.

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised while persisting or restoring session checkpoints
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The session id cannot be used as a storage key
    ///
    /// Raised before touching the store; the file backend maps session ids
    /// straight to file names, so they are restricted to `[A-Za-z0-9._-]`.
    #[error("Session id '{session_id}' is not a valid storage key: {reason}")]
    InvalidSessionId {
        /// The offending session id
        session_id: String,
        /// Why it was rejected
        reason: String,
    },

    /// The payload does not carry the checkpoint envelope header
    #[error("Payload is not a colloquy checkpoint: {0}")]
    NotACheckpoint(String),

    /// The envelope was written by an unknown (likely newer) layout revision
    #[error("Unsupported checkpoint envelope version {0}")]
    UnsupportedVersion(u8),

    /// The envelope was written by a different codec than the reader's
    #[error("Checkpoint body is {found}, but this codec reads {expected}")]
    FormatMismatch {
        /// Format the reading codec understands
        expected: &'static str,
        /// Format recorded in the envelope
        found: String,
    },

    /// The state failed to serialize into an envelope body
    #[error("Failed to encode checkpoint body: {0}")]
    Encode(String),

    /// The envelope body failed to deserialize back into state
    #[error("Failed to decode checkpoint body: {0}")]
    Decode(String),

    /// The backing store failed
    #[error("Checkpoint store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
