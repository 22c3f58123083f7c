//! Error types and error handling for the dialogue engine
//!
//! This module defines all error types that can occur during specification
//! loading, graph compilation, and turn execution. All errors implement
//! `std::error::Error` via the `thiserror` crate.
//!
//! # Error Hierarchy
//!
//! ```text
//! EngineError
//! ├── Config            - Malformed specification / missing top-level fields
//! ├── Validation        - Per-step-variant violations (carries step name)
//! ├── GraphBuild        - Dangling step references found at compile time
//! ├── UnknownFlow       - Flow name not present in the compiled spec
//! ├── UnknownStep       - Step index/name missing at runtime (mis-compiled graph)
//! ├── Nlu               - Understanding provider failures
//! ├── Action            - Action handler failures
//! ├── AdvanceCap        - Per-turn node execution cap exceeded
//! ├── Timeout           - Per-turn deadline expired
//! ├── Checkpoint        - Persistence errors
//! ├── CorruptCheckpoint - Checkpoint payload no longer decodes
//! ├── Serialization     - JSON errors
//! ├── Yaml              - YAML parsing errors
//! └── Custom            - Application-defined errors
//! ```
//!
//! Configuration errors (`Config`, `Validation`, `GraphBuild`) are fatal at
//! startup and always carry the offending step name and a human-readable
//! reason. Runtime-per-turn failures (NLU, action, deadline, advance cap) are
//! recovered at the turn boundary by the scheduler; see the scheduler module
//! for the exact semantics of each.

use thiserror::Error;

/// Convenience result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// Comprehensive error type for all dialogue engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed specification or missing required top-level fields
    #[error("Configuration error: {0}")]
    Config(String),

    /// A step violated its variant's requirements
    ///
    /// Carries the offending step name so spec authors can find the
    /// problem without a line number.
    #[error("Step '{step}' is invalid: {reason}")]
    Validation {
        /// Name of the offending step
        step: String,
        /// Human-readable reason
        reason: String,
    },

    /// A referenced step name does not resolve within the flow
    ///
    /// Emitted by the compiler for dangling `jump_to`, branch cases,
    /// `on_confirm`, `on_deny`, `exit_to`, and while-body references.
    #[error("Graph build failed at step '{step}': {reason}")]
    GraphBuild {
        /// Step carrying the dangling reference
        step: String,
        /// Human-readable reason
        reason: String,
    },

    /// Flow name not present in the compiled specification
    #[error("Unknown flow: '{0}'")]
    UnknownFlow(String),

    /// Step missing at runtime
    ///
    /// Should be impossible after a successful compile; indicates a
    /// mis-compiled graph and is fatal for the turn.
    #[error("Flow '{flow}' has no step at index {index}")]
    UnknownStep {
        /// Flow the cursor was parked in
        flow: String,
        /// Cursor position that failed to resolve
        index: usize,
    },

    /// Understanding provider failure (after retry)
    #[error("NLU error: {0}")]
    Nlu(#[from] crate::nlu::NluError),

    /// Action handler failure
    #[error("Action error: {0}")]
    Action(#[from] crate::action::ActionError),

    /// The per-turn node execution cap was exceeded
    ///
    /// Indicates a mis-wired graph (for example a while loop whose guard
    /// never turns false without a collect in the body). Never swallowed:
    /// the scheduler logs this at `error` level and moves the flow to the
    /// error state.
    #[error("Flow '{flow}' exceeded the per-turn node execution cap of {cap}")]
    AdvanceCap {
        /// Flow whose execution hit the cap
        flow: String,
        /// Configured cap
        cap: usize,
    },

    /// Per-turn deadline expired
    ///
    /// The turn is aborted and no partial progress is persisted.
    #[error("Turn timed out after {duration_ms}ms during {operation}")]
    Timeout {
        /// Phase that was executing when the deadline expired
        operation: String,
        /// Deadline in milliseconds
        duration_ms: u64,
    },

    /// Checkpoint persistence error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] colloquy_checkpoint::CheckpointError),

    /// Checkpoint payload exists but no longer decodes
    ///
    /// Fatal for the session until it is externally reset.
    #[error("Corrupt checkpoint for session '{session}': {reason}")]
    CorruptCheckpoint {
        /// Session whose checkpoint failed to decode
        session: String,
        /// Decode failure description
        reason: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Custom application-defined error
    #[error("{0}")]
    Custom(String),
}

impl EngineError {
    /// Create a validation error with step context
    pub fn validation(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Create a graph build error with step context
    pub fn graph_build(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GraphBuild {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }
}
