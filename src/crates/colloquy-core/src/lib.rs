//! # colloquy-core - Dialogue Orchestration Runtime
//!
//! **A flow engine for multi-turn conversations** - a declarative YAML
//! specification of conversational *flows* (ordered step programs with slots,
//! branches, loops, prompts, action calls, and confirmations) is compiled
//! into executable node graphs, and a scheduler drives one user turn at a
//! time against checkpointed per-session state.
//!
//! ## Overview
//!
//! `colloquy-core` provides:
//!
//! - **A compiled flow graph** - steps get stable indices, `while` loops
//!   desugar to guard/body/jump-back, every edge is validated at startup
//! - **Suspension as state** - "waiting for the user" is a serializable
//!   `pending_task`, never a preserved call stack, so conversations survive
//!   process restarts
//! - **A flow stack** - digressions and nested `call`s push contexts;
//!   completion, cancellation, and errors pop and prune them
//! - **A pattern dispatcher** - NLU interpretations (slot values,
//!   corrections, cancellations, confirmations, digressions, ...) are
//!   reconciled with the currently executing step
//! - **At-most-once actions** - `executed_steps` keyed by (flow id, step
//!   index) gives action idempotence without a write-ahead log
//!
//! ## Core Concepts
//!
//! ### 1. DialogueEngine - Primary API
//!
//! [`DialogueEngine`] is the main entry point. Feed it a validated
//! [`DialogueSpec`], an [`NluProvider`], an [`ActionRegistry`], and a
//! checkpoint backend; call [`DialogueEngine::process_turn`] once per user
//! utterance.
//!
//! ### 2. Per-Session Serialization
//!
//! All work for a session key is serialized on a per-session lock; different
//! sessions run in parallel. Node code is therefore straightforwardly
//! sequential and state needs no internal locking.
//!
//! ### 3. Deltas
//!
//! Nodes and dispatches never mutate state in place - they return
//! [`StateDelta`]s which the scheduler applies in order. Scalars are
//! last-writer-wins within a turn, executed-step sets union, response
//! fragments concatenate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use colloquy_core::{DialogueEngine, DialogueSpec};
//! use colloquy_core::nlu::ScriptedNlu;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> colloquy_core::Result<()> {
//! let spec = DialogueSpec::from_path("flows.yaml")?;
//! let engine = DialogueEngine::builder(spec)
//!     .with_nlu(Arc::new(ScriptedNlu::new(vec![])))
//!     .build()?;
//!
//! let result = engine.process_turn("user-42", "I want to book a flight").await?;
//! println!("{}", result.response);
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod compiler;
pub mod config;
pub mod confirmation;
pub mod delta;
pub mod dispatcher;
pub mod error;
pub mod expr;
pub mod flow_manager;
pub mod nlu;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod step;
pub mod step_manager;
pub mod template;

pub use action::{ActionError, ActionHandler, ActionRegistry, SlotNormalizer, ValidatorRegistry};
pub use compiler::{CompiledNode, CompiledSpec, FlowGraph, Next, NodeKind};
pub use config::{
    DialogueSpec, Durability, FlowDef, OverflowStrategy, ResponseTemplates, Settings, SlotDecl,
    SlotType,
};
pub use delta::StateDelta;
pub use dispatcher::{DispatchOutcome, PatternDispatcher};
pub use error::{EngineError, Result};
pub use nlu::{MessageType, NluInterpretation, NluProvider, NluRequest, SlotValue};
pub use runtime::Runtime;
pub use scheduler::{DialogueEngine, DialogueEngineBuilder, StateCodec, TurnResult};
pub use state::{
    ConversationState, ConversationTurn, DialogueState, FlowContext, FlowPhase, FlowResult,
    PendingTask, PushReason,
};
pub use step::{Step, StepKind};
