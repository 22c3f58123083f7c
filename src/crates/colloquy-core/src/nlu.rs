//! NLU provider interface and interpretation types
//!
//! The understanding model itself is an external collaborator: the engine
//! hands a provider the utterance plus dialogue context and receives back a
//! typed [`NluInterpretation`] - one of a closed set of dialogue commands.
//! The pattern dispatcher reconciles that interpretation with the currently
//! executing step; nothing downstream ever sees raw text.
//!
//! [`ScriptedNlu`] is the test double used throughout the scenario suite: a
//! queue of canned interpretations returned in order, which makes multi-turn
//! tests deterministic without any model in the loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::state::ConversationTurn;

/// Confidence assigned to slots the provider synthesises when nothing was
/// extracted; such fallback slots are never treated as corrections.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Errors surfaced by an NLU provider
#[derive(Debug, Error)]
pub enum NluError {
    /// Provider-side failure (network, model, quota, ...)
    #[error("NLU provider failed: {0}")]
    Provider(String),

    /// The provider returned something that does not decode
    #[error("NLU response malformed: {0}")]
    Malformed(String),

    /// A scripted provider ran out of canned interpretations
    #[error("NLU script exhausted: {0}")]
    ScriptExhausted(String),
}

/// The closed set of dialogue commands an utterance can resolve to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// One or more slot values for the active flow
    SlotValue,
    /// "actually I meant X" - replace an earlier value and rewind
    Correction,
    /// Change a value without implying the earlier answer was wrong
    Modification,
    /// A new task intent while a flow is active
    Interruption,
    /// A side question with intent to return
    Digression,
    /// The user asked what was meant
    Clarification,
    /// Abandon the active flow
    Cancellation,
    /// Reply to a confirm prompt
    Confirmation,
    /// "go on" / acknowledgement, no content
    Continuation,
    /// Ask for a human
    Handoff,
    /// Social talk with no dialogue content
    Chitchat,
}

/// How a slot value relates to existing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotAction {
    /// First-time fill
    #[default]
    Provide,
    /// Replace an earlier, wrong value
    Correct,
    /// Adjust an earlier value
    Modify,
}

/// One extracted slot value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotValue {
    /// Slot name
    pub name: String,

    /// Extracted value (typed; normalization happens downstream)
    pub value: Value,

    /// How this value relates to existing state
    #[serde(default)]
    pub action: SlotAction,

    /// Extraction confidence in [0, 1]
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl SlotValue {
    /// A plain first-time fill with full confidence
    pub fn provide(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            action: SlotAction::Provide,
            confidence: 1.0,
        }
    }

    /// A correction of an earlier value
    pub fn correct(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            action: SlotAction::Correct,
            confidence: 1.0,
        }
    }

    /// Whether this is a synthesised fallback slot (never a correction)
    pub fn is_fallback(&self) -> bool {
        (self.confidence - FALLBACK_CONFIDENCE).abs() < f64::EPSILON
            && self.action == SlotAction::Provide
    }
}

/// A typed interpretation of one utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NluInterpretation {
    /// Which dialogue command this utterance is
    pub message_type: MessageType,

    /// Flow or action name the command refers to (interruption/digression)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Extracted slot values, in utterance order
    #[serde(default)]
    pub slots: Vec<SlotValue>,

    /// Yes/no/unclear for confirmation replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_value: Option<bool>,

    /// Overall confidence in [0, 1]
    #[serde(default = "default_confidence")]
    pub confidence: f64,

    /// Provider's reasoning, for logs and debugging only
    #[serde(default)]
    pub reasoning: String,
}

impl NluInterpretation {
    /// Build an interpretation of the given type with no payload
    pub fn of(message_type: MessageType) -> Self {
        Self {
            message_type,
            command: None,
            slots: Vec::new(),
            confirmation_value: None,
            confidence: 1.0,
            reasoning: String::new(),
        }
    }

    /// Attach slot values
    pub fn with_slots(mut self, slots: Vec<SlotValue>) -> Self {
        self.slots = slots;
        self
    }

    /// Attach a flow/action command
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Attach a confirmation value (`None` = unclear)
    pub fn with_confirmation(mut self, value: Option<bool>) -> Self {
        self.confirmation_value = value;
        self
    }
}

/// Everything the provider gets to work with for one utterance
#[derive(Debug, Clone, Serialize)]
pub struct NluRequest {
    /// Raw user utterance
    pub utterance: String,

    /// Trailing conversation window
    pub history: Vec<ConversationTurn>,

    /// Name of the active flow, if any
    pub active_flow: Option<String>,

    /// Current slot values of the active flow
    pub current_slots: HashMap<String, Value>,

    /// Flow names available to start (unprefixed)
    pub available_flows: Vec<String>,

    /// Action names available (unprefixed)
    pub available_actions: Vec<String>,

    /// Slots the parked step is waiting for
    pub expected_slots: Vec<String>,
}

/// External understanding provider
///
/// Treated as stateless by the scheduler; one retry with identical input is
/// attempted on failure before the turn is failed.
#[async_trait]
pub trait NluProvider: Send + Sync {
    /// Interpret one utterance against the current dialogue context
    async fn interpret(&self, request: &NluRequest) -> Result<NluInterpretation, NluError>;
}

/// Scripted provider for tests: returns canned interpretations in order
#[derive(Debug, Default)]
pub struct ScriptedNlu {
    script: tokio::sync::Mutex<std::collections::VecDeque<NluInterpretation>>,
}

impl ScriptedNlu {
    /// Create a provider that will replay `interpretations` in order
    pub fn new(interpretations: Vec<NluInterpretation>) -> Self {
        Self {
            script: tokio::sync::Mutex::new(interpretations.into()),
        }
    }

    /// Append one more canned interpretation
    pub async fn push(&self, interpretation: NluInterpretation) {
        self.script.lock().await.push_back(interpretation);
    }

    /// How many canned interpretations remain
    pub async fn remaining(&self) -> usize {
        self.script.lock().await.len()
    }
}

#[async_trait]
impl NluProvider for ScriptedNlu {
    async fn interpret(&self, request: &NluRequest) -> Result<NluInterpretation, NluError> {
        self.script.lock().await.pop_front().ok_or_else(|| {
            NluError::ScriptExhausted(format!("no interpretation for '{}'", request.utterance))
        })
    }
}
