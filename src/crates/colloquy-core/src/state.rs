//! Dialogue state: the checkpointed per-session container
//!
//! [`DialogueState`] is everything a session carries between turns: the flow
//! stack, per-flow slot stores, executed-step sets (the idempotence keys for
//! actions), the single optional [`PendingTask`], a bounded conversation
//! window, and turn bookkeeping. The whole structure round-trips losslessly
//! through serde - that is what makes suspension a *state property*: a turn
//! fully returns, and the next turn reconstructs execution from the
//! checkpoint alone. Nothing here holds a call stack, a future, or any other
//! process-bound resource.
//!
//! # Invariants
//!
//! - every flow id in `flow_slots` / `executed_steps` appears on `flow_stack`
//!   (pruning happens when a flow exits)
//! - at most one stack entry is `Active`; entries below are `Paused`
//! - `pending_task` is present iff the previous turn ended at a suspension
//!   point
//! - `executed_steps` per flow grows monotonically within the flow's lifetime
//! - `messages` is trimmed to the configured history window
//! - `turn_count` is strictly increasing
//!
//! State is never mutated by node code directly; nodes produce
//! [`StateDelta`](crate::delta::StateDelta)s which the scheduler applies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Lifecycle phase of a flow context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowPhase {
    /// Top of the stack, currently executing
    Active,
    /// Below an active flow, waiting to resume
    Paused,
    /// Ran to its end
    Completed,
    /// Abandoned by the user
    Cancelled,
    /// Unrecoverable runtime failure
    Error,
}

/// How a flow ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowResult {
    Completed,
    Cancelled,
    Error,
}

impl FlowResult {
    /// The terminal phase this result maps to
    pub fn phase(self) -> FlowPhase {
        match self {
            FlowResult::Completed => FlowPhase::Completed,
            FlowResult::Cancelled => FlowPhase::Cancelled,
            FlowResult::Error => FlowPhase::Error,
        }
    }
}

/// Why a flow was pushed onto the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushReason {
    /// First flow of a conversation, or a fresh top-level intent
    Initial,
    /// User interrupted with a new task
    Interruption,
    /// Explicit digression with intent to return
    Digression,
    /// Parent `call` step
    Call,
    /// `link` transfer from a completed flow
    Link,
}

/// A live instance of a flow on the stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    /// Opaque unique id; the key into `flow_slots` and `executed_steps`
    pub flow_id: String,

    /// Name of the flow definition this context executes
    pub flow_name: String,

    /// Lifecycle phase
    pub flow_state: FlowPhase,

    /// Cursor: index into the compiled node order
    pub current_step_index: usize,

    /// Why this context was pushed
    pub reason: PushReason,

    /// Whether control returns to the parent when this context completes
    pub resume_parent: bool,

    /// Child slot name to parent slot name, applied on completion (from `call`)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output_mappings: HashMap<String, String>,

    /// Inputs this context was seeded with
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, Value>,

    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FlowContext {
    /// Create a fresh active context for a named flow
    pub fn new(flow_name: impl Into<String>, reason: PushReason) -> Self {
        Self {
            flow_id: Uuid::new_v4().to_string(),
            flow_name: flow_name.into(),
            flow_state: FlowPhase::Active,
            current_step_index: 0,
            reason,
            resume_parent: matches!(
                reason,
                PushReason::Digression | PushReason::Interruption | PushReason::Call
            ),
            output_mappings: HashMap::new(),
            inputs: HashMap::new(),
            started_at: Utc::now(),
            paused_at: None,
            completed_at: None,
        }
    }

    /// Seed inputs (used by `call` and digressions with carried slots)
    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Record output mappings applied when this context completes
    pub fn with_output_mappings(mut self, mappings: HashMap<String, String>) -> Self {
        self.output_mappings = mappings;
        self
    }
}

/// The single "I need input from the user" record carried across turns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum PendingTask {
    /// A collect step is waiting for a slot value
    Collect {
        slot: String,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
    },
    /// A confirm step is waiting for yes/no
    Confirm {
        prompt: String,
        options: Vec<String>,
    },
    /// A say step with `await_ack` is waiting for acknowledgement
    Inform {
        prompt: String,
        #[serde(default)]
        wait: bool,
    },
}

impl PendingTask {
    /// The prompt to re-render when extracting a response
    pub fn prompt(&self) -> &str {
        match self {
            PendingTask::Collect { prompt, .. } => prompt,
            PendingTask::Confirm { prompt, .. } => prompt,
            PendingTask::Inform { prompt, .. } => prompt,
        }
    }
}

/// Who said a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the bounded conversation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Classification of what the conversation is parked on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// No active flow
    #[default]
    Idle,
    /// Parked on a collect step
    WaitingForSlot,
    /// Parked on an action step
    ReadyForAction,
    /// Parked on a confirm step
    ReadyForConfirmation,
    /// Parked on an internal step (branch, set, say)
    Internal,
    /// Session marked for human handoff
    Escalated,
}

/// Bounded record of a flow that recently left the stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedFlow {
    pub flow_id: String,
    pub flow_name: String,
    pub result: FlowResult,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// The complete checkpointed state of one dialogue session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DialogueState {
    /// Flow contexts, bottom to top; the last entry is the active context
    #[serde(default)]
    pub flow_stack: Vec<FlowContext>,

    /// flow id to slot name to value
    #[serde(default)]
    pub flow_slots: HashMap<String, HashMap<String, Value>>,

    /// flow id to set of executed step indices (action idempotence keys)
    #[serde(default)]
    pub executed_steps: HashMap<String, BTreeSet<usize>>,

    /// At most one suspension carried to the next turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_task: Option<PendingTask>,

    /// Interpretation produced this turn; cleared before checkpointing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_nlu: Option<crate::nlu::NluInterpretation>,

    /// Bounded trailing conversation window
    #[serde(default)]
    pub messages: Vec<ConversationTurn>,

    /// Per-turn scratchpad; `_`-prefixed keys are never user-visible
    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    /// Bounded log of flows that recently left the stack
    #[serde(default)]
    pub completed_flows: Vec<CompletedFlow>,

    /// What the conversation is parked on
    #[serde(default)]
    pub conversation_state: ConversationState,

    /// Strictly increasing turn counter
    #[serde(default)]
    pub turn_count: u64,

    /// Response emitted by the previous turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
}

impl DialogueState {
    /// Fresh state for a new session
    pub fn new() -> Self {
        Self::default()
    }

    /// The active flow context (top of stack), if any
    pub fn active_context(&self) -> Option<&FlowContext> {
        self.flow_stack.last()
    }

    /// Mutable access to the active flow context
    pub fn active_context_mut(&mut self) -> Option<&mut FlowContext> {
        self.flow_stack.last_mut()
    }

    /// Slots of the active flow (empty map when idle)
    pub fn active_slots(&self) -> HashMap<String, Value> {
        self.active_context()
            .and_then(|ctx| self.flow_slots.get(&ctx.flow_id))
            .cloned()
            .unwrap_or_default()
    }

    /// One slot of the active flow
    pub fn active_slot(&self, name: &str) -> Option<&Value> {
        let ctx = self.active_context()?;
        self.flow_slots.get(&ctx.flow_id)?.get(name)
    }

    /// Whether a step index has been executed in the given flow instance
    pub fn is_step_executed(&self, flow_id: &str, index: usize) -> bool {
        self.executed_steps
            .get(flow_id)
            .map(|set| set.contains(&index))
            .unwrap_or(false)
    }

    /// Append a conversation turn, trimming to the history window
    pub fn push_message(&mut self, turn: ConversationTurn, window: usize) {
        self.messages.push(turn);
        if self.messages.len() > window {
            let excess = self.messages.len() - window;
            self.messages.drain(..excess);
        }
    }

    /// Record a terminal flow in the bounded completed-flows log
    pub fn push_completed(&mut self, entry: CompletedFlow, window: usize) {
        self.completed_flows.push(entry);
        if self.completed_flows.len() > window {
            let excess = self.completed_flows.len() - window;
            self.completed_flows.drain(..excess);
        }
    }

    /// Drop the slot store and executed-step set of a flow instance
    pub fn prune_flow(&mut self, flow_id: &str) {
        self.flow_slots.remove(flow_id);
        self.executed_steps.remove(flow_id);
    }

    /// Depth of the flow stack
    pub fn stack_depth(&self) -> usize {
        self.flow_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_state_is_idle() {
        let state = DialogueState::new();
        assert!(state.active_context().is_none());
        assert_eq!(state.conversation_state, ConversationState::Idle);
        assert_eq!(state.turn_count, 0);
    }

    #[test]
    fn test_active_context_is_top_of_stack() {
        let mut state = DialogueState::new();
        let mut bottom = FlowContext::new("parent", PushReason::Initial);
        bottom.flow_state = FlowPhase::Paused;
        let top = FlowContext::new("child", PushReason::Digression);
        let top_id = top.flow_id.clone();

        state.flow_stack.push(bottom);
        state.flow_stack.push(top);

        assert_eq!(state.active_context().unwrap().flow_id, top_id);
        assert_eq!(state.stack_depth(), 2);
    }

    #[test]
    fn test_message_window_trims_oldest() {
        let mut state = DialogueState::new();
        for i in 0..5 {
            state.push_message(ConversationTurn::user(format!("m{}", i)), 3);
        }
        assert_eq!(state.messages.len(), 3);
        assert_eq!(state.messages[0].content, "m2");
    }

    #[test]
    fn test_prune_flow_removes_slots_and_marks() {
        let mut state = DialogueState::new();
        state
            .flow_slots
            .insert("f1".to_string(), HashMap::from([("a".to_string(), json!(1))]));
        state
            .executed_steps
            .insert("f1".to_string(), BTreeSet::from([0, 1]));

        state.prune_flow("f1");

        assert!(state.flow_slots.is_empty());
        assert!(state.executed_steps.is_empty());
    }

    #[test]
    fn test_digression_context_resumes_parent() {
        assert!(FlowContext::new("f", PushReason::Digression).resume_parent);
        assert!(FlowContext::new("f", PushReason::Interruption).resume_parent);
        assert!(FlowContext::new("f", PushReason::Call).resume_parent);
        assert!(!FlowContext::new("f", PushReason::Initial).resume_parent);
        assert!(!FlowContext::new("f", PushReason::Link).resume_parent);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = DialogueState::new();
        let ctx = FlowContext::new("book_flight", PushReason::Initial);
        let id = ctx.flow_id.clone();
        state.flow_stack.push(ctx);
        state
            .flow_slots
            .insert(id.clone(), HashMap::from([("origin".to_string(), json!("Madrid"))]));
        state.executed_steps.insert(id, BTreeSet::from([0]));
        state.pending_task = Some(PendingTask::Collect {
            slot: "destination".to_string(),
            prompt: "Where to?".to_string(),
            options: None,
        });
        state.turn_count = 4;

        let bytes = serde_json::to_vec(&state).unwrap();
        let restored: DialogueState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored, state);
    }
}
