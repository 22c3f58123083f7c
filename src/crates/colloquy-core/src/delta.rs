//! State deltas: immutable updates produced by nodes, merged by the scheduler
//!
//! Nodes never mutate [`DialogueState`] in place. Each node (and each pattern
//! dispatch) returns a [`StateDelta`] describing its changes; the scheduler
//! applies deltas in the order they were produced. Merging is deterministic:
//! scalar fields are last-writer-wins within a turn, `executed_steps`
//! additions union, and response fragments / messages concatenate in order.
//!
//! Disjoint slot writes commute: two deltas touching different flows' slot
//! maps (or produced from the same base map with different keys) can merge in
//! either order with the same result. That property is exercised by proptest
//! in the crate's property suite.

use serde_json::Value;
use std::collections::HashMap;

use crate::state::{
    CompletedFlow, ConversationState, ConversationTurn, DialogueState, FlowContext, PendingTask,
};

/// A partial description of state changes
///
/// Every field is optional; `Default` is the empty delta. `pending_task` is
/// doubly optional: the outer `None` means "untouched", `Some(None)` means
/// "clear the pending task".
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    /// Replacement flow stack
    pub flow_stack: Option<Vec<FlowContext>>,

    /// Whole-map replacement of one flow's slot store, keyed by flow id
    pub flow_slots: Option<(String, HashMap<String, Value>)>,

    /// Executed-step additions as (flow id, step index)
    pub executed_steps: Vec<(String, usize)>,

    /// Executed-step removals (cursor rewind clears non-action marks)
    pub cleared_steps: Vec<(String, usize)>,

    /// Flow ids whose slot stores and executed-step sets are dropped
    /// (pruning when a flow leaves the stack)
    pub pruned_flows: Vec<String>,

    /// Pending-task update: `Some(None)` clears, `Some(Some(..))` sets
    pub pending_task: Option<Option<PendingTask>>,

    /// Response fragment appended to this turn's output
    pub response_fragment: Option<String>,

    /// Conversation turn appended to the bounded window
    pub message: Option<ConversationTurn>,

    /// Branch decision taken this execution, as (metadata key, target index)
    pub branch_target: Option<(String, usize)>,

    /// Metadata writes applied in order
    pub metadata: Vec<(String, Value)>,

    /// Metadata removals
    pub metadata_removals: Vec<String>,

    /// Conversation-state classification update
    pub conversation_state: Option<ConversationState>,

    /// Terminal flow recorded in the completed-flows log
    pub completed_flow: Option<CompletedFlow>,
}

impl StateDelta {
    /// The empty delta
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta that only replaces the flow stack
    pub fn with_stack(stack: Vec<FlowContext>) -> Self {
        Self {
            flow_stack: Some(stack),
            ..Self::default()
        }
    }

    /// Delta that only replaces one flow's slot map
    pub fn with_slots(flow_id: impl Into<String>, slots: HashMap<String, Value>) -> Self {
        Self {
            flow_slots: Some((flow_id.into(), slots)),
            ..Self::default()
        }
    }

    /// Delta that only sets the pending task
    pub fn with_pending(task: PendingTask) -> Self {
        Self {
            pending_task: Some(Some(task)),
            ..Self::default()
        }
    }

    /// Delta that only clears the pending task
    pub fn clearing_pending() -> Self {
        Self {
            pending_task: Some(None),
            ..Self::default()
        }
    }

    /// Delta that only appends a response fragment
    pub fn with_fragment(fragment: impl Into<String>) -> Self {
        Self {
            response_fragment: Some(fragment.into()),
            ..Self::default()
        }
    }

    /// Builder-style executed-step addition
    pub fn mark_executed(mut self, flow_id: impl Into<String>, index: usize) -> Self {
        self.executed_steps.push((flow_id.into(), index));
        self
    }

    /// Builder-style metadata write
    pub fn set_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    /// True when the delta changes nothing
    pub fn is_empty(&self) -> bool {
        self.flow_stack.is_none()
            && self.flow_slots.is_none()
            && self.executed_steps.is_empty()
            && self.cleared_steps.is_empty()
            && self.pruned_flows.is_empty()
            && self.pending_task.is_none()
            && self.response_fragment.is_none()
            && self.message.is_none()
            && self.branch_target.is_none()
            && self.metadata.is_empty()
            && self.metadata_removals.is_empty()
            && self.conversation_state.is_none()
            && self.completed_flow.is_none()
    }

    /// Merge `other` into `self` (other is the later writer)
    ///
    /// Last-writer-wins for scalars, union for executed steps, concatenation
    /// for fragments and metadata writes. Merging is associative, so the
    /// scheduler can fold any number of deltas pairwise.
    pub fn merge(mut self, other: StateDelta) -> StateDelta {
        if other.flow_stack.is_some() {
            self.flow_stack = other.flow_stack;
        }
        if other.flow_slots.is_some() {
            self.flow_slots = other.flow_slots;
        }
        self.executed_steps.extend(other.executed_steps);
        self.cleared_steps.extend(other.cleared_steps);
        self.pruned_flows.extend(other.pruned_flows);
        if other.pending_task.is_some() {
            self.pending_task = other.pending_task;
        }
        self.response_fragment = match (self.response_fragment, other.response_fragment) {
            (Some(a), Some(b)) => Some(format!("{}\n{}", a, b)),
            (a, None) => a,
            (None, b) => b,
        };
        if other.message.is_some() {
            self.message = other.message;
        }
        if other.branch_target.is_some() {
            self.branch_target = other.branch_target;
        }
        self.metadata.extend(other.metadata);
        self.metadata_removals.extend(other.metadata_removals);
        if other.conversation_state.is_some() {
            self.conversation_state = other.conversation_state;
        }
        if other.completed_flow.is_some() {
            self.completed_flow = other.completed_flow;
        }
        self
    }
}

impl DialogueState {
    /// Apply one delta to this state
    ///
    /// `history_window` and `completed_window` bound the message and
    /// completed-flows logs.
    pub fn apply(&mut self, delta: StateDelta, history_window: usize, completed_window: usize) {
        if let Some(stack) = delta.flow_stack {
            self.flow_stack = stack;
        }
        if let Some((flow_id, slots)) = delta.flow_slots {
            self.flow_slots.insert(flow_id, slots);
        }
        for (flow_id, index) in delta.executed_steps {
            self.executed_steps.entry(flow_id).or_default().insert(index);
        }
        for (flow_id, index) in delta.cleared_steps {
            if let Some(set) = self.executed_steps.get_mut(&flow_id) {
                set.remove(&index);
            }
        }
        for flow_id in delta.pruned_flows {
            self.prune_flow(&flow_id);
        }
        if let Some(task) = delta.pending_task {
            self.pending_task = task;
        }
        if let Some(turn) = delta.message {
            self.push_message(turn, history_window);
        }
        if let Some((key, index)) = delta.branch_target {
            self.metadata
                .insert(key, Value::Number(serde_json::Number::from(index)));
        }
        for (key, value) in delta.metadata {
            self.metadata.insert(key, value);
        }
        for key in delta.metadata_removals {
            self.metadata.remove(&key);
        }
        if let Some(cs) = delta.conversation_state {
            self.conversation_state = cs;
        }
        if let Some(done) = delta.completed_flow {
            self.push_completed(done, completed_window);
        }
        // response_fragment is turn-scoped; the scheduler collects fragments
        // itself and folds the final response into last_response.
    }
}
