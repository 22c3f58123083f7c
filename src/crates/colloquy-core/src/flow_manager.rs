//! Flow manager: stack push/pop/peek as delta-producing functions
//!
//! The flow stack is the engine's call structure: the top entry is active,
//! everything below is paused, and contexts refer to each other only by
//! position - no cross-references, so pruning a popped context can never
//! dangle. Push allocates a fresh flow id, pauses the previous top, and
//! enforces the depth limit with the configured overflow strategy. Pop
//! resumes the parent (if any), maps `call` outputs into the caller's slots,
//! prunes the popped flow's slot store and executed-step marks, and records
//! the context in the bounded completed-flows log.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;

use crate::config::{OverflowStrategy, ResponseTemplates, Settings};
use crate::delta::StateDelta;
use crate::state::{
    CompletedFlow, DialogueState, FlowContext, FlowPhase, FlowResult, PushReason,
};
use crate::template::interpolate;

/// Stack operations over a dialogue state
///
/// Borrowing the settings and templates keeps this a plain function bundle;
/// all real state lives in [`DialogueState`] and all changes come back as
/// [`StateDelta`]s.
pub struct FlowManager<'a> {
    settings: &'a Settings,
    templates: &'a ResponseTemplates,
}

/// What to push
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Flow definition name
    pub flow_name: String,
    /// Slots the new context starts with
    pub inputs: HashMap<String, Value>,
    /// Why the push happens
    pub reason: PushReason,
    /// Child slot to parent slot, applied when the child completes
    pub output_mappings: HashMap<String, String>,
}

impl PushRequest {
    /// Push with no inputs or output mappings
    pub fn new(flow_name: impl Into<String>, reason: PushReason) -> Self {
        Self {
            flow_name: flow_name.into(),
            inputs: HashMap::new(),
            reason,
            output_mappings: HashMap::new(),
        }
    }
}

/// Result of a push attempt
#[derive(Debug)]
pub enum PushOutcome {
    /// The context was pushed; the delta contains the new stack
    Pushed {
        delta: StateDelta,
        flow_id: String,
    },
    /// The stack was full and the strategy rejected the new flow
    Rejected { delta: StateDelta },
}

/// Result of a pop
#[derive(Debug)]
pub struct PopOutcome {
    /// Stack, pruning, output-mapping, and log updates
    pub delta: StateDelta,
    /// The popped context, in its terminal phase
    pub popped: FlowContext,
    /// Name of the parent flow that resumed, if any
    pub resumed_parent: Option<String>,
}

impl<'a> FlowManager<'a> {
    pub fn new(settings: &'a Settings, templates: &'a ResponseTemplates) -> Self {
        Self {
            settings,
            templates,
        }
    }

    /// Read-only: the active context
    pub fn peek<'s>(&self, state: &'s DialogueState) -> Option<&'s FlowContext> {
        state.active_context()
    }

    /// Read-only: slots of the active flow
    pub fn get_all_slots(&self, state: &DialogueState) -> HashMap<String, Value> {
        state.active_slots()
    }

    /// Push a new flow context, enforcing the depth limit
    pub fn push(&self, state: &DialogueState, request: PushRequest) -> PushOutcome {
        let mut stack = state.flow_stack.clone();
        let mut delta = StateDelta::new();

        if stack.len() >= self.settings.max_stack_depth {
            match self.settings.overflow_strategy {
                OverflowStrategy::RejectNew => {
                    tracing::debug!(
                        flow = %request.flow_name,
                        depth = stack.len(),
                        "stack full; rejecting new flow"
                    );
                    return PushOutcome::Rejected {
                        delta: StateDelta::with_fragment(self.templates.stack_overflow.clone()),
                    };
                }
                OverflowStrategy::CancelOldest => {
                    let mut oldest = stack.remove(0);
                    oldest.flow_state = FlowPhase::Cancelled;
                    oldest.completed_at = Some(Utc::now());
                    tracing::debug!(
                        cancelled = %oldest.flow_name,
                        "stack full; cancelling oldest flow"
                    );
                    delta.pruned_flows.push(oldest.flow_id.clone());
                    delta.completed_flow = Some(terminal_record(&oldest, FlowResult::Cancelled));
                }
            }
        }

        if let Some(top) = stack.last_mut() {
            top.flow_state = FlowPhase::Paused;
            top.paused_at = Some(Utc::now());
        }

        let ctx = FlowContext::new(&request.flow_name, request.reason)
            .with_inputs(request.inputs.clone())
            .with_output_mappings(request.output_mappings);
        let flow_id = ctx.flow_id.clone();

        if !request.inputs.is_empty() {
            delta.flow_slots = Some((flow_id.clone(), request.inputs));
        }

        tracing::debug!(flow = %request.flow_name, %flow_id, reason = ?ctx.reason, "flow pushed");
        stack.push(ctx);
        delta.flow_stack = Some(stack);

        PushOutcome::Pushed { delta, flow_id }
    }

    /// Pop the active flow with a terminal result, resuming the parent
    ///
    /// Returns `None` when the stack is empty. `call` output mappings are
    /// applied from the popped child's slots into the parent's before the
    /// child's store is pruned - but only on completion; a cancelled or
    /// errored child maps nothing back.
    pub fn pop(&self, state: &DialogueState, result: FlowResult) -> Option<PopOutcome> {
        let mut stack = state.flow_stack.clone();
        let mut popped = stack.pop()?;
        popped.flow_state = result.phase();
        popped.completed_at = Some(Utc::now());

        let mut delta = StateDelta::new();
        delta.pruned_flows.push(popped.flow_id.clone());
        delta.completed_flow = Some(terminal_record(&popped, result));

        // Routing metadata scoped to the popped instance dies with it.
        let prefix = format!("_branch_target:{}:", popped.flow_id);
        delta
            .metadata_removals
            .extend(state.metadata.keys().filter(|k| k.starts_with(&prefix)).cloned());

        let mut resumed_parent = None;
        if let Some(parent) = stack.last_mut() {
            parent.flow_state = FlowPhase::Active;
            parent.paused_at = None;
            resumed_parent = Some(parent.flow_name.clone());

            if result == FlowResult::Completed && !popped.output_mappings.is_empty() {
                let child_slots = state
                    .flow_slots
                    .get(&popped.flow_id)
                    .cloned()
                    .unwrap_or_default();
                let mut parent_slots = state
                    .flow_slots
                    .get(&parent.flow_id)
                    .cloned()
                    .unwrap_or_default();
                for (child_slot, parent_slot) in &popped.output_mappings {
                    if let Some(value) = child_slots.get(child_slot) {
                        parent_slots.insert(parent_slot.clone(), value.clone());
                    }
                }
                delta.flow_slots = Some((parent.flow_id.clone(), parent_slots));
            }

            if result == FlowResult::Completed
                && matches!(
                    popped.reason,
                    PushReason::Digression | PushReason::Interruption
                )
            {
                let vars = HashMap::from([(
                    "flow".to_string(),
                    Value::String(parent.flow_name.clone()),
                )]);
                delta.response_fragment =
                    Some(interpolate(&self.templates.digression_return, &vars));
            }
        }

        tracing::debug!(
            flow = %popped.flow_name,
            flow_id = %popped.flow_id,
            result = ?result,
            resumed = ?resumed_parent,
            "flow popped"
        );
        delta.flow_stack = Some(stack);

        Some(PopOutcome {
            delta,
            popped,
            resumed_parent,
        })
    }
}

fn terminal_record(ctx: &FlowContext, result: FlowResult) -> CompletedFlow {
    CompletedFlow {
        flow_id: ctx.flow_id.clone(),
        flow_name: ctx.flow_name.clone(),
        result,
        started_at: ctx.started_at,
        ended_at: ctx.completed_at.unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager_fixtures() -> (Settings, ResponseTemplates) {
        (Settings::default(), ResponseTemplates::default())
    }

    fn apply(state: &mut DialogueState, delta: StateDelta) {
        state.apply(delta, 10, 10);
    }

    #[test]
    fn test_push_pauses_previous_top() {
        let (settings, templates) = manager_fixtures();
        let manager = FlowManager::new(&settings, &templates);
        let mut state = DialogueState::new();

        match manager.push(&state, PushRequest::new("parent", PushReason::Initial)) {
            PushOutcome::Pushed { delta, .. } => apply(&mut state, delta),
            other => panic!("expected push, got {:?}", other),
        }
        match manager.push(&state, PushRequest::new("child", PushReason::Digression)) {
            PushOutcome::Pushed { delta, .. } => apply(&mut state, delta),
            other => panic!("expected push, got {:?}", other),
        }

        assert_eq!(state.stack_depth(), 2);
        assert_eq!(state.flow_stack[0].flow_state, FlowPhase::Paused);
        assert!(state.flow_stack[0].paused_at.is_some());
        assert_eq!(state.flow_stack[1].flow_state, FlowPhase::Active);
        assert_eq!(state.active_context().unwrap().flow_name, "child");
    }

    #[test]
    fn test_push_seeds_inputs_as_slots() {
        let (settings, templates) = manager_fixtures();
        let manager = FlowManager::new(&settings, &templates);
        let state = DialogueState::new();

        let mut request = PushRequest::new("child", PushReason::Call);
        request.inputs = HashMap::from([("account".to_string(), json!("savings"))]);

        match manager.push(&state, request) {
            PushOutcome::Pushed { delta, flow_id } => {
                let (id, slots) = delta.flow_slots.unwrap();
                assert_eq!(id, flow_id);
                assert_eq!(slots["account"], json!("savings"));
            }
            other => panic!("expected push, got {:?}", other),
        }
    }

    #[test]
    fn test_depth_limit_reject_new() {
        let (mut settings, templates) = manager_fixtures();
        settings.max_stack_depth = 2;
        let manager = FlowManager::new(&settings, &templates);
        let mut state = DialogueState::new();

        for name in ["a", "b"] {
            match manager.push(&state, PushRequest::new(name, PushReason::Initial)) {
                PushOutcome::Pushed { delta, .. } => apply(&mut state, delta),
                other => panic!("expected push, got {:?}", other),
            }
        }

        match manager.push(&state, PushRequest::new("c", PushReason::Digression)) {
            PushOutcome::Rejected { delta } => {
                assert_eq!(
                    delta.response_fragment.as_deref(),
                    Some(templates.stack_overflow.as_str())
                );
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(state.stack_depth(), 2);
    }

    #[test]
    fn test_depth_limit_cancel_oldest() {
        let (mut settings, templates) = manager_fixtures();
        settings.max_stack_depth = 2;
        settings.overflow_strategy = OverflowStrategy::CancelOldest;
        let manager = FlowManager::new(&settings, &templates);
        let mut state = DialogueState::new();

        for name in ["a", "b"] {
            match manager.push(&state, PushRequest::new(name, PushReason::Initial)) {
                PushOutcome::Pushed { delta, .. } => apply(&mut state, delta),
                other => panic!("expected push, got {:?}", other),
            }
        }
        let oldest_id = state.flow_stack[0].flow_id.clone();
        state
            .flow_slots
            .insert(oldest_id.clone(), HashMap::from([("x".to_string(), json!(1))]));

        match manager.push(&state, PushRequest::new("c", PushReason::Digression)) {
            PushOutcome::Pushed { delta, .. } => apply(&mut state, delta),
            other => panic!("expected push, got {:?}", other),
        }

        assert_eq!(state.stack_depth(), 2);
        assert_eq!(state.flow_stack[1].flow_name, "c");
        // The cancelled flow's slots are pruned and its end recorded.
        assert!(!state.flow_slots.contains_key(&oldest_id));
        assert_eq!(state.completed_flows.len(), 1);
        assert_eq!(state.completed_flows[0].result, FlowResult::Cancelled);
    }

    #[test]
    fn test_pop_resumes_parent_and_prunes_child() {
        let (settings, templates) = manager_fixtures();
        let manager = FlowManager::new(&settings, &templates);
        let mut state = DialogueState::new();

        for (name, reason) in [("parent", PushReason::Initial), ("child", PushReason::Digression)] {
            match manager.push(&state, PushRequest::new(name, reason)) {
                PushOutcome::Pushed { delta, .. } => apply(&mut state, delta),
                other => panic!("expected push, got {:?}", other),
            }
        }
        let child_id = state.active_context().unwrap().flow_id.clone();
        state
            .flow_slots
            .insert(child_id.clone(), HashMap::from([("y".to_string(), json!(2))]));

        let outcome = manager.pop(&state, FlowResult::Completed).unwrap();
        assert_eq!(outcome.resumed_parent.as_deref(), Some("parent"));
        assert_eq!(outcome.popped.flow_state, FlowPhase::Completed);
        // Digression return is acknowledged.
        assert_eq!(outcome.delta.response_fragment.as_deref(), Some("Back to parent."));

        apply(&mut state, outcome.delta);
        assert_eq!(state.stack_depth(), 1);
        assert_eq!(state.active_context().unwrap().flow_state, FlowPhase::Active);
        assert!(!state.flow_slots.contains_key(&child_id));
    }

    #[test]
    fn test_pop_maps_call_outputs_on_completion_only() {
        let (settings, templates) = manager_fixtures();
        let manager = FlowManager::new(&settings, &templates);
        let mut state = DialogueState::new();

        match manager.push(&state, PushRequest::new("parent", PushReason::Initial)) {
            PushOutcome::Pushed { delta, .. } => apply(&mut state, delta),
            other => panic!("expected push, got {:?}", other),
        }
        let parent_id = state.active_context().unwrap().flow_id.clone();

        let mut request = PushRequest::new("child", PushReason::Call);
        request.output_mappings =
            HashMap::from([("balance".to_string(), "latest_balance".to_string())]);
        match manager.push(&state, request) {
            PushOutcome::Pushed { delta, .. } => apply(&mut state, delta),
            other => panic!("expected push, got {:?}", other),
        }
        let child_id = state.active_context().unwrap().flow_id.clone();
        state
            .flow_slots
            .insert(child_id, HashMap::from([("balance".to_string(), json!(120))]));

        let outcome = manager.pop(&state, FlowResult::Completed).unwrap();
        apply(&mut state, outcome.delta);

        assert_eq!(state.flow_slots[&parent_id]["latest_balance"], json!(120));
    }

    #[test]
    fn test_pop_cancelled_child_maps_nothing() {
        let (settings, templates) = manager_fixtures();
        let manager = FlowManager::new(&settings, &templates);
        let mut state = DialogueState::new();

        match manager.push(&state, PushRequest::new("parent", PushReason::Initial)) {
            PushOutcome::Pushed { delta, .. } => apply(&mut state, delta),
            other => panic!("expected push, got {:?}", other),
        }
        let parent_id = state.active_context().unwrap().flow_id.clone();

        let mut request = PushRequest::new("child", PushReason::Call);
        request.output_mappings = HashMap::from([("a".to_string(), "b".to_string())]);
        match manager.push(&state, request) {
            PushOutcome::Pushed { delta, .. } => apply(&mut state, delta),
            other => panic!("expected push, got {:?}", other),
        }

        let outcome = manager.pop(&state, FlowResult::Cancelled).unwrap();
        apply(&mut state, outcome.delta);

        assert!(state
            .flow_slots
            .get(&parent_id)
            .map(|s| !s.contains_key("b"))
            .unwrap_or(true));
    }

    #[test]
    fn test_pop_empty_stack_is_none() {
        let (settings, templates) = manager_fixtures();
        let manager = FlowManager::new(&settings, &templates);
        assert!(manager.pop(&DialogueState::new(), FlowResult::Completed).is_none());
    }
}
