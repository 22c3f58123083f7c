//! Pattern dispatcher: NLU interpretations to state deltas
//!
//! The dispatcher is the reconciliation point between what the user just
//! said (as one of the closed set of [`MessageType`]s) and what the graph is
//! currently doing. Each dispatch returns zero or more deltas, applied by
//! the scheduler in order, plus a verdict on whether the turn should go on
//! to advance the graph.
//!
//! Dispatch table:
//!
//! | Type | Effect |
//! |---|---|
//! | slot_value | normalize + validate each slot in utterance order; store; a validation failure suspends with the configured retry message |
//! | correction | store and rewind the cursor to the earliest corrected collect; while a confirmation awaits its reply, corrections it owns (its declared `slot`, or any slot when it declares none) re-prompt it instead |
//! | modification | store without rewinding; acknowledged differently |
//! | interruption / digression | push the named flow (depth permitting) |
//! | clarification / chitchat | render the template, restore the pending task, do not advance |
//! | cancellation | pop the active flow as cancelled, prune it, render the template |
//! | confirmation | forward to the confirmation subsystem |
//! | continuation | advance normally (an awaited inform was already consumed) |
//! | handoff | mark the session escalated, render the template |
//!
//! Per-slot `action` flags override the blanket message type, and a
//! fallback slot (synthesised at confidence 0.5) is never treated as a
//! correction.

use serde_json::{json, Value};

use crate::compiler::{CompiledNode, NodeKind};
use crate::confirmation::ConfirmationManager;
use crate::delta::StateDelta;
use crate::error::Result;
use crate::flow_manager::{FlowManager, PushOutcome, PushRequest};
use crate::nlu::{MessageType, NluInterpretation, SlotAction, SlotValue};
use crate::runtime::Runtime;
use crate::state::{
    ConversationState, DialogueState, FlowResult, PendingTask, PushReason,
};
use crate::step_manager::{branch_target_key, StepManager};

/// What a dispatch decided
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Deltas to apply, in order
    pub deltas: Vec<StateDelta>,
    /// Whether the scheduler should advance the graph afterwards
    pub advance: bool,
}

impl DispatchOutcome {
    fn advancing(deltas: Vec<StateDelta>) -> Self {
        Self {
            deltas,
            advance: true,
        }
    }

    fn parked(deltas: Vec<StateDelta>) -> Self {
        Self {
            deltas,
            advance: false,
        }
    }
}

/// Turns one interpretation into state deltas
pub struct PatternDispatcher<'a> {
    runtime: &'a Runtime,
}

impl<'a> PatternDispatcher<'a> {
    pub fn new(runtime: &'a Runtime) -> Self {
        Self { runtime }
    }

    /// Dispatch one interpretation
    ///
    /// `consumed_pending` is the pending task the turn started with (already
    /// cleared from state); non-consuming message types restore it so the
    /// session keeps waiting for the same input.
    pub fn dispatch(
        &self,
        state: &DialogueState,
        interpretation: &NluInterpretation,
        consumed_pending: Option<&PendingTask>,
    ) -> Result<DispatchOutcome> {
        tracing::trace!(
            message_type = ?interpretation.message_type,
            slots = interpretation.slots.len(),
            command = ?interpretation.command,
            "dispatching interpretation"
        );

        match interpretation.message_type {
            MessageType::SlotValue => {
                self.apply_slot_values(state, interpretation, consumed_pending, SlotAction::Provide)
            }
            MessageType::Correction => {
                self.apply_slot_values(state, interpretation, consumed_pending, SlotAction::Correct)
            }
            MessageType::Modification => {
                self.apply_slot_values(state, interpretation, consumed_pending, SlotAction::Modify)
            }
            MessageType::Confirmation => self.handle_confirmation(state, interpretation),
            MessageType::Continuation => Ok(DispatchOutcome::advancing(vec![])),
            MessageType::Cancellation => Ok(self.handle_cancellation(state)),
            MessageType::Interruption => {
                self.handle_flow_push(state, interpretation, consumed_pending, PushReason::Interruption)
            }
            MessageType::Digression => {
                self.handle_flow_push(state, interpretation, consumed_pending, PushReason::Digression)
            }
            MessageType::Clarification => Ok(self.template_reply(
                self.runtime.templates().clarification.clone(),
                state,
                consumed_pending,
            )),
            MessageType::Chitchat => Ok(self.template_reply(
                self.runtime.templates().chitchat.clone(),
                state,
                consumed_pending,
            )),
            MessageType::Handoff => Ok(self.handle_handoff(state, consumed_pending)),
        }
    }

    // --- slot values, corrections, modifications --------------------------

    fn apply_slot_values(
        &self,
        state: &DialogueState,
        interpretation: &NluInterpretation,
        consumed_pending: Option<&PendingTask>,
        blanket: SlotAction,
    ) -> Result<DispatchOutcome> {
        let Some(ctx) = state.active_context() else {
            // Slot values with no active flow have nothing to fill.
            tracing::debug!("slot values arrived while idle; ignoring");
            return Ok(DispatchOutcome::parked(vec![]));
        };
        let flow_id = ctx.flow_id.clone();
        let graph = self.runtime.compiled().flow(&ctx.flow_name)?;
        let at_confirm = matches!(consumed_pending, Some(PendingTask::Confirm { .. }));

        let mut working = state.clone();
        let mut deltas: Vec<StateDelta> = Vec::new();
        let mut corrected_indices: Vec<usize> = Vec::new();
        let mut corrected_names: Vec<String> = Vec::new();

        for slot_value in &interpretation.slots {
            let effective = effective_action(slot_value, blanket);
            let decl = self.runtime.spec().slot(&slot_value.name);

            let normalized = match self.runtime.normalizer().normalize(
                decl,
                &slot_value.name,
                &slot_value.value,
            ) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(slot = %slot_value.name, error = %e, "normalization rejected value");
                    deltas.push(self.validation_retry(&working, graph.node_for_slot(&slot_value.name)));
                    return Ok(DispatchOutcome::parked(deltas));
                }
            };

            if !self.validate_slot(graph, &slot_value.name, &normalized) {
                tracing::debug!(slot = %slot_value.name, "validator rejected value");
                deltas.push(self.validation_retry(&working, graph.node_for_slot(&slot_value.name)));
                return Ok(DispatchOutcome::parked(deltas));
            }

            let mut slots = working.flow_slots.get(&flow_id).cloned().unwrap_or_default();
            slots.insert(slot_value.name.clone(), normalized.clone());
            let mut delta = StateDelta::with_slots(flow_id.clone(), slots);

            match effective {
                SlotAction::Provide => {}
                SlotAction::Correct => {
                    corrected_names.push(slot_value.name.clone());
                    if let Some(idx) = graph.collect_index_for_slot(&slot_value.name) {
                        corrected_indices.push(idx);
                    }
                    let ack = self.runtime.render(
                        &self.runtime.templates().correction_ack,
                        &working,
                        &[
                            ("slot", json!(slot_value.name)),
                            ("value", normalized.clone()),
                        ],
                    );
                    delta.metadata.push(("_correction_ack".to_string(), json!(ack)));
                    delta.response_fragment = Some(ack);
                }
                SlotAction::Modify => {
                    let ack = self.runtime.render(
                        &self.runtime.templates().modification_ack,
                        &working,
                        &[
                            ("slot", json!(slot_value.name)),
                            ("value", normalized.clone()),
                        ],
                    );
                    delta.metadata.push(("_modification_ack".to_string(), json!(ack)));
                    delta.response_fragment = Some(ack);
                }
            }

            working.apply(delta.clone(), usize::MAX, usize::MAX);
            deltas.push(delta);
        }

        if !corrected_names.is_empty() && at_confirm {
            // A correction while awaiting confirmation re-prompts with the
            // updated values instead of rewinding. A confirm that names a
            // slot only owns corrections to that slot; everything else falls
            // through to the rewind rule below.
            let confirm_mgr =
                ConfirmationManager::new(self.runtime.settings(), self.runtime.templates());
            if let Some(node) = current_node(&working, self.runtime)? {
                if let NodeKind::Confirm {
                    slot: confirm_slot, ..
                } = &node.kind
                {
                    let owns_correction = confirm_slot
                        .as_ref()
                        .map_or(true, |s| corrected_names.iter().any(|n| n == s));
                    if owns_correction {
                        deltas.push(confirm_mgr.reprompt(&working, node));
                        return Ok(DispatchOutcome::parked(deltas));
                    }
                }
            }
        }

        if let Some(&target) = corrected_indices.iter().min() {
            let current = working
                .active_context()
                .map(|c| c.current_step_index)
                .unwrap_or(0);
            if target < current {
                deltas.push(rewind_to(&working, graph, &flow_id, target));
            }
        }

        Ok(DispatchOutcome::advancing(deltas))
    }

    fn validate_slot(&self, graph: &crate::compiler::FlowGraph, slot: &str, value: &Value) -> bool {
        let step_validator = graph.node_for_slot(slot).and_then(|n| match &n.kind {
            NodeKind::Collect { validator, .. } => validator.clone(),
            _ => None,
        });
        let decl_validator = self
            .runtime
            .spec()
            .slot(slot)
            .and_then(|d| d.validator.clone());

        match step_validator.or(decl_validator) {
            Some(name) => self.runtime.validators().validate(&name, value),
            None => true,
        }
    }

    /// Suspend on the collect step again with the configured retry message
    fn validation_retry(
        &self,
        state: &DialogueState,
        node: Option<&CompiledNode>,
    ) -> StateDelta {
        let (slot, message) = match node.map(|n| &n.kind) {
            Some(NodeKind::Collect {
                slot,
                validation_message,
                ..
            }) => (
                slot.clone(),
                validation_message.clone().unwrap_or_else(|| {
                    self.runtime.templates().validation_failed.clone()
                }),
            ),
            _ => (
                String::new(),
                self.runtime.templates().validation_failed.clone(),
            ),
        };
        let prompt = self
            .runtime
            .render(&message, state, &[("slot", json!(slot))]);
        StateDelta::with_pending(PendingTask::Collect {
            slot,
            prompt,
            options: None,
        })
    }

    // --- confirmation ------------------------------------------------------

    fn handle_confirmation(
        &self,
        state: &DialogueState,
        interpretation: &NluInterpretation,
    ) -> Result<DispatchOutcome> {
        let Some(node) = current_node(state, self.runtime)? else {
            return Ok(DispatchOutcome::advancing(vec![]));
        };
        if !matches!(node.kind, NodeKind::Confirm { .. }) {
            // A stray "yes" outside a confirmation advances like a
            // continuation.
            tracing::debug!(step = %node.name, "confirmation outside a confirm step; treating as continuation");
            return Ok(DispatchOutcome::advancing(vec![]));
        }

        let confirm_mgr =
            ConfirmationManager::new(self.runtime.settings(), self.runtime.templates());
        let (outcome, delta) =
            confirm_mgr.handle_reply(state, node, interpretation.confirmation_value);
        Ok(DispatchOutcome {
            deltas: vec![delta],
            advance: outcome.advances(),
        })
    }

    // --- cancellation ------------------------------------------------------

    fn handle_cancellation(&self, state: &DialogueState) -> DispatchOutcome {
        let flow_mgr = FlowManager::new(self.runtime.settings(), self.runtime.templates());
        let Some(outcome) = flow_mgr.pop(state, FlowResult::Cancelled) else {
            // Nothing to cancel.
            return DispatchOutcome::parked(vec![StateDelta::with_fragment(
                self.runtime.templates().cancellation.clone(),
            )]);
        };

        let mut deltas = vec![outcome.delta];
        let mut reply = StateDelta::with_fragment(self.runtime.templates().cancellation.clone());
        reply.pending_task = Some(None);
        deltas.push(reply);

        DispatchOutcome::parked(deltas)
    }

    // --- interruptions and digressions -------------------------------------

    fn handle_flow_push(
        &self,
        state: &DialogueState,
        interpretation: &NluInterpretation,
        consumed_pending: Option<&PendingTask>,
        reason: PushReason,
    ) -> Result<DispatchOutcome> {
        let Some(command) = interpretation.command.as_deref() else {
            tracing::debug!("interruption without a flow command; asking for clarification");
            return Ok(self.template_reply(
                self.runtime.templates().clarification.clone(),
                state,
                consumed_pending,
            ));
        };
        if self.runtime.compiled().flow(command).is_err() {
            tracing::debug!(flow = command, "interruption names an unknown flow");
            return Ok(self.template_reply(
                self.runtime.templates().clarification.clone(),
                state,
                consumed_pending,
            ));
        }

        let reason = if state.flow_stack.is_empty() {
            PushReason::Initial
        } else {
            reason
        };
        let flow_mgr = FlowManager::new(self.runtime.settings(), self.runtime.templates());
        match flow_mgr.push(state, PushRequest::new(command, reason)) {
            PushOutcome::Pushed { delta, .. } => Ok(DispatchOutcome::advancing(vec![delta])),
            PushOutcome::Rejected { mut delta } => {
                // The active flow keeps waiting for whatever it was waiting for.
                if let Some(pending) = consumed_pending {
                    delta.pending_task = Some(Some(pending.clone()));
                }
                Ok(DispatchOutcome::parked(vec![delta]))
            }
        }
    }

    // --- simple template replies -------------------------------------------

    fn template_reply(
        &self,
        template: String,
        state: &DialogueState,
        consumed_pending: Option<&PendingTask>,
    ) -> DispatchOutcome {
        let rendered = self.runtime.render(&template, state, &[]);
        let mut delta = StateDelta::with_fragment(rendered);
        if let Some(pending) = consumed_pending {
            delta.pending_task = Some(Some(pending.clone()));
        }
        DispatchOutcome::parked(vec![delta])
    }

    fn handle_handoff(
        &self,
        state: &DialogueState,
        consumed_pending: Option<&PendingTask>,
    ) -> DispatchOutcome {
        let mut outcome = self.template_reply(
            self.runtime.templates().handoff.clone(),
            state,
            consumed_pending,
        );
        let mut delta = StateDelta::new().set_metadata("_escalated", json!(true));
        delta.conversation_state = Some(ConversationState::Escalated);
        outcome.deltas.push(delta);
        outcome
    }

}

/// Per-slot action override of the blanket message type
///
/// A slot explicitly flagged `correct`/`modify` keeps that flag; an unflagged
/// (`provide`) slot inherits the blanket. Fallback slots never upgrade.
fn effective_action(slot: &SlotValue, blanket: SlotAction) -> SlotAction {
    if slot.action != SlotAction::Provide {
        return slot.action;
    }
    if slot.is_fallback() {
        return SlotAction::Provide;
    }
    blanket
}

/// The node the active flow is parked on, if any
fn current_node<'r>(
    state: &DialogueState,
    runtime: &'r Runtime,
) -> Result<Option<&'r CompiledNode>> {
    StepManager::new(runtime.compiled(), runtime.settings()).current_node(state)
}

/// Cursor rewind for a correction: back to the corrected collect, clearing
/// re-runnable execution marks at or after the target (action marks stay -
/// at-most-once execution wins over re-execution)
fn rewind_to(
    state: &DialogueState,
    graph: &crate::compiler::FlowGraph,
    flow_id: &str,
    target: usize,
) -> StateDelta {
    let mut stack = state.flow_stack.clone();
    if let Some(top) = stack.last_mut() {
        tracing::debug!(
            flow = %top.flow_name,
            from = top.current_step_index,
            to = target,
            "rewinding cursor for correction"
        );
        top.current_step_index = target;
    }

    let mut delta = StateDelta::with_stack(stack);
    for node in graph.nodes().iter().filter(|n| n.index >= target) {
        if matches!(node.kind, NodeKind::Action { .. }) {
            continue;
        }
        if state.is_step_executed(flow_id, node.index) {
            delta.cleared_steps.push((flow_id.to_string(), node.index));
            delta
                .metadata_removals
                .push(branch_target_key(flow_id, node.index));
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionRegistry, IdentityNormalizer, ValidatorRegistry};
    use crate::compiler::CompiledSpec;
    use crate::config::DialogueSpec;
    use crate::nlu::ScriptedNlu;
    use crate::state::{FlowContext, FlowPhase};
    use std::collections::HashMap;
    use std::sync::Arc;

    const SPEC: &str = r#"
flows:
  - name: book_flight
    steps:
      - {step: ask_origin, type: collect, slot: origin, prompt: "From?"}
      - {step: ask_destination, type: collect, slot: destination, prompt: "To?"}
      - {step: ask_date, type: collect, slot: date, prompt: "When?", validator: date, validation_message: "That's not a date I understand."}
      - {step: search, type: action, call: search_flights}
      - step: ask
        type: confirm
        slot: destination
        message: "Book {origin} to {destination}?"
        on_confirm: done
        on_deny: ask_origin
      - {step: done, type: say, message: "Done!"}
  - name: check_balance
    steps:
      - {step: tell, type: say, message: "Your balance is fine."}
"#;

    fn runtime() -> Runtime {
        let spec = Arc::new(DialogueSpec::from_yaml(SPEC).unwrap());
        let compiled = Arc::new(CompiledSpec::compile(&spec).unwrap());
        Runtime::new(
            spec,
            compiled,
            Arc::new(ScriptedNlu::new(vec![])),
            Arc::new(ActionRegistry::new()),
            Arc::new(IdentityNormalizer),
            Arc::new(ValidatorRegistry::with_builtins()),
        )
    }

    fn state_in_flow(at_step: usize) -> (DialogueState, String) {
        let mut state = DialogueState::new();
        let mut ctx = FlowContext::new("book_flight", crate::state::PushReason::Initial);
        ctx.current_step_index = at_step;
        let id = ctx.flow_id.clone();
        state.flow_stack.push(ctx);
        (state, id)
    }

    fn apply_outcome(state: &mut DialogueState, outcome: &DispatchOutcome) {
        for delta in &outcome.deltas {
            state.apply(delta.clone(), 10, 10);
        }
    }

    #[test]
    fn test_slot_value_stores_normalized_value() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, id) = state_in_flow(0);

        let interp = NluInterpretation::of(MessageType::SlotValue)
            .with_slots(vec![SlotValue::provide("origin", json!("Madrid"))]);
        let outcome = dispatcher.dispatch(&state, &interp, None).unwrap();
        assert!(outcome.advance);

        apply_outcome(&mut state, &outcome);
        assert_eq!(state.flow_slots[&id]["origin"], json!("Madrid"));
    }

    #[test]
    fn test_multiple_slots_applied_in_order() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, id) = state_in_flow(0);

        let interp = NluInterpretation::of(MessageType::SlotValue).with_slots(vec![
            SlotValue::provide("origin", json!("New York")),
            SlotValue::provide("destination", json!("Los Angeles")),
        ]);
        let outcome = dispatcher.dispatch(&state, &interp, None).unwrap();
        apply_outcome(&mut state, &outcome);

        assert_eq!(state.flow_slots[&id]["origin"], json!("New York"));
        assert_eq!(state.flow_slots[&id]["destination"], json!("Los Angeles"));
    }

    #[test]
    fn test_validation_failure_suspends_with_retry_message() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, id) = state_in_flow(2);

        let interp = NluInterpretation::of(MessageType::SlotValue)
            .with_slots(vec![SlotValue::provide("date", json!("whenever-ish"))]);
        let outcome = dispatcher.dispatch(&state, &interp, None).unwrap();
        assert!(!outcome.advance);

        apply_outcome(&mut state, &outcome);
        match &state.pending_task {
            Some(PendingTask::Collect { slot, prompt, .. }) => {
                assert_eq!(slot, "date");
                assert_eq!(prompt, "That's not a date I understand.");
            }
            other => panic!("expected collect retry, got {:?}", other),
        }
        // The rejected value was not stored.
        assert!(state
            .flow_slots
            .get(&id)
            .map(|s| !s.contains_key("date"))
            .unwrap_or(true));
    }

    #[test]
    fn test_correction_rewinds_to_earliest_corrected_collect() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, id) = state_in_flow(1);
        state.flow_slots.insert(
            id.clone(),
            HashMap::from([("origin".to_string(), json!("Chicago"))]),
        );
        // ask_origin already ran once.
        state.executed_steps.entry(id.clone()).or_default().insert(0);

        let interp = NluInterpretation::of(MessageType::Correction)
            .with_slots(vec![SlotValue::correct("origin", json!("Denver"))]);
        let outcome = dispatcher.dispatch(&state, &interp, None).unwrap();
        assert!(outcome.advance);
        apply_outcome(&mut state, &outcome);

        assert_eq!(state.flow_slots[&id]["origin"], json!("Denver"));
        // Cursor rewound to the corrected collect; advancement will skip it
        // forward again since the slot is set.
        assert_eq!(state.active_context().unwrap().current_step_index, 0);
        // An acknowledgement was rendered.
        let ack = outcome
            .deltas
            .iter()
            .find_map(|d| d.response_fragment.clone())
            .unwrap();
        assert!(ack.contains("origin") && ack.contains("Denver"));
    }

    #[test]
    fn test_modification_does_not_rewind() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, id) = state_in_flow(2);
        state.flow_slots.insert(
            id.clone(),
            HashMap::from([("origin".to_string(), json!("Chicago"))]),
        );

        let interp = NluInterpretation::of(MessageType::Modification)
            .with_slots(vec![SlotValue {
                name: "origin".to_string(),
                value: json!("Denver"),
                action: SlotAction::Modify,
                confidence: 1.0,
            }]);
        let outcome = dispatcher.dispatch(&state, &interp, None).unwrap();
        apply_outcome(&mut state, &outcome);

        assert_eq!(state.flow_slots[&id]["origin"], json!("Denver"));
        assert_eq!(state.active_context().unwrap().current_step_index, 2);
    }

    #[test]
    fn test_correction_to_confirmed_slot_reprompts_the_confirmation() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, id) = state_in_flow(4);
        state.flow_slots.insert(
            id.clone(),
            HashMap::from([
                ("origin".to_string(), json!("Madrid")),
                ("destination".to_string(), json!("Barcelona")),
            ]),
        );
        let pending = PendingTask::Confirm {
            prompt: "Book Madrid to Barcelona?".to_string(),
            options: vec!["yes".to_string(), "no".to_string()],
        };

        // The confirm declares slot: destination, so it owns this correction.
        let interp = NluInterpretation::of(MessageType::Correction)
            .with_slots(vec![SlotValue::correct("destination", json!("Valencia"))]);
        let outcome = dispatcher.dispatch(&state, &interp, Some(&pending)).unwrap();
        assert!(!outcome.advance);
        apply_outcome(&mut state, &outcome);

        // No rewind: the cursor stays on the confirm, re-prompted with the
        // corrected value interpolated.
        assert_eq!(state.active_context().unwrap().current_step_index, 4);
        match &state.pending_task {
            Some(PendingTask::Confirm { prompt, .. }) => {
                assert_eq!(prompt, "Book Madrid to Valencia?");
            }
            other => panic!("expected confirm re-prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_correction_to_other_slot_at_confirm_rewinds_instead() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, id) = state_in_flow(4);
        state.flow_slots.insert(
            id.clone(),
            HashMap::from([
                ("origin".to_string(), json!("Madrid")),
                ("destination".to_string(), json!("Barcelona")),
            ]),
        );
        let pending = PendingTask::Confirm {
            prompt: "Book Madrid to Barcelona?".to_string(),
            options: vec!["yes".to_string(), "no".to_string()],
        };

        // origin is outside the confirm's declared slot: normal rewind rule.
        let interp = NluInterpretation::of(MessageType::Correction)
            .with_slots(vec![SlotValue::correct("origin", json!("Denver"))]);
        let outcome = dispatcher.dispatch(&state, &interp, Some(&pending)).unwrap();
        assert!(outcome.advance);
        apply_outcome(&mut state, &outcome);

        assert_eq!(state.flow_slots[&id]["origin"], json!("Denver"));
        assert_eq!(state.active_context().unwrap().current_step_index, 0);
    }

    #[test]
    fn test_fallback_slot_never_becomes_correction() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, id) = state_in_flow(1);
        state.flow_slots.insert(
            id.clone(),
            HashMap::from([("origin".to_string(), json!("Chicago"))]),
        );

        let fallback = SlotValue {
            name: "origin".to_string(),
            value: json!("Denver"),
            action: SlotAction::Provide,
            confidence: crate::nlu::FALLBACK_CONFIDENCE,
        };
        let interp =
            NluInterpretation::of(MessageType::Correction).with_slots(vec![fallback]);
        let outcome = dispatcher.dispatch(&state, &interp, None).unwrap();
        apply_outcome(&mut state, &outcome);

        // Value stored, but no rewind happened.
        assert_eq!(state.flow_slots[&id]["origin"], json!("Denver"));
        assert_eq!(state.active_context().unwrap().current_step_index, 1);
    }

    #[test]
    fn test_cancellation_pops_and_prunes() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, id) = state_in_flow(1);
        state.flow_slots.insert(
            id.clone(),
            HashMap::from([("origin".to_string(), json!("Madrid"))]),
        );
        state.executed_steps.entry(id.clone()).or_default().insert(0);
        state.pending_task = Some(PendingTask::Collect {
            slot: "destination".to_string(),
            prompt: "To?".to_string(),
            options: None,
        });

        let interp = NluInterpretation::of(MessageType::Cancellation);
        let outcome = dispatcher.dispatch(&state, &interp, None).unwrap();
        assert!(!outcome.advance);
        apply_outcome(&mut state, &outcome);

        assert!(state.flow_stack.is_empty());
        assert!(!state.flow_slots.contains_key(&id));
        assert!(!state.executed_steps.contains_key(&id));
        assert_eq!(state.pending_task, None);
        assert_eq!(state.completed_flows.len(), 1);
        assert_eq!(state.completed_flows[0].result, FlowResult::Cancelled);
        let frag = outcome
            .deltas
            .iter()
            .find_map(|d| d.response_fragment.clone())
            .unwrap();
        assert_eq!(frag, crate::config::ResponseTemplates::default().cancellation);
    }

    #[test]
    fn test_digression_pushes_and_pauses_parent() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, _) = state_in_flow(1);

        let interp =
            NluInterpretation::of(MessageType::Digression).with_command("check_balance");
        let outcome = dispatcher.dispatch(&state, &interp, None).unwrap();
        assert!(outcome.advance);
        apply_outcome(&mut state, &outcome);

        assert_eq!(state.stack_depth(), 2);
        assert_eq!(state.flow_stack[0].flow_state, FlowPhase::Paused);
        assert_eq!(state.active_context().unwrap().flow_name, "check_balance");
        assert!(state.active_context().unwrap().resume_parent);
    }

    #[test]
    fn test_unknown_flow_command_asks_for_clarification() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (state, _) = state_in_flow(1);
        let pending = PendingTask::Collect {
            slot: "destination".to_string(),
            prompt: "To?".to_string(),
            options: None,
        };

        let interp =
            NluInterpretation::of(MessageType::Interruption).with_command("order_pizza");
        let outcome = dispatcher.dispatch(&state, &interp, Some(&pending)).unwrap();
        assert!(!outcome.advance);
        // The pending task is restored so the session keeps waiting.
        assert!(outcome
            .deltas
            .iter()
            .any(|d| matches!(&d.pending_task, Some(Some(PendingTask::Collect { slot, .. })) if slot == "destination")));
    }

    #[test]
    fn test_handoff_escalates() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (mut state, _) = state_in_flow(1);

        let interp = NluInterpretation::of(MessageType::Handoff);
        let outcome = dispatcher.dispatch(&state, &interp, None).unwrap();
        assert!(!outcome.advance);
        apply_outcome(&mut state, &outcome);

        assert_eq!(state.conversation_state, ConversationState::Escalated);
        assert_eq!(state.metadata["_escalated"], json!(true));
    }

    #[test]
    fn test_chitchat_does_not_advance() {
        let rt = runtime();
        let dispatcher = PatternDispatcher::new(&rt);
        let (state, _) = state_in_flow(1);

        let interp = NluInterpretation::of(MessageType::Chitchat);
        let outcome = dispatcher.dispatch(&state, &interp, None).unwrap();
        assert!(!outcome.advance);
        assert!(outcome.deltas[0].response_fragment.is_some());
    }
}
