//! Step manager: per-flow cursor and advancement through completed steps
//!
//! The cursor (`current_step_index` on the active [`FlowContext`]) parks on
//! the first *incomplete* step. Completeness is variant-specific: a collect
//! is complete iff its slot is set, an action iff its index is in
//! `executed_steps`, and branch/say/set/confirm use the execution flag (a
//! routed branch or answered confirm additionally has its recorded target).
//!
//! [`StepManager::advance_through_completed`] is what makes "I want to fly
//! from NYC to LAX tomorrow" fill three slots and park on the confirm step
//! rather than the second collect: after the dispatcher stores the slot
//! values, the cursor skips every collect whose slot is now set. Advancement
//! shares the per-turn node budget; running out means the graph is mis-wired
//! and surfaces as an [`AdvanceCap`](crate::error::EngineError::AdvanceCap)
//! error, never a silent stall.

use crate::compiler::{CompiledNode, CompiledSpec, Next, NodeKind};
use crate::config::Settings;
use crate::delta::StateDelta;
use crate::error::{EngineError, Result};
use crate::state::{ConversationState, DialogueState};

/// Metadata key recording the routed target of an executed branch/confirm
pub fn branch_target_key(flow_id: &str, index: usize) -> String {
    format!("_branch_target:{}:{}", flow_id, index)
}

/// Cursor operations over the active flow
pub struct StepManager<'a> {
    compiled: &'a CompiledSpec,
    settings: &'a Settings,
}

impl<'a> StepManager<'a> {
    pub fn new(compiled: &'a CompiledSpec, settings: &'a Settings) -> Self {
        Self { compiled, settings }
    }

    /// The node the active flow is parked on
    ///
    /// `Ok(None)` when idle or when the cursor has run off the end (flow
    /// complete, waiting for the scheduler to pop).
    pub fn current_node(&self, state: &DialogueState) -> Result<Option<&'a CompiledNode>> {
        let Some(ctx) = state.active_context() else {
            return Ok(None);
        };
        let graph = self.compiled.flow(&ctx.flow_name)?;
        Ok(graph.node(ctx.current_step_index))
    }

    /// Variant-specific completeness check
    pub fn is_complete(&self, node: &CompiledNode, state: &DialogueState, flow_id: &str) -> bool {
        match &node.kind {
            NodeKind::Collect { slot, .. } => state
                .flow_slots
                .get(flow_id)
                .and_then(|slots| slots.get(slot))
                .map(|v| !v.is_null())
                .unwrap_or(false),
            NodeKind::Action { .. }
            | NodeKind::Say { .. }
            | NodeKind::Set { .. }
            | NodeKind::Call { .. } => state.is_step_executed(flow_id, node.index),
            NodeKind::Branch { .. } | NodeKind::Confirm { .. } => {
                state.is_step_executed(flow_id, node.index)
                    && self.recorded_target(state, flow_id, node.index).is_some()
            }
            // A link transfers control the moment it runs; it is never
            // parked on in a completed state.
            NodeKind::Link { .. } => false,
        }
    }

    /// Successor of a step already known to be complete
    pub fn successor_of_completed(
        &self,
        node: &CompiledNode,
        state: &DialogueState,
        flow_id: &str,
    ) -> Option<Next> {
        match &node.kind {
            NodeKind::Branch { .. } | NodeKind::Confirm { .. } => self
                .recorded_target(state, flow_id, node.index)
                .map(Next::Step),
            _ => Some(node.next),
        }
    }

    /// Park classification for the step the cursor stopped on
    pub fn classify(node: Option<&CompiledNode>) -> ConversationState {
        match node.map(|n| &n.kind) {
            None => ConversationState::Idle,
            Some(NodeKind::Collect { .. }) => ConversationState::WaitingForSlot,
            Some(NodeKind::Action { .. }) => ConversationState::ReadyForAction,
            Some(NodeKind::Confirm { .. }) => ConversationState::ReadyForConfirmation,
            Some(_) => ConversationState::Internal,
        }
    }

    /// Move the cursor forward while the current step is complete
    ///
    /// Consumes from the shared per-turn node budget; exhausting it is a
    /// graph defect surfaced as `AdvanceCap`. Returns a delta updating the
    /// cursor and the conversation-state classification.
    pub fn advance_through_completed(
        &self,
        state: &DialogueState,
        budget: &mut usize,
    ) -> Result<StateDelta> {
        let Some(ctx) = state.active_context() else {
            return Ok(StateDelta {
                conversation_state: Some(ConversationState::Idle),
                ..StateDelta::default()
            });
        };
        let graph = self.compiled.flow(&ctx.flow_name)?;
        let flow_id = ctx.flow_id.clone();
        let flow_name = ctx.flow_name.clone();
        let mut index = ctx.current_step_index;
        let mut delta = StateDelta::new();
        // Routing decisions are consumed as they are traversed (a second
        // arrival within this walk means a cycle of stale marks, not a
        // completed step).
        let mut consumed: std::collections::HashSet<usize> = std::collections::HashSet::new();

        loop {
            let Some(node) = graph.node(index) else {
                break; // ran off the end: flow complete
            };
            if consumed.contains(&index) || !self.is_complete(node, state, &flow_id) {
                break;
            }
            if *budget == 0 {
                tracing::error!(
                    flow = %flow_name,
                    step = %node.name,
                    cap = self.settings.max_node_visits_per_turn,
                    "advance cap exceeded while skipping completed steps; graph is mis-wired"
                );
                return Err(EngineError::AdvanceCap {
                    flow: flow_name,
                    cap: self.settings.max_node_visits_per_turn,
                });
            }
            *budget -= 1;

            let successor = self.successor_of_completed(node, state, &flow_id);
            if matches!(node.kind, NodeKind::Branch { .. } | NodeKind::Confirm { .. }) {
                // An answered confirm or routed branch is one-shot: the next
                // visit re-evaluates instead of replaying the old route.
                consumed.insert(index);
                delta.cleared_steps.push((flow_id.clone(), node.index));
                delta
                    .metadata_removals
                    .push(branch_target_key(&flow_id, node.index));
            }

            match successor {
                Some(Next::Step(next)) => {
                    tracing::trace!(flow = %flow_name, from = %node.name, to = next, "skipping completed step");
                    index = next;
                }
                Some(Next::End) | None => {
                    index = graph.len(); // park past the end: complete
                    break;
                }
            }
        }

        let mut stack = state.flow_stack.clone();
        if let Some(top) = stack.last_mut() {
            top.current_step_index = index;
        }

        delta.flow_stack = Some(stack);
        delta.conversation_state = Some(Self::classify(graph.node(index)));
        Ok(delta)
    }

    fn recorded_target(&self, state: &DialogueState, flow_id: &str, index: usize) -> Option<usize> {
        state
            .metadata
            .get(&branch_target_key(flow_id, index))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }
}
