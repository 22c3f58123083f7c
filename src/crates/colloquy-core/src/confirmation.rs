//! Confirmation subsystem: the confirm step's reply state machine
//!
//! A confirm step prompts, then waits. Each reply turn drives one transition
//! keyed on the interpretation's `confirmation_value`:
//!
//! - `Some(true)` - affirmed: the attempt counter clears and the cursor
//!   routes to `on_confirm`
//! - `Some(false)` - denied: counter clears, routes to `on_deny`
//! - `None` - unclear: the counter increments and the same prompt re-renders;
//!   at the configured maximum the exhausted response is emitted and the
//!   counter resets so the user gets a fresh round
//!
//! A correction or modification received while awaiting the reply is applied
//! by the dispatcher first; [`ConfirmationManager::reprompt`] then re-enters
//! the prompt state with the updated slot values interpolated and the
//! counter cleared. A confirm step that declares a `slot` only owns
//! corrections to that slot - corrections to anything else rewind the cursor
//! through the dispatcher's normal rule instead of re-prompting here.
//!
//! The attempt counter lives in state metadata under `_confirm_attempts`
//! (underscore-prefixed: never user-visible), so it survives checkpointing
//! like everything else about a suspended turn.

use serde_json::json;

use crate::compiler::{CompiledNode, NodeKind};
use crate::config::{ResponseTemplates, Settings};
use crate::delta::StateDelta;
use crate::state::{DialogueState, PendingTask};
use crate::step_manager::branch_target_key;
use crate::template::interpolate;

/// Metadata key holding the unclear-reply counter
pub const ATTEMPTS_KEY: &str = "_confirm_attempts";

/// What a confirmation reply resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Route to `on_confirm`; cursor advancement may continue
    Affirmed,
    /// Route to `on_deny`; cursor advancement may continue
    Denied,
    /// Unclear reply; same prompt re-issued
    Retry { attempt: u32 },
    /// Too many unclear replies; exhausted response emitted, counter reset
    Exhausted,
}

impl ConfirmOutcome {
    /// Whether the turn should continue advancing the graph
    pub fn advances(&self) -> bool {
        matches!(self, ConfirmOutcome::Affirmed | ConfirmOutcome::Denied)
    }
}

/// Drives confirm-step transitions
pub struct ConfirmationManager<'a> {
    settings: &'a Settings,
    templates: &'a ResponseTemplates,
}

impl<'a> ConfirmationManager<'a> {
    pub fn new(settings: &'a Settings, templates: &'a ResponseTemplates) -> Self {
        Self {
            settings,
            templates,
        }
    }

    /// Render the prompt and suspend (the step's first execution)
    pub fn prompt(&self, state: &DialogueState, node: &CompiledNode) -> StateDelta {
        StateDelta::with_pending(PendingTask::Confirm {
            prompt: self.rendered_prompt(state, node),
            options: vec!["yes".to_string(), "no".to_string()],
        })
    }

    /// Apply one reply to a confirm step the session is awaiting
    pub fn handle_reply(
        &self,
        state: &DialogueState,
        node: &CompiledNode,
        confirmation_value: Option<bool>,
    ) -> (ConfirmOutcome, StateDelta) {
        let NodeKind::Confirm {
            on_confirm,
            on_deny,
            ..
        } = &node.kind
        else {
            // The dispatcher only routes confirmations here when parked on a
            // confirm step; anything else is a no-op.
            return (ConfirmOutcome::Retry { attempt: 0 }, StateDelta::new());
        };
        let Some(ctx) = state.active_context() else {
            return (ConfirmOutcome::Retry { attempt: 0 }, StateDelta::new());
        };
        let flow_id = ctx.flow_id.clone();

        match confirmation_value {
            Some(answer) => {
                let target = if answer { *on_confirm } else { *on_deny };
                let mut delta = StateDelta::new().mark_executed(flow_id.clone(), node.index);
                delta.branch_target = Some((branch_target_key(&flow_id, node.index), target));
                delta.pending_task = Some(None);
                delta.metadata_removals.push(ATTEMPTS_KEY.to_string());
                tracing::debug!(
                    step = %node.name,
                    answer,
                    "confirmation resolved"
                );
                (
                    if answer {
                        ConfirmOutcome::Affirmed
                    } else {
                        ConfirmOutcome::Denied
                    },
                    delta,
                )
            }
            None => {
                let attempt = self.attempts(state) + 1;
                if attempt >= self.settings.max_confirmation_attempts {
                    tracing::debug!(step = %node.name, attempt, "confirmation attempts exhausted");
                    let mut delta = StateDelta::with_fragment(
                        self.templates.confirmation_exhausted.clone(),
                    );
                    delta.metadata_removals.push(ATTEMPTS_KEY.to_string());
                    delta.pending_task = Some(Some(PendingTask::Confirm {
                        prompt: self.rendered_prompt(state, node),
                        options: vec!["yes".to_string(), "no".to_string()],
                    }));
                    (ConfirmOutcome::Exhausted, delta)
                } else {
                    tracing::debug!(step = %node.name, attempt, "unclear confirmation; re-prompting");
                    let delta = StateDelta::with_pending(PendingTask::Confirm {
                        prompt: self.rendered_prompt(state, node),
                        options: vec!["yes".to_string(), "no".to_string()],
                    })
                    .set_metadata(ATTEMPTS_KEY, json!(attempt));
                    (ConfirmOutcome::Retry { attempt }, delta)
                }
            }
        }
    }

    /// Re-enter the prompt state after a mid-confirmation slot change
    ///
    /// The returned delta clears the attempt counter and re-suspends with
    /// the prompt rendered against the *post-update* state, so the caller
    /// must apply the slot delta first.
    pub fn reprompt(&self, state: &DialogueState, node: &CompiledNode) -> StateDelta {
        let mut delta = StateDelta::with_pending(PendingTask::Confirm {
            prompt: self.rendered_prompt(state, node),
            options: vec!["yes".to_string(), "no".to_string()],
        });
        delta.metadata_removals.push(ATTEMPTS_KEY.to_string());
        delta
    }

    fn attempts(&self, state: &DialogueState) -> u32 {
        state
            .metadata
            .get(ATTEMPTS_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }

    fn rendered_prompt(&self, state: &DialogueState, node: &CompiledNode) -> String {
        let message = match &node.kind {
            NodeKind::Confirm { message, .. } => message.as_str(),
            _ => "",
        };
        interpolate(message, &state.active_slots())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile_flow, FlowGraph};
    use crate::state::{FlowContext, PushReason};
    use crate::step::Step;
    use serde_json::json;
    use std::collections::HashMap;

    fn graph() -> FlowGraph {
        let steps: Vec<Step> = serde_yaml::from_str(
            r#"
- step: ask
  type: confirm
  message: "Book {origin} to {destination}?"
  on_confirm: done
  on_deny: retry
- {step: done, type: say, message: "Booked."}
- {step: retry, type: say, message: "Okay, starting over."}
"#,
        )
        .unwrap();
        compile_flow("booking", &steps).unwrap()
    }

    fn state_at_confirm() -> (DialogueState, String) {
        let mut state = DialogueState::new();
        let ctx = FlowContext::new("booking", PushReason::Initial);
        let id = ctx.flow_id.clone();
        state.flow_stack.push(ctx);
        state.flow_slots.insert(
            id.clone(),
            HashMap::from([
                ("origin".to_string(), json!("Madrid")),
                ("destination".to_string(), json!("Barcelona")),
            ]),
        );
        (state, id)
    }

    #[test]
    fn test_prompt_interpolates_slots() {
        let graph = graph();
        let settings = Settings::default();
        let templates = ResponseTemplates::default();
        let manager = ConfirmationManager::new(&settings, &templates);
        let (state, _) = state_at_confirm();

        let delta = manager.prompt(&state, graph.node(0).unwrap());
        match delta.pending_task {
            Some(Some(PendingTask::Confirm { prompt, .. })) => {
                assert_eq!(prompt, "Book Madrid to Barcelona?");
            }
            other => panic!("expected confirm pending task, got {:?}", other),
        }
    }

    #[test]
    fn test_affirm_routes_to_on_confirm_and_clears_counter() {
        let graph = graph();
        let settings = Settings::default();
        let templates = ResponseTemplates::default();
        let manager = ConfirmationManager::new(&settings, &templates);
        let (mut state, id) = state_at_confirm();
        state.metadata.insert(ATTEMPTS_KEY.to_string(), json!(2));

        let (outcome, delta) =
            manager.handle_reply(&state, graph.node(0).unwrap(), Some(true));
        assert_eq!(outcome, ConfirmOutcome::Affirmed);
        assert!(outcome.advances());

        state.apply(delta, 10, 10);
        assert!(state.is_step_executed(&id, 0));
        assert_eq!(state.metadata.get(ATTEMPTS_KEY), None);
        assert_eq!(state.metadata[&branch_target_key(&id, 0)], json!(1));
        assert_eq!(state.pending_task, None);
    }

    #[test]
    fn test_deny_routes_to_on_deny() {
        let graph = graph();
        let settings = Settings::default();
        let templates = ResponseTemplates::default();
        let manager = ConfirmationManager::new(&settings, &templates);
        let (mut state, id) = state_at_confirm();

        let (outcome, delta) =
            manager.handle_reply(&state, graph.node(0).unwrap(), Some(false));
        assert_eq!(outcome, ConfirmOutcome::Denied);

        state.apply(delta, 10, 10);
        assert_eq!(state.metadata[&branch_target_key(&id, 0)], json!(2));
    }

    #[test]
    fn test_unclear_increments_and_reprompts_until_exhausted() {
        let graph = graph();
        let settings = Settings::default(); // max 3 attempts
        let templates = ResponseTemplates::default();
        let manager = ConfirmationManager::new(&settings, &templates);
        let (mut state, _) = state_at_confirm();

        let (outcome, delta) = manager.handle_reply(&state, graph.node(0).unwrap(), None);
        assert_eq!(outcome, ConfirmOutcome::Retry { attempt: 1 });
        assert!(!outcome.advances());
        state.apply(delta, 10, 10);
        assert_eq!(state.metadata[ATTEMPTS_KEY], json!(1));
        // Same prompt re-rendered.
        assert_eq!(
            state.pending_task.as_ref().map(|t| t.prompt().to_string()),
            Some("Book Madrid to Barcelona?".to_string())
        );

        let (outcome, delta) = manager.handle_reply(&state, graph.node(0).unwrap(), None);
        assert_eq!(outcome, ConfirmOutcome::Retry { attempt: 2 });
        state.apply(delta, 10, 10);

        let (outcome, delta) = manager.handle_reply(&state, graph.node(0).unwrap(), None);
        assert_eq!(outcome, ConfirmOutcome::Exhausted);
        state.apply(delta, 10, 10);
        // Counter resets for a fresh round.
        assert_eq!(state.metadata.get(ATTEMPTS_KEY), None);

        // An affirm after exhaustion still works.
        let (outcome, _) = manager.handle_reply(&state, graph.node(0).unwrap(), Some(true));
        assert_eq!(outcome, ConfirmOutcome::Affirmed);
    }

    #[test]
    fn test_reprompt_after_correction_uses_updated_slots() {
        let graph = graph();
        let settings = Settings::default();
        let templates = ResponseTemplates::default();
        let manager = ConfirmationManager::new(&settings, &templates);
        let (mut state, id) = state_at_confirm();
        state.metadata.insert(ATTEMPTS_KEY.to_string(), json!(1));
        state
            .flow_slots
            .get_mut(&id)
            .unwrap()
            .insert("origin".to_string(), json!("Denver"));

        let delta = manager.reprompt(&state, graph.node(0).unwrap());
        state.apply(delta, 10, 10);

        assert_eq!(state.metadata.get(ATTEMPTS_KEY), None);
        assert_eq!(
            state.pending_task.as_ref().map(|t| t.prompt().to_string()),
            Some("Book Denver to Barcelona?".to_string())
        );
    }
}
