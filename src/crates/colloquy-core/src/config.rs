//! Config model: the validated in-memory dialogue specification
//!
//! A [`DialogueSpec`] is parsed from YAML (see the step module for the step
//! grammar) and then validated. Parsing enforces the discriminated step union;
//! `validate()` enforces everything serde cannot express: unique step names
//! per flow, unique flow names, non-empty messages and prompts, declared
//! action references, validator names, and settings ranges. Dangling step
//! *references* are the compiler's job and surface as `GraphBuild` errors.
//!
//! # Top-level layout (YAML)
//!
//! ```yaml
//! flows:
//!   - name: book_flight
//!     description: Book a flight for the user
//!     trigger_examples:
//!       - I want to book a flight
//!     steps:
//!       - step: ask_origin
//!         type: collect
//!         slot: origin
//!         prompt: "Where from?"
//! slots:
//!   - name: origin
//!     type: string
//! actions:
//!   - search_flights
//! responses:
//!   cancellation: "Okay, I've cancelled that."
//! settings:
//!   durability: async
//!   max_stack_depth: 5
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::step::Step;

/// Validated top-level dialogue specification
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DialogueSpec {
    /// Flow programs, in declaration order
    pub flows: Vec<FlowDef>,

    /// Slot declarations shared across flows
    #[serde(default)]
    pub slots: Vec<SlotDecl>,

    /// Names of actions the flows may call (handlers are registered in code)
    #[serde(default)]
    pub actions: Vec<String>,

    /// Response templates
    #[serde(default)]
    pub responses: ResponseTemplates,

    /// Engine settings
    #[serde(default)]
    pub settings: Settings,
}

/// One declared flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDef {
    /// Flow name, unique across the spec
    pub name: String,

    /// Human-readable description, passed to the NLU provider
    #[serde(default)]
    pub description: String,

    /// Example utterances that should trigger this flow
    #[serde(default)]
    pub trigger_examples: Vec<String>,

    /// Ordered step program
    pub steps: Vec<Step>,
}

/// Slot declaration: a named, typed value collected during a flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotDecl {
    /// Slot name
    pub name: String,

    /// Value type hint for the normalizer
    #[serde(default, rename = "type")]
    pub slot_type: SlotType,

    /// Default validator applied when a collect step names none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
}

/// Slot value types understood by the normalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    /// Free-form string
    String,
    /// Numeric value
    Number,
    /// Boolean value
    Boolean,
    /// Calendar date
    Date,
    /// Anything the NLU produced, unchanged
    #[default]
    Any,
}

/// Checkpoint durability modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Write the checkpoint before acknowledging the turn
    Sync,
    /// Write concurrently with response delivery (default)
    #[default]
    Async,
    /// Write only on graceful shutdown; risks loss on crash
    Exit,
}

/// What to do when a push would exceed the stack depth limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Refuse the new flow and tell the user (default)
    #[default]
    RejectNew,
    /// Cancel the oldest stacked flow to make room
    CancelOldest,
}

/// Engine settings, all defaulted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Checkpoint durability mode
    pub durability: Durability,

    /// Maximum flow stack depth
    pub max_stack_depth: usize,

    /// Unclear confirmation replies tolerated before the exhausted response
    pub max_confirmation_attempts: u32,

    /// Trailing conversation window passed to the NLU and kept in state
    pub history_window: usize,

    /// Hard cap on node executions per turn (safety net, not a code path)
    pub max_node_visits_per_turn: usize,

    /// Behaviour when a push would overflow the stack
    pub overflow_strategy: OverflowStrategy,

    /// Bounded log of recently completed flows kept in state
    pub completed_flows_window: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            durability: Durability::default(),
            max_stack_depth: 5,
            max_confirmation_attempts: 3,
            history_window: 10,
            max_node_visits_per_turn: 20,
            overflow_strategy: OverflowStrategy::default(),
            completed_flows_window: 10,
        }
    }
}

/// Response templates with `{placeholder}` interpolation
///
/// Every template has a workable default so a minimal spec stays runnable;
/// deployments override the voice wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResponseTemplates {
    /// Emitted when a turn produced no fragments and no prompt
    pub default_response: String,

    /// Emitted when the NLU failed twice
    pub not_understood: String,

    /// Correction acknowledgement; `{slot}` and `{value}` available
    pub correction_ack: String,

    /// Modification acknowledgement; `{slot}` and `{value}` available
    pub modification_ack: String,

    /// Emitted when the active flow is cancelled
    pub cancellation: String,

    /// Emitted for clarification requests
    pub clarification: String,

    /// Emitted when the session is escalated to a human
    pub handoff: String,

    /// Neutral response for chitchat
    pub chitchat: String,

    /// Emitted when control returns to a paused flow; `{flow}` available
    pub digression_return: String,

    /// Emitted when an action handler fails; `{action}` available
    pub action_failed: String,

    /// Emitted when confirmation attempts are exhausted
    pub confirmation_exhausted: String,

    /// Emitted when a new flow is rejected because the stack is full
    pub stack_overflow: String,

    /// Fallback when a collect step has no `validation_message`; `{slot}` available
    pub validation_failed: String,
}

impl Default for ResponseTemplates {
    fn default() -> Self {
        Self {
            default_response: "Okay.".to_string(),
            not_understood: "Sorry, I didn't understand that. Could you rephrase?".to_string(),
            correction_ack: "Got it, {slot} is now {value}.".to_string(),
            modification_ack: "Updated {slot} to {value}.".to_string(),
            cancellation: "Okay, I've cancelled that.".to_string(),
            clarification: "Let me clarify.".to_string(),
            handoff: "I'm connecting you with a human agent.".to_string(),
            chitchat: "Happy to chat! What can I do for you?".to_string(),
            digression_return: "Back to {flow}.".to_string(),
            action_failed: "Something went wrong running {action}. Let's try again.".to_string(),
            confirmation_exhausted: "I still couldn't tell - let's try once more.".to_string(),
            stack_overflow: "Let's finish what we're doing first.".to_string(),
            validation_failed: "That doesn't look like a valid {slot}.".to_string(),
        }
    }
}

impl DialogueSpec {
    /// Parse and validate a specification from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let spec: DialogueSpec =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::Config(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse and validate a specification from a file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Look up a flow by name
    pub fn flow(&self, name: &str) -> Option<&FlowDef> {
        self.flows.iter().find(|f| f.name == name)
    }

    /// Look up a slot declaration by name
    pub fn slot(&self, name: &str) -> Option<&SlotDecl> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Flow names in declaration order (unprefixed, as handed to the NLU)
    pub fn flow_names(&self) -> Vec<String> {
        self.flows.iter().map(|f| f.name.clone()).collect()
    }

    /// Per-variant and cross-reference checks serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.flows.is_empty() {
            return Err(EngineError::Config(
                "specification declares no flows".to_string(),
            ));
        }

        let mut flow_names = HashSet::new();
        for flow in &self.flows {
            if flow.name.trim().is_empty() {
                return Err(EngineError::Config(
                    "a flow is missing its 'name'".to_string(),
                ));
            }
            if !flow_names.insert(flow.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate flow name '{}'",
                    flow.name
                )));
            }
            if flow.steps.is_empty() {
                return Err(EngineError::Config(format!(
                    "flow '{}' has no steps",
                    flow.name
                )));
            }

            let mut step_names = HashSet::new();
            for step in &flow.steps {
                step.validate()?;
                if !step_names.insert(step.step.as_str()) {
                    return Err(EngineError::validation(
                        &step.step,
                        format!("duplicate step name in flow '{}'", flow.name),
                    ));
                }
            }

            self.validate_action_references(flow)?;
        }

        let mut slot_names = HashSet::new();
        for slot in &self.slots {
            if !slot_names.insert(slot.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate slot declaration '{}'",
                    slot.name
                )));
            }
        }

        if self.settings.max_stack_depth == 0 {
            return Err(EngineError::Config(
                "settings.max_stack_depth must be at least 1".to_string(),
            ));
        }
        if self.settings.max_node_visits_per_turn == 0 {
            return Err(EngineError::Config(
                "settings.max_node_visits_per_turn must be at least 1".to_string(),
            ));
        }
        if self.settings.history_window == 0 {
            return Err(EngineError::Config(
                "settings.history_window must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Action steps must call a declared action when the list is present
    fn validate_action_references(&self, flow: &FlowDef) -> Result<()> {
        if self.actions.is_empty() {
            return Ok(());
        }
        let declared: HashSet<&str> = self.actions.iter().map(String::as_str).collect();
        for step in &flow.steps {
            if let crate::step::StepKind::Action { call, .. } = &step.kind {
                if !declared.contains(call.as_str()) {
                    return Err(EngineError::validation(
                        &step.step,
                        format!("action '{}' is not declared under top-level 'actions'", call),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
flows:
  - name: greet
    steps:
      - step: hello
        type: say
        message: "Hi there!"
"#;

    #[test]
    fn test_minimal_spec_parses_with_defaults() {
        let spec = DialogueSpec::from_yaml(MINIMAL).unwrap();
        assert_eq!(spec.flows.len(), 1);
        assert_eq!(spec.settings.max_stack_depth, 5);
        assert_eq!(spec.settings.durability, Durability::Async);
        assert_eq!(spec.settings.overflow_strategy, OverflowStrategy::RejectNew);
    }

    #[test]
    fn test_empty_spec_rejected() {
        let err = DialogueSpec::from_yaml("flows: []").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let yaml = r#"
flows:
  - name: f
    steps:
      - {step: a, type: say, message: one}
      - {step: a, type: say, message: two}
"#;
        let err = DialogueSpec::from_yaml(yaml).unwrap_err();
        assert!(format!("{}", err).contains("duplicate step name"));
    }

    #[test]
    fn test_duplicate_flow_names_rejected() {
        let yaml = r#"
flows:
  - name: f
    steps: [{step: a, type: say, message: one}]
  - name: f
    steps: [{step: b, type: say, message: two}]
"#;
        assert!(DialogueSpec::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_undeclared_action_rejected_when_actions_listed() {
        let yaml = r#"
flows:
  - name: f
    steps:
      - {step: run, type: action, call: mystery}
actions: [known_action]
"#;
        let err = DialogueSpec::from_yaml(yaml).unwrap_err();
        assert!(format!("{}", err).contains("mystery"));
    }

    #[test]
    fn test_settings_parse() {
        let yaml = r#"
flows:
  - name: f
    steps: [{step: a, type: say, message: hi}]
settings:
  durability: exit
  max_stack_depth: 2
  overflow_strategy: cancel_oldest
"#;
        let spec = DialogueSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.settings.durability, Durability::Exit);
        assert_eq!(spec.settings.max_stack_depth, 2);
        assert_eq!(
            spec.settings.overflow_strategy,
            OverflowStrategy::CancelOldest
        );
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let err = DialogueSpec::from_yaml("flows: [").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
