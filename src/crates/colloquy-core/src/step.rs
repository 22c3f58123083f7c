//! Step catalog: the tagged step union and per-variant requirements
//!
//! A flow is an ordered program of steps. Each step is a [`Step`] wrapper
//! (unique `step` name plus optional `jump_to` override) around a [`StepKind`]
//! variant discriminated by the YAML `type` tag. Using a tagged union instead
//! of one wide struct with every field optional means serde enforces the
//! per-variant required fields at parse time - a `say` without a `message`
//! fails deserialization with an error naming the missing field, and an
//! unknown `type` tag is rejected outright.
//!
//! Execution contracts per variant live with the scheduler and step manager;
//! this module only defines the shape and the parse/validate-time rules.
//!
//! # Example (YAML)
//!
//! ```yaml
//! steps:
//!   - step: ask_origin
//!     type: collect
//!     slot: origin
//!     prompt: "Where are you flying from?"
//!   - step: search
//!     type: action
//!     call: search_flights
//!     map_outputs:
//!       top_result: chosen_flight
//!   - step: ask
//!     type: confirm
//!     message: "Book {origin} to {destination}?"
//!     on_confirm: finish
//!     on_deny: ask_origin
//!   - step: finish
//!     type: say
//!     message: "Done!"
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{EngineError, Result};

/// One node of a flow program
///
/// `step` must be unique within the containing flow. `jump_to` overrides the
/// default fall-through successor for variants that fall through (`say`,
/// `collect`, `action`, `set`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Unique name of this step within the flow
    pub step: String,

    /// Explicit successor overriding source-order fall-through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_to: Option<String>,

    /// Variant payload, discriminated on the `type` tag
    #[serde(flatten)]
    pub kind: StepKind,
}

/// The step variant payload
///
/// Internally tagged on `type`; unknown tags are a deserialization error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Emit an interpolated message and fall through
    Say {
        /// Message template; `{slot}` placeholders interpolate active-flow slots
        message: String,

        /// Suspend after emitting until the user acknowledges
        #[serde(default)]
        await_ack: bool,
    },

    /// Ask the user for a slot value, suspending until one arrives
    Collect {
        /// Target slot name
        slot: String,

        /// Prompt template shown when the slot is still unset
        prompt: String,

        /// Validator name applied to incoming values for this slot
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validator: Option<String>,

        /// Message rendered when validation rejects a value
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation_message: Option<String>,
    },

    /// Invoke a registered external action handler (at most once per flow)
    Action {
        /// Registered action name
        call: String,

        /// Renames action outputs into slot names
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        map_outputs: HashMap<String, String>,
    },

    /// Assign a computed value to a slot
    Set {
        /// Target slot name
        slot: String,

        /// Literal value (exclusive with `expression`)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,

        /// Expression over the active flow's slots (exclusive with `value`)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },

    /// Evaluate an expression and route to the matching case
    Branch {
        /// Expression over the active flow's slots
        evaluate: String,

        /// Case value (stringified) to target step name
        cases: HashMap<String, String>,

        /// Target when no case matches
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },

    /// Guarded loop over a list of body steps (desugared at compile time)
    While {
        /// Loop guard expression
        condition: String,

        /// Names of the body steps, in order
        #[serde(rename = "do")]
        body: Vec<String>,

        /// Step to continue at once the guard turns false (END if absent)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_to: Option<String>,
    },

    /// Ask the user to confirm, then route to one of two targets
    Confirm {
        /// Slot this confirmation is about, if any
        ///
        /// When present, only corrections to this slot re-prompt the
        /// confirmation while it awaits a reply; corrections to other slots
        /// rewind the cursor as usual. Absent means any correction
        /// re-prompts.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slot: Option<String>,

        /// Prompt template; all active-flow slots are available
        message: String,

        /// Target step on affirmation
        on_confirm: String,

        /// Target step on denial
        on_deny: String,
    },

    /// Complete this flow and transfer control to another
    Link {
        /// Target flow name
        flow: String,
    },

    /// Push a child flow, resuming here when it completes
    Call {
        /// Target flow name
        flow: String,

        /// Child slot name to caller-side expression seeding it
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        inputs: HashMap<String, String>,

        /// Child slot name to caller slot name, mapped on completion
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        map_outputs: HashMap<String, String>,
    },
}

impl Step {
    /// Short tag for logging and error messages
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            StepKind::Say { .. } => "say",
            StepKind::Collect { .. } => "collect",
            StepKind::Action { .. } => "action",
            StepKind::Set { .. } => "set",
            StepKind::Branch { .. } => "branch",
            StepKind::While { .. } => "while",
            StepKind::Confirm { .. } => "confirm",
            StepKind::Link { .. } => "link",
            StepKind::Call { .. } => "call",
        }
    }

    /// Enforce what serde cannot: non-empty fields and exclusive options
    ///
    /// Called by the config model after deserialization. Errors carry this
    /// step's name.
    pub fn validate(&self) -> Result<()> {
        if self.step.is_empty() {
            return Err(EngineError::Config(
                "a step is missing its 'step' name".to_string(),
            ));
        }

        match &self.kind {
            StepKind::Say { message, .. } => {
                if message.trim().is_empty() {
                    return Err(self.invalid("say requires a non-empty 'message'"));
                }
            }
            StepKind::Collect { slot, prompt, .. } => {
                if slot.trim().is_empty() {
                    return Err(self.invalid("collect requires a non-empty 'slot'"));
                }
                if prompt.trim().is_empty() {
                    return Err(self.invalid("collect requires a non-empty 'prompt'"));
                }
            }
            StepKind::Action { call, .. } => {
                if call.trim().is_empty() {
                    return Err(self.invalid("action requires a non-empty 'call'"));
                }
            }
            StepKind::Set {
                slot,
                value,
                expression,
            } => {
                if slot.trim().is_empty() {
                    return Err(self.invalid("set requires a non-empty 'slot'"));
                }
                match (value, expression) {
                    (None, None) => {
                        return Err(self.invalid("set requires either 'value' or 'expression'"))
                    }
                    (Some(_), Some(_)) => {
                        return Err(
                            self.invalid("set takes 'value' or 'expression', not both")
                        )
                    }
                    _ => {}
                }
            }
            StepKind::Branch { evaluate, cases, .. } => {
                if evaluate.trim().is_empty() {
                    return Err(self.invalid("branch requires a non-empty 'evaluate'"));
                }
                if cases.is_empty() {
                    return Err(self.invalid("branch requires at least one case"));
                }
            }
            StepKind::While {
                condition, body, ..
            } => {
                if condition.trim().is_empty() {
                    return Err(self.invalid("while requires a non-empty 'condition'"));
                }
                if body.is_empty() {
                    return Err(self.invalid("while requires a non-empty 'do' list"));
                }
            }
            StepKind::Confirm {
                slot,
                message,
                on_confirm,
                on_deny,
            } => {
                if message.trim().is_empty() {
                    return Err(self.invalid("confirm requires a non-empty 'message'"));
                }
                if on_confirm.trim().is_empty() || on_deny.trim().is_empty() {
                    return Err(self.invalid("confirm requires 'on_confirm' and 'on_deny'"));
                }
                if let Some(slot) = slot {
                    if slot.trim().is_empty() {
                        return Err(self.invalid("confirm 'slot' must be non-empty when present"));
                    }
                }
            }
            StepKind::Link { flow } => {
                if flow.trim().is_empty() {
                    return Err(self.invalid("link requires a non-empty 'flow'"));
                }
            }
            StepKind::Call { flow, .. } => {
                if flow.trim().is_empty() {
                    return Err(self.invalid("call requires a non-empty 'flow'"));
                }
            }
        }

        Ok(())
    }

    fn invalid(&self, reason: &str) -> EngineError {
        EngineError::validation(&self.step, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> std::result::Result<Step, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    #[test]
    fn test_parse_say_step() {
        let step = parse("{step: greet, type: say, message: Hello}").unwrap();
        assert_eq!(step.step, "greet");
        assert!(matches!(step.kind, StepKind::Say { .. }));
    }

    #[test]
    fn test_say_without_message_mentions_missing_field() {
        let err = parse("{step: greet, type: say}").unwrap_err();
        assert!(err.to_string().contains("message"), "got: {}", err);
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let err = parse("{step: odd, type: teleport}").unwrap_err();
        assert!(err.to_string().contains("teleport") || err.to_string().contains("unknown"));
    }

    #[test]
    fn test_collect_parses_optional_validator() {
        let step = parse(
            "{step: ask, type: collect, slot: date, prompt: 'When?', validator: date, validation_message: 'Not a date'}",
        )
        .unwrap();
        match step.kind {
            StepKind::Collect { validator, .. } => assert_eq!(validator.as_deref(), Some("date")),
            other => panic!("expected collect, got {:?}", other),
        }
    }

    #[test]
    fn test_while_requires_condition_and_body() {
        assert!(parse("{step: loop, type: while, do: [a]}").is_err());
        assert!(parse("{step: loop, type: while, condition: 'x < 3'}").is_err());
        assert!(parse("{step: loop, type: while, condition: 'x < 3', do: [a]}").is_ok());
    }

    #[test]
    fn test_set_exclusivity_validated() {
        let both = parse("{step: s, type: set, slot: x, value: 1, expression: 'y + 1'}").unwrap();
        assert!(both.validate().is_err());

        let neither = parse("{step: s, type: set, slot: x}").unwrap();
        assert!(neither.validate().is_err());

        let value_only = parse("{step: s, type: set, slot: x, value: 1}").unwrap();
        assert!(value_only.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_message() {
        let step = parse("{step: greet, type: say, message: '  '}").unwrap();
        let err = step.validate().unwrap_err();
        assert!(format!("{}", err).contains("greet"));
    }

    #[test]
    fn test_confirm_slot_must_be_non_empty_when_present() {
        let step = parse(
            "{step: ask, type: confirm, slot: ' ', message: 'Sure?', on_confirm: a, on_deny: b}",
        )
        .unwrap();
        let err = step.validate().unwrap_err();
        assert!(format!("{}", err).contains("slot"));

        let step = parse(
            "{step: ask, type: confirm, slot: date, message: 'Sure?', on_confirm: a, on_deny: b}",
        )
        .unwrap();
        assert!(step.validate().is_ok());
    }

    #[test]
    fn test_jump_to_round_trips() {
        let step = parse("{step: s, type: say, message: hi, jump_to: end}").unwrap();
        assert_eq!(step.jump_to.as_deref(), Some("end"));

        let yaml = serde_yaml::to_string(&step).unwrap();
        let back: Step = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, step);
    }
}
