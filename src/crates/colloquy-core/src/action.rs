//! External collaborator interfaces: actions, normalization, validation
//!
//! Three seams the engine depends on but does not implement:
//!
//! - [`ActionHandler`] - user-supplied effectful functions invoked by action
//!   steps. A handler receives the full slot map and returns named outputs;
//!   the step's `map_outputs` renames them into slots. The scheduler never
//!   auto-retries an action; idempotence on user-driven retry is the
//!   handler's contract.
//! - [`SlotNormalizer`] - turns raw extracted values into typed ones using
//!   the slot declaration as a hint. [`IdentityNormalizer`] passes values
//!   through unchanged.
//! - [`ValidatorRegistry`] - named predicates run against incoming slot
//!   values before they are stored. Ships with `non_empty`, `numeric`,
//!   `boolean`, and `date` built-ins plus `regex:<pattern>` inline patterns;
//!   applications register their own.
//!
//! All three are injected through the runtime context, never read from
//! globals, so tests substitute doubles freely.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{SlotDecl, SlotType};

/// Errors surfaced by action handlers
#[derive(Debug, Error)]
pub enum ActionError {
    /// No handler registered under the requested name
    #[error("No action handler registered for '{0}'")]
    Unknown(String),

    /// The handler ran and failed
    #[error("Action '{action}' failed: {reason}")]
    Failed {
        /// Action name
        action: String,
        /// Handler-provided reason
        reason: String,
    },
}

impl ActionError {
    /// Handler failure with context
    pub fn failed(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            action: action.into(),
            reason: reason.into(),
        }
    }
}

/// A registered, user-supplied effectful function
///
/// Asynchronous from the scheduler's perspective; the scheduler awaits
/// completion before proceeding. Expected to be idempotent on user-driven
/// retry, since a failed action step stays pending and re-runs next turn.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute against the active flow's full slot map, returning named outputs
    async fn execute(
        &self,
        slots: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, ActionError>;
}

/// Adapter so plain async closures can register as handlers in tests and
/// small deployments
pub struct FnAction<F>(pub F);

#[async_trait]
impl<F, Fut> ActionHandler for FnAction<F>
where
    F: Fn(HashMap<String, Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<HashMap<String, Value>, ActionError>> + Send,
{
    async fn execute(
        &self,
        slots: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, ActionError> {
        (self.0)(slots.clone()).await
    }
}

/// Immutable name-to-handler registry, shared across sessions without locking
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name (builder style; startup only)
    pub fn register(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Look up a handler
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(name)
    }

    /// Registered action names, sorted (as handed to the NLU)
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// Errors surfaced by slot normalization
#[derive(Debug, Error)]
#[error("Cannot normalize slot '{slot}': {reason}")]
pub struct NormalizeError {
    /// Slot being normalized
    pub slot: String,
    /// Failure description
    pub reason: String,
}

/// Turns raw extracted values into typed slot values
pub trait SlotNormalizer: Send + Sync {
    /// Normalize `raw` for the given declaration (`None` when undeclared)
    fn normalize(&self, decl: Option<&SlotDecl>, name: &str, raw: &Value)
        -> Result<Value, NormalizeError>;
}

/// Pass-through normalizer with light string-to-type coercion
///
/// Strings are coerced to the declared type where unambiguous ("3" to a
/// number slot becomes 3); everything else passes through unchanged.
#[derive(Debug, Clone, Default)]
pub struct IdentityNormalizer;

impl SlotNormalizer for IdentityNormalizer {
    fn normalize(
        &self,
        decl: Option<&SlotDecl>,
        name: &str,
        raw: &Value,
    ) -> Result<Value, NormalizeError> {
        let Some(decl) = decl else {
            return Ok(raw.clone());
        };
        match (decl.slot_type, raw) {
            (SlotType::Number, Value::String(s)) => {
                s.trim().parse::<f64>().map(|n| serde_json::json!(n)).map_err(|_| {
                    NormalizeError {
                        slot: name.to_string(),
                        reason: format!("'{}' is not a number", s),
                    }
                })
            }
            (SlotType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" => Ok(Value::Bool(true)),
                "false" | "no" => Ok(Value::Bool(false)),
                other => Err(NormalizeError {
                    slot: name.to_string(),
                    reason: format!("'{}' is not a boolean", other),
                }),
            },
            _ => Ok(raw.clone()),
        }
    }
}

/// A named slot-value predicate
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Named validators resolvable from collect steps and slot declarations
pub struct ValidatorRegistry {
    validators: HashMap<String, Validator>,
}

impl ValidatorRegistry {
    /// Registry preloaded with the built-ins
    pub fn with_builtins() -> Self {
        let mut validators: HashMap<String, Validator> = HashMap::new();
        validators.insert(
            "non_empty".to_string(),
            Arc::new(|v: &Value| match v {
                Value::String(s) => !s.trim().is_empty(),
                Value::Null => false,
                _ => true,
            }),
        );
        validators.insert(
            "numeric".to_string(),
            Arc::new(|v: &Value| match v {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            }),
        );
        validators.insert(
            "boolean".to_string(),
            Arc::new(|v: &Value| {
                matches!(v, Value::Bool(_))
                    || matches!(v, Value::String(s)
                        if matches!(s.trim().to_lowercase().as_str(), "true" | "false" | "yes" | "no"))
            }),
        );
        validators.insert(
            "date".to_string(),
            Arc::new(|v: &Value| match v {
                Value::String(s) => {
                    let s = s.trim();
                    !s.is_empty()
                        && (chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
                            || relative_date(s))
                }
                _ => false,
            }),
        );
        Self { validators }
    }

    /// Register a custom validator (builder style; startup only)
    pub fn register(mut self, name: impl Into<String>, validator: Validator) -> Self {
        self.validators.insert(name.into(), validator);
        self
    }

    /// Whether a validator name resolves (inline `regex:` always does)
    pub fn knows(&self, name: &str) -> bool {
        name.starts_with("regex:") || self.validators.contains_key(name)
    }

    /// Run the named validator; unknown names accept everything and log
    pub fn validate(&self, name: &str, value: &Value) -> bool {
        if let Some(pattern) = name.strip_prefix("regex:") {
            return match Regex::new(pattern) {
                Ok(re) => match value {
                    Value::String(s) => re.is_match(s),
                    other => re.is_match(&other.to_string()),
                },
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "invalid validator regex; accepting value");
                    true
                }
            };
        }
        match self.validators.get(name) {
            Some(v) => v(value),
            None => {
                tracing::warn!(validator = name, "unknown validator; accepting value");
                true
            }
        }
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.validators.keys().collect();
        names.sort();
        f.debug_struct("ValidatorRegistry").field("validators", &names).finish()
    }
}

/// Accepts the handful of relative forms users actually type
fn relative_date(s: &str) -> bool {
    matches!(
        s.to_lowercase().as_str(),
        "today" | "tomorrow" | "yesterday"
            | "monday" | "tuesday" | "wednesday" | "thursday" | "friday" | "saturday" | "sunday"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_action_adapter() {
        let registry = ActionRegistry::new().register(
            "echo",
            Arc::new(FnAction(|slots: HashMap<String, Value>| async move {
                Ok::<_, ActionError>(HashMap::from([(
                    "echoed".to_string(),
                    json!(slots.len()),
                )]))
            })),
        );

        let handler = registry.get("echo").unwrap();
        let out = handler
            .execute(&HashMap::from([("a".to_string(), json!(1))]))
            .await
            .unwrap();
        assert_eq!(out["echoed"], json!(1));
    }

    #[test]
    fn test_unknown_action_lookup() {
        let registry = ActionRegistry::new();
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_identity_normalizer_coerces_declared_numbers() {
        let decl = SlotDecl {
            name: "guests".to_string(),
            slot_type: SlotType::Number,
            validator: None,
        };
        let norm = IdentityNormalizer;

        assert_eq!(
            norm.normalize(Some(&decl), "guests", &json!("4")).unwrap(),
            json!(4.0)
        );
        assert!(norm.normalize(Some(&decl), "guests", &json!("four")).is_err());
        // Undeclared slots pass through untouched.
        assert_eq!(norm.normalize(None, "x", &json!("4")).unwrap(), json!("4"));
    }

    #[test]
    fn test_builtin_validators() {
        let reg = ValidatorRegistry::with_builtins();

        assert!(reg.validate("non_empty", &json!("Madrid")));
        assert!(!reg.validate("non_empty", &json!("   ")));
        assert!(reg.validate("numeric", &json!("42")));
        assert!(!reg.validate("numeric", &json!("forty-two")));
        assert!(reg.validate("date", &json!("2026-03-01")));
        assert!(reg.validate("date", &json!("tomorrow")));
        assert!(!reg.validate("date", &json!("not a date")));
    }

    #[test]
    fn test_regex_validator() {
        let reg = ValidatorRegistry::with_builtins();
        assert!(reg.validate("regex:^[A-Z]{3}$", &json!("JFK")));
        assert!(!reg.validate("regex:^[A-Z]{3}$", &json!("New York")));
    }

    #[test]
    fn test_unknown_validator_accepts() {
        let reg = ValidatorRegistry::with_builtins();
        assert!(reg.validate("nonexistent", &json!("anything")));
        assert!(!reg.knows("nonexistent"));
        assert!(reg.knows("regex:x"));
    }
}
