//! Runtime context injected into dispatch and node execution
//!
//! External collaborators (NLU provider, action registry, normalizer,
//! validators, the parsed spec and its compiled graphs) are bundled into a
//! [`Runtime`] value produced by the engine at startup and handed to every
//! component that needs them. Nothing reads global state, which is what makes
//! test-double substitution a constructor argument instead of a linker trick.
//!
//! Everything in the bundle is immutable after startup and shared across
//! session workers without locking.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{ActionRegistry, SlotNormalizer, ValidatorRegistry};
use crate::compiler::CompiledSpec;
use crate::config::{DialogueSpec, ResponseTemplates, Settings};
use crate::nlu::NluProvider;
use crate::state::DialogueState;
use crate::template::interpolate;

/// Immutable bundle of external collaborators and compiled configuration
#[derive(Clone)]
pub struct Runtime {
    spec: Arc<DialogueSpec>,
    compiled: Arc<CompiledSpec>,
    nlu: Arc<dyn NluProvider>,
    actions: Arc<ActionRegistry>,
    normalizer: Arc<dyn SlotNormalizer>,
    validators: Arc<ValidatorRegistry>,
}

impl Runtime {
    pub fn new(
        spec: Arc<DialogueSpec>,
        compiled: Arc<CompiledSpec>,
        nlu: Arc<dyn NluProvider>,
        actions: Arc<ActionRegistry>,
        normalizer: Arc<dyn SlotNormalizer>,
        validators: Arc<ValidatorRegistry>,
    ) -> Self {
        Self {
            spec,
            compiled,
            nlu,
            actions,
            normalizer,
            validators,
        }
    }

    pub fn spec(&self) -> &DialogueSpec {
        &self.spec
    }

    pub fn compiled(&self) -> &CompiledSpec {
        &self.compiled
    }

    pub fn nlu(&self) -> &dyn NluProvider {
        self.nlu.as_ref()
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn normalizer(&self) -> &dyn SlotNormalizer {
        self.normalizer.as_ref()
    }

    pub fn validators(&self) -> &ValidatorRegistry {
        &self.validators
    }

    pub fn settings(&self) -> &Settings {
        &self.spec.settings
    }

    pub fn templates(&self) -> &ResponseTemplates {
        &self.spec.responses
    }

    /// Render a template against the active flow's slots plus extra variables
    pub fn render(
        &self,
        template: &str,
        state: &DialogueState,
        extra: &[(&str, Value)],
    ) -> String {
        let mut vars: HashMap<String, Value> = state.active_slots();
        for (k, v) in extra {
            vars.insert((*k).to_string(), v.clone());
        }
        interpolate(template, &vars)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("flows", &self.compiled.flow_names())
            .field("actions", &self.actions.names())
            .finish()
    }
}
