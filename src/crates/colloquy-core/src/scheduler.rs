//! Scheduler: executes exactly one user turn
//!
//! [`DialogueEngine`] owns the per-turn algorithm:
//!
//! 1. load the checkpointed state for the session key (new session if absent)
//! 2. append the user message, increment the turn counter
//! 3. call the NLU provider with utterance + dialogue context (one retry)
//! 4. run the pattern dispatcher and apply its deltas in order
//! 5. advance the cursor through steps the dispatch completed
//! 6. execute graph nodes in a bounded loop until a node suspends, the flow
//!    stack drains, or the per-turn cap is hit
//! 7. extract the response (say fragments, then the pending prompt, then the
//!    configured default)
//! 8. persist per the configured durability mode
//!
//! # Scheduling model
//!
//! Single-threaded *per session*: a per-session-key mutex serializes all work
//! for one conversation, which is load-bearing for the idempotence and
//! checkpoint-merge invariants. Different sessions run in parallel freely;
//! the compiled graphs and registries are immutable and shared.
//!
//! # Suspension
//!
//! Suspension is a state property (`pending_task`), not a coroutine: the turn
//! fully returns, and the next turn reconstructs everything from the
//! checkpoint. A turn introduces at most one suspension - the node loop
//! breaks the moment one appears.
//!
//! # Failure semantics
//!
//! - NLU failure: one retry with the same input, then the turn fails with the
//!   `not_understood` response and *unchanged, unpersisted* state
//! - action failure: the step is not marked executed; the failure is surfaced
//!   and the flow stays parked on the action step (user-driven retry)
//! - per-turn cap exceeded: graph defect - logged at `error`, the flow moves
//!   to the error phase
//! - deadline expired: [`EngineError::Timeout`]; nothing past the last
//!   committed turn is persisted
//! - checkpoint write failure: propagates and fails the turn in every
//!   durability mode

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use colloquy_checkpoint::{CheckpointCodec, CheckpointSaver, InMemoryCheckpointSaver, JsonCodec};

use crate::action::{ActionRegistry, IdentityNormalizer, SlotNormalizer, ValidatorRegistry};
use crate::compiler::{CompiledSpec, Next, NodeKind};
use crate::config::{DialogueSpec, Durability};
use crate::confirmation::ConfirmationManager;
use crate::delta::StateDelta;
use crate::dispatcher::PatternDispatcher;
use crate::error::{EngineError, Result};
use crate::flow_manager::{FlowManager, PushOutcome, PushRequest};
use crate::nlu::{NluProvider, NluRequest};
use crate::runtime::Runtime;
use crate::state::{
    ConversationState, ConversationTurn, DialogueState, FlowPhase, FlowResult, PendingTask,
    PushReason,
};
use crate::step_manager::{branch_target_key, StepManager};

/// Type-erased checkpoint encoding, so the engine can hold any
/// [`CheckpointCodec`] behind one object-safe seam
pub trait StateCodec: Send + Sync {
    fn encode(&self, state: &DialogueState) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<DialogueState>;
}

impl<C: CheckpointCodec> StateCodec for C {
    fn encode(&self, state: &DialogueState) -> Result<Vec<u8>> {
        Ok(CheckpointCodec::encode(self, state)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<DialogueState> {
        Ok(CheckpointCodec::decode(self, bytes)?)
    }
}

/// Outcome of one processed turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    /// Text to show the user
    pub response: String,
    /// What the conversation is now parked on
    pub conversation_state: ConversationState,
    /// Turn counter after this turn
    pub turn_count: u64,
    /// Name of the active flow, if any
    pub active_flow: Option<String>,
}

/// Builder for [`DialogueEngine`]
pub struct DialogueEngineBuilder {
    spec: DialogueSpec,
    nlu: Option<Arc<dyn NluProvider>>,
    actions: Arc<ActionRegistry>,
    normalizer: Arc<dyn SlotNormalizer>,
    validators: Arc<ValidatorRegistry>,
    checkpointer: Arc<dyn CheckpointSaver>,
    codec: Arc<dyn StateCodec>,
}

impl DialogueEngineBuilder {
    /// Start from a validated specification
    pub fn new(spec: DialogueSpec) -> Self {
        Self {
            spec,
            nlu: None,
            actions: Arc::new(ActionRegistry::new()),
            normalizer: Arc::new(IdentityNormalizer),
            validators: Arc::new(ValidatorRegistry::with_builtins()),
            checkpointer: Arc::new(InMemoryCheckpointSaver::new()),
            codec: Arc::new(JsonCodec::new()),
        }
    }

    /// The understanding provider (required)
    pub fn with_nlu(mut self, nlu: Arc<dyn NluProvider>) -> Self {
        self.nlu = Some(nlu);
        self
    }

    /// Action handlers referenced by the spec's action steps
    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = Arc::new(actions);
        self
    }

    /// Slot normalizer (defaults to [`IdentityNormalizer`])
    pub fn with_normalizer(mut self, normalizer: Arc<dyn SlotNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Validator registry (defaults to the built-ins)
    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = Arc::new(validators);
        self
    }

    /// Checkpoint backend (defaults to in-memory)
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    /// Checkpoint encoding (defaults to JSON)
    pub fn with_codec(mut self, codec: Arc<dyn StateCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Compile the specification and assemble the engine
    pub fn build(self) -> Result<DialogueEngine> {
        let nlu = self
            .nlu
            .ok_or_else(|| EngineError::Config("an NLU provider is required".to_string()))?;
        let spec = Arc::new(self.spec);
        let compiled = Arc::new(CompiledSpec::compile(&spec)?);
        tracing::info!(flows = ?compiled.flow_names(), "dialogue spec compiled");

        Ok(DialogueEngine {
            runtime: Runtime::new(
                spec,
                compiled,
                nlu,
                self.actions,
                self.normalizer,
                self.validators,
            ),
            checkpointer: self.checkpointer,
            codec: self.codec,
            sessions: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashMap::new()),
        })
    }
}

/// The dialogue orchestration engine
pub struct DialogueEngine {
    runtime: Runtime,
    checkpointer: Arc<dyn CheckpointSaver>,
    codec: Arc<dyn StateCodec>,
    /// Per-session serialization locks
    sessions: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Unflushed states under `exit` durability
    dirty: Mutex<HashMap<String, DialogueState>>,
}

impl DialogueEngine {
    /// Start building an engine from a specification
    pub fn builder(spec: DialogueSpec) -> DialogueEngineBuilder {
        DialogueEngineBuilder::new(spec)
    }

    /// The injected collaborator bundle
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Process one user turn with no deadline
    pub async fn process_turn(&self, session_id: &str, utterance: &str) -> Result<TurnResult> {
        self.process_turn_with_deadline(session_id, utterance, None)
            .await
    }

    /// Process one user turn, aborting at the deadline
    ///
    /// On expiry nothing is persisted: the session's checkpoint stays at the
    /// last committed turn.
    pub async fn process_turn_with_deadline(
        &self,
        session_id: &str,
        utterance: &str,
        deadline: Option<Duration>,
    ) -> Result<TurnResult> {
        // Serialize all work for this session key.
        let session_lock = self.session_lock(session_id).await;
        let _guard = session_lock.lock().await;

        let deadline = deadline.map(|d| Instant::now() + d);
        let mut state = self.load_state(session_id).await?;

        let consumed_pending = state.pending_task.take();
        state.last_nlu = None;
        state
            .metadata
            .retain(|k, _| k != "_correction_ack" && k != "_modification_ack");

        let window = self.runtime.settings().history_window;
        state.push_message(ConversationTurn::user(utterance), window);
        state.turn_count += 1;
        tracing::debug!(
            session_id,
            turn = state.turn_count,
            utterance,
            "processing turn"
        );

        let request = self.build_nlu_request(&state, consumed_pending.as_ref(), utterance);
        let interpretation = match self.interpret_with_retry(&request, deadline).await {
            Ok(interp) => interp,
            Err(EngineError::Timeout { operation, duration_ms }) => {
                return Err(EngineError::Timeout { operation, duration_ms });
            }
            Err(e) => {
                // Fail the turn visibly; state is unchanged and unpersisted.
                tracing::warn!(session_id, error = %e, "NLU failed after retry");
                return Ok(TurnResult {
                    response: self.runtime.templates().not_understood.clone(),
                    conversation_state: state.conversation_state,
                    turn_count: state.turn_count,
                    active_flow: state.active_context().map(|c| c.flow_name.clone()),
                });
            }
        };
        state.last_nlu = Some(interpretation.clone());

        let mut fragments: Vec<String> = Vec::new();
        let mut pending_prompt: Option<String> = None;
        let mut budget = self.runtime.settings().max_node_visits_per_turn;

        let dispatch = PatternDispatcher::new(&self.runtime).dispatch(
            &state,
            &interpretation,
            consumed_pending.as_ref(),
        )?;
        for delta in dispatch.deltas {
            self.absorb(&mut state, delta, &mut fragments, &mut pending_prompt);
        }

        if dispatch.advance {
            self.check_deadline(deadline, "dispatch")?;
            self.run_graph(
                &mut state,
                &mut fragments,
                &mut pending_prompt,
                &mut budget,
                deadline,
            )
            .await?;
        }

        // Response precedence: say fragments, then the pending prompt, then
        // the configured default.
        let mut parts = fragments;
        if let Some(prompt) = pending_prompt {
            parts.push(prompt);
        }
        let response = if parts.is_empty() {
            self.runtime.templates().default_response.clone()
        } else {
            parts.join("\n")
        };

        state.last_response = Some(response.clone());
        state.push_message(ConversationTurn::assistant(response.clone()), window);
        state.conversation_state = self.final_classification(&state)?;
        state.last_nlu = None;

        let result = TurnResult {
            response,
            conversation_state: state.conversation_state,
            turn_count: state.turn_count,
            active_flow: state.active_context().map(|c| c.flow_name.clone()),
        };

        self.persist(session_id, state).await?;
        Ok(result)
    }

    /// Read a session's current state (dirty cache first under `exit` mode)
    pub async fn state(&self, session_id: &str) -> Result<Option<DialogueState>> {
        if let Some(state) = self.dirty.lock().await.get(session_id) {
            return Ok(Some(state.clone()));
        }
        match self.checkpointer.load(session_id).await? {
            Some(bytes) => {
                let state =
                    self.codec
                        .decode(&bytes)
                        .map_err(|e| EngineError::CorruptCheckpoint {
                            session: session_id.to_string(),
                            reason: e.to_string(),
                        })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Externally reset a session, dropping its checkpoint
    pub async fn reset_session(&self, session_id: &str) -> Result<()> {
        self.dirty.lock().await.remove(session_id);
        self.checkpointer.delete(session_id).await?;
        tracing::info!(session_id, "session reset");
        Ok(())
    }

    /// Flush unwritten state (required before exit under `exit` durability)
    pub async fn flush(&self) -> Result<()> {
        let drained: Vec<(String, DialogueState)> =
            self.dirty.lock().await.drain().collect();
        for (session_id, state) in drained {
            let bytes = self.codec.encode(&state)?;
            self.checkpointer.save(&session_id, bytes).await?;
        }
        Ok(())
    }

    // --- internals ---------------------------------------------------------

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_state(&self, session_id: &str) -> Result<DialogueState> {
        Ok(self.state(session_id).await?.unwrap_or_default())
    }

    async fn persist(&self, session_id: &str, state: DialogueState) -> Result<()> {
        match self.runtime.settings().durability {
            Durability::Sync => {
                let bytes = self.codec.encode(&state)?;
                self.checkpointer.save(session_id, bytes).await?;
            }
            Durability::Async => {
                // Serialize up front; the write itself overlaps with response
                // delivery but is joined before the turn is acknowledged, so
                // write failures still fail the turn.
                let bytes = self.codec.encode(&state)?;
                let checkpointer = Arc::clone(&self.checkpointer);
                let session = session_id.to_string();
                let handle =
                    tokio::spawn(async move { checkpointer.save(&session, bytes).await });
                handle
                    .await
                    .map_err(|e| EngineError::Custom(format!("checkpoint task panicked: {}", e)))??;
            }
            Durability::Exit => {
                self.dirty
                    .lock()
                    .await
                    .insert(session_id.to_string(), state);
            }
        }
        Ok(())
    }

    fn build_nlu_request(
        &self,
        state: &DialogueState,
        consumed_pending: Option<&PendingTask>,
        utterance: &str,
    ) -> NluRequest {
        let expected_slots = match consumed_pending {
            Some(PendingTask::Collect { slot, .. }) => vec![slot.clone()],
            _ => {
                let step_mgr =
                    StepManager::new(self.runtime.compiled(), self.runtime.settings());
                match step_mgr.current_node(state) {
                    Ok(Some(node)) => match &node.kind {
                        NodeKind::Collect { slot, .. } => vec![slot.clone()],
                        _ => vec![],
                    },
                    _ => vec![],
                }
            }
        };

        NluRequest {
            utterance: utterance.to_string(),
            history: state.messages.clone(),
            active_flow: state.active_context().map(|c| c.flow_name.clone()),
            current_slots: state.active_slots(),
            available_flows: self.runtime.compiled().flow_names().to_vec(),
            available_actions: self.runtime.actions().names(),
            expected_slots,
        }
    }

    async fn interpret_with_retry(
        &self,
        request: &NluRequest,
        deadline: Option<Instant>,
    ) -> Result<crate::nlu::NluInterpretation> {
        match self.nlu_call(request, deadline).await {
            Ok(interp) => Ok(interp),
            Err(e @ EngineError::Timeout { .. }) => Err(e),
            Err(first) => {
                tracing::debug!(error = %first, "NLU failed; retrying once with the same input");
                self.nlu_call(request, deadline).await
            }
        }
    }

    async fn nlu_call(
        &self,
        request: &NluRequest,
        deadline: Option<Instant>,
    ) -> Result<crate::nlu::NluInterpretation> {
        let fut = self.runtime.nlu().interpret(request);
        match deadline {
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(EngineError::timeout("nlu", 0));
                }
                match tokio::time::timeout(remaining, fut).await {
                    Ok(result) => Ok(result?),
                    Err(_) => Err(EngineError::timeout(
                        "nlu",
                        remaining.as_millis() as u64,
                    )),
                }
            }
            None => Ok(fut.await?),
        }
    }

    fn check_deadline(&self, deadline: Option<Instant>, operation: &str) -> Result<()> {
        if let Some(at) = deadline {
            if Instant::now() >= at {
                return Err(EngineError::timeout(operation, 0));
            }
        }
        Ok(())
    }

    /// Apply one delta, harvesting turn-scoped outputs
    fn absorb(
        &self,
        state: &mut DialogueState,
        delta: StateDelta,
        fragments: &mut Vec<String>,
        pending_prompt: &mut Option<String>,
    ) {
        if let Some(fragment) = &delta.response_fragment {
            fragments.push(fragment.clone());
        }
        match &delta.pending_task {
            Some(Some(task)) => *pending_prompt = Some(task.prompt().to_string()),
            Some(None) => *pending_prompt = None,
            None => {}
        }
        state.apply(
            delta,
            self.runtime.settings().history_window,
            self.runtime.settings().completed_flows_window,
        );
    }

    /// Bounded node execution loop
    async fn run_graph(
        &self,
        state: &mut DialogueState,
        fragments: &mut Vec<String>,
        pending_prompt: &mut Option<String>,
        budget: &mut usize,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let step_mgr = StepManager::new(self.runtime.compiled(), self.runtime.settings());
        let flow_mgr = FlowManager::new(self.runtime.settings(), self.runtime.templates());
        let confirm_mgr =
            ConfirmationManager::new(self.runtime.settings(), self.runtime.templates());

        // Skip whatever this turn's slot fills already completed (this is
        // the multi-slot advance: one utterance can park several steps ahead).
        match step_mgr.advance_through_completed(state, budget) {
            Ok(delta) => self.absorb(state, delta, fragments, pending_prompt),
            Err(EngineError::AdvanceCap { flow, cap }) => {
                self.mark_flow_error(state, &flow, cap);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        loop {
            self.check_deadline(deadline, "node execution")?;

            let Some(ctx) = state.active_context() else {
                break; // idle
            };
            if ctx.flow_state == FlowPhase::Error {
                break; // unusable until externally reset
            }
            let flow_id = ctx.flow_id.clone();
            let flow_name = ctx.flow_name.clone();
            let index = ctx.current_step_index;
            let graph = Arc::clone(self.runtime.compiled().flow(&flow_name)?);

            // Cursor past the end: the flow completed.
            if index >= graph.len() {
                if let Some(pop) = flow_mgr.pop(state, FlowResult::Completed) {
                    self.absorb(state, pop.delta, fragments, pending_prompt);
                }
                continue;
            }

            if *budget == 0 {
                tracing::error!(
                    flow = %flow_name,
                    cap = self.runtime.settings().max_node_visits_per_turn,
                    "per-turn node execution cap exceeded; graph is mis-wired"
                );
                self.mark_flow_error(
                    state,
                    &flow_name,
                    self.runtime.settings().max_node_visits_per_turn,
                );
                break;
            }
            *budget -= 1;

            let node = graph
                .node(index)
                .ok_or(EngineError::UnknownStep {
                    flow: flow_name.clone(),
                    index,
                })?
                .clone();
            tracing::trace!(flow = %flow_name, step = %node.name, kind = node.kind.name(), "executing node");

            match &node.kind {
                NodeKind::Say { message, await_ack } => {
                    let rendered = self.runtime.render(message, state, &[]);
                    let mut delta = StateDelta::with_fragment(rendered.clone())
                        .mark_executed(flow_id.clone(), index);
                    if *await_ack {
                        delta.pending_task = Some(Some(PendingTask::Inform {
                            prompt: rendered,
                            wait: true,
                        }));
                        self.absorb(state, delta, fragments, pending_prompt);
                        break; // suspended
                    }
                    self.absorb(state, delta, fragments, pending_prompt);
                    self.move_cursor(state, node.next, graph.len());
                }

                NodeKind::Collect { slot, prompt, .. } => {
                    let filled = state
                        .flow_slots
                        .get(&flow_id)
                        .and_then(|s| s.get(slot))
                        .map(|v| !v.is_null())
                        .unwrap_or(false);
                    if filled {
                        self.move_cursor(state, node.next, graph.len());
                        continue;
                    }
                    let rendered = self.runtime.render(prompt, state, &[]);
                    let delta = StateDelta::with_pending(PendingTask::Collect {
                        slot: slot.clone(),
                        prompt: rendered,
                        options: None,
                    });
                    self.absorb(state, delta, fragments, pending_prompt);
                    break; // suspended
                }

                NodeKind::Action { call, map_outputs } => {
                    if state.is_step_executed(&flow_id, index) {
                        // Replay within the same flow is a no-op.
                        self.move_cursor(state, node.next, graph.len());
                        continue;
                    }
                    self.check_deadline(deadline, "action")?;
                    match self.invoke_action(state, call, deadline).await {
                        Ok(outputs) => {
                            let mut slots = state
                                .flow_slots
                                .get(&flow_id)
                                .cloned()
                                .unwrap_or_default();
                            for (output_key, slot_name) in map_outputs {
                                if let Some(value) = outputs.get(output_key) {
                                    slots.insert(slot_name.clone(), value.clone());
                                } else {
                                    tracing::debug!(
                                        action = %call,
                                        output = %output_key,
                                        "mapped output missing from action result"
                                    );
                                }
                            }
                            let delta = StateDelta::with_slots(flow_id.clone(), slots)
                                .mark_executed(flow_id.clone(), index);
                            self.absorb(state, delta, fragments, pending_prompt);
                            self.move_cursor(state, node.next, graph.len());
                        }
                        Err(e @ EngineError::Timeout { .. }) => return Err(e),
                        Err(e) => {
                            // Not marked executed: the flow stays parked here
                            // and the action re-runs next turn.
                            tracing::warn!(action = %call, error = %e, "action failed; flow stays at the action step");
                            let rendered = self.runtime.render(
                                &self.runtime.templates().action_failed,
                                state,
                                &[("action", json!(call))],
                            );
                            fragments.push(rendered);
                            break;
                        }
                    }
                }

                NodeKind::Set { slot, source } => {
                    let slots_now = state.active_slots();
                    let value = source.eval(&slots_now);
                    let mut slots = state
                        .flow_slots
                        .get(&flow_id)
                        .cloned()
                        .unwrap_or_default();
                    slots.insert(slot.clone(), value);
                    let delta = StateDelta::with_slots(flow_id.clone(), slots)
                        .mark_executed(flow_id.clone(), index);
                    self.absorb(state, delta, fragments, pending_prompt);
                    self.move_cursor(state, node.next, graph.len());
                }

                NodeKind::Branch {
                    guard,
                    cases,
                    default,
                } => {
                    let value = guard.eval(&state.active_slots());
                    let key = crate::expr::Expr::stringify(&value);
                    let target = cases.get(&key).copied().or(*default);
                    let Some(target) = target else {
                        tracing::error!(
                            flow = %flow_name,
                            step = %node.name,
                            value = %key,
                            "branch matched no case and has no default"
                        );
                        self.mark_flow_error(
                            state,
                            &flow_name,
                            self.runtime.settings().max_node_visits_per_turn,
                        );
                        break;
                    };
                    let mut delta = StateDelta::new().mark_executed(flow_id.clone(), index);
                    if let Next::Step(target_index) = target {
                        delta.branch_target =
                            Some((branch_target_key(&flow_id, index), target_index));
                    }
                    self.absorb(state, delta, fragments, pending_prompt);
                    self.move_cursor(state, target, graph.len());
                }

                NodeKind::Confirm { .. } => {
                    // Already answered this turn: follow the recorded route,
                    // consuming it so the next visit re-prompts.
                    if state.is_step_executed(&flow_id, index) {
                        if let Some(next) =
                            step_mgr.successor_of_completed(&node, state, &flow_id)
                        {
                            let mut consume = StateDelta::new();
                            consume.cleared_steps.push((flow_id.clone(), index));
                            consume
                                .metadata_removals
                                .push(branch_target_key(&flow_id, index));
                            self.absorb(state, consume, fragments, pending_prompt);
                            self.move_cursor(state, next, graph.len());
                            continue;
                        }
                    }
                    let delta = confirm_mgr.prompt(state, &node);
                    self.absorb(state, delta, fragments, pending_prompt);
                    break; // suspended
                }

                NodeKind::Link { flow } => {
                    // The current flow completes and control transfers.
                    if let Some(pop) = flow_mgr.pop(state, FlowResult::Completed) {
                        self.absorb(state, pop.delta, fragments, pending_prompt);
                    }
                    match flow_mgr.push(state, PushRequest::new(flow, PushReason::Link)) {
                        PushOutcome::Pushed { delta, .. } => {
                            self.absorb(state, delta, fragments, pending_prompt);
                        }
                        PushOutcome::Rejected { delta } => {
                            self.absorb(state, delta, fragments, pending_prompt);
                            break;
                        }
                    }
                }

                NodeKind::Call {
                    flow,
                    inputs,
                    map_outputs,
                } => {
                    let caller_slots = state.active_slots();
                    let seeded: HashMap<String, serde_json::Value> = inputs
                        .iter()
                        .map(|(slot, source)| (slot.clone(), source.eval(&caller_slots)))
                        .collect();
                    // Marked executed at push time so the caller advances past
                    // the call when it resumes.
                    let delta = StateDelta::new().mark_executed(flow_id.clone(), index);
                    self.absorb(state, delta, fragments, pending_prompt);

                    let mut request = PushRequest::new(flow, PushReason::Call);
                    request.inputs = seeded;
                    request.output_mappings = map_outputs.clone();
                    match flow_mgr.push(state, request) {
                        PushOutcome::Pushed { delta, .. } => {
                            self.absorb(state, delta, fragments, pending_prompt);
                        }
                        PushOutcome::Rejected { delta } => {
                            self.absorb(state, delta, fragments, pending_prompt);
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn invoke_action(
        &self,
        state: &DialogueState,
        call: &str,
        deadline: Option<Instant>,
    ) -> Result<HashMap<String, serde_json::Value>> {
        let handler = self
            .runtime
            .actions()
            .get(call)
            .ok_or_else(|| crate::action::ActionError::Unknown(call.to_string()))?;
        let slots = state.active_slots();
        let fut = handler.execute(&slots);
        match deadline {
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(EngineError::timeout("action", 0));
                }
                match tokio::time::timeout(remaining, fut).await {
                    Ok(result) => Ok(result?),
                    Err(_) => Err(EngineError::timeout(
                        "action",
                        remaining.as_millis() as u64,
                    )),
                }
            }
            None => Ok(fut.await?),
        }
    }

    /// Move the active flow's cursor (graph length parks "complete")
    fn move_cursor(&self, state: &mut DialogueState, next: Next, graph_len: usize) {
        if let Some(top) = state.flow_stack.last_mut() {
            top.current_step_index = match next {
                Next::Step(i) => i,
                Next::End => graph_len,
            };
        }
    }

    /// A mis-wired or mis-behaving graph moves the flow to the error phase
    fn mark_flow_error(&self, state: &mut DialogueState, flow_name: &str, cap: usize) {
        tracing::error!(flow = %flow_name, cap, "flow moved to error state");
        if let Some(top) = state.flow_stack.last_mut() {
            top.flow_state = FlowPhase::Error;
        }
    }

    fn final_classification(&self, state: &DialogueState) -> Result<ConversationState> {
        if state
            .metadata
            .get("_escalated")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Ok(ConversationState::Escalated);
        }
        let step_mgr = StepManager::new(self.runtime.compiled(), self.runtime.settings());
        Ok(StepManager::classify(step_mgr.current_node(state)?))
    }
}

impl std::fmt::Debug for DialogueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogueEngine")
            .field("runtime", &self.runtime)
            .finish()
    }
}
