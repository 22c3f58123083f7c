//! Compiler: flow definitions to executable node graphs
//!
//! Each flow's step list is translated into a [`FlowGraph`]: an immutable,
//! thread-safe array of [`CompiledNode`]s with resolved edges, ready for the
//! scheduler. Compilation happens once at startup; sessions share the result
//! through an `Arc` without locking.
//!
//! # Algorithm
//!
//! 1. Assign each step a stable index in source order. The index doubles as
//!    the action idempotence key, so it must not change between runs of the
//!    same specification.
//! 2. Desugar every `while` into a synthetic guard branch named
//!    `__{step}_guard` with cases `{"true": first body step, "false":
//!    exit_to or END}`, and force the last body step's successor back to the
//!    guard. The original step name aliases the guard, so `jump_to` and
//!    branch cases can target the loop by its source name - which is also how
//!    nested loops chain: an inner loop's `exit_to` naming the outer loop
//!    resolves to the outer guard.
//! 3. Resolve every referenced target (`jump_to`, branch cases and default,
//!    `on_confirm`, `on_deny`, `exit_to`, while bodies). The reserved name
//!    `END` terminates the flow. Unresolved names are a
//!    [`GraphBuild`](crate::error::EngineError::GraphBuild) error.
//! 4. Wire fall-through edges: sequential by default, `jump_to` overrides,
//!    branch nodes never fall through, the last step falls through to END.
//! 5. Parse and cache every expression (branch guards, while conditions, set
//!    expressions, call inputs) so runtime evaluation never re-parses.
//!
//! Unreachable steps are legal but reported by
//! [`FlowGraph::unreachable_steps`] and logged at `warn` during compilation.

use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::config::DialogueSpec;
use crate::error::{EngineError, Result};
use crate::expr::Expr;
use crate::step::{Step, StepKind};

/// Reserved target name that terminates a flow
pub const END: &str = "END";

/// Resolved successor edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Continue at the node with this index
    Step(usize),
    /// The flow completes
    End,
}

/// Where a set value or call input comes from
#[derive(Debug, Clone)]
pub enum ValueSource {
    /// Literal JSON value
    Literal(Value),
    /// Cached parsed expression over the active flow's slots
    Expression(Expr),
}

impl ValueSource {
    /// Evaluate against a slot map
    pub fn eval(&self, slots: &HashMap<String, Value>) -> Value {
        match self {
            ValueSource::Literal(v) => v.clone(),
            ValueSource::Expression(e) => e.eval(slots),
        }
    }
}

/// Executable node variant (the step catalog minus `while`, plus cached
/// expressions and resolved targets)
#[derive(Debug, Clone)]
pub enum NodeKind {
    Say {
        message: String,
        await_ack: bool,
    },
    Collect {
        slot: String,
        prompt: String,
        validator: Option<String>,
        validation_message: Option<String>,
    },
    Action {
        call: String,
        map_outputs: HashMap<String, String>,
    },
    Set {
        slot: String,
        source: ValueSource,
    },
    Branch {
        guard: Expr,
        cases: HashMap<String, Next>,
        default: Option<Next>,
    },
    Confirm {
        slot: Option<String>,
        message: String,
        on_confirm: usize,
        on_deny: usize,
    },
    Link {
        flow: String,
    },
    Call {
        flow: String,
        inputs: HashMap<String, ValueSource>,
        map_outputs: HashMap<String, String>,
    },
}

impl NodeKind {
    /// Short tag for logging
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Say { .. } => "say",
            NodeKind::Collect { .. } => "collect",
            NodeKind::Action { .. } => "action",
            NodeKind::Set { .. } => "set",
            NodeKind::Branch { .. } => "branch",
            NodeKind::Confirm { .. } => "confirm",
            NodeKind::Link { .. } => "link",
            NodeKind::Call { .. } => "call",
        }
    }
}

/// One executable node
#[derive(Debug, Clone)]
pub struct CompiledNode {
    /// Stable index in source order; the action idempotence key
    pub index: usize,

    /// Node name (synthetic guards are `__{step}_guard`)
    pub name: String,

    /// Executable variant
    pub kind: NodeKind,

    /// Fall-through successor with `jump_to` applied (unused by branch)
    pub next: Next,
}

/// An immutable, compiled flow ready for execution
#[derive(Debug)]
pub struct FlowGraph {
    /// Flow name this graph was compiled from
    pub flow_name: String,
    nodes: Vec<CompiledNode>,
    index_of: HashMap<String, usize>,
}

impl FlowGraph {
    /// Node at an index
    pub fn node(&self, index: usize) -> Option<&CompiledNode> {
        self.nodes.get(index)
    }

    /// Resolve a step name (while names alias their guards)
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index_of.get(name).copied()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes (never true after a successful compile)
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in index order
    pub fn nodes(&self) -> &[CompiledNode] {
        &self.nodes
    }

    /// Index of the collect node targeting `slot`, if any
    pub fn collect_index_for_slot(&self, slot: &str) -> Option<usize> {
        self.nodes.iter().position(
            |n| matches!(&n.kind, NodeKind::Collect { slot: s, .. } if s == slot),
        )
    }

    /// The collect node targeting `slot`, if any
    pub fn node_for_slot(&self, slot: &str) -> Option<&CompiledNode> {
        self.collect_index_for_slot(slot).and_then(|i| self.node(i))
    }

    /// Names of nodes not reachable from the entry node
    pub fn unreachable_steps(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        if !self.nodes.is_empty() {
            queue.push_back(0usize);
            seen.insert(0usize);
        }
        while let Some(i) = queue.pop_front() {
            let node = &self.nodes[i];
            let mut targets: Vec<Next> = Vec::new();
            match &node.kind {
                NodeKind::Branch { cases, default, .. } => {
                    targets.extend(cases.values().copied());
                    if let Some(d) = default {
                        targets.push(*d);
                    }
                }
                NodeKind::Confirm {
                    on_confirm,
                    on_deny,
                    ..
                } => {
                    targets.push(Next::Step(*on_confirm));
                    targets.push(Next::Step(*on_deny));
                }
                NodeKind::Link { .. } => {}
                _ => targets.push(node.next),
            }
            for t in targets {
                if let Next::Step(j) = t {
                    if seen.insert(j) {
                        queue.push_back(j);
                    }
                }
            }
        }
        self.nodes
            .iter()
            .filter(|n| !seen.contains(&n.index))
            .map(|n| n.name.clone())
            .collect()
    }
}

/// All compiled flows of a specification
#[derive(Debug)]
pub struct CompiledSpec {
    flows: HashMap<String, Arc<FlowGraph>>,
    flow_names: Vec<String>,
}

impl CompiledSpec {
    /// Compile every flow and validate cross-flow references
    pub fn compile(spec: &DialogueSpec) -> Result<Self> {
        let mut flows = HashMap::new();
        let mut flow_names = Vec::new();

        for flow in &spec.flows {
            let graph = compile_flow(&flow.name, &flow.steps)?;
            let unreachable = graph.unreachable_steps();
            if !unreachable.is_empty() {
                tracing::warn!(
                    flow = %flow.name,
                    steps = ?unreachable,
                    "flow contains unreachable steps"
                );
            }
            flow_names.push(flow.name.clone());
            flows.insert(flow.name.clone(), Arc::new(graph));
        }

        // link/call targets must name flows that exist.
        for flow in &spec.flows {
            for step in &flow.steps {
                let target = match &step.kind {
                    StepKind::Link { flow } => Some(flow),
                    StepKind::Call { flow, .. } => Some(flow),
                    _ => None,
                };
                if let Some(target) = target {
                    if !flows.contains_key(target) {
                        return Err(EngineError::graph_build(
                            &step.step,
                            format!("references unknown flow '{}'", target),
                        ));
                    }
                }
            }
        }

        Ok(Self { flows, flow_names })
    }

    /// Compiled graph for a flow
    pub fn flow(&self, name: &str) -> Result<&Arc<FlowGraph>> {
        self.flows
            .get(name)
            .ok_or_else(|| EngineError::UnknownFlow(name.to_string()))
    }

    /// Flow names in declaration order
    pub fn flow_names(&self) -> &[String] {
        &self.flow_names
    }
}

/// Compile one flow's step list
pub fn compile_flow(flow_name: &str, steps: &[Step]) -> Result<FlowGraph> {
    // Pass 1: stable indices and the name map (while names alias guards).
    let mut index_of = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        if step.step == END || step.step.starts_with("__") {
            return Err(EngineError::validation(
                &step.step,
                "step names starting with '__' and the name 'END' are reserved",
            ));
        }
        index_of.insert(step.step.clone(), i);
    }

    let resolve = |step: &Step, target: &str| -> Result<Next> {
        if target == END {
            return Ok(Next::End);
        }
        index_of
            .get(target)
            .map(|i| Next::Step(*i))
            .ok_or_else(|| {
                EngineError::graph_build(
                    &step.step,
                    format!("references unknown step '{}'", target),
                )
            })
    };

    // Pass 2: which body steps get their successor forced back to a guard.
    let mut forced_next: HashMap<usize, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        if let StepKind::While { body, .. } = &step.kind {
            for name in body {
                if name == END {
                    return Err(EngineError::graph_build(
                        &step.step,
                        "while body cannot contain END; use exit_to",
                    ));
                }
                resolve(step, name)?;
            }
            let Some(last_name) = body.last() else {
                return Err(EngineError::validation(
                    &step.step,
                    "while requires a non-empty 'do' list",
                ));
            };
            let last_idx = index_of[last_name.as_str()];
            let last_step = &steps[last_idx];
            if last_step.jump_to.is_some() {
                return Err(EngineError::graph_build(
                    &step.step,
                    format!(
                        "last body step '{}' carries jump_to; the loop owns its successor",
                        last_name
                    ),
                ));
            }
            match &last_step.kind {
                StepKind::Branch { .. }
                | StepKind::Confirm { .. }
                | StepKind::Link { .. }
                | StepKind::While { .. } => {
                    return Err(EngineError::graph_build(
                        &step.step,
                        format!(
                            "last body step '{}' ({}) cannot fall through back to the guard",
                            last_name,
                            last_step.kind_name()
                        ),
                    ));
                }
                _ => {}
            }
            forced_next.insert(last_idx, i);
        }
    }

    // Pass 3: build nodes with resolved edges and cached expressions.
    let mut nodes = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let fall_through = if let Some(guard) = forced_next.get(&i) {
            Next::Step(*guard)
        } else if let Some(target) = &step.jump_to {
            resolve(step, target)?
        } else if i + 1 < steps.len() {
            Next::Step(i + 1)
        } else {
            Next::End
        };

        let parse_expr = |text: &str| -> Result<Expr> {
            Expr::parse(text).map_err(|e| EngineError::validation(&step.step, e.to_string()))
        };

        let (name, kind) = match &step.kind {
            StepKind::Say { message, await_ack } => (
                step.step.clone(),
                NodeKind::Say {
                    message: message.clone(),
                    await_ack: *await_ack,
                },
            ),
            StepKind::Collect {
                slot,
                prompt,
                validator,
                validation_message,
            } => (
                step.step.clone(),
                NodeKind::Collect {
                    slot: slot.clone(),
                    prompt: prompt.clone(),
                    validator: validator.clone(),
                    validation_message: validation_message.clone(),
                },
            ),
            StepKind::Action { call, map_outputs } => (
                step.step.clone(),
                NodeKind::Action {
                    call: call.clone(),
                    map_outputs: map_outputs.clone(),
                },
            ),
            StepKind::Set {
                slot,
                value,
                expression,
            } => {
                let source = match (value, expression) {
                    (Some(v), None) => ValueSource::Literal(v.clone()),
                    (None, Some(e)) => ValueSource::Expression(parse_expr(e)?),
                    _ => {
                        return Err(EngineError::validation(
                            &step.step,
                            "set requires exactly one of 'value' or 'expression'",
                        ))
                    }
                };
                (
                    step.step.clone(),
                    NodeKind::Set {
                        slot: slot.clone(),
                        source,
                    },
                )
            }
            StepKind::Branch {
                evaluate,
                cases,
                default,
            } => {
                let guard = parse_expr(evaluate)?;
                let mut resolved = HashMap::new();
                for (case, target) in cases {
                    resolved.insert(case.clone(), resolve(step, target)?);
                }
                let default = match default {
                    Some(d) => Some(resolve(step, d)?),
                    None => None,
                };
                if default.is_none()
                    && guard.is_boolean_shaped()
                    && !(resolved.contains_key("true") && resolved.contains_key("false"))
                {
                    return Err(EngineError::graph_build(
                        &step.step,
                        "boolean branch needs both 'true' and 'false' cases or a default",
                    ));
                }
                (
                    step.step.clone(),
                    NodeKind::Branch {
                        guard,
                        cases: resolved,
                        default,
                    },
                )
            }
            StepKind::While {
                condition,
                body,
                exit_to,
            } => {
                let guard = parse_expr(condition)?;
                let Some(first) = body.first() else {
                    return Err(EngineError::validation(
                        &step.step,
                        "while requires a non-empty 'do' list",
                    ));
                };
                let first_body = resolve(step, first)?;
                let exit = match exit_to {
                    Some(e) => resolve(step, e)?,
                    None => Next::End,
                };
                let cases = HashMap::from([
                    ("true".to_string(), first_body),
                    ("false".to_string(), exit),
                ]);
                (
                    format!("__{}_guard", step.step),
                    NodeKind::Branch {
                        guard,
                        cases,
                        default: None,
                    },
                )
            }
            StepKind::Confirm {
                slot,
                message,
                on_confirm,
                on_deny,
            } => {
                let on_confirm = match resolve(step, on_confirm)? {
                    Next::Step(i) => i,
                    Next::End => {
                        return Err(EngineError::graph_build(
                            &step.step,
                            "on_confirm cannot target END; confirm a final say instead",
                        ))
                    }
                };
                let on_deny = match resolve(step, on_deny)? {
                    Next::Step(i) => i,
                    Next::End => {
                        return Err(EngineError::graph_build(
                            &step.step,
                            "on_deny cannot target END; route to a step first",
                        ))
                    }
                };
                (
                    step.step.clone(),
                    NodeKind::Confirm {
                        slot: slot.clone(),
                        message: message.clone(),
                        on_confirm,
                        on_deny,
                    },
                )
            }
            StepKind::Link { flow } => (step.step.clone(), NodeKind::Link { flow: flow.clone() }),
            StepKind::Call {
                flow,
                inputs,
                map_outputs,
            } => {
                let mut parsed_inputs = HashMap::new();
                for (slot, text) in inputs {
                    parsed_inputs.insert(slot.clone(), ValueSource::Expression(parse_expr(text)?));
                }
                (
                    step.step.clone(),
                    NodeKind::Call {
                        flow: flow.clone(),
                        inputs: parsed_inputs,
                        map_outputs: map_outputs.clone(),
                    },
                )
            }
        };

        nodes.push(CompiledNode {
            index: i,
            name,
            kind,
            next: fall_through,
        });
    }

    // Synthetic guard names resolve too.
    let mut index_of = index_of;
    for node in &nodes {
        if node.name.starts_with("__") {
            index_of.insert(node.name.clone(), node.index);
        }
    }

    Ok(FlowGraph {
        flow_name: flow_name.to_string(),
        nodes,
        index_of,
    })
}
