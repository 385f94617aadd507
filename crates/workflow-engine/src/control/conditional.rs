//! Conditional engine: evaluates a node's configured expression, selects
//! the taken branch, and computes the skip set for the non-taken one via
//! the planner's fixpoint BFS.

use crate::context::build_interpolation_context;
use common::error::EngineError;
use common::types::{Edge, ExecutionContext, JsonValue, Node};
use std::collections::HashSet;
use uuid::Uuid;

use super::Result;

#[derive(Debug, Clone)]
pub struct ConditionalResult {
    pub condition: String,
    pub result: bool,
    pub taken_branch: &'static str,
    pub next_nodes: Vec<Uuid>,
    pub stop_execution: bool,
    /// Nodes on the non-taken branch (and everything reachable only through
    /// it) that must be treated as skipped rather than missing.
    pub skip_set: HashSet<Uuid>,
}

/// Evaluates `node`'s condition and computes branch selection + skip set.
/// Does not itself execute `next_nodes` — the Orchestrator schedules those.
///
/// `interp_override`, when set, is the layered interpolation context a
/// caller built for this node — e.g. a Loop's per-iteration item/index
/// variables — and is used in place of a freshly-built one so a Conditional
/// nested in a Loop or Parallel body can see that body's variables.
pub fn evaluate(
    node: &Node,
    nodes: &[Node],
    edges: &[Edge],
    ctx: &ExecutionContext,
    interp_override: Option<JsonValue>,
) -> Result<ConditionalResult> {
    let condition = node
        .data
        .config
        .get("condition")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| EngineError::Internal(format!("conditional node {} missing 'condition'", node.id)))?
        .to_string();

    let interp_ctx = interp_override.unwrap_or_else(|| build_interpolation_context(ctx));
    let result = crate::expression::evaluate_condition(&condition, &interp_ctx)
        .map_err(|e| EngineError::Internal(format!("conditional node {}: {e}", node.id)))?;

    let taken_branch: &'static str = if result { "true" } else { "false" };

    let next_nodes: Vec<Uuid> = edges
        .iter()
        .filter(|e| e.source == node.id && e.label.as_deref() == Some(taken_branch))
        .map(|e| e.target)
        .collect();

    let stop_key = if result { "stop_on_true" } else { "stop_on_false" };
    let stop_execution = node.data.config.get(stop_key).and_then(JsonValue::as_bool).unwrap_or(false);

    let skip_set = crate::planner::conditional_skip_set(node.id, taken_branch, nodes, edges);

    Ok(ConditionalResult { condition, result, taken_branch, next_nodes, stop_execution, skip_set })
}
