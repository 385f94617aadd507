//! Loop executor: for-each iteration over an array or object, sequential
//! over items, with break conditions and a stop/continue error strategy.

use super::{NodeExecutor, Result};
use crate::context::{build_interpolation_context, derive_sub_context, with_loop_variables};
use crate::expression::{evaluate_condition, get_value_by_path};
use common::error::{ControlError, EngineError};
use common::types::{Edge, ExecutionContext, JsonValue, Node};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct LoopConfig {
    source: String,
    item_variable: String,
    index_variable: Option<String>,
    key_variable: Option<String>,
    max_iterations: usize,
    on_error: OnError,
    break_conditions: Vec<BreakCondition>,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum OnError {
    Stop,
    Continue,
}

enum BreakCondition {
    FreeForm(String),
    Triple { operator: String, field: String, value: JsonValue },
}

fn parse_config(node: &Node) -> Result<LoopConfig> {
    let config = &node.data.config;
    let source = config
        .get("source")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| EngineError::Internal(format!("loop node {} missing 'source'", node.id)))?
        .to_string();
    let item_variable = config
        .get("item_variable")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| EngineError::Internal(format!("loop node {} missing 'item_variable'", node.id)))?
        .to_string();
    let index_variable = config.get("index_variable").and_then(JsonValue::as_str).map(String::from);
    let key_variable = config.get("key_variable").and_then(JsonValue::as_str).map(String::from);
    let max_iterations = config.get("max_iterations").and_then(JsonValue::as_u64).unwrap_or(1000) as usize;
    let on_error = match config.get("on_error").and_then(JsonValue::as_str).unwrap_or("stop") {
        "continue" => OnError::Continue,
        _ => OnError::Stop,
    };
    let break_conditions = config
        .get("break_conditions")
        .and_then(JsonValue::as_array)
        .map(|arr| arr.iter().filter_map(parse_break_condition).collect())
        .unwrap_or_default();

    Ok(LoopConfig { source, item_variable, index_variable, key_variable, max_iterations, on_error, break_conditions })
}

fn parse_break_condition(value: &JsonValue) -> Option<BreakCondition> {
    if let Some(cond) = value.get("condition").and_then(JsonValue::as_str) {
        return Some(BreakCondition::FreeForm(cond.to_string()));
    }
    let operator = value.get("operator").and_then(JsonValue::as_str)?.to_string();
    let field = value.get("field").and_then(JsonValue::as_str)?.to_string();
    let literal = value.get("value").cloned().unwrap_or(JsonValue::Null);
    Some(BreakCondition::Triple { operator, field, value: literal })
}

/// One item visited by the loop (array element, or object value keyed
/// lexicographically), with order preserved.
enum LoopItem {
    Indexed(JsonValue),
    Keyed(String, JsonValue),
}

/// Resolves `source` against the interpolation context. A bare dotted path
/// resolves directly; a single enclosing `${...}`/`{{...}}` marker (the same
/// form `handle_http`/`handle_slack`/`handle_delay` take their string fields
/// in) is stripped first so the array or object underneath comes back intact
/// instead of being flattened to a string by `expression::interpolate`.
fn resolve_source(base_interp: &JsonValue, source: &str) -> JsonValue {
    let trimmed = source.trim();
    let inner = trimmed
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .or_else(|| trimmed.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")));
    let path = inner.map(str::trim).unwrap_or(trimmed);
    get_value_by_path(base_interp, path).unwrap_or(JsonValue::Null)
}

fn resolve_items(source_value: &JsonValue) -> Result<Vec<LoopItem>> {
    match source_value {
        JsonValue::Array(items) => Ok(items.iter().cloned().map(LoopItem::Indexed).collect()),
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Ok(keys.into_iter().map(|k| LoopItem::Keyed(k.clone(), map[k].clone())).collect())
        }
        _ => Err(EngineError::Control(ControlError::InvalidLoopSource)),
    }
}

#[derive(Debug, Clone)]
pub struct IterationResult {
    pub index: usize,
    pub item: JsonValue,
    pub key: Option<String>,
    pub output: JsonValue,
    pub error: Option<String>,
    pub is_first: bool,
    pub is_last: bool,
}

#[derive(Debug, Clone)]
pub struct LoopResult {
    pub iteration_count: usize,
    pub iterations: Vec<IterationResult>,
    pub metadata: JsonValue,
}

/// Runs the loop node's body for every resolved item, sequentially.
pub async fn run(
    node: &Node,
    nodes: &[Node],
    edges: &[Edge],
    executor: &dyn NodeExecutor,
    ctx: &mut ExecutionContext,
    cancel: &CancellationToken,
) -> Result<LoopResult> {
    let config = parse_config(node)?;

    let base_interp = build_interpolation_context(ctx);
    let source_value = resolve_source(&base_interp, &config.source);
    let items = resolve_items(&source_value)?;

    if items.len() > config.max_iterations {
        return Err(EngineError::Control(ControlError::MaxIterationsExceeded {
            actual: items.len(),
            max: config.max_iterations,
        }));
    }

    let body = crate::planner::find_loop_body(node.id, edges);
    let body_node_map: HashMap<Uuid, &Node> = nodes.iter().filter(|n| body.nodes.contains(&n.id)).map(|n| (n.id, n)).collect();
    let body_edges: Vec<Edge> = edges
        .iter()
        .filter(|e| body.nodes.contains(&e.source) && body.nodes.contains(&e.target))
        .cloned()
        .collect();
    let body_nodes: Vec<Node> = body_node_map.values().map(|&n| n.clone()).collect();
    let body_order = crate::planner::topological_order(&body_nodes, &body_edges)
        .map_err(|e| EngineError::Internal(format!("loop node {} has an unorderable body: {e}", node.id)))?;

    let total_items = items.len();
    let mut iterations = Vec::with_capacity(total_items);
    let mut break_triggered = false;
    let mut break_at_index = None;

    for (index, loop_item) in items.into_iter().enumerate() {
        let (item_value, key) = match loop_item {
            LoopItem::Indexed(v) => (v, None),
            LoopItem::Keyed(k, v) => (v, Some(k)),
        };
        let is_first = index == 0;
        let is_last = index + 1 == total_items;

        let mut sub_ctx = derive_sub_context(ctx);
        let mut last_output = JsonValue::Null;
        let mut iteration_error = None;
        let mut skip: HashSet<Uuid> = HashSet::new();

        for node_id in &body_order {
            if cancel.is_cancelled() {
                return Err(EngineError::Control(ControlError::Cancelled));
            }
            if skip.contains(node_id) {
                continue;
            }
            let Some(&body_node) = body_node_map.get(node_id) else { continue };
            let layered = with_loop_variables(
                &build_interpolation_context(&sub_ctx),
                &config.item_variable,
                config.index_variable.as_deref(),
                config.key_variable.as_deref(),
                &item_value,
                index,
                key.as_deref(),
                total_items,
                is_first,
                is_last,
            );
            match executor.execute_node(body_node.id, &mut sub_ctx, cancel, Some(layered), &mut skip).await {
                Ok(output) => last_output = output,
                Err(e) => {
                    iteration_error = Some(e.to_string());
                    if config.on_error == OnError::Stop {
                        return Err(e);
                    }
                    break;
                }
            }
        }

        // propagate this iteration's writes back so later iterations and
        // sibling post-loop nodes can see them.
        ctx.step_outputs.extend(sub_ctx.step_outputs.clone());

        iterations.push(IterationResult {
            index,
            item: item_value.clone(),
            key: key.clone(),
            output: last_output,
            error: iteration_error,
            is_first,
            is_last,
        });

        let post_iter_ctx = with_loop_variables(
            &build_interpolation_context(&sub_ctx),
            &config.item_variable,
            config.index_variable.as_deref(),
            config.key_variable.as_deref(),
            &item_value,
            index,
            key.as_deref(),
            total_items,
            is_first,
            is_last,
        );
        if evaluate_break_conditions(&config.break_conditions, &post_iter_ctx)? {
            break_triggered = true;
            break_at_index = Some(index);
            if let Some(last) = iterations.last_mut() {
                last.is_last = true;
            }
            break;
        }
    }

    let metadata = serde_json::json!({
        "item_variable": config.item_variable,
        "index_variable": config.index_variable,
        "key_variable": config.key_variable,
        "on_error": match config.on_error { OnError::Stop => "stop", OnError::Continue => "continue" },
        "total_items": total_items,
        "break_triggered": break_triggered,
        "break_at_index": break_at_index,
    });

    Ok(LoopResult { iteration_count: iterations.len(), iterations, metadata })
}

fn evaluate_break_conditions(conditions: &[BreakCondition], ctx: &JsonValue) -> Result<bool> {
    for condition in conditions {
        let triggered = match condition {
            BreakCondition::FreeForm(expr) => {
                evaluate_condition(expr, ctx).map_err(|e| EngineError::Internal(e.to_string()))?
            }
            BreakCondition::Triple { operator, field, value } => {
                let left = get_value_by_path(ctx, field).unwrap_or(JsonValue::Null);
                evaluate_triple(operator, &left, value)?
            }
        };
        if triggered {
            return Ok(true);
        }
    }
    Ok(false)
}

fn evaluate_triple(operator: &str, left: &JsonValue, right: &JsonValue) -> Result<bool> {
    match operator {
        "equals" | "==" => Ok(values_equal(left, right)),
        "not_equals" | "!=" => Ok(!values_equal(left, right)),
        "greater_than" | ">" | "less_than" | "<" | "greater_or_equal" | ">=" | "less_or_equal" | "<=" => {
            let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) else {
                return Err(EngineError::Control(ControlError::BreakConditionOperandMismatch(format!(
                    "{left} {operator} {right}"
                ))));
            };
            Ok(match operator {
                "greater_than" | ">" => l > r,
                "less_than" | "<" => l < r,
                "greater_or_equal" | ">=" => l >= r,
                "less_or_equal" | "<=" => l <= r,
                _ => unreachable!(),
            })
        }
        "contains" => Ok(match left {
            JsonValue::String(s) => s.contains(&stringify(right)),
            JsonValue::Array(items) => items.iter().any(|v| values_equal(v, right)),
            _ => false,
        }),
        "starts_with" => Ok(as_str(left).is_some_and(|s| s.starts_with(&stringify(right)))),
        "ends_with" => Ok(as_str(left).is_some_and(|s| s.ends_with(&stringify(right)))),
        other => Err(EngineError::Internal(format!("unknown break condition operator: {other}"))),
    }
}

fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn as_str(value: &JsonValue) -> Option<&str> {
    value.as_str()
}

fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
