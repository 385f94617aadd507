//! Fork / Join. Fork is pure bookkeeping: it names the downstream branches
//! positionally so later scheduling can address them. Join waits on
//! whichever of its incoming branches are still running, bounded by an
//! optional timeout.

use super::Result;
use common::error::{ControlError, EngineError};
use common::types::{Edge, ExecutionContext, JsonValue, Node};
use futures::future::select_all;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ForkResult {
    pub branch_count: usize,
    pub branch_ids: Vec<String>,
    pub metadata: JsonValue,
}

/// Names each of `node`'s outgoing edges `branch_0`, `branch_1`, … in edge
/// order.
pub fn fork(node: &Node, edges: &[Edge]) -> ForkResult {
    let count = edges.iter().filter(|e| e.source == node.id).count();
    let branch_ids = (0..count).map(|i| format!("branch_{i}")).collect();
    ForkResult { branch_count: count, branch_ids, metadata: serde_json::json!({}) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinStrategy {
    WaitAll,
    WaitN(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnTimeout {
    Fail,
    Continue,
}

#[derive(Debug, Clone)]
pub struct JoinResult {
    pub completed_branches: Vec<Uuid>,
    pub branch_outputs: HashMap<Uuid, JsonValue>,
    pub timed_out: bool,
    pub metadata: JsonValue,
}

/// A branch source still being awaited — the orchestrator hands over the
/// task it spawned for that branch so Join can race them against the timeout.
pub type PendingBranch = (Uuid, tokio::task::JoinHandle<Result<JsonValue>>);

fn parse_join_config(node: &Node, incoming_count: usize) -> Result<(JoinStrategy, u64, OnTimeout)> {
    let strategy = match node.data.config.get("join_strategy").and_then(JsonValue::as_str).unwrap_or("wait_all") {
        "wait_all" => JoinStrategy::WaitAll,
        "wait_n" => {
            let n = node.data.config.get("required_count").and_then(JsonValue::as_u64).unwrap_or(0) as usize;
            if n == 0 || n > incoming_count {
                return Err(EngineError::Control(ControlError::InvalidRequiredCount));
            }
            JoinStrategy::WaitN(n)
        }
        other => return Err(EngineError::Internal(format!("join node {}: unknown join_strategy '{other}'", node.id))),
    };
    let timeout_ms = node.data.config.get("timeout_ms").and_then(JsonValue::as_u64).unwrap_or(0);
    let on_timeout = match node.data.config.get("on_timeout").and_then(JsonValue::as_str).unwrap_or("fail") {
        "continue" => OnTimeout::Continue,
        _ => OnTimeout::Fail,
    };
    Ok((strategy, timeout_ms, on_timeout))
}

/// Waits for `node`'s incoming branches per its `JoinStrategy`. Sources
/// whose output already sits in `ctx.step_outputs` count as complete
/// without waiting; `pending` covers the rest.
pub async fn join(node: &Node, edges: &[Edge], ctx: &ExecutionContext, pending: Vec<PendingBranch>) -> Result<JoinResult> {
    let sources = crate::planner::find_incoming_branches(node.id, edges);
    let (strategy, timeout_ms, on_timeout) = parse_join_config(node, sources.len())?;
    let required = match strategy {
        JoinStrategy::WaitAll => sources.len(),
        JoinStrategy::WaitN(n) => n,
    };

    let mut branch_outputs: HashMap<Uuid, JsonValue> = HashMap::new();
    let mut completed: HashSet<Uuid> = HashSet::new();
    for &source in &sources {
        if let Some(output) = ctx.step_outputs.get(&source.to_string()) {
            branch_outputs.insert(source, output.clone());
            completed.insert(source);
        }
    }

    let deadline = if timeout_ms == 0 { None } else { Some(Instant::now() + Duration::from_millis(timeout_ms)) };
    let mut ids: Vec<Uuid> = pending.iter().map(|(id, _)| *id).filter(|id| !completed.contains(id)).collect();
    let mut handles: Vec<_> = pending.into_iter().filter(|(id, _)| ids.contains(id)).map(|(_, h)| h).collect();
    let mut timed_out = false;

    while completed.len() < required && !handles.is_empty() {
        let wait = match deadline {
            None => select_all(handles).await,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    timed_out = true;
                    break;
                }
                match tokio::time::timeout(remaining, select_all(handles)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                }
            }
        };
        let (result, index, rest) = wait;
        let source_id = ids.remove(index);
        handles = rest;
        if let Ok(Ok(output)) = result {
            branch_outputs.insert(source_id, output);
            completed.insert(source_id);
        }
    }

    if completed.len() < required {
        if timed_out || deadline.is_some() {
            match on_timeout {
                OnTimeout::Fail => return Err(EngineError::Control(ControlError::JoinTimeout)),
                OnTimeout::Continue => {
                    return Ok(JoinResult {
                        completed_branches: completed.into_iter().collect(),
                        branch_outputs,
                        timed_out: true,
                        metadata: join_metadata(strategy, timeout_ms),
                    });
                }
            }
        }
        return Err(EngineError::Control(ControlError::JoinTimeout));
    }

    Ok(JoinResult {
        completed_branches: completed.into_iter().collect(),
        branch_outputs,
        timed_out: false,
        metadata: join_metadata(strategy, timeout_ms),
    })
}

fn join_metadata(strategy: JoinStrategy, timeout_ms: u64) -> JsonValue {
    serde_json::json!({
        "join_strategy": match strategy { JoinStrategy::WaitAll => "wait_all", JoinStrategy::WaitN(_) => "wait_n" },
        "timeout_ms": timeout_ms,
    })
}
