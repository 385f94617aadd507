//! Parallel executor: bounded-concurrency branches with a
//! `fail_fast`/`wait_all` error strategy and cooperative cancellation.

use super::{NodeExecutor, Result};
use crate::context::derive_sub_context;
use common::error::{ControlError, EngineError};
use common::types::{Edge, ExecutionContext, JsonValue, Node, NodeType};
use futures::future::select_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorStrategy {
    FailFast,
    WaitAll,
}

#[derive(Debug, Clone)]
pub struct BranchResult {
    pub branch_index: usize,
    pub output: JsonValue,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ParallelResult {
    pub branch_count: usize,
    pub branch_results: Vec<BranchResult>,
    pub metadata: JsonValue,
}

fn parse_strategy(node: &Node) -> Result<ErrorStrategy> {
    match node.data.config.get("error_strategy").and_then(JsonValue::as_str).unwrap_or("fail_fast") {
        "fail_fast" => Ok(ErrorStrategy::FailFast),
        "wait_all" => Ok(ErrorStrategy::WaitAll),
        other => Err(EngineError::Internal(format!("parallel node {}: unknown error_strategy '{other}'", node.id))),
    }
}

/// Explicit `branches` config (array of node-id arrays) takes precedence;
/// otherwise each direct outgoing edge from the parallel node starts a
/// branch whose body is discovered by BFS stopping at Join nodes.
fn derive_branches(node: &Node, nodes: &[Node], edges: &[Edge]) -> Result<Vec<Vec<Uuid>>> {
    if let Some(explicit) = node.data.config.get("branches").and_then(JsonValue::as_array) {
        let mut branches = Vec::with_capacity(explicit.len());
        for branch in explicit {
            let ids: Option<Vec<Uuid>> = branch
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok())).collect());
            branches.push(ids.ok_or_else(|| EngineError::Internal(format!("parallel node {}: malformed 'branches' entry", node.id)))?);
        }
        return Ok(branches);
    }

    let join_ids: HashSet<Uuid> = nodes.iter().filter(|n| matches!(n.node_type, NodeType::Join)).map(|n| n.id).collect();
    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for edge in edges {
        adjacency.entry(edge.source).or_default().push(edge.target);
    }

    let children: Vec<Uuid> = edges.iter().filter(|e| e.source == node.id).map(|e| e.target).collect();
    let branches = children
        .into_iter()
        .map(|start| {
            let mut visited = HashSet::from([start]);
            let mut queue = VecDeque::from([start]);
            let mut order = Vec::new();
            while let Some(current) = queue.pop_front() {
                order.push(current);
                if join_ids.contains(&current) {
                    continue;
                }
                if let Some(neighbors) = adjacency.get(&current) {
                    for &next in neighbors {
                        if visited.insert(next) {
                            queue.push_back(next);
                        }
                    }
                }
            }
            order
        })
        .collect();
    Ok(branches)
}

fn topological_subset(branch_nodes: &[Uuid], nodes: &[Node], edges: &[Edge]) -> Result<Vec<Uuid>> {
    let set: HashSet<Uuid> = branch_nodes.iter().copied().collect();
    let subset_nodes: Vec<Node> = nodes.iter().filter(|n| set.contains(&n.id)).cloned().collect();
    let subset_edges: Vec<Edge> = edges.iter().filter(|e| set.contains(&e.source) && set.contains(&e.target)).cloned().collect();
    crate::planner::topological_order(&subset_nodes, &subset_edges)
        .map_err(|e| EngineError::Internal(format!("parallel branch has an unorderable body: {e}")))
}

/// Runs every branch concurrently, bounded by `max_concurrency`. `ctx` is
/// only mutated after all branches settle — each branch works over its own
/// derived sub-context while running.
pub async fn run(
    node: &Node,
    nodes: &[Node],
    edges: &[Edge],
    executor: Arc<dyn NodeExecutor>,
    ctx: &mut ExecutionContext,
    cancel: &CancellationToken,
) -> Result<ParallelResult> {
    let strategy = parse_strategy(node)?;
    let max_concurrency = node.data.config.get("max_concurrency").and_then(JsonValue::as_u64).unwrap_or(0) as usize;
    let branch_node_ids = derive_branches(node, nodes, edges)?;
    let branch_count = branch_node_ids.len();

    let node_map: HashMap<Uuid, Node> = nodes.iter().map(|n| (n.id, n.clone())).collect();
    let permits = if max_concurrency == 0 { branch_count.max(1) } else { max_concurrency.min(branch_count.max(1)) };
    let semaphore = Arc::new(Semaphore::new(permits));
    let branch_cancel = cancel.child_token();

    let mut tasks = Vec::with_capacity(branch_count);
    for (branch_index, ids) in branch_node_ids.into_iter().enumerate() {
        let order = topological_subset(&ids, nodes, edges)?;
        let sub_ctx = derive_sub_context(ctx);
        let executor = executor.clone();
        let semaphore = semaphore.clone();
        let branch_cancel = branch_cancel.clone();
        let node_map = node_map.clone();

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            let start = Instant::now();
            let mut ctx = sub_ctx;
            let mut last_output = JsonValue::Null;
            let mut error = None;
            let mut skip: HashSet<Uuid> = HashSet::new();

            for node_id in &order {
                if branch_cancel.is_cancelled() {
                    error = Some("execution cancelled".to_string());
                    break;
                }
                if skip.contains(node_id) {
                    continue;
                }
                let Some(body_node) = node_map.get(node_id) else { continue };
                if matches!(body_node.node_type, NodeType::Join) {
                    // the branch body's BFS includes the join it converges on
                    // so the caller can find it, but the join itself only
                    // runs once, at the top level, after every branch merges.
                    continue;
                }
                match executor.execute_node(body_node.id, &mut ctx, &branch_cancel, None, &mut skip).await {
                    Ok(output) => last_output = output,
                    Err(e) => {
                        error = Some(e.to_string());
                        break;
                    }
                }
            }

            let duration_ms = start.elapsed().as_millis() as u64;
            (branch_index, last_output, error, duration_ms, ctx.step_outputs)
        }));
    }

    let mut branch_results = vec![None; branch_count];
    let mut merged_step_outputs = HashMap::new();
    let mut first_error: Option<String> = None;

    let mut remaining = tasks;
    while !remaining.is_empty() {
        let (outcome, _index, rest) = select_all(remaining).await;
        remaining = rest;
        let (branch_index, output, error, duration_ms, step_outputs) =
            outcome.map_err(|e| EngineError::Internal(format!("parallel branch task panicked: {e}")))?;

        if error.is_some() && first_error.is_none() {
            first_error = error.clone();
            if strategy == ErrorStrategy::FailFast {
                branch_cancel.cancel();
            }
        }
        merged_step_outputs.extend(step_outputs);
        branch_results[branch_index] = Some(BranchResult { branch_index, output, error, duration_ms });
    }

    ctx.step_outputs.extend(merged_step_outputs);

    if let Some(err) = first_error {
        return Err(EngineError::Control(ControlError::BranchFailed(err)));
    }

    let metadata = serde_json::json!({
        "error_strategy": match strategy { ErrorStrategy::FailFast => "fail_fast", ErrorStrategy::WaitAll => "wait_all" },
        "max_concurrency": max_concurrency,
    });

    Ok(ParallelResult {
        branch_count,
        branch_results: branch_results.into_iter().map(|b| b.expect("every branch index filled")).collect(),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::NodeData;

    fn node(node_type: NodeType, config: JsonValue) -> Node {
        Node { id: Uuid::new_v4(), node_type, data: NodeData { name: "n".to_string(), config, retry: None } }
    }

    fn edge(source: Uuid, target: Uuid) -> Edge {
        Edge { id: Uuid::new_v4(), source, target, label: None }
    }

    #[test]
    fn derives_one_branch_per_direct_child_stopping_at_join() {
        let parallel = node(NodeType::Parallel, serde_json::json!({}));
        let b1 = node(NodeType::Transform, serde_json::json!({}));
        let b2 = node(NodeType::Transform, serde_json::json!({}));
        let join = node(NodeType::Join, serde_json::json!({"join_strategy": "wait_all"}));
        let edges = vec![edge(parallel.id, b1.id), edge(parallel.id, b2.id), edge(b1.id, join.id), edge(b2.id, join.id)];
        let nodes = vec![parallel.clone(), b1.clone(), b2.clone(), join.clone()];
        let branches = derive_branches(&parallel, &nodes, &edges).unwrap();
        assert_eq!(branches.len(), 2);
        for branch in &branches {
            assert!(branch.contains(&join.id), "branch should reach the join but not go past it");
        }
    }

    #[test]
    fn explicit_branches_config_takes_precedence() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let parallel = node(NodeType::Parallel, serde_json::json!({"branches": [[a.to_string()], [b.to_string()]]}));
        let branches = derive_branches(&parallel, &[], &[]).unwrap();
        assert_eq!(branches, vec![vec![a], vec![b]]);
    }

    #[test]
    fn rejects_unknown_error_strategy() {
        let parallel = node(NodeType::Parallel, serde_json::json!({"error_strategy": "retry_all"}));
        assert!(parse_strategy(&parallel).is_err());
    }
}
