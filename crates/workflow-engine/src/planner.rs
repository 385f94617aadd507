//! Planner: DAG ordering, loop-body and join-incoming discovery, and
//! conditional skip-set computation — the graph-shape questions the
//! orchestrator and control constructs need answered before they can walk
//! or schedule a workflow.

use common::types::{Edge, Node};
use common::PlannerError;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

type Result<T> = std::result::Result<T, PlannerError>;

/// Kahn's algorithm; fails with [`PlannerError::CycleDetected`] unless every
/// node is emitted.
pub fn topological_order(nodes: &[Node], edges: &[Edge]) -> Result<Vec<Uuid>> {
    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut in_degree: HashMap<Uuid, usize> = nodes.iter().map(|n| (n.id, 0)).collect();

    for edge in edges {
        adjacency.entry(edge.source).or_default().push(edge.target);
        *in_degree.get_mut(&edge.target).ok_or(PlannerError::NodeNotFound(edge.target))? += 1;
    }

    let mut queue: VecDeque<Uuid> =
        in_degree.iter().filter(|(_, &d)| d == 0).map(|(&id, _)| id).collect();
    if queue.is_empty() && !nodes.is_empty() {
        return Err(PlannerError::NoStartNodes);
    }

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id);
        if let Some(neighbors) = adjacency.get(&id) {
            for &next in neighbors {
                let degree = in_degree.get_mut(&next).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(PlannerError::CycleDetected);
    }
    Ok(order)
}

/// Nodes with in-degree zero.
pub fn find_start_nodes(nodes: &[Node], edges: &[Edge]) -> Vec<Uuid> {
    let has_incoming: HashSet<Uuid> = edges.iter().map(|e| e.target).collect();
    nodes.iter().map(|n| n.id).filter(|id| !has_incoming.contains(id)).collect()
}

#[derive(Debug, Clone, Default)]
pub struct LoopBody {
    /// `None` for an empty-body loop (the loop node has no outgoing edges at all).
    pub entrance: Option<Uuid>,
    pub nodes: HashSet<Uuid>,
    /// Targets of the loop's non-entrance outgoing edges — the loop-exit set.
    pub exits: HashSet<Uuid>,
}

/// The first outgoing edge from `loop_id` is the body entrance, the
/// remaining outgoing edges are loop-exit targets; BFS from the entrance,
/// excluding the exit set, discovers the rest of the body.
pub fn find_loop_body(loop_id: Uuid, edges: &[Edge]) -> LoopBody {
    let mut outgoing = edges.iter().filter(|e| e.source == loop_id);
    let Some(first) = outgoing.next() else {
        return LoopBody::default();
    };
    let entrance = first.target;
    let exits: HashSet<Uuid> = outgoing.map(|e| e.target).collect();

    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for edge in edges {
        adjacency.entry(edge.source).or_default().push(edge.target);
    }

    let mut body_nodes = HashSet::new();
    body_nodes.insert(entrance);
    let mut queue = VecDeque::from([entrance]);
    while let Some(current) = queue.pop_front() {
        if let Some(neighbors) = adjacency.get(&current) {
            for &next in neighbors {
                if exits.contains(&next) || body_nodes.contains(&next) {
                    continue;
                }
                body_nodes.insert(next);
                queue.push_back(next);
            }
        }
    }

    LoopBody { entrance: Some(entrance), nodes: body_nodes, exits }
}

/// Sources of all edges targeting `join_id`.
pub fn find_incoming_branches(join_id: Uuid, edges: &[Edge]) -> Vec<Uuid> {
    edges.iter().filter(|e| e.target == join_id).map(|e| e.source).collect()
}

/// BFS from each of `starts` independently, stopping expansion at (but still
/// including) any node in `stop_at`. Used by the Orchestrator to discover
/// Parallel/Fork branch bodies so its outer topological walk doesn't
/// re-execute nodes a control construct already ran.
pub fn branch_bodies_from_children(starts: &[Uuid], edges: &[Edge], stop_at: &HashSet<Uuid>) -> Vec<Vec<Uuid>> {
    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for edge in edges {
        adjacency.entry(edge.source).or_default().push(edge.target);
    }

    starts
        .iter()
        .map(|&start| {
            let mut visited = HashSet::from([start]);
            let mut queue = VecDeque::from([start]);
            let mut order = Vec::new();
            while let Some(current) = queue.pop_front() {
                order.push(current);
                if stop_at.contains(&current) {
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
        .collect()
}

/// BFS-by-fixpoint from the non-taken branch's direct targets. A node joins
/// the skip set only once *every* one
/// of its parents is already skipped, so a join merging a skipped branch
/// with a live one is never itself skipped.
pub fn conditional_skip_set(conditional_id: Uuid, taken_branch: &str, nodes: &[Node], edges: &[Edge]) -> HashSet<Uuid> {
    let non_taken_label = if taken_branch == "true" { "false" } else { "true" };

    let mut skip_set: HashSet<Uuid> = edges
        .iter()
        .filter(|e| e.source == conditional_id && e.label.as_deref() == Some(non_taken_label))
        .map(|e| e.target)
        .collect();

    let mut parents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for edge in edges {
        parents.entry(edge.target).or_default().push(edge.source);
    }

    loop {
        let mut changed = false;
        for node in nodes {
            if node.id == conditional_id || skip_set.contains(&node.id) {
                continue;
            }
            if let Some(ps) = parents.get(&node.id) {
                if !ps.is_empty() && ps.iter().all(|p| skip_set.contains(p)) && skip_set.insert(node.id) {
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    skip_set
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{NodeData, NodeType};

    fn node(node_type: NodeType) -> Node {
        Node { id: Uuid::new_v4(), node_type, data: NodeData { name: "n".to_string(), config: serde_json::json!({}), retry: None } }
    }

    fn edge(source: Uuid, target: Uuid, label: Option<&str>) -> Edge {
        Edge { id: Uuid::new_v4(), source, target, label: label.map(String::from) }
    }

    #[test]
    fn topological_order_linear_chain() {
        let a = node(NodeType::Trigger);
        let b = node(NodeType::Transform);
        let c = node(NodeType::Transform);
        let edges = vec![edge(a.id, b.id, None), edge(b.id, c.id, None)];
        let order = topological_order(&[a.clone(), b.clone(), c.clone()], &edges).unwrap();
        assert_eq!(order, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn topological_order_detects_cycle() {
        let a = node(NodeType::Trigger);
        let b = node(NodeType::Transform);
        let edges = vec![edge(a.id, b.id, None), edge(b.id, a.id, None)];
        assert_eq!(topological_order(&[a, b], &edges), Err(PlannerError::CycleDetected));
    }

    #[test]
    fn find_loop_body_excludes_exit_targets() {
        let loop_node = node(NodeType::Loop);
        let body1 = node(NodeType::Transform);
        let body2 = node(NodeType::Transform);
        let after = node(NodeType::Transform);
        let edges = vec![
            edge(loop_node.id, body1.id, None),
            edge(loop_node.id, after.id, None),
            edge(body1.id, body2.id, None),
        ];
        let result = find_loop_body(loop_node.id, &edges);
        assert_eq!(result.entrance, Some(body1.id));
        assert!(result.nodes.contains(&body1.id));
        assert!(result.nodes.contains(&body2.id));
        assert!(!result.nodes.contains(&after.id));
        assert!(result.exits.contains(&after.id));
    }

    #[test]
    fn find_loop_body_empty_when_no_outgoing_edges() {
        let loop_node = node(NodeType::Loop);
        let result = find_loop_body(loop_node.id, &[]);
        assert_eq!(result.entrance, None);
        assert!(result.nodes.is_empty());
    }

    #[test]
    fn find_incoming_branches_returns_join_sources() {
        let a = node(NodeType::Fork);
        let b = node(NodeType::Transform);
        let c = node(NodeType::Transform);
        let join = node(NodeType::Join);
        let edges = vec![edge(a.id, b.id, None), edge(a.id, c.id, None), edge(b.id, join.id, None), edge(c.id, join.id, None)];
        let mut branches = find_incoming_branches(join.id, &edges);
        branches.sort();
        let mut expected = vec![b.id, c.id];
        expected.sort();
        assert_eq!(branches, expected);
    }

    #[test]
    fn conditional_skip_set_excludes_join_with_live_parent() {
        let cond = node(NodeType::Conditional);
        let true_branch = node(NodeType::Transform);
        let false_branch = node(NodeType::Transform);
        let join = node(NodeType::Join);
        let edges = vec![
            edge(cond.id, true_branch.id, Some("true")),
            edge(cond.id, false_branch.id, Some("false")),
            edge(true_branch.id, join.id, None),
            edge(false_branch.id, join.id, None),
        ];
        let nodes = vec![cond.clone(), true_branch.clone(), false_branch.clone(), join.clone()];
        let skip = conditional_skip_set(cond.id, "true", &nodes, &edges);
        assert!(skip.contains(&false_branch.id));
        assert!(!skip.contains(&join.id), "join has a live parent and must not be skipped");
        assert!(!skip.contains(&true_branch.id));
    }

    #[test]
    fn conditional_skip_set_propagates_through_pure_skip_chain() {
        let cond = node(NodeType::Conditional);
        let false_branch = node(NodeType::Transform);
        let downstream = node(NodeType::Transform);
        let edges = vec![
            edge(cond.id, false_branch.id, Some("false")),
            edge(false_branch.id, downstream.id, None),
        ];
        let nodes = vec![cond.clone(), false_branch.clone(), downstream.clone()];
        let skip = conditional_skip_set(cond.id, "true", &nodes, &edges);
        assert!(skip.contains(&false_branch.id));
        assert!(skip.contains(&downstream.id));
    }
}
