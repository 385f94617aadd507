//! Workflow parsing and structural validation: unique node ids, resolvable
//! edge endpoints, at least one starting node. Ordering and cycle
//! detection are delegated to [`crate::planner`].

use common::types::Workflow;
use common::ParseError;
use std::collections::HashSet;

pub struct WorkflowParser;

impl WorkflowParser {
    pub fn new() -> Self {
        Self
    }

    /// Parses a workflow definition from a JSON document and checks
    /// structural invariants (non-empty, unique node ids, resolvable edge
    /// endpoints, at least one start node, acyclic). Does not check
    /// per-node config semantics — that is [`crate::validator::WorkflowValidator`]'s job.
    pub fn parse(&self, definition: &str) -> Result<Workflow, ParseError> {
        let workflow: Workflow =
            serde_json::from_str(definition).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        self.validate_structure(&workflow)?;
        Ok(workflow)
    }

    fn validate_structure(&self, workflow: &Workflow) -> Result<(), ParseError> {
        if workflow.nodes.is_empty() {
            return Err(ParseError::EmptyWorkflow);
        }

        let mut node_ids = HashSet::new();
        for node in &workflow.nodes {
            if !node_ids.insert(node.id) {
                return Err(ParseError::DuplicateNodeId(node.id));
            }
        }

        for edge in &workflow.edges {
            if !node_ids.contains(&edge.source) {
                return Err(ParseError::InvalidEdgeSource(edge.source));
            }
            if !node_ids.contains(&edge.target) {
                return Err(ParseError::InvalidEdgeTarget(edge.target));
            }
        }

        let has_incoming: HashSet<_> = workflow.edges.iter().map(|e| e.target).collect();
        if node_ids.iter().all(|id| has_incoming.contains(id)) {
            return Err(ParseError::NoStartingNode);
        }

        crate::planner::topological_order(&workflow.nodes, &workflow.edges)
            .map_err(|_| ParseError::NoStartingNode)?;

        Ok(())
    }
}

impl Default for WorkflowParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::types::{Edge, Node, NodeData, NodeType};
    use uuid::Uuid;

    fn node(node_type: NodeType) -> Node {
        Node { id: Uuid::new_v4(), node_type, data: NodeData { name: "n".to_string(), config: serde_json::json!({}), retry: None } }
    }

    fn workflow(nodes: Vec<Node>, edges: Vec<Edge>) -> Workflow {
        Workflow {
            id: Uuid::new_v4(),
            name: "wf".to_string(),
            description: None,
            nodes,
            edges,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn parses_valid_workflow() {
        let a = node(NodeType::Trigger);
        let b = node(NodeType::Transform);
        let edge = Edge { id: Uuid::new_v4(), source: a.id, target: b.id, label: None };
        let wf = workflow(vec![a, b], vec![edge]);
        let json = serde_json::to_string(&wf).unwrap();
        assert!(WorkflowParser::new().parse(&json).is_ok());
    }

    #[test]
    fn rejects_empty_workflow() {
        let wf = workflow(vec![], vec![]);
        let json = serde_json::to_string(&wf).unwrap();
        assert!(matches!(WorkflowParser::new().parse(&json), Err(ParseError::EmptyWorkflow)));
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let mut a = node(NodeType::Trigger);
        let b_id = a.id;
        let mut b = node(NodeType::Transform);
        b.id = b_id;
        a.id = b_id;
        let wf = workflow(vec![a, b], vec![]);
        let json = serde_json::to_string(&wf).unwrap();
        assert!(matches!(WorkflowParser::new().parse(&json), Err(ParseError::DuplicateNodeId(_))));
    }

    #[test]
    fn rejects_dangling_edge_endpoints() {
        let a = node(NodeType::Trigger);
        let edge = Edge { id: Uuid::new_v4(), source: a.id, target: Uuid::new_v4(), label: None };
        let wf = workflow(vec![a], vec![edge]);
        let json = serde_json::to_string(&wf).unwrap();
        assert!(matches!(WorkflowParser::new().parse(&json), Err(ParseError::InvalidEdgeTarget(_))));
    }

    #[test]
    fn rejects_cycles() {
        let a = node(NodeType::Trigger);
        let b = node(NodeType::Transform);
        let e1 = Edge { id: Uuid::new_v4(), source: a.id, target: b.id, label: None };
        let e2 = Edge { id: Uuid::new_v4(), source: b.id, target: a.id, label: None };
        let wf = workflow(vec![a, b], vec![e1, e2]);
        let json = serde_json::to_string(&wf).unwrap();
        assert!(WorkflowParser::new().parse(&json).is_err());
    }

    #[test]
    fn rejects_no_start_nodes() {
        // a -> b -> a is both a cycle and has no zero-indegree node; caught
        // by the has_incoming check before topological_order even runs.
        let a = node(NodeType::Trigger);
        let b = node(NodeType::Transform);
        let e1 = Edge { id: Uuid::new_v4(), source: a.id, target: b.id, label: None };
        let e2 = Edge { id: Uuid::new_v4(), source: b.id, target: a.id, label: None };
        let wf = workflow(vec![a, b], vec![e1, e2]);
        let json = serde_json::to_string(&wf).unwrap();
        assert!(matches!(WorkflowParser::new().parse(&json), Err(ParseError::NoStartingNode)));
    }
}
