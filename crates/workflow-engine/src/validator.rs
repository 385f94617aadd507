//! Per-node config validation and reachability: required config fields per
//! `NodeType` over the opaque JSON config, plus a reachability sweep from
//! the workflow's starting nodes.

use common::types::{JsonValue, Node, NodeType, Workflow};
use common::ValidationError;
use std::collections::HashSet;
use uuid::Uuid;

pub struct WorkflowValidator;

impl WorkflowValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, workflow: &Workflow) -> Result<(), ValidationError> {
        for node in &workflow.nodes {
            self.validate_node(node)?;
        }
        self.validate_reachability(workflow)
    }

    pub fn validate_node(&self, node: &Node) -> Result<(), ValidationError> {
        match node.node_type {
            NodeType::Trigger => Ok(()),
            NodeType::Http => {
                require_str(node, "url")?;
                require_str(node, "method")?;
                Ok(())
            }
            NodeType::Transform | NodeType::Script => require_nonempty_script(node),
            NodeType::Slack => require_str(node, "channel"),
            NodeType::Delay => require_str(node, "duration"),
            NodeType::SubWorkflow => require_uuid(node, "workflow_id"),
            NodeType::Conditional => require_str(node, "condition"),
            NodeType::Loop => {
                require_str(node, "source")?;
                require_str(node, "item_variable")
            }
            NodeType::Parallel => require_enum(node, "error_strategy", &["fail_fast", "wait_all"]),
            NodeType::Fork => Ok(()),
            NodeType::Join => {
                require_enum(node, "join_strategy", &["wait_all", "wait_n"])?;
                if field(node, "join_strategy").and_then(JsonValue::as_str) == Some("wait_n") {
                    match field(node, "required_count").and_then(JsonValue::as_u64) {
                        Some(n) if n > 0 => Ok(()),
                        _ => Err(ValidationError::MissingRequiredField(node.id, "required_count".to_string())),
                    }
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn validate_reachability(&self, workflow: &Workflow) -> Result<(), ValidationError> {
        let start_nodes = crate::planner::find_start_nodes(&workflow.nodes, &workflow.edges);
        let mut adjacency: std::collections::HashMap<Uuid, Vec<Uuid>> = std::collections::HashMap::new();
        for edge in &workflow.edges {
            adjacency.entry(edge.source).or_default().push(edge.target);
        }

        let mut reachable: HashSet<Uuid> = start_nodes.iter().copied().collect();
        let mut queue: std::collections::VecDeque<Uuid> = start_nodes.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if let Some(neighbors) = adjacency.get(&id) {
                for &next in neighbors {
                    if reachable.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }

        for node in &workflow.nodes {
            if !reachable.contains(&node.id) {
                return Err(ValidationError::MalformedConfig(node.id, "node is unreachable from any start node".to_string()));
            }
        }
        Ok(())
    }
}

impl Default for WorkflowValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn field<'a>(node: &'a Node, key: &str) -> Option<&'a JsonValue> {
    node.data.config.as_object().and_then(|o| o.get(key))
}

fn require_str(node: &Node, key: &str) -> Result<(), ValidationError> {
    match field(node, key).and_then(JsonValue::as_str) {
        Some(s) if !s.is_empty() => Ok(()),
        _ => Err(ValidationError::MissingRequiredField(node.id, key.to_string())),
    }
}

fn require_uuid(node: &Node, key: &str) -> Result<(), ValidationError> {
    let s = field(node, key).and_then(JsonValue::as_str).ok_or_else(|| {
        ValidationError::MissingRequiredField(node.id, key.to_string())
    })?;
    Uuid::parse_str(s)
        .map(|_| ())
        .map_err(|_| ValidationError::InvalidEnumValue(node.id, key.to_string(), s.to_string()))
}

fn require_enum(node: &Node, key: &str, allowed: &[&str]) -> Result<(), ValidationError> {
    let value = field(node, key).and_then(JsonValue::as_str).ok_or_else(|| {
        ValidationError::MissingRequiredField(node.id, key.to_string())
    })?;
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidEnumValue(node.id, key.to_string(), value.to_string()))
    }
}

fn require_nonempty_script(node: &Node) -> Result<(), ValidationError> {
    match field(node, "script").and_then(JsonValue::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(ValidationError::EmptyScript(node.id)),
    }
}
