use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Opaque JSON value used at node config / I/O boundaries.
pub type JsonValue = serde_json::Value;

// ─────────────────────────── Workflow definition ───────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub node_type: NodeType,
    pub data: NodeData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub name: String,
    #[serde(default = "default_config")]
    pub config: JsonValue,
    #[serde(default)]
    pub retry: Option<RetryPolicyConfig>,
}

fn default_config() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Http,
    Transform,
    Script,
    Slack,
    Delay,
    SubWorkflow,
    Conditional,
    Loop,
    Parallel,
    Fork,
    Join,
}

impl NodeType {
    /// Whether this node type is a control-flow construct that may only be
    /// driven by the control-aware execution path, never run as a bare leaf
    /// node by the node runtime's dispatch table.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            NodeType::Conditional | NodeType::Loop | NodeType::Parallel | NodeType::Fork | NodeType::Join
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Schedule,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub source: Uuid,
    pub target: Uuid,
    /// "true" / "false" for conditional branches; the first outgoing edge
    /// from a loop node is the (conventionally unlabeled) body entrance.
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

// ─────────────────────────────── Execution ─────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub tenant_id: String,
    pub workflow_id: Uuid,
    pub trigger_type: TriggerType,
    pub trigger_data: JsonValue,
    pub status: ExecutionStatus,
    pub output_data: Option<JsonValue>,
    pub error_message: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub execution_depth: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub execution_id: Uuid,
    pub node_id: Uuid,
    pub node_type: NodeType,
    pub input_data: JsonValue,
    pub output_data: Option<JsonValue>,
    pub status: StepStatus,
    /// Carries the error's classification and retry count once finalized.
    pub error_message: Option<String>,
    pub retry_count: u32,
}

/// In-memory per-execution record.
///
/// Owned exclusively by the Orchestrator for the lifetime of a single
/// top-level `execute` call. Sub-contexts for loop iterations / parallel
/// branches are derived copies produced by engine-crate helpers, not by
/// this type itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tenant_id: String,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: String,
    pub trigger_data: HashMap<String, JsonValue>,
    pub step_outputs: HashMap<String, JsonValue>,
    pub credential_values: HashSet<String>,
    pub workflow_chain: Vec<Uuid>,
    pub depth: u32,
}

impl ExecutionContext {
    pub fn new(
        tenant_id: impl Into<String>,
        execution_id: Uuid,
        workflow_id: Uuid,
        explicit_user_id: Option<String>,
        trigger_data: HashMap<String, JsonValue>,
    ) -> Self {
        let user_id = derive_user_id(explicit_user_id.as_deref(), &trigger_data);
        Self {
            tenant_id: tenant_id.into(),
            execution_id,
            workflow_id,
            user_id,
            trigger_data,
            step_outputs: HashMap::new(),
            credential_values: HashSet::new(),
            workflow_chain: vec![workflow_id],
            depth: 0,
        }
    }
}

/// Picks the acting user for an execution: an explicitly supplied caller
/// identity wins, then `trigger.user_id`, then `trigger._auth.user_id`,
/// falling back to `"system"` when none are present.
fn derive_user_id(explicit: Option<&str>, trigger_data: &HashMap<String, JsonValue>) -> String {
    if let Some(s) = explicit {
        return s.to_string();
    }
    if let Some(JsonValue::String(s)) = trigger_data.get("user_id") {
        return s.clone();
    }
    if let Some(JsonValue::Object(auth)) = trigger_data.get("_auth") {
        if let Some(JsonValue::String(s)) = auth.get("user_id") {
            return s.clone();
        }
    }
    "system".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_prefers_explicit_over_trigger_and_auth() {
        let mut trigger_data = HashMap::new();
        trigger_data.insert("user_id".to_string(), JsonValue::String("u1".to_string()));
        trigger_data.insert("_auth".to_string(), serde_json::json!({"user_id": "u2"}));
        assert_eq!(derive_user_id(Some("caller"), &trigger_data), "caller");
        assert_eq!(derive_user_id(None, &trigger_data), "u1");
    }

    #[test]
    fn user_id_falls_back_to_auth_then_system() {
        let mut trigger_data = HashMap::new();
        trigger_data.insert("_auth".to_string(), serde_json::json!({"user_id": "u2"}));
        assert_eq!(derive_user_id(None, &trigger_data), "u2");

        assert_eq!(derive_user_id(None, &HashMap::new()), "system");
    }
}
