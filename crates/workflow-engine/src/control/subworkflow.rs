//! Sub-workflow executor: depth-limited, cycle-free nested workflow
//! invocation through the [`WorkflowInvoker`] seam so this module never
//! depends on `orchestrator` directly.

use super::Result;
use crate::interfaces::WorkflowInvoker;
use common::error::{ControlError, EngineError};
use common::types::{ExecutionContext, JsonValue, Node};
use uuid::Uuid;

/// Checks depth and cycle invariants, then delegates to `invoker` (the
/// orchestrator) to run the child execution.
pub async fn invoke(node: &Node, ctx: &ExecutionContext, invoker: &dyn WorkflowInvoker, max_depth: u32) -> Result<JsonValue> {
    if ctx.depth >= max_depth {
        return Err(EngineError::Control(ControlError::MaxDepthExceeded));
    }

    let workflow_id_str = node
        .data
        .config
        .get("workflow_id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| EngineError::Internal(format!("sub-workflow node {} missing 'workflow_id'", node.id)))?;
    let workflow_id = Uuid::parse_str(workflow_id_str)
        .map_err(|e| EngineError::Internal(format!("sub-workflow node {}: invalid workflow_id: {e}", node.id)))?;

    if ctx.workflow_chain.contains(&workflow_id) {
        return Err(EngineError::Control(ControlError::CircularWorkflowDependency));
    }

    let trigger_data = node.data.config.get("input").cloned().unwrap_or(JsonValue::Null);

    invoker.invoke(&ctx.tenant_id, workflow_id, trigger_data, ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::types::NodeData;
    use common::types::NodeType;
    use std::collections::HashMap;

    struct StubInvoker;

    #[async_trait]
    impl WorkflowInvoker for StubInvoker {
        async fn invoke(&self, _tenant_id: &str, _workflow_id: Uuid, trigger_data: JsonValue, _parent: &ExecutionContext) -> common::Result<JsonValue> {
            Ok(serde_json::json!({"echo": trigger_data}))
        }
    }

    fn node_with(config: JsonValue) -> Node {
        Node { id: Uuid::new_v4(), node_type: NodeType::SubWorkflow, data: NodeData { name: "n".to_string(), config, retry: None } }
    }

    fn ctx(depth: u32, chain: Vec<Uuid>) -> ExecutionContext {
        let mut c = ExecutionContext::new("t1", Uuid::new_v4(), Uuid::new_v4(), None, HashMap::new());
        c.depth = depth;
        c.workflow_chain = chain;
        c
    }

    #[tokio::test]
    async fn invokes_successfully_within_depth_and_cycle_limits() {
        let wf_id = Uuid::new_v4();
        let node = node_with(serde_json::json!({"workflow_id": wf_id.to_string(), "input": {"a": 1}}));
        let c = ctx(2, vec![Uuid::new_v4()]);
        let result = invoke(&node, &c, &StubInvoker, 10).await.unwrap();
        assert_eq!(result["echo"]["a"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn rejects_depth_at_or_beyond_max() {
        let wf_id = Uuid::new_v4();
        let node = node_with(serde_json::json!({"workflow_id": wf_id.to_string()}));
        let c = ctx(10, vec![]);
        let err = invoke(&node, &c, &StubInvoker, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::Control(ControlError::MaxDepthExceeded)));
    }

    #[tokio::test]
    async fn rejects_workflow_already_in_chain() {
        let wf_id = Uuid::new_v4();
        let node = node_with(serde_json::json!({"workflow_id": wf_id.to_string()}));
        let c = ctx(1, vec![wf_id]);
        let err = invoke(&node, &c, &StubInvoker, 10).await.unwrap_err();
        assert!(matches!(err, EngineError::Control(ControlError::CircularWorkflowDependency)));
    }
}
