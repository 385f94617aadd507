//! Execution context derivation and interpolation-context assembly.

use common::types::{ExecutionContext, JsonValue};
use std::collections::HashMap;

/// `{ trigger, steps, env: { tenant_id, execution_id, workflow_id } }`.
/// Loop/parallel callers layer their own variables on top via
/// [`with_loop_variables`].
pub fn build_interpolation_context(ctx: &ExecutionContext) -> JsonValue {
    serde_json::json!({
        "trigger": ctx.trigger_data,
        "steps": ctx.step_outputs,
        "env": {
            "tenant_id": ctx.tenant_id,
            "execution_id": ctx.execution_id,
            "workflow_id": ctx.workflow_id,
        },
    })
}

/// Layers loop-iteration variables onto an interpolation context: the
/// configured item/index/key variables at the top level, plus a `_loop`
/// section mirrored as `loop`.
#[allow(clippy::too_many_arguments)]
pub fn with_loop_variables(
    base: &JsonValue,
    item_variable: &str,
    index_variable: Option<&str>,
    key_variable: Option<&str>,
    item: &JsonValue,
    index: usize,
    key: Option<&str>,
    total_items: usize,
    is_first: bool,
    is_last: bool,
) -> JsonValue {
    let mut out = base.clone();
    let obj = out.as_object_mut().expect("interpolation context is always an object");
    obj.insert(item_variable.to_string(), item.clone());
    if let Some(index_var) = index_variable {
        obj.insert(index_var.to_string(), serde_json::json!(index));
    }
    if let (Some(key_var), Some(key)) = (key_variable, key) {
        obj.insert(key_var.to_string(), serde_json::json!(key));
    }
    let loop_ctx = serde_json::json!({
        "index": index,
        "item": item,
        "key": key,
        "total_items": total_items,
        "is_first": is_first,
        "is_last": is_last,
    });
    obj.insert("_loop".to_string(), loop_ctx.clone());
    obj.insert("loop".to_string(), loop_ctx);
    out
}

/// Derives a sub-context for a loop iteration or parallel branch: a private
/// `step_outputs` map seeded from the parent's (so body nodes can see
/// outputs produced before the construct started), sharing the ancestor's
/// `trigger_data`/`credential_values` (cloned, since these maps are owned by
/// value rather than behind an `Arc`).
pub fn derive_sub_context(parent: &ExecutionContext) -> ExecutionContext {
    ExecutionContext {
        tenant_id: parent.tenant_id.clone(),
        execution_id: parent.execution_id,
        workflow_id: parent.workflow_id,
        user_id: parent.user_id.clone(),
        trigger_data: parent.trigger_data.clone(),
        step_outputs: parent.step_outputs.clone(),
        credential_values: parent.credential_values.clone(),
        workflow_chain: parent.workflow_chain.clone(),
        depth: parent.depth,
    }
}

/// Derives a child execution context for a sub-workflow invocation: fresh
/// trigger data and step outputs, `depth + 1`, and the invoked workflow id
/// appended to the chain.
pub fn derive_child_context(
    parent: &ExecutionContext,
    child_execution_id: uuid::Uuid,
    child_workflow_id: uuid::Uuid,
    trigger_data: HashMap<String, JsonValue>,
) -> ExecutionContext {
    let mut workflow_chain = parent.workflow_chain.clone();
    workflow_chain.push(child_workflow_id);
    ExecutionContext {
        tenant_id: parent.tenant_id.clone(),
        execution_id: child_execution_id,
        workflow_id: child_workflow_id,
        user_id: parent.user_id.clone(),
        trigger_data,
        step_outputs: HashMap::new(),
        credential_values: parent.credential_values.clone(),
        workflow_chain,
        depth: parent.depth + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        let mut trigger_data = HashMap::new();
        trigger_data.insert("amount".to_string(), serde_json::json!(10));
        ExecutionContext::new("tenant-1", Uuid::new_v4(), Uuid::new_v4(), None, trigger_data)
    }

    #[test]
    fn interpolation_context_has_expected_sections() {
        let ctx = ctx();
        let json = build_interpolation_context(&ctx);
        assert_eq!(json["trigger"]["amount"], serde_json::json!(10));
        assert_eq!(json["env"]["tenant_id"], serde_json::json!("tenant-1"));
    }

    #[test]
    fn loop_variables_inject_item_index_and_loop_section() {
        let ctx = ctx();
        let base = build_interpolation_context(&ctx);
        let item = serde_json::json!({"id": 1});
        let layered = with_loop_variables(&base, "u", Some("i"), None, &item, 0, None, 3, true, false);
        assert_eq!(layered["u"], item);
        assert_eq!(layered["i"], serde_json::json!(0));
        assert_eq!(layered["loop"]["is_first"], serde_json::json!(true));
        assert_eq!(layered["_loop"]["total_items"], serde_json::json!(3));
    }

    #[test]
    fn derive_sub_context_seeds_step_outputs_from_parent() {
        let mut parent = ctx();
        parent.step_outputs.insert("n1".to_string(), serde_json::json!("out"));
        let child = derive_sub_context(&parent);
        assert_eq!(child.step_outputs.get("n1"), Some(&serde_json::json!("out")));
        assert_eq!(child.trigger_data, parent.trigger_data);
    }

    #[test]
    fn derive_child_context_increments_depth_and_chain() {
        let parent = ctx();
        let child_exec = Uuid::new_v4();
        let child_wf = Uuid::new_v4();
        let child = derive_child_context(&parent, child_exec, child_wf, HashMap::new());
        assert_eq!(child.depth, parent.depth + 1);
        assert!(child.workflow_chain.contains(&child_wf));
        assert!(child.step_outputs.is_empty());
    }
}
