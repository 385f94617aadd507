//! Orchestrator: resolves a workflow, walks it in topological order, and
//! drives each node through the Node Runtime or the matching `control::*`
//! module, carrying conditional skip-set bookkeeping and Fork/Join branch
//! scheduling across the walk.

use crate::context::{build_interpolation_context, derive_child_context, derive_sub_context};
use crate::control::{self, NodeExecutor};
use crate::interfaces::{Broadcaster, CredentialInjector, HttpClient, Repository, SlackClient, WorkflowInvoker};
use crate::node_runtime::NodeRuntime;
use crate::planner;
use async_trait::async_trait;
use common::config::EngineConfig;
use common::error::{ControlError, EngineError, PlannerError};
use common::types::{
    Edge, Execution, ExecutionContext, ExecutionStatus, JsonValue, Node, NodeType, StepStatus, TriggerType, Workflow,
};
use common::{Classification, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Coarse recovery guidance surfaced alongside a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    RetryFromFailed,
    FixConfiguration,
    Manual,
}

/// Maps an error's [`Classification`] to a coarse recovery suggestion.
pub fn suggest_recovery(classification: Classification) -> RecoveryAction {
    match classification {
        Classification::Transient => RecoveryAction::Retry,
        Classification::Permanent => RecoveryAction::FixConfiguration,
        Classification::Unknown => RecoveryAction::Manual,
    }
}

/// In-memory control surface for a still-running execution. Durable
/// resumption after a crash is out of scope; this only governs a live
/// process.
struct ExecutionHandle {
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
}

impl ExecutionHandle {
    fn new() -> Self {
        Self { cancel: CancellationToken::new(), paused: Arc::new(AtomicBool::new(false)), resume_notify: Arc::new(Notify::new()) }
    }

    async fn wait_while_paused(&self) {
        while self.paused.load(Ordering::SeqCst) {
            self.resume_notify.notified().await;
        }
    }
}

pub struct Orchestrator {
    config: EngineConfig,
    repository: Arc<dyn Repository>,
    node_runtime: Arc<NodeRuntime>,
    broadcaster: Arc<dyn Broadcaster>,
    handles: RwLock<HashMap<Uuid, Arc<ExecutionHandle>>>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, repository: Arc<dyn Repository>, broadcaster: Arc<dyn Broadcaster>, node_runtime: Arc<NodeRuntime>) -> Self {
        Self { config, repository, node_runtime, broadcaster, handles: RwLock::new(HashMap::new()) }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_clients(
        config: EngineConfig,
        repository: Arc<dyn Repository>,
        broadcaster: Arc<dyn Broadcaster>,
        credential_injector: Option<Arc<dyn CredentialInjector>>,
        http_client: Option<Arc<dyn HttpClient>>,
        slack_client: Option<Arc<dyn SlackClient>>,
        workflow_invoker: Option<Arc<dyn WorkflowInvoker>>,
    ) -> Self {
        let node_runtime = Arc::new(NodeRuntime::new(config.clone(), credential_injector, http_client, slack_client, workflow_invoker));
        Self::new(config, repository, broadcaster, node_runtime)
    }

    /// Runs `workflow` from a fresh top-level trigger. `explicit_user_id`,
    /// when set, is the caller-supplied acting user and takes precedence
    /// over any `user_id` carried in `trigger_data`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        tenant_id: &str,
        trigger_type: TriggerType,
        trigger_data: HashMap<String, JsonValue>,
        explicit_user_id: Option<String>,
    ) -> Result<JsonValue> {
        let execution_id = Uuid::new_v4();
        let mut ctx = ExecutionContext::new(tenant_id, execution_id, workflow.id, explicit_user_id, trigger_data.clone());
        self.run_registered(workflow, &mut ctx, trigger_type, None).await
    }

    async fn run_registered(
        &self,
        workflow: &Workflow,
        ctx: &mut ExecutionContext,
        trigger_type: TriggerType,
        parent_execution_id: Option<Uuid>,
    ) -> Result<JsonValue> {
        let now = chrono::Utc::now();
        let execution = Execution {
            id: ctx.execution_id,
            tenant_id: ctx.tenant_id.clone(),
            workflow_id: workflow.id,
            trigger_type,
            trigger_data: JsonValue::Object(ctx.trigger_data.clone().into_iter().collect()),
            status: ExecutionStatus::Running,
            output_data: None,
            error_message: None,
            parent_execution_id,
            execution_depth: ctx.depth,
            created_at: now,
            updated_at: now,
        };
        self.repository.create_execution(&execution).await?;

        let handle = Arc::new(ExecutionHandle::new());
        self.handles.write().await.insert(ctx.execution_id, handle.clone());

        self.broadcaster.execution_started(&ctx.tenant_id, workflow.id, ctx.execution_id, workflow.nodes.len()).await;

        let result = self.run(workflow, ctx, &handle).await;

        self.handles.write().await.remove(&ctx.execution_id);

        match &result {
            Ok(output) => {
                self.repository
                    .update_execution_status(ctx.execution_id, ExecutionStatus::Completed, Some(output.clone()), None)
                    .await?;
                self.broadcaster.execution_completed(&ctx.tenant_id, workflow.id, ctx.execution_id, output.clone()).await;
            }
            Err(e) => {
                self.repository.update_execution_status(ctx.execution_id, ExecutionStatus::Failed, None, Some(e.to_string())).await?;
                self.broadcaster.execution_failed(&ctx.tenant_id, workflow.id, ctx.execution_id, &e.to_string()).await;
            }
        }

        result
    }

    /// Core topological walk: dispatches every non-skipped node to the Node
    /// Runtime or a `control::*` module, tracking conditional skip-sets and
    /// any Fork branches still racing toward a downstream Join.
    async fn run(&self, workflow: &Workflow, ctx: &mut ExecutionContext, handle: &Arc<ExecutionHandle>) -> Result<JsonValue> {
        let order = planner::topological_order(&workflow.nodes, &workflow.edges)?;
        let node_map: HashMap<Uuid, &Node> = workflow.nodes.iter().map(|n| (n.id, n)).collect();
        let join_ids: HashSet<Uuid> = workflow.nodes.iter().filter(|n| matches!(n.node_type, NodeType::Join)).map(|n| n.id).collect();

        let run_ctx: Arc<RunningExecution> = Arc::new(RunningExecution { workflow: workflow.clone(), node_runtime: self.node_runtime.clone() });

        let mut skip: HashSet<Uuid> = HashSet::new();
        let mut pending_joins: HashMap<Uuid, Vec<control::fork_join::PendingBranch>> = HashMap::new();
        let total = order.len();

        for (i, node_id) in order.iter().enumerate() {
            handle.wait_while_paused().await;
            if handle.cancel.is_cancelled() {
                return Err(EngineError::Control(ControlError::Cancelled));
            }
            if skip.contains(node_id) {
                continue;
            }
            let node = *node_map.get(node_id).ok_or(EngineError::Planner(PlannerError::NodeNotFound(*node_id)))?;

            self.broadcaster.step_started(&ctx.tenant_id, workflow.id, ctx.execution_id, node.id, node.node_type).await;
            let step_input = build_interpolation_context(ctx);
            let started = self.repository.create_step_execution(ctx.execution_id, node.id, node.node_type, step_input).await?;
            let start = Instant::now();

            let outcome = self.dispatch_top_level(node, workflow, &node_map, &join_ids, &run_ctx, ctx, &handle.cancel, &mut skip, &mut pending_joins, &order[i + 1..]).await;

            let duration_ms = start.elapsed().as_millis() as u64;
            match &outcome {
                Ok(output) => {
                    self.repository.update_step_execution(started.execution_id, node.id, StepStatus::Completed, Some(output.clone()), None).await?;
                    self.broadcaster.step_completed(&ctx.tenant_id, workflow.id, ctx.execution_id, node.id, output, duration_ms).await;
                }
                Err(e) => {
                    self.repository.update_step_execution(started.execution_id, node.id, StepStatus::Failed, None, Some(e.to_string())).await?;
                    self.broadcaster.step_failed(&ctx.tenant_id, workflow.id, ctx.execution_id, node.id, &e.to_string()).await;
                }
            }
            outcome?;
            self.broadcaster.progress(&ctx.tenant_id, workflow.id, ctx.execution_id, i + 1, total).await;
        }

        Ok(JsonValue::Object(ctx.step_outputs.clone().into_iter().collect()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_top_level(
        &self,
        node: &Node,
        workflow: &Workflow,
        node_map: &HashMap<Uuid, &Node>,
        join_ids: &HashSet<Uuid>,
        run_ctx: &Arc<RunningExecution>,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        skip: &mut HashSet<Uuid>,
        pending_joins: &mut HashMap<Uuid, Vec<control::fork_join::PendingBranch>>,
        remaining: &[Uuid],
    ) -> Result<JsonValue> {
        match node.node_type {
            NodeType::Conditional => {
                let cond = control::conditional::evaluate(node, &workflow.nodes, &workflow.edges, ctx, None)?;
                skip.extend(cond.skip_set.iter().copied());
                if cond.stop_execution {
                    skip.extend(remaining.iter().copied());
                }
                let value = serde_json::json!({"condition": cond.condition, "result": cond.result, "branch": cond.taken_branch});
                ctx.step_outputs.insert(node.id.to_string(), value.clone());
                Ok(value)
            }
            NodeType::Loop => {
                let result = control::loop_exec::run(node, &workflow.nodes, &workflow.edges, run_ctx.as_ref(), ctx, cancel).await?;
                let body = planner::find_loop_body(node.id, &workflow.edges);
                skip.extend(body.nodes.iter().copied());
                let value = serde_json::json!({
                    "iteration_count": result.iteration_count,
                    "metadata": result.metadata,
                });
                ctx.step_outputs.insert(node.id.to_string(), value.clone());
                Ok(value)
            }
            NodeType::Parallel => {
                let children: Vec<Uuid> = workflow.edges.iter().filter(|e| e.source == node.id).map(|e| e.target).collect();
                let branch_bodies = planner::branch_bodies_from_children(&children, &workflow.edges, join_ids);
                let result = control::parallel::run(node, &workflow.nodes, &workflow.edges, run_ctx.clone(), ctx, cancel).await?;
                for body in &branch_bodies {
                    skip.extend(body.iter().copied().filter(|id| !join_ids.contains(id)));
                }
                let value = serde_json::json!({
                    "branch_count": result.branch_count,
                    "metadata": result.metadata,
                });
                ctx.step_outputs.insert(node.id.to_string(), value.clone());
                Ok(value)
            }
            NodeType::Fork => {
                let fork_result = control::fork_join::fork(node, &workflow.edges);
                let children: Vec<Uuid> = workflow.edges.iter().filter(|e| e.source == node.id).map(|e| e.target).collect();
                let branch_bodies = planner::branch_bodies_from_children(&children, &workflow.edges, join_ids);

                let mut target_join: Option<Uuid> = None;
                for body in &branch_bodies {
                    let exec_nodes: Vec<Uuid> = body.iter().copied().filter(|id| !join_ids.contains(id)).collect();
                    if let Some(&joined) = body.last().filter(|id| join_ids.contains(*id)) {
                        target_join = Some(joined);
                    }
                    if exec_nodes.is_empty() {
                        continue;
                    }
                    let Some(&source) = exec_nodes.last() else { continue };
                    let sub_ctx = derive_sub_context(ctx);
                    let branch_executor = run_ctx.clone();
                    let branch_cancel = cancel.child_token();
                    let handle = tokio::spawn(async move {
                        let mut sub_ctx = sub_ctx;
                        let mut last_output = JsonValue::Null;
                        let mut branch_skip: HashSet<Uuid> = HashSet::new();
                        for node_id in &exec_nodes {
                            if branch_skip.contains(node_id) {
                                continue;
                            }
                            last_output = branch_executor.execute_node(*node_id, &mut sub_ctx, &branch_cancel, None, &mut branch_skip).await?;
                        }
                        Ok(last_output)
                    });
                    pending_joins.entry(target_join.unwrap_or(node.id)).or_default().push((source, handle));
                    skip.extend(body.iter().copied().filter(|id| !join_ids.contains(id)));
                }

                let value = serde_json::json!({"branch_count": fork_result.branch_count, "branch_ids": fork_result.branch_ids});
                ctx.step_outputs.insert(node.id.to_string(), value.clone());
                Ok(value)
            }
            NodeType::Join => {
                let pending = pending_joins.remove(&node.id).unwrap_or_default();
                let result = control::fork_join::join(node, &workflow.edges, ctx, pending).await?;
                for (source, output) in &result.branch_outputs {
                    ctx.step_outputs.insert(source.to_string(), output.clone());
                }
                let value = serde_json::json!({
                    "completed_branches": result.completed_branches.iter().map(Uuid::to_string).collect::<Vec<_>>(),
                    "timed_out": result.timed_out,
                    "metadata": result.metadata,
                });
                ctx.step_outputs.insert(node.id.to_string(), value.clone());
                Ok(value)
            }
            _ => self.node_runtime.execute_node(node, ctx, cancel, None).await.map_err(EngineError::from),
        }
    }

    pub async fn pause(&self, execution_id: Uuid) -> Result<()> {
        if let Some(handle) = self.handles.read().await.get(&execution_id) {
            handle.paused.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn resume(&self, execution_id: Uuid) -> Result<()> {
        if let Some(handle) = self.handles.read().await.get(&execution_id) {
            handle.paused.store(false, Ordering::SeqCst);
            handle.resume_notify.notify_waiters();
        }
        Ok(())
    }

    pub async fn cancel(&self, execution_id: Uuid) -> Result<()> {
        if let Some(handle) = self.handles.read().await.get(&execution_id) {
            handle.cancel.cancel();
            handle.resume_notify.notify_waiters();
        }
        Ok(())
    }

    pub async fn is_running(&self, execution_id: Uuid) -> bool {
        self.handles.read().await.contains_key(&execution_id)
    }
}

#[async_trait]
impl WorkflowInvoker for Orchestrator {
    async fn invoke(&self, tenant_id: &str, workflow_id: Uuid, trigger_data: JsonValue, parent: &ExecutionContext) -> Result<JsonValue> {
        let workflow = self.repository.get_workflow_by_id(tenant_id, workflow_id).await?;
        let child_execution_id = Uuid::new_v4();
        let trigger_map: HashMap<String, JsonValue> = match trigger_data {
            JsonValue::Object(map) => map.into_iter().collect(),
            other => HashMap::from([("value".to_string(), other)]),
        };
        let mut child_ctx = derive_child_context(parent, child_execution_id, workflow_id, trigger_map);
        self.run_registered(&workflow, &mut child_ctx, TriggerType::Manual, Some(parent.execution_id)).await
    }
}

/// Per-execution `NodeExecutor` carrying the workflow a single top-level
/// (or recursive sub-workflow) run resolves nodes against — a fresh
/// instance per [`Orchestrator::run`] call, so control submodules can call
/// back into arbitrary node execution (including nested control nodes)
/// without the trait needing to thread `Workflow` through every call.
struct RunningExecution {
    workflow: Workflow,
    node_runtime: Arc<NodeRuntime>,
}

#[async_trait]
impl NodeExecutor for RunningExecution {
    async fn execute_node(
        &self,
        node_id: Uuid,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        interp_override: Option<JsonValue>,
        skip: &mut HashSet<Uuid>,
    ) -> Result<JsonValue> {
        let node = self.workflow.nodes.iter().find(|n| n.id == node_id).ok_or(EngineError::Planner(PlannerError::NodeNotFound(node_id)))?.clone();

        if node.node_type.is_control() {
            return self.dispatch_nested(&node, ctx, cancel, interp_override, skip).await;
        }
        self.node_runtime.execute_node(&node, ctx, cancel, interp_override).await.map_err(EngineError::from)
    }
}

impl RunningExecution {
    /// Nested control nodes (e.g. a Conditional inside a Loop body) run
    /// here. `interp_override` carries the caller body's layered variables
    /// (a Loop's per-iteration item/index, say) through to a nested
    /// Conditional's own condition evaluation. A nested Conditional extends
    /// `skip`, the caller's body-local skip set, exactly as the top-level
    /// walk's Conditional arm does, so the enclosing Loop/Parallel body's
    /// own topological order honors the same non-taken-branch skip. A
    /// nested Loop/Parallel manages its own fresh skip set for its own body
    /// and doesn't touch the caller's.
    async fn dispatch_nested(
        &self,
        node: &Node,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        interp_override: Option<JsonValue>,
        skip: &mut HashSet<Uuid>,
    ) -> Result<JsonValue> {
        match node.node_type {
            NodeType::Conditional => {
                let cond = control::conditional::evaluate(node, &self.workflow.nodes, &self.workflow.edges, ctx, interp_override)?;
                skip.extend(cond.skip_set.iter().copied());
                let value = serde_json::json!({"condition": cond.condition, "result": cond.result, "branch": cond.taken_branch});
                ctx.step_outputs.insert(node.id.to_string(), value.clone());
                Ok(value)
            }
            NodeType::Loop => {
                let result = control::loop_exec::run(node, &self.workflow.nodes, &self.workflow.edges, self, ctx, cancel).await?;
                let value = serde_json::json!({"iteration_count": result.iteration_count, "metadata": result.metadata});
                ctx.step_outputs.insert(node.id.to_string(), value.clone());
                Ok(value)
            }
            NodeType::Parallel => {
                let result = control::parallel::run(node, &self.workflow.nodes, &self.workflow.edges, Arc::new(Self { workflow: self.workflow.clone(), node_runtime: self.node_runtime.clone() }), ctx, cancel).await?;
                let value = serde_json::json!({"branch_count": result.branch_count, "metadata": result.metadata});
                ctx.step_outputs.insert(node.id.to_string(), value.clone());
                Ok(value)
            }
            NodeType::Fork | NodeType::Join => Err(EngineError::Internal(format!(
                "node {}: nested Fork/Join inside a loop or parallel body is unsupported",
                node.id
            ))),
            _ => unreachable!("non-control node types are handled before dispatch_nested"),
        }
    }
}

fn _assert_send_sync() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<Orchestrator>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::types::{NodeData, StepExecution};
    use std::sync::Mutex;

    struct InMemoryRepository {
        executions: Mutex<HashMap<Uuid, Execution>>,
        workflows: HashMap<Uuid, Workflow>,
    }

    impl InMemoryRepository {
        fn new(workflows: Vec<Workflow>) -> Self {
            Self { executions: Mutex::new(HashMap::new()), workflows: workflows.into_iter().map(|w| (w.id, w)).collect() }
        }
    }

    #[async_trait]
    impl Repository for InMemoryRepository {
        async fn get_workflow_by_id(&self, _tenant_id: &str, workflow_id: Uuid) -> Result<Workflow> {
            self.workflows.get(&workflow_id).cloned().ok_or_else(|| EngineError::Internal("workflow not found".to_string()))
        }

        async fn create_execution(&self, execution: &Execution) -> Result<()> {
            self.executions.lock().unwrap().insert(execution.id, execution.clone());
            Ok(())
        }

        async fn get_execution_by_id(&self, execution_id: Uuid) -> Result<Execution> {
            self.executions.lock().unwrap().get(&execution_id).cloned().ok_or_else(|| EngineError::Internal("not found".to_string()))
        }

        async fn update_execution_status(&self, execution_id: Uuid, status: ExecutionStatus, output: Option<JsonValue>, error: Option<String>) -> Result<()> {
            let mut executions = self.executions.lock().unwrap();
            if let Some(e) = executions.get_mut(&execution_id) {
                e.status = status;
                e.output_data = output;
                e.error_message = error;
            }
            Ok(())
        }

        async fn create_step_execution(&self, execution_id: Uuid, node_id: Uuid, node_type: NodeType, input: JsonValue) -> Result<StepExecution> {
            Ok(StepExecution { execution_id, node_id, node_type, input_data: input, output_data: None, status: StepStatus::Running, error_message: None, retry_count: 0 })
        }

        async fn update_step_execution(&self, _execution_id: Uuid, _node_id: Uuid, _status: StepStatus, _output: Option<JsonValue>, _error: Option<String>) -> Result<()> {
            Ok(())
        }
    }

    fn node(node_type: NodeType, config: JsonValue) -> Node {
        Node { id: Uuid::new_v4(), node_type, data: NodeData { name: "n".to_string(), config, retry: None } }
    }

    fn edge(source: Uuid, target: Uuid, label: Option<&str>) -> Edge {
        Edge { id: Uuid::new_v4(), source, target, label: label.map(String::from) }
    }

    fn workflow(nodes: Vec<Node>, edges: Vec<Edge>) -> Workflow {
        Workflow { id: Uuid::new_v4(), name: "wf".to_string(), description: None, nodes, edges, created_at: chrono::Utc::now(), updated_at: chrono::Utc::now() }
    }

    fn orchestrator(workflows: Vec<Workflow>) -> Orchestrator {
        let repo = Arc::new(InMemoryRepository::new(workflows));
        let broadcaster = Arc::new(crate::interfaces::NullBroadcaster);
        Orchestrator::with_clients(EngineConfig::default(), repo, broadcaster, None, None, None, None)
    }

    #[tokio::test]
    async fn executes_a_linear_trigger_to_script_workflow() {
        let trigger = node(NodeType::Trigger, serde_json::json!({}));
        let script = node(NodeType::Script, serde_json::json!({"script": "1 + 1"}));
        let edges = vec![edge(trigger.id, script.id, None)];
        let wf = workflow(vec![trigger.clone(), script.clone()], edges);
        let orch = orchestrator(vec![wf.clone()]);

        let output = orch.execute(&wf, "tenant-1", TriggerType::Manual, HashMap::new(), None).await.unwrap();
        assert_eq!(output[script.id.to_string()], serde_json::json!(2));
    }

    #[tokio::test]
    async fn conditional_skip_set_prevents_the_untaken_branch_from_running() {
        let trigger = node(NodeType::Trigger, serde_json::json!({}));
        let cond = node(NodeType::Conditional, serde_json::json!({"condition": "trigger.amount > 100"}));
        let true_branch = node(NodeType::Script, serde_json::json!({"script": "\"taken\""}));
        let false_branch = node(NodeType::Script, serde_json::json!({"script": "\"not taken\""}));
        let edges = vec![
            edge(trigger.id, cond.id, None),
            edge(cond.id, true_branch.id, Some("true")),
            edge(cond.id, false_branch.id, Some("false")),
        ];
        let wf = workflow(vec![trigger.clone(), cond.clone(), true_branch.clone(), false_branch.clone()], edges);
        let orch = orchestrator(vec![wf.clone()]);

        let mut trigger_data = HashMap::new();
        trigger_data.insert("amount".to_string(), serde_json::json!(150));
        let output = orch.execute(&wf, "tenant-1", TriggerType::Manual, trigger_data, None).await.unwrap();
        assert!(output.get(true_branch.id.to_string()).is_some());
        assert!(output.get(false_branch.id.to_string()).is_none());
    }

    #[tokio::test]
    async fn pause_blocks_progress_until_resumed() {
        let trigger = node(NodeType::Trigger, serde_json::json!({}));
        let script = node(NodeType::Script, serde_json::json!({"script": "1"}));
        let wf = workflow(vec![trigger.clone(), script.clone()], vec![edge(trigger.id, script.id, None)]);
        let orch = Arc::new(orchestrator(vec![wf.clone()]));

        let orch2 = orch.clone();
        let wf2 = wf.clone();
        let run = tokio::spawn(async move { orch2.execute(&wf2, "t1", TriggerType::Manual, HashMap::new(), None).await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let result = run.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancel_aborts_a_running_execution() {
        let trigger = node(NodeType::Trigger, serde_json::json!({}));
        let delay = node(NodeType::Delay, serde_json::json!({"duration": "5s"}));
        let wf = workflow(vec![trigger.clone(), delay.clone()], vec![edge(trigger.id, delay.id, None)]);
        let orch = Arc::new(orchestrator(vec![wf.clone()]));

        let orch2 = orch.clone();
        let wf2 = wf.clone();
        let run = tokio::spawn(async move { orch2.execute(&wf2, "t1", TriggerType::Manual, HashMap::new(), None).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let execution_ids: Vec<Uuid> = orch.handles.read().await.keys().copied().collect();
        for id in execution_ids {
            orch.cancel(id).await.unwrap();
        }
        let result = run.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn nested_conditional_inside_a_loop_body_skips_the_untaken_branch() {
        let trigger = node(NodeType::Trigger, serde_json::json!({}));
        let loop_node = node(NodeType::Loop, serde_json::json!({"source": "trigger.items", "item_variable": "x"}));
        let cond = node(NodeType::Conditional, serde_json::json!({"condition": "x > 1"}));
        let true_branch = node(NodeType::Script, serde_json::json!({"script": "\"taken\""}));
        let false_branch = node(NodeType::Script, serde_json::json!({"script": "\"not taken\""}));
        let edges = vec![
            edge(trigger.id, loop_node.id, None),
            edge(loop_node.id, cond.id, None),
            edge(cond.id, true_branch.id, Some("true")),
            edge(cond.id, false_branch.id, Some("false")),
        ];
        let wf = workflow(vec![trigger.clone(), loop_node.clone(), cond.clone(), true_branch.clone(), false_branch.clone()], edges);
        let orch = orchestrator(vec![wf.clone()]);

        let mut trigger_data = HashMap::new();
        trigger_data.insert("items".to_string(), serde_json::json!([5]));
        let output = orch.execute(&wf, "tenant-1", TriggerType::Manual, trigger_data, None).await.unwrap();
        assert!(output.get(true_branch.id.to_string()).is_some());
        assert!(
            output.get(false_branch.id.to_string()).is_none(),
            "a nested conditional's non-taken branch must not run just because it shares a loop body with the taken one"
        );
    }

    #[test]
    fn recovery_actions_follow_classification() {
        assert_eq!(suggest_recovery(Classification::Transient), RecoveryAction::Retry);
        assert_eq!(suggest_recovery(Classification::Permanent), RecoveryAction::FixConfiguration);
        assert_eq!(suggest_recovery(Classification::Unknown), RecoveryAction::Manual);
    }
}
