//! Node runtime: per-node execution — interpolation, credential injection,
//! retry, circuit breaking, classification, output masking — driven through
//! a closed dispatch table keyed by node type rather than an open-ended
//! match spread across the caller.

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier;
use crate::context::build_interpolation_context;
use crate::interfaces::{mask_output, CredentialInjector, HttpClient, HttpRequestSpec, SlackClient, SlackMessage, WorkflowInvoker};
use crate::retry::{self, RetryOutcome};
use crate::sandbox::{self, ScriptContext};
use common::config::EngineConfig;
use common::error::NodeRuntimeError;
use common::types::{ExecutionContext, JsonValue, Node, NodeType, RetryPolicyConfig};
use common::Classification;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Uniform error type the dispatch table's handlers return; carries an
/// optional HTTP status so the Http handler can classify by status code
/// instead of falling back to message substring matching.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
struct HandlerError {
    message: String,
    status: Option<u16>,
}

impl HandlerError {
    fn message(message: impl Into<String>) -> Self {
        Self { message: message.into(), status: None }
    }

    fn classification(&self) -> Classification {
        match self.status {
            Some(status) => classifier::classify_http_status(status),
            None => classifier::classify(self),
        }
    }
}

pub struct NodeRuntime {
    config: EngineConfig,
    credential_injector: Option<Arc<dyn CredentialInjector>>,
    http_client: Option<Arc<dyn HttpClient>>,
    slack_client: Option<Arc<dyn SlackClient>>,
    workflow_invoker: Option<Arc<dyn WorkflowInvoker>>,
    circuit_breakers: CircuitBreakerRegistry,
}

impl NodeRuntime {
    pub fn new(
        config: EngineConfig,
        credential_injector: Option<Arc<dyn CredentialInjector>>,
        http_client: Option<Arc<dyn HttpClient>>,
        slack_client: Option<Arc<dyn SlackClient>>,
        workflow_invoker: Option<Arc<dyn WorkflowInvoker>>,
    ) -> Self {
        let circuit_breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
        Self { config, credential_injector, http_client, slack_client, workflow_invoker, circuit_breakers }
    }

    /// Executes a single non-control leaf node. Panics if handed a
    /// control-flow node type — those only run under the control-aware
    /// paths in [`crate::control`].
    ///
    /// `interp_override`, when set, replaces the context's own
    /// trigger/steps/env assembly wholesale — the Loop Executor uses this to
    /// hand body nodes an interpolation context already layered with the
    /// iteration's item/index/key/`_loop` variables.
    pub async fn execute_node(
        &self,
        node: &Node,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        interp_override: Option<JsonValue>,
    ) -> Result<JsonValue, NodeRuntimeError> {
        assert!(!node.node_type.is_control(), "control nodes must run through the control-aware path");

        if matches!(node.node_type, NodeType::Trigger) {
            let output = JsonValue::Object(ctx.trigger_data.clone().into_iter().collect());
            ctx.step_outputs.insert(node.id.to_string(), output.clone());
            return Ok(output);
        }

        let interp_ctx = interp_override.unwrap_or_else(|| build_interpolation_context(ctx));
        let mut config = node.data.config.clone();

        if let Some(injector) = &self.credential_injector {
            if config.as_object().is_some_and(|o| !o.is_empty()) {
                let (rewritten, secrets) = injector
                    .inject_credentials(config, &ctx.tenant_id, ctx.workflow_id, ctx.execution_id, &ctx.user_id)
                    .await
                    .map_err(|e| self.wrap_error(node, e.to_string(), Classification::Unknown, 0))?;
                config = rewritten;
                ctx.credential_values.extend(secrets);
            }
        }

        let policy = node.data.retry.clone().unwrap_or_else(|| self.config.default_retry_policy.clone());
        let ctx_snapshot = ctx.clone();

        let mut attempts_used = 0u32;
        let result = self.dispatch_with_retry(node, &config, &interp_ctx, &ctx_snapshot, &policy, cancel, &mut attempts_used).await;

        let output = match result {
            Ok(value) => value,
            Err(handler_err) => {
                let classification = handler_err.classification();
                return Err(self.wrap_error(node, handler_err.message, classification, attempts_used));
            }
        };

        let masked = mask_output(output, &ctx.credential_values);
        ctx.step_outputs.insert(node.id.to_string(), masked.clone());
        Ok(masked)
    }

    fn wrap_error(&self, node: &Node, message: String, classification: Classification, retry_count: u32) -> NodeRuntimeError {
        NodeRuntimeError {
            node_id: node.id,
            node_type: format!("{:?}", node.node_type),
            message,
            classification,
            retry_count,
        }
    }

    async fn dispatch_with_retry(
        &self,
        node: &Node,
        config: &JsonValue,
        interp_ctx: &JsonValue,
        ctx: &ExecutionContext,
        policy: &RetryPolicyConfig,
        cancel: &CancellationToken,
        attempts_used: &mut u32,
    ) -> Result<JsonValue, HandlerError> {
        let outcome = retry::execute(policy, cancel, |attempt| {
            *attempts_used = attempt;
            self.dispatch(node, config, interp_ctx, ctx, cancel)
        })
        .await?;

        match outcome {
            RetryOutcome::Succeeded(value) => Ok(value),
            RetryOutcome::Cancelled => Err(HandlerError::message("execution cancelled")),
        }
    }

    async fn dispatch(
        &self,
        node: &Node,
        config: &JsonValue,
        interp_ctx: &JsonValue,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<JsonValue, HandlerError> {
        match node.node_type {
            NodeType::Http => self.handle_http(config, interp_ctx).await,
            NodeType::Transform | NodeType::Script => self.handle_script(config, interp_ctx).await,
            NodeType::Slack => self.handle_slack(config, interp_ctx).await,
            NodeType::Delay => self.handle_delay(config, interp_ctx, cancel).await,
            NodeType::SubWorkflow => self.handle_subworkflow(node, ctx).await,
            NodeType::Trigger => unreachable!("handled before dispatch"),
            _ => unreachable!("control nodes never reach dispatch"),
        }
    }

    async fn handle_http(&self, config: &JsonValue, interp_ctx: &JsonValue) -> Result<JsonValue, HandlerError> {
        let client = self.http_client.as_ref().ok_or_else(|| HandlerError::message("no http client configured"))?;
        let url = crate::expression::interpolate(
            config.get("url").and_then(JsonValue::as_str).ok_or_else(|| HandlerError::message("missing url"))?,
            interp_ctx,
        );
        let method = config.get("method").and_then(JsonValue::as_str).unwrap_or("GET").to_string();
        let timeout_ms = config.get("timeout_ms").and_then(JsonValue::as_u64).unwrap_or(30_000);
        let body = config.get("body").cloned();

        let breaker = self.circuit_breakers.get(&format!("http:{url}")).await;
        breaker.admit().await.map_err(|e| HandlerError::message(e.to_string()))?;

        let request = HttpRequestSpec { url, method, headers: Default::default(), body, timeout_ms };
        let result = client.execute(request).await;

        match result {
            Ok(response) if (200..300).contains(&response.status) => {
                breaker.record_success().await;
                Ok(serde_json::json!({"status": response.status, "body": response.body}))
            }
            Ok(response) => {
                breaker.record_failure().await;
                Err(HandlerError { message: format!("http status {}", response.status), status: Some(response.status) })
            }
            Err(e) => {
                breaker.record_failure().await;
                Err(HandlerError { message: e.message, status: e.status })
            }
        }
    }

    async fn handle_script(&self, config: &JsonValue, interp_ctx: &JsonValue) -> Result<JsonValue, HandlerError> {
        let script = config.get("script").and_then(JsonValue::as_str).unwrap_or_default().to_string();
        let script_ctx = ScriptContext {
            trigger: interp_ctx.get("trigger").cloned().unwrap_or(JsonValue::Null),
            steps: interp_ctx.get("steps").cloned().unwrap_or(JsonValue::Null),
            env: interp_ctx.get("env").cloned().unwrap_or(JsonValue::Null),
            vars: JsonValue::Null,
            input: interp_ctx.clone(),
        };
        let sandbox_config = self.config.sandbox.clone();
        let timeout_ms = sandbox_config.timeout_ms;
        let outcome = tokio::task::spawn_blocking(move || sandbox::run(&script, &script_ctx, &sandbox_config, timeout_ms))
            .await
            .map_err(|e| HandlerError::message(format!("sandbox task panicked: {e}")))?;
        outcome.map(|o| o.value).map_err(|e| HandlerError::message(e.to_string()))
    }

    async fn handle_slack(&self, config: &JsonValue, interp_ctx: &JsonValue) -> Result<JsonValue, HandlerError> {
        let client = self.slack_client.as_ref().ok_or_else(|| HandlerError::message("no slack client configured"))?;
        let channel = config.get("channel").and_then(JsonValue::as_str).unwrap_or_default().to_string();
        let template = config.get("message").and_then(JsonValue::as_str).unwrap_or_default();
        let text = crate::expression::interpolate(template, interp_ctx);
        client
            .send_message(SlackMessage { channel, text })
            .await
            .map_err(|e| HandlerError::message(e.to_string()))?;
        Ok(serde_json::json!({"sent": true}))
    }

    async fn handle_delay(&self, config: &JsonValue, interp_ctx: &JsonValue, cancel: &CancellationToken) -> Result<JsonValue, HandlerError> {
        let raw = config.get("duration").and_then(JsonValue::as_str).unwrap_or_default();
        let interpolated = crate::expression::interpolate(raw, interp_ctx);
        let requested = parse_go_duration(&interpolated).map_err(HandlerError::message)?;

        let start = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(requested) => {}
            _ = cancel.cancelled() => return Err(HandlerError::message("execution cancelled")),
        }
        let actual = start.elapsed();

        Ok(serde_json::json!({
            "requested_ms": requested.as_millis() as u64,
            "actual_ms": actual.as_millis() as u64,
            "completed": true,
        }))
    }

    async fn handle_subworkflow(&self, node: &Node, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let invoker = self.workflow_invoker.as_ref().ok_or_else(|| HandlerError::message("no workflow invoker configured"))?;
        crate::control::subworkflow::invoke(node, ctx, invoker.as_ref(), self.config.max_subworkflow_depth)
            .await
            .map_err(|e| HandlerError::message(e.to_string()))
    }
}

/// Parses a Go-style duration (`ms`, `s`, `m`, `h` suffix); rejects negative
/// values.
fn parse_go_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(stripped) = s.strip_prefix('-') {
        let _ = parse_go_duration(stripped)?;
        return Err(format!("negative duration: {s}"));
    }
    let (number_part, unit) = if let Some(n) = s.strip_suffix("ms") {
        (n, "ms")
    } else if let Some(n) = s.strip_suffix('s') {
        (n, "s")
    } else if let Some(n) = s.strip_suffix('m') {
        (n, "m")
    } else if let Some(n) = s.strip_suffix('h') {
        (n, "h")
    } else {
        return Err(format!("unrecognized duration unit: {s}"));
    };
    let value: f64 = number_part.parse().map_err(|_| format!("invalid duration number: {s}"))?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => unreachable!(),
    };
    Ok(Duration::from_millis(millis.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_duration_unit() {
        assert_eq!(parse_go_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_go_duration("2s").unwrap(), Duration::from_millis(2_000));
        assert_eq!(parse_go_duration("3m").unwrap(), Duration::from_millis(180_000));
        assert_eq!(parse_go_duration("1h").unwrap(), Duration::from_millis(3_600_000));
    }

    #[test]
    fn rejects_negative_duration() {
        assert!(parse_go_duration("-5s").is_err());
    }

    #[test]
    fn rejects_unrecognized_unit() {
        assert!(parse_go_duration("5days").is_err());
    }
}
