//! External interfaces: persistence, credentials, and event broadcast are
//! consumed, not owned, by the core. Traits here are the seams a host
//! application implements; the engine only depends on these.

use async_trait::async_trait;
use common::types::{Execution, ExecutionStatus, JsonValue, NodeType, StepExecution, StepStatus, Workflow};
use common::Result;
use std::collections::HashMap;
use uuid::Uuid;

/// Workflow/execution/step persistence.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_workflow_by_id(&self, tenant_id: &str, workflow_id: Uuid) -> Result<Workflow>;

    async fn create_execution(&self, execution: &Execution) -> Result<()>;

    async fn get_execution_by_id(&self, execution_id: Uuid) -> Result<Execution>;

    async fn update_execution_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        output: Option<JsonValue>,
        error: Option<String>,
    ) -> Result<()>;

    async fn create_step_execution(
        &self,
        execution_id: Uuid,
        node_id: Uuid,
        node_type: NodeType,
        input: JsonValue,
    ) -> Result<StepExecution>;

    async fn update_step_execution(
        &self,
        execution_id: Uuid,
        node_id: Uuid,
        status: StepStatus,
        output: Option<JsonValue>,
        error: Option<String>,
    ) -> Result<()>;
}

/// Decrypted credential lookup and per-node injection. `inject_credentials`
/// returns the rewritten node config plus the literal secret values the
/// engine must mask on output.
#[async_trait]
pub trait CredentialInjector: Send + Sync {
    async fn get_value(&self, tenant_id: &str, credential_id: &str, user_id: &str) -> Result<JsonValue>;

    async fn inject_credentials(
        &self,
        config: JsonValue,
        tenant_id: &str,
        workflow_id: Uuid,
        execution_id: Uuid,
        accessed_by: &str,
    ) -> Result<(JsonValue, Vec<String>)>;
}

/// Masks every occurrence of an exact `values` literal inside `output` with
/// `"***"`, preserving structure. Matches whole values only — never a
/// substring replacement, which would corrupt output that merely contains a
/// secret as part of a longer string. Free function rather than a trait
/// method: it's pure and every injector needs exactly this behavior.
pub fn mask_output(output: JsonValue, values: &HashSet<String>) -> JsonValue {
    match output {
        JsonValue::String(s) => {
            if values.contains(&s) {
                JsonValue::String("***".to_string())
            } else {
                JsonValue::String(s)
            }
        }
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(|v| mask_output(v, values)).collect()),
        JsonValue::Object(map) => {
            JsonValue::Object(map.into_iter().map(|(k, v)| (k, mask_output(v, values))).collect())
        }
        other => other,
    }
}

use std::collections::HashSet;

/// Lifecycle events, fire-and-forget. Implementations must not fail
/// execution; the engine ignores errors here.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn execution_started(&self, tenant_id: &str, workflow_id: Uuid, execution_id: Uuid, total_steps: usize);
    async fn execution_completed(&self, tenant_id: &str, workflow_id: Uuid, execution_id: Uuid, output: JsonValue);
    async fn execution_failed(&self, tenant_id: &str, workflow_id: Uuid, execution_id: Uuid, error: &str);
    async fn step_started(&self, tenant_id: &str, workflow_id: Uuid, execution_id: Uuid, node_id: Uuid, node_type: NodeType);
    async fn step_completed(
        &self,
        tenant_id: &str,
        workflow_id: Uuid,
        execution_id: Uuid,
        node_id: Uuid,
        output: &JsonValue,
        duration_ms: u64,
    );
    async fn step_failed(&self, tenant_id: &str, workflow_id: Uuid, execution_id: Uuid, node_id: Uuid, error: &str);
    async fn progress(&self, tenant_id: &str, workflow_id: Uuid, execution_id: Uuid, done: usize, total: usize);
}

/// Outbound HTTP call, abstracted behind a trait: the engine only needs
/// somewhere to send the request and classify the outcome, not a concrete
/// client.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<JsonValue>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: JsonValue,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("http request failed: {message}")]
pub struct HttpError {
    pub message: String,
    /// Present when the failure is a completed response with a non-2xx
    /// status, so the caller can classify by status code rather than message.
    pub status: Option<u16>,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequestSpec) -> std::result::Result<HttpResponse, HttpError>;
}

/// Outbound Slack post, abstracted the same way as `HttpClient`.
#[derive(Debug, Clone)]
pub struct SlackMessage {
    pub channel: String,
    pub text: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("slack send failed: {0}")]
pub struct SlackError(pub String);

#[async_trait]
pub trait SlackClient: Send + Sync {
    async fn send_message(&self, message: SlackMessage) -> std::result::Result<(), SlackError>;
}

/// Recursive sub-workflow invocation, implemented by the Orchestrator and
/// handed to the Node Runtime so `node_runtime` never depends on
/// `orchestrator` directly.
#[async_trait]
pub trait WorkflowInvoker: Send + Sync {
    async fn invoke(
        &self,
        tenant_id: &str,
        workflow_id: Uuid,
        trigger_data: JsonValue,
        parent: &common::types::ExecutionContext,
    ) -> Result<JsonValue>;
}

/// A `Broadcaster` that drops every event; used by tests and standalone runs
/// where no transport is wired up.
pub struct NullBroadcaster;

#[async_trait]
impl Broadcaster for NullBroadcaster {
    async fn execution_started(&self, _: &str, _: Uuid, _: Uuid, _: usize) {}
    async fn execution_completed(&self, _: &str, _: Uuid, _: Uuid, _: JsonValue) {}
    async fn execution_failed(&self, _: &str, _: Uuid, _: Uuid, _: &str) {}
    async fn step_started(&self, _: &str, _: Uuid, _: Uuid, _: Uuid, _: NodeType) {}
    async fn step_completed(&self, _: &str, _: Uuid, _: Uuid, _: Uuid, _: &JsonValue, _: u64) {}
    async fn step_failed(&self, _: &str, _: Uuid, _: Uuid, _: Uuid, _: &str) {}
    async fn progress(&self, _: &str, _: Uuid, _: Uuid, _: usize, _: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_output_replaces_exact_matches_only() {
        let mut secrets = HashSet::new();
        secrets.insert("sk-secret".to_string());
        let output = serde_json::json!({
            "token": "sk-secret",
            "message": "token is sk-secret embedded",
            "nested": ["sk-secret", "other"]
        });
        let masked = mask_output(output, &secrets);
        assert_eq!(masked["token"], serde_json::json!("***"));
        // substring occurrence inside a larger string is left untouched.
        assert_eq!(masked["message"], serde_json::json!("token is sk-secret embedded"));
        assert_eq!(masked["nested"][0], serde_json::json!("***"));
        assert_eq!(masked["nested"][1], serde_json::json!("other"));
    }
}
