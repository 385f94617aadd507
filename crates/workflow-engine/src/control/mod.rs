//! Control-flow engine: conditional branch skipping, for-each loops,
//! bounded-concurrency parallel branches, fork/join synchronization, and
//! sub-workflow invocation. Each submodule implements one construct; all of
//! them drive node execution through [`NodeExecutor`] rather than calling
//! `node_runtime` directly, so a control node's body can itself contain
//! control nodes without this module depending on `orchestrator` (which
//! implements the trait).

pub mod conditional;
pub mod fork_join;
pub mod loop_exec;
pub mod parallel;
pub mod subworkflow;

use async_trait::async_trait;
use common::error::EngineError;
use common::types::{ExecutionContext, JsonValue};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Executes a single node by ID, dispatching to the Node Runtime for leaf
/// nodes or recursively into this module for control nodes. Implemented by
/// the Orchestrator; control submodules depend only on this trait.
///
/// `skip` is the caller's body-local skip set: a nested Conditional's
/// non-taken branch is added to it so the caller's own topological walk
/// over that same body skips those node ids, the same way the top-level
/// walk's skip set works.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute_node(
        &self,
        node_id: Uuid,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        interp_override: Option<JsonValue>,
        skip: &mut HashSet<Uuid>,
    ) -> Result<JsonValue>;
}
