use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error taxonomy for the engine crate, composing the
/// concern-specific enums below into one type callers can match on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("planner error: {0}")]
    Planner(#[from] PlannerError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("control-flow error: {0}")]
    Control(#[from] ControlError),

    #[error("node runtime error: {0}")]
    NodeRuntime(#[from] NodeRuntimeError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("empty workflow")]
    EmptyWorkflow,

    #[error("duplicate node id: {0}")]
    DuplicateNodeId(Uuid),

    #[error("invalid edge source: {0}")]
    InvalidEdgeSource(Uuid),

    #[error("invalid edge target: {0}")]
    InvalidEdgeTarget(Uuid),

    #[error("no starting node found")]
    NoStartingNode,
}

/// Planner-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlannerError {
    #[error("cycle detected in workflow graph")]
    CycleDetected,

    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("no start nodes found")]
    NoStartNodes,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("node {0} is missing required config field '{1}'")]
    MissingRequiredField(Uuid, String),

    #[error("node {0} has an invalid enum value for '{1}': {2}")]
    InvalidEnumValue(Uuid, String, String),

    #[error("node {0} has malformed config: {1}")]
    MalformedConfig(Uuid, String),

    #[error("script on node {0} is empty")]
    EmptyScript(Uuid),
}

/// Control-flow failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("max sub-workflow depth exceeded")]
    MaxDepthExceeded,

    #[error("circular workflow dependency detected")]
    CircularWorkflowDependency,

    #[error("break condition operand mismatch: {0}")]
    BreakConditionOperandMismatch(String),

    #[error("join timed out waiting for incoming branches")]
    JoinTimeout,

    #[error("loop source exceeds max iterations: {actual} > {max}")]
    MaxIterationsExceeded { actual: usize, max: usize },

    #[error("loop source is neither an array nor an object")]
    InvalidLoopSource,

    #[error("execution cancelled")]
    Cancelled,

    #[error("parallel group cancelled after branch failure: {0}")]
    BranchFailed(String),

    #[error("join requires 1 <= required_count <= total incoming branches")]
    InvalidRequiredCount,
}

/// Node-runtime failures, wrapped with classification context.
#[derive(Debug, Error, Clone)]
#[error("node {node_id} ({node_type}) failed: {message} [classification={classification:?}, retry_count={retry_count}]")]
pub struct NodeRuntimeError {
    pub node_id: Uuid,
    pub node_type: String,
    pub message: String,
    pub classification: crate::classification::Classification,
    pub retry_count: u32,
}

/// Sandbox failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("script exceeds max length")]
    ScriptTooLarge,

    #[error("script contains a forbidden pattern: {0}")]
    SandboxViolation(String),

    #[error("script references a forbidden global: {0}")]
    ForbiddenGlobal(String),

    #[error("script performed a forbidden operation: {0}")]
    ForbiddenOperation(String),

    #[error("script compilation failed: {0}")]
    Compilation(String),

    #[error("script execution failed: {0}")]
    Execution(String),

    #[error("script result extraction failed: {0}")]
    Extraction(String),

    #[error("script timed out")]
    Timeout,

    #[error("script exceeded memory limit")]
    MemoryLimitExceeded,

    #[error("script exceeded call stack limit")]
    StackOverflow,
}

impl SandboxError {
    /// The execution phase this error occurred in.
    pub fn phase(&self) -> &'static str {
        match self {
            SandboxError::ScriptTooLarge
            | SandboxError::SandboxViolation(_)
            | SandboxError::ForbiddenGlobal(_)
            | SandboxError::ForbiddenOperation(_) => "validation",
            SandboxError::Compilation(_) => "compilation",
            SandboxError::Execution(_)
            | SandboxError::Timeout
            | SandboxError::MemoryLimitExceeded
            | SandboxError::StackOverflow => "execution",
            SandboxError::Extraction(_) => "extraction",
        }
    }
}
