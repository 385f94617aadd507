pub mod classification;
pub mod config;
pub mod error;
pub mod types;

pub use classification::Classification;
pub use error::{
    ControlError, EngineError, NodeRuntimeError, ParseError, PlannerError, Result, SandboxError,
    ValidationError,
};
