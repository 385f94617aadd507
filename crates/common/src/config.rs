use serde::{Deserialize, Serialize};

use crate::types::RetryPolicyConfig;

/// Process-wide circuit breaker defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub max_failures: u32,
    pub timeout_ms: u64,
    pub max_requests: u32,
    pub sliding_window_size: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout_ms: 30_000,
            max_requests: 1,
            sliding_window_size: 10,
        }
    }
}

/// Sandboxed script evaluator resource bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_call_stack_size: usize,
    pub max_memory_mb: u64,
    pub max_script_length: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_timeout_ms: 60_000,
            max_call_stack_size: 1_000,
            max_memory_mb: 64,
            max_script_length: 100_000,
        }
    }
}

/// Engine-wide configuration, env-driven with sane defaults so the engine
/// runs out of the box in tests and falls back cleanly in production.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub default_retry_policy: RetryPolicyConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub sandbox: SandboxConfig,
    pub max_subworkflow_depth: u32,
    pub default_loop_max_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry_policy: RetryPolicyConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            sandbox: SandboxConfig::default(),
            max_subworkflow_depth: env_u32("WORKFLOW_MAX_SUBWORKFLOW_DEPTH", 10),
            default_loop_max_iterations: env_usize("WORKFLOW_LOOP_MAX_ITERATIONS", 1000),
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_subworkflow_depth, 10);
        assert_eq!(cfg.default_loop_max_iterations, 1000);
        assert!(cfg.sandbox.max_timeout_ms >= cfg.sandbox.timeout_ms);
    }
}
