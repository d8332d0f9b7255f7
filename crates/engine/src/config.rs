//! Engine configuration.

use std::time::Duration;

use relay_workflow::RetryPolicy;

/// Tunables for the execution engine.
///
/// Per-node retry and timeout policies in the workflow definition override
/// these defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default timeout for a single decision callback attempt.
    pub default_decision_timeout: Duration,

    /// Default timeout for a single task or tool attempt.
    pub default_task_timeout: Duration,

    /// Default retry policy for nodes that declare none.
    pub default_retry: RetryPolicy,

    /// Maximum nodes running concurrently within one execution.
    pub max_concurrent_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_decision_timeout: Duration::from_secs(60),
            default_task_timeout: Duration::from_secs(300),
            default_retry: RetryPolicy::default(),
            max_concurrent_nodes: 16,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_decision_timeout: env_secs("RELAY_DECISION_TIMEOUT")
                .unwrap_or(defaults.default_decision_timeout),
            default_task_timeout: env_secs("RELAY_TASK_TIMEOUT")
                .unwrap_or(defaults.default_task_timeout),
            default_retry: defaults.default_retry,
            max_concurrent_nodes: env_parse("RELAY_MAX_CONCURRENT_NODES")
                .unwrap_or(defaults.max_concurrent_nodes),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
