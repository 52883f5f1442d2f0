//! Engine tuning knobs.

use flowforge_workflow::expression::ScriptLimits;
use serde::Deserialize;
use std::time::Duration;

/// Retry, timeout and concurrency limits for the runner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Executor calls per node before a retryable error becomes fatal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on every further attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Per-invocation timeout; exceeding it is a retryable timeout error.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Nodes of one level running at the same time.
    #[serde(default = "default_max_level_concurrency")]
    pub max_level_concurrency: usize,

    /// Longest duration a `wait` node may ask for.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,

    /// How deep synchronous `sub-workflow` calls may nest.
    #[serde(default = "default_sub_workflow_max_depth")]
    pub sub_workflow_max_depth: u32,

    /// Longest a synchronous `sub-workflow` call may take end to end.
    #[serde(default = "default_sub_workflow_timeout_secs")]
    pub sub_workflow_timeout_secs: u64,

    /// Wall-clock budget for the scripts of one node invocation.
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,

    /// Heap limit for the scripts of one node invocation.
    #[serde(default = "default_script_memory_mb")]
    pub script_memory_mb: usize,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_node_timeout_secs() -> u64 {
    30
}

fn default_max_level_concurrency() -> usize {
    8
}

fn default_max_wait_secs() -> u64 {
    3600
}

fn default_sub_workflow_max_depth() -> u32 {
    5
}

fn default_sub_workflow_timeout_secs() -> u64 {
    600
}

fn default_script_timeout_ms() -> u64 {
    1_000
}

fn default_script_memory_mb() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            node_timeout_secs: default_node_timeout_secs(),
            max_level_concurrency: default_max_level_concurrency(),
            max_wait_secs: default_max_wait_secs(),
            sub_workflow_max_depth: default_sub_workflow_max_depth(),
            sub_workflow_timeout_secs: default_sub_workflow_timeout_secs(),
            script_timeout_ms: default_script_timeout_ms(),
            script_memory_mb: default_script_memory_mb(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    /// Delay before attempt `attempt + 1`, for `attempt >= 1`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    #[must_use]
    pub fn sub_workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.sub_workflow_timeout_secs)
    }

    /// Sandbox limits for expression and `code` evaluation.
    #[must_use]
    pub fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            time_budget: Duration::from_millis(self.script_timeout_ms),
            memory_limit: self.script_memory_mb.saturating_mul(1024 * 1024),
            ..ScriptLimits::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_defaults_match_default() {
        let parsed: EngineConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(parsed, EngineConfig::default());
        assert_eq!(parsed.max_attempts, 3);
        assert_eq!(parsed.node_timeout(), Duration::from_secs(30));
        assert_eq!(parsed.sub_workflow_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn script_limits_follow_config() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "script_timeout_ms": 250, "script_memory_mb": 8 }"#)
                .expect("parse");
        let limits = config.script_limits();
        assert_eq!(limits.time_budget, Duration::from_millis(250));
        assert_eq!(limits.memory_limit, 8 * 1024 * 1024);
        assert_eq!(limits.max_stack_size, ScriptLimits::default().max_stack_size);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(40), Duration::from_millis(5_000));
    }
}
