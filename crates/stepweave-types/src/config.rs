//! Engine configuration types.
//!
//! `EngineConfig` is the `engine.toml` that controls scheduling, retry and
//! registry behavior. Every field has a default, so an empty file (or no file)
//! yields a working engine.

use serde::{Deserialize, Serialize};

/// Top-level configuration for a `WorkflowEngine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of ready nodes run concurrently in one batch.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Retries after the first failed attempt, unless a node overrides it.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between retry attempts in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// How the retry delay grows with the attempt number.
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Delay used by DELAY nodes that don't declare one.
    #[serde(default = "default_delay_ms")]
    pub default_delay_ms: u64,

    /// Maximum sub-workflow nesting depth.
    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: u32,

    /// Whether CONDITION results prune their dependents.
    #[serde(default)]
    pub condition_branching: ConditionBranching,

    /// What the scheduler does when a node exhausts its retries.
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Finished executions older than this are removed by `evict_finished`.
    /// None keeps them until deleted explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_ttl_secs: Option<u64>,
}

fn default_concurrency_limit() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_max_sub_workflow_depth() -> u32 {
    5
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            backoff: BackoffStrategy::default(),
            default_delay_ms: default_delay_ms(),
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            condition_branching: ConditionBranching::default(),
            failure_policy: FailurePolicy::default(),
            event_capacity: default_event_capacity(),
            execution_ttl_secs: None,
        }
    }
}

impl EngineConfig {
    /// Clamp values that would wedge the engine (a zero batch size never
    /// makes progress, a zero-capacity broadcast channel panics).
    pub fn sanitized(mut self) -> Self {
        self.concurrency_limit = self.concurrency_limit.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self
    }
}

/// Retry delay growth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `attempt * base` milliseconds.
    #[default]
    Linear,
    /// `base * 2^(attempt - 1)` milliseconds.
    Exponential,
}

/// Effect of a CONDITION node's result on the rest of the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionBranching {
    /// Record the boolean; every dependent still runs.
    #[default]
    Observe,
    /// A `false` result marks every transitive dependent SKIPPED.
    SkipDescendants,
}

/// Scheduler reaction to a node that exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Finish the current batch, then fail the execution.
    #[default]
    FailFast,
    /// Keep running independent branches; nodes blocked by a failure are
    /// marked SKIPPED and the execution ends FAILED.
    Continue,
}
