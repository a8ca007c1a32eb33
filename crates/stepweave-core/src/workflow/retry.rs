//! Bounded retry with linear or exponential backoff.
//!
//! `RetryHandler` holds no state; the policy is resolved per node from the
//! engine config and the node's own override. [`retry_with_backoff`] drives
//! the attempt loop and reports every failure to an observer so the caller
//! can update its records and publish events between attempts.

use std::future::Future;
use std::time::Duration;

use stepweave_types::config::{BackoffStrategy, EngineConfig};

use super::node_runner::NodeError;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Effective retry settings for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// Engine defaults, with the node's `max_retries` taking precedence.
    pub fn for_node(config: &EngineConfig, node_max_retries: Option<u32>) -> Self {
        Self {
            max_retries: node_max_retries.unwrap_or(config.max_retries),
            base_delay_ms: config.retry_base_delay_ms,
            backoff: config.backoff,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry decisions. All logic lives in associated functions that
/// take the policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow a failure.
    ///
    /// `retries_so_far` counts retries already performed (0 after the first
    /// attempt fails). Non-retryable errors never retry.
    pub fn should_retry(policy: &RetryPolicy, retries_so_far: u32, error: &NodeError) -> bool {
        error.is_retryable() && retries_so_far < policy.max_retries
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match policy.backoff {
            BackoffStrategy::Linear => policy.base_delay_ms.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                policy.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Attempt loop
// ---------------------------------------------------------------------------

/// Result of a retried operation together with the retries it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, NodeError>,
    pub retries: u32,
}

/// Run `operation` until it succeeds, fails non-retryably, or the policy's
/// retry budget is spent.
///
/// `operation` receives the 1-based attempt number. `on_failure` is called
/// after every failed attempt with `(attempt, error, will_retry)`, before the
/// backoff sleep.
pub async fn retry_with_backoff<T, F, Fut, O>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_failure: O,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
    O: FnMut(u32, &NodeError, bool),
{
    let mut retries = 0;
    loop {
        let attempt = retries + 1;
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    retries,
                };
            }
            Err(error) => {
                let will_retry = RetryHandler::should_retry(policy, retries, &error);
                on_failure(attempt, &error, will_retry);
                if !will_retry {
                    return RetryOutcome {
                        result: Err(error),
                        retries,
                    };
                }
                tokio::time::sleep(RetryHandler::backoff_delay(policy, attempt)).await;
                retries += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32, backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            backoff,
        }
    }

    fn handler_error(msg: &str) -> NodeError {
        NodeError::Handler(anyhow::anyhow!(msg.to_string()))
    }

    #[test]
    fn test_policy_prefers_node_override() {
        let config = EngineConfig::default();
        assert_eq!(RetryPolicy::for_node(&config, None).max_retries, 3);
        assert_eq!(RetryPolicy::for_node(&config, Some(0)).max_retries, 0);
        assert_eq!(RetryPolicy::for_node(&config, None).base_delay_ms, 1000);
    }

    #[test]
    fn test_should_retry_within_budget() {
        let p = policy(2, BackoffStrategy::Linear);
        let err = handler_error("boom");
        assert!(RetryHandler::should_retry(&p, 0, &err));
        assert!(RetryHandler::should_retry(&p, 1, &err));
        assert!(!RetryHandler::should_retry(&p, 2, &err));
    }

    #[test]
    fn test_non_retryable_error_never_retries() {
        let p = policy(3, BackoffStrategy::Linear);
        let err = NodeError::MissingHandler {
            node_id: "a".to_string(),
        };
        assert!(!RetryHandler::should_retry(&p, 0, &err));
    }

    #[test]
    fn test_linear_backoff() {
        let p = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff: BackoffStrategy::Linear,
        };
        assert_eq!(RetryHandler::backoff_delay(&p, 1), Duration::from_millis(1000));
        assert_eq!(RetryHandler::backoff_delay(&p, 2), Duration::from_millis(2000));
        assert_eq!(RetryHandler::backoff_delay(&p, 3), Duration::from_millis(3000));
    }

    #[test]
    fn test_exponential_backoff() {
        let p = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 100,
            backoff: BackoffStrategy::Exponential,
        };
        assert_eq!(RetryHandler::backoff_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::backoff_delay(&p, 4), Duration::from_millis(800));
        // Saturates instead of overflowing
        assert_eq!(
            RetryHandler::backoff_delay(&p, 200),
            Duration::from_millis(u64::MAX)
        );
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut failures = Vec::new();

        let outcome = retry_with_backoff(
            &policy(3, BackoffStrategy::Linear),
            |_attempt| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(handler_error("transient"))
                    } else {
                        Ok(n)
                    }
                }
            },
            |attempt, _err, will_retry| failures.push((attempt, will_retry)),
        )
        .await;

        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.retries, 2);
        assert_eq!(failures, vec![(1, true), (2, true)]);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let mut attempts = Vec::new();
        let outcome: RetryOutcome<()> = retry_with_backoff(
            &policy(2, BackoffStrategy::Linear),
            |attempt| async move { Err(handler_error(&format!("attempt {attempt}"))) },
            |attempt, _err, will_retry| attempts.push((attempt, will_retry)),
        )
        .await;

        assert_eq!(outcome.retries, 2);
        assert!(outcome.result.unwrap_err().to_string().contains("attempt 3"));
        assert_eq!(attempts, vec![(1, true), (2, true), (3, false)]);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let outcome: RetryOutcome<()> = retry_with_backoff(
            &policy(5, BackoffStrategy::Linear),
            |_| async {
                Err(NodeError::DepthExceeded {
                    depth: 6,
                    max: 5,
                })
            },
            |_, _, _| {},
        )
        .await;
        assert_eq!(outcome.retries, 0);
        assert!(matches!(outcome.result, Err(NodeError::DepthExceeded { .. })));
    }
}
