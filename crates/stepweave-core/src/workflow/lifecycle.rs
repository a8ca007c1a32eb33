//! Execution lifecycle control and registry housekeeping.
//!
//! Pause and cancel only flip flags on the execution record; the scheduler
//! loop observes them between batches. Resume clears the pause and drives the
//! execution again from its current frontier, without replaying completed
//! nodes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stepweave_types::event::EngineEvent;
use stepweave_types::workflow::ExecutionStatus;
use tracing::Instrument;

use super::executor::{ExecutorError, WorkflowEngine};
use super::state::{ExecutionRecord, ExecutionState};

impl WorkflowEngine {
    fn require_execution(&self, execution_id: &str) -> Result<Arc<ExecutionRecord>, ExecutorError> {
        self.inner
            .executions
            .get(execution_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ExecutorError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Ask the scheduler to stop after the current batch.
    ///
    /// The execution moves to PENDING with `is_paused` set. Nodes already
    /// running finish normally.
    pub fn pause_execution(&self, execution_id: &str) -> Result<(), ExecutorError> {
        let record = self.require_execution(execution_id)?;
        record.with_state(|state| {
            if state.is_cancelled || state.status.is_terminal() {
                return Err(invalid(execution_id, "paused", state.status));
            }
            state.is_paused = true;
            state.status = ExecutionStatus::Pending;
            Ok(())
        })?;

        tracing::info!(execution_id, "execution pause requested");
        self.inner.events.publish(EngineEvent::ExecutionPaused {
            execution_id: execution_id.to_string(),
        });
        Ok(())
    }

    /// Continue a paused execution from its frontier.
    ///
    /// Resolves like `execute_workflow`: with the final state once the run
    /// completes (or is paused or cancelled again), or `Err` if it fails. If
    /// the previous loop has not yet stopped, it is awaited first and may
    /// already have finished the run, in which case that state is returned.
    pub async fn resume_execution(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionState, ExecutorError> {
        let record = self.require_execution(execution_id)?;
        record.with_state(|state| {
            if state.is_cancelled || state.status.is_terminal() {
                return Err(invalid(execution_id, "resumed", state.status));
            }
            state.is_paused = false;
            state.status = ExecutionStatus::Running;
            Ok(())
        })?;

        tracing::info!(execution_id, "execution resumed");
        self.inner.events.publish(EngineEvent::ExecutionResumed {
            execution_id: execution_id.to_string(),
        });

        let span = tracing::info_span!(
            "workflow_execution",
            execution_id = %execution_id,
            workflow_id = %record.workflow.id,
            depth = record.depth,
        );
        self.drive(&record).instrument(span).await
    }

    /// Stop scheduling new batches and mark the execution CANCELLED now.
    ///
    /// Running handlers are not aborted; they can observe the cancellation
    /// through `NodeContext::is_cancelled`. Sub-workflows started by this
    /// execution are cancelled with it and start no further batches.
    pub fn cancel_execution(&self, execution_id: &str) -> Result<(), ExecutorError> {
        let record = self.require_execution(execution_id)?;
        if self.cancel_record(&record) {
            return Ok(());
        }
        Err(invalid(execution_id, "cancelled", record.lock_state().status))
    }

    /// Snapshot of an execution's current state.
    pub fn get_execution_status(&self, execution_id: &str) -> Option<ExecutionState> {
        self.inner
            .executions
            .get(execution_id)
            .map(|entry| entry.value().snapshot())
    }

    /// Snapshots of every execution in the registry, oldest first.
    pub fn get_all_executions(&self) -> Vec<ExecutionState> {
        let mut all: Vec<ExecutionState> = self
            .inner
            .executions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    /// Remove an execution from the registry. Returns whether it existed.
    ///
    /// A running execution keeps running; it just stops being queryable.
    pub fn delete_execution(&self, execution_id: &str) -> bool {
        self.inner.executions.remove(execution_id).is_some()
    }

    /// Remove every execution. Returns how many were removed.
    pub fn clear_executions(&self) -> usize {
        let count = self.inner.executions.len();
        self.inner.executions.clear();
        count
    }

    /// Drop finished executions older than the configured TTL.
    /// Does nothing when `execution_ttl_secs` is unset.
    pub fn evict_finished(&self) -> usize {
        match self.inner.config.execution_ttl_secs {
            Some(ttl) => self.evict_finished_older_than(Duration::from_secs(ttl)),
            None => 0,
        }
    }

    /// Drop executions that reached a terminal status more than `age` ago.
    pub fn evict_finished_older_than(&self, age: Duration) -> usize {
        // Too large to represent means nothing is old enough.
        let Ok(age) = chrono::Duration::from_std(age) else {
            return 0;
        };
        let cutoff = Utc::now().checked_sub_signed(age);
        let before = self.inner.executions.len();

        self.inner.executions.retain(|_, record| {
            let state = record.lock_state();
            let expired = match (state.ended_at, cutoff) {
                (Some(ended), Some(cutoff)) => state.status.is_terminal() && ended <= cutoff,
                _ => false,
            };
            !expired
        });

        let evicted = before.saturating_sub(self.inner.executions.len());
        if evicted > 0 {
            tracing::debug!(evicted, "evicted finished executions");
        }
        evicted
    }

    /// Cancel every unfinished execution and empty both registries.
    pub fn shutdown(&self) {
        let cancelled = self
            .inner
            .executions
            .iter()
            .filter(|entry| self.cancel_record(entry.value()))
            .count();

        self.inner.executions.clear();
        self.inner.workflows.clear();
        tracing::info!(cancelled, "workflow engine shut down");
    }
}

fn invalid(execution_id: &str, action: &'static str, status: ExecutionStatus) -> ExecutorError {
    ExecutorError::InvalidState {
        execution_id: execution_id.to_string(),
        action,
        reason: format!("execution is {status:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
