use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::RetryPolicy;

use super::recommendation::{ActionStep, RecommendationId, RecommendationStatus, StepStatus};
use super::store::{LifecycleError, LifecycleStore};

/// Adapter for one downstream system. Internal behavior of the system is out
/// of scope; the engine only needs the call to succeed, fail transiently, or
/// fail permanently.
#[async_trait]
pub trait TargetSystemAdapter: Send + Sync {
    async fn invoke(&self, step: &ActionStep) -> Result<Value, AdapterError>;
}

/// Downstream call failure. Transient failures are retried under the
/// configured policy; permanent ones fail the step immediately.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// A step that exhausted its retries (or failed permanently), recorded on
/// the step and surfaced to the caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("step {sequence_no} against '{target_system}' failed after {attempts} attempt(s): {message}")]
pub struct StepExecutionError {
    pub sequence_no: u32,
    pub target_system: String,
    pub attempts: u32,
    pub message: String,
}

/// Why an execution run could not even start or commit its outcome.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Summary of one finished plan run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub recommendation_id: RecommendationId,
    pub status: RecommendationStatus,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub failed_step: Option<StepExecutionError>,
}

/// Runs approved action plans against the registered downstream adapters.
/// Steps run strictly in `sequence_no` order because later steps may depend
/// on earlier ones' side effects; different recommendations' plans may run
/// concurrently in separate tasks.
pub struct ExecutionOrchestrator {
    adapters: BTreeMap<String, Arc<dyn TargetSystemAdapter>>,
    retry: RetryPolicy,
    call_timeout: Duration,
    store: Arc<LifecycleStore>,
}

impl ExecutionOrchestrator {
    pub(crate) fn new(
        adapters: BTreeMap<String, Arc<dyn TargetSystemAdapter>>,
        retry: RetryPolicy,
        call_timeout: Duration,
        store: Arc<LifecycleStore>,
    ) -> Self {
        Self {
            adapters,
            retry,
            call_timeout,
            store,
        }
    }

    /// Execute the plan of a recommendation already in `executing`. On the
    /// first unrecoverable step failure the remaining steps are skipped and
    /// the recommendation transitions to `failed`; already-succeeded steps
    /// are left as-is (compensation belongs to each target system, out of
    /// band). If every step succeeds the recommendation completes.
    pub async fn execute(
        &self,
        id: &RecommendationId,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        let record = self
            .store
            .get(id)
            .map_err(LifecycleError::from)?
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        if record.status != RecommendationStatus::Executing {
            return Err(ExecuteError::Lifecycle(LifecycleError::InvalidState {
                id: id.clone(),
                current: record.status.label(),
                expected: RecommendationStatus::Executing.label(),
            }));
        }

        let mut plan = record.action_plan;
        plan.sort_by_key(|step| step.sequence_no);

        let mut failure: Option<StepExecutionError> = None;
        for index in 0..plan.len() {
            if failure.is_some() {
                plan[index].status = StepStatus::Skipped;
                continue;
            }

            match self.run_step(&mut plan[index]).await {
                Ok(()) => {
                    plan[index].status = StepStatus::Succeeded;
                    plan[index].last_error = None;
                }
                Err(err) => {
                    plan[index].status = StepStatus::Failed;
                    plan[index].last_error = Some(err.message.clone());
                    warn!(
                        recommendation_id = %id,
                        step = err.sequence_no,
                        target_system = %err.target_system,
                        attempts = err.attempts,
                        "step failed; skipping remaining steps"
                    );
                    failure = Some(err);
                }
            }
            self.store.record_plan_progress(id, plan.clone())?;
        }

        let steps_succeeded = count(&plan, StepStatus::Succeeded);
        let steps_failed = count(&plan, StepStatus::Failed);
        let steps_skipped = count(&plan, StepStatus::Skipped);

        let status = if let Some(ref err) = failure {
            let record = self.store.mark_failed(id, plan)?;
            info!(recommendation_id = %id, step = err.sequence_no, "execution failed");
            record.status
        } else {
            let record = self.store.mark_completed(id, plan)?;
            info!(recommendation_id = %id, steps = steps_succeeded, "execution completed");
            record.status
        };

        Ok(ExecutionOutcome {
            recommendation_id: id.clone(),
            status,
            steps_succeeded,
            steps_failed,
            steps_skipped,
            failed_step: failure,
        })
    }

    /// Invoke one step's adapter under the call timeout, retrying transient
    /// failures with exponential backoff. A timeout counts as a failed
    /// attempt subject to the same policy.
    async fn run_step(&self, step: &mut ActionStep) -> Result<(), StepExecutionError> {
        let Some(adapter) = self.adapters.get(&step.target_system) else {
            step.attempt_count = 1;
            return Err(StepExecutionError {
                sequence_no: step.sequence_no,
                target_system: step.target_system.clone(),
                attempts: 1,
                message: format!("no adapter registered for '{}'", step.target_system),
            });
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            step.attempt_count = attempt;

            let message = match timeout(self.call_timeout, adapter.invoke(step)).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(AdapterError::Permanent(message))) => {
                    return Err(StepExecutionError {
                        sequence_no: step.sequence_no,
                        target_system: step.target_system.clone(),
                        attempts: attempt,
                        message,
                    });
                }
                Ok(Err(AdapterError::Transient(message))) => message,
                Err(_) => format!(
                    "call timed out after {}ms",
                    self.call_timeout.as_millis()
                ),
            };

            if attempt >= self.retry.max_attempts {
                return Err(StepExecutionError {
                    sequence_no: step.sequence_no,
                    target_system: step.target_system.clone(),
                    attempts: attempt,
                    message,
                });
            }

            let backoff = self.retry.backoff_for(attempt);
            warn!(
                step = step.sequence_no,
                target_system = %step.target_system,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %message,
                "step attempt failed; retrying"
            );
            sleep(backoff).await;
        }
    }
}

fn count(plan: &[ActionStep], status: StepStatus) -> usize {
    plan.iter().filter(|step| step.status == status).count()
}
