use super::{delegate_step_scope, JobContext, RecordCell, UnitContext};
use jobline_core::{BatchStatus, Step, StepExecution, StepRecord};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runtime wrapper around one step execution
pub struct StepContext {
    job: JobContext,
    step: Arc<Step>,
    cell: RecordCell,
    original: Option<StepExecution>,
    reused: bool,
}

impl StepContext {
    /// Build the context for running `step` in the job.
    ///
    /// On restart the original execution of the step is looked up. A
    /// completed original that may not start again is reused as is and the
    /// step is not rerun; any other original seeds the new record with its
    /// checkpoints.
    pub async fn create(job: &JobContext, step: Arc<Step>) -> crate::Result<Self> {
        let original = match job.prior_execution() {
            Some(prior) => {
                let found = job
                    .repository()
                    .find_original_step_execution_for_restart(&step.id, prior)
                    .await?;
                if found.is_none() {
                    warn!(
                        step = %step.id,
                        prior_execution_id = %prior.id,
                        "No original step execution found for restart, starting fresh"
                    );
                }
                found
            }
            None => None,
        };

        if let Some(original) = &original {
            if original.state.batch_status == BatchStatus::Completed && !step.allow_start_if_complete {
                info!(
                    step = %step.id,
                    step_execution_id = %original.id,
                    "Step already completed, reusing original execution"
                );
                return Ok(Self {
                    job: job.clone(),
                    cell: RecordCell::new(StepRecord::Step(original.clone()), job.codec().clone()),
                    step,
                    original: Some(original.clone()),
                    reused: true,
                });
            }
        }

        let mut record = job
            .repository()
            .create_step_execution(&job.execution(), &step.id)
            .await?;
        if let Some(original) = &original {
            record.state.carry_forward_from(&original.state);
            debug!(
                step = %step.id,
                step_execution_id = %record.id,
                original_id = %original.id,
                "Carried checkpoints forward from original execution"
            );
        }

        Ok(Self {
            job: job.clone(),
            cell: RecordCell::new(StepRecord::Step(record), job.codec().clone()),
            step,
            original,
            reused: false,
        })
    }

    /// Whether this context wraps a completed original that is not rerun
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn original(&self) -> Option<&StepExecution> {
        self.original.as_ref()
    }

    pub fn step_definition(&self) -> &Arc<Step> {
        &self.step
    }

    /// Snapshot of the step execution record
    pub fn execution(&self) -> StepExecution {
        let record = self.cell.snapshot();
        StepExecution {
            id: record.step_execution_id(),
            job_execution_id: record.job_execution_id(),
            step_name: record.step_name().to_string(),
            state: record.state().clone(),
        }
    }
}

delegate_step_scope!(StepContext);

impl UnitContext for StepContext {
    fn job_context(&self) -> &JobContext {
        &self.job
    }

    fn step(&self) -> &Step {
        &self.step
    }

    fn cell(&self) -> &RecordCell {
        &self.cell
    }

    fn cancel_token(&self) -> &CancellationToken {
        self.job.cancel_token()
    }
}
