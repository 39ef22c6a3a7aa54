//! Step execution
//!
//! Runs one step of a job execution end to end: restart lookup, start limit,
//! step listeners around the body, and the final status and save.

use crate::batchlet::run_batchlet;
use crate::chunk::run_chunk;
use crate::context::{JobContext, StepContext, UnitContext};
use crate::metrics::STEP_DURATION;
use crate::partition_runner::run_partitioned;
use crate::{Error, Result};
use jobline_core::{ArtifactRole, BatchStatus, JobScope, Step, StepExecution, StepKind, StepScope};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// How a step ended
#[derive(Debug)]
pub struct StepOutcome {
    pub batch_status: BatchStatus,

    /// Exit status the job's transitions are matched against
    pub exit_status: String,

    pub execution: StepExecution,

    /// The error that failed the step, if any
    pub failure: Option<Error>,

    /// Set when a completed original execution was reused on restart
    pub reused: bool,
}

impl StepOutcome {
    fn from_context(ctx: &StepContext, failure: Option<Error>) -> Self {
        let execution = ctx.execution();
        Self {
            batch_status: execution.state.batch_status,
            exit_status: execution.state.effective_exit_status(),
            execution,
            failure,
            reused: ctx.is_reused(),
        }
    }
}

/// Run `step` within the job.
///
/// Collaborator failures and timeouts end the step FAILED and are returned
/// in the outcome; only repository failures surface as `Err`.
#[instrument(
    name = "step_runner.run_step",
    skip(job, step),
    fields(job_execution_id = %job.execution_id(), step = %step.id)
)]
pub async fn run_step(job: &JobContext, step: Arc<Step>) -> Result<StepOutcome> {
    let ctx = StepContext::create(job, step.clone()).await?;
    if ctx.is_reused() {
        return Ok(StepOutcome::from_context(&ctx, None));
    }

    let started = Instant::now();
    let result = execute(&ctx).await;

    let failure = match result {
        Ok(()) => None,
        Err(e @ Error::Storage(_)) => {
            fail(&ctx, &e);
            finish(&ctx);
            if let Err(save_err) = ctx.save(true).await {
                warn!(error = %save_err, "Failed to persist step after repository failure");
            }
            return Err(e);
        }
        Err(e) => {
            fail(&ctx, &e);
            Some(e)
        }
    };

    finish(&ctx);
    ctx.save(true).await?;

    let outcome = StepOutcome::from_context(&ctx, failure);
    STEP_DURATION
        .with_label_values(&[kind_label(&step), outcome.batch_status.as_str()])
        .observe(started.elapsed().as_secs_f64());
    info!(
        status = %outcome.batch_status,
        exit_status = %outcome.exit_status,
        duration_ms = started.elapsed().as_millis() as u64,
        "Step finished"
    );
    Ok(outcome)
}

async fn execute(ctx: &StepContext) -> Result<()> {
    let job = ctx.job_context();
    let step = ctx.step();

    if step.start_limit > 0 {
        let starts = job
            .repository()
            .count_step_starts(job.instance_id(), &step.id)
            .await?;
        if starts > step.start_limit {
            return Err(Error::Execution(format!(
                "step {} was started {} times, exceeding its start limit of {}",
                step.id, starts, step.start_limit
            )));
        }
    }

    ctx.cell().set_batch_status(BatchStatus::Started);
    ctx.save(true).await?;

    let listeners = step
        .listeners
        .iter()
        .map(|name| -> Result<_> { Ok((name.as_str(), job.factory().step_listener(name, &step.properties)?)) })
        .collect::<Result<Vec<_>>>()?;

    for (name, listener) in &listeners {
        listener
            .before_step(ctx)
            .await
            .map_err(|e| Error::collaborator(ArtifactRole::StepListener, name, "before_step", e))?;
    }

    let body = if step.is_partitioned() {
        run_partitioned(ctx).await
    } else {
        match &step.kind {
            StepKind::Chunk { .. } => run_chunk(ctx).await,
            StepKind::Batchlet { .. } => run_batchlet(ctx).await,
        }
    };

    // after_step sees the failure of the body
    if let Err(e) = &body {
        fail(ctx, e);
    }

    let mut after = Ok(());
    for (name, listener) in &listeners {
        if let Err(e) = listener.after_step(ctx).await {
            let err = Error::collaborator(ArtifactRole::StepListener, name, "after_step", e);
            if after.is_ok() {
                after = Err(err);
            } else {
                warn!(error = %err, "Step listener failed");
            }
        }
    }

    body.and(after)
}

/// Store the failure on the step and move it to FAILED, once
fn fail(ctx: &StepContext, err: &Error) {
    if ctx.batch_status() == BatchStatus::Failed && ctx.exception().is_some() {
        return;
    }
    error!(step = %ctx.step_name(), error = %err, "Step failed");
    ctx.cell().record_failure(&anyhow::Error::msg(err.to_string()));
}

fn finish(ctx: &StepContext) {
    match ctx.batch_status() {
        BatchStatus::Started => {
            ctx.cell().set_batch_status(BatchStatus::Completed);
        }
        BatchStatus::Stopping => {
            ctx.cell().set_batch_status(BatchStatus::Stopped);
        }
        _ => {}
    }
}

fn kind_label(step: &Step) -> &'static str {
    match (&step.kind, step.is_partitioned()) {
        (_, true) => "partitioned",
        (StepKind::Chunk { .. }, false) => "chunk",
        (StepKind::Batchlet { .. }, false) => "batchlet",
    }
}
