//! Job execution
//!
//! Walks the job graph of one job execution: job listeners around the walk,
//! steps run through the step runner, decisions, nested flows, and splits
//! whose flows run concurrently.
//!
//! # Routing
//!
//! After each element its exit status is matched against the element's
//! transitions in declaration order. A matched `next` continues at the named
//! sibling; `end`, `fail` and `stop` end the job. Without a match a FAILED or
//! STOPPED element ends the job with that status, otherwise the element's
//! `next` attribute is followed and a missing `next` ends the element list.

use crate::context::JobContext;
use crate::metrics::{ACTIVE_JOB_EXECUTIONS, JOB_EXECUTIONS_TOTAL};
use crate::step_runner::run_step;
use crate::{Error, Result};
use futures::future::{join_all, BoxFuture, FutureExt};
use jobline_core::transition::find_match;
use jobline_core::{
    ArtifactRole, BatchStatus, Decision, JobElement, JobExecution, JobScope, Split, StepExecution, Transition,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// What an element ended with
#[derive(Debug, Clone)]
struct UnitOutcome {
    batch_status: BatchStatus,
    exit_status: String,

    /// Last step executions, handed to a decider that follows
    executions: Vec<StepExecution>,
}

impl UnitOutcome {
    fn completed() -> Self {
        Self {
            batch_status: BatchStatus::Completed,
            exit_status: BatchStatus::Completed.as_str().to_string(),
            executions: Vec::new(),
        }
    }
}

enum Walk {
    /// Ran off the end of the element list
    Finished(Option<UnitOutcome>),

    /// A transition or an unrouted failure ended the job
    Terminated,
}

/// Runs one job execution to a terminal status
pub struct JobRunner {
    ctx: JobContext,
}

impl JobRunner {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Run the job and persist its final status.
    ///
    /// The returned execution is always terminal. An `Err` carries what forced
    /// the job to FAILED outside normal routing (a job listener, a split
    /// timeout, a loop); the FAILED status is persisted before it is returned.
    #[instrument(
        name = "job_runner.run",
        skip(self),
        fields(job = %self.ctx.job_name(), job_execution_id = %self.ctx.execution_id())
    )]
    pub async fn run(self) -> Result<JobExecution> {
        ACTIVE_JOB_EXECUTIONS.inc();
        let result = self.execute().await;
        ACTIVE_JOB_EXECUTIONS.dec();

        let ctx = &self.ctx;
        if let Err(e) = &result {
            error!(error = %e, "Job execution failed");
            ctx.update_batch_status(BatchStatus::Failed);
        }
        match ctx.batch_status() {
            BatchStatus::Started => {
                ctx.update_batch_status(BatchStatus::Completed);
            }
            BatchStatus::Stopping => {
                ctx.update_batch_status(BatchStatus::Stopped);
            }
            _ => {}
        }
        ctx.persist().await?;

        let execution = ctx.execution();
        JOB_EXECUTIONS_TOTAL
            .with_label_values(&[execution.batch_status.as_str()])
            .inc();
        info!(
            status = %execution.batch_status,
            exit_status = %execution.effective_exit_status(),
            "Job execution finished"
        );

        result.map(|()| execution)
    }

    async fn execute(&self) -> Result<()> {
        let ctx = &self.ctx;
        let job = ctx.job();

        if !ctx.update_batch_status(BatchStatus::Started) {
            info!("Stop requested before the job started");
            return Ok(());
        }
        ctx.persist().await?;

        let listeners = job
            .listeners
            .iter()
            .map(|name| -> Result<_> { Ok((name.as_str(), ctx.factory().job_listener(name, &job.properties)?)) })
            .collect::<Result<Vec<_>>>()?;

        for (name, listener) in &listeners {
            listener
                .before_job(ctx)
                .await
                .map_err(|e| Error::collaborator(ArtifactRole::JobListener, name, "before_job", e))?;
        }

        let start = self.start_position()?;
        if let Some(start) = start {
            info!(restart_position = %start, "Resuming at restart position");
        }
        walk(ctx, &job.elements, start, true).await?;

        for (name, listener) in &listeners {
            listener
                .after_job(ctx)
                .await
                .map_err(|e| Error::collaborator(ArtifactRole::JobListener, name, "after_job", e))?;
        }
        Ok(())
    }

    /// Override parameter first, then what the prior execution recorded.
    ///
    /// Both apply to restarts only; a fresh start always begins at the head.
    fn start_position(&self) -> Result<Option<&str>> {
        let ctx = &self.ctx;
        let override_position = ctx.options().restart_position.as_deref();
        let position = match ctx.prior_execution() {
            Some(prior) => override_position.or(prior.restart_position.as_deref()),
            None => {
                if let Some(ignored) = override_position {
                    warn!(position = %ignored, "Restart position ignored on a fresh start");
                }
                None
            }
        };

        match position {
            Some(id) if !ctx.job().elements.iter().any(|e| e.id() == id) => Err(Error::Restart(format!(
                "restart position {} is not a top-level element of job {}",
                id,
                ctx.job_name()
            ))),
            other => Ok(other),
        }
    }
}

fn find<'a>(elements: &'a [JobElement], id: &str) -> Result<&'a JobElement> {
    elements
        .iter()
        .find(|e| e.id() == id)
        .ok_or_else(|| Error::Execution(format!("unknown element {}", id)))
}

/// Walk one element list from `start` (or its head)
fn walk<'a>(
    ctx: &'a JobContext,
    elements: &'a [JobElement],
    start: Option<&'a str>,
    top_level: bool,
) -> BoxFuture<'a, Result<Walk>> {
    async move {
        let mut current = match start {
            Some(id) => find(elements, id)?,
            None => match elements.first() {
                Some(first) => first,
                None => return Ok(Walk::Finished(None)),
            },
        };
        let mut visited = HashSet::new();
        let mut last: Option<UnitOutcome> = None;

        loop {
            if !visited.insert(current.id()) && !ctx.options().loop_allowed {
                return Err(Error::LoopDetected(current.id().to_string()));
            }

            if ctx.stop_requested() {
                info!(element = %current.id(), "Stop observed before element");
                if top_level {
                    ctx.set_restart_position(Some(current.id().to_string()));
                }
                return Ok(Walk::Terminated);
            }

            debug!(element = %current.id(), kind = current.kind(), "Running element");
            let outcome = match current {
                JobElement::Step(step) => {
                    let outcome = run_step(ctx, Arc::new(step.clone())).await?;
                    UnitOutcome {
                        batch_status: outcome.batch_status,
                        exit_status: outcome.exit_status,
                        executions: vec![outcome.execution],
                    }
                }
                JobElement::Decision(decision) => {
                    let executions = last.as_ref().map(|o| o.executions.as_slice()).unwrap_or_default();
                    decide(ctx, decision, executions).await?
                }
                JobElement::Flow(flow) => match walk(ctx, &flow.elements, None, false).await? {
                    Walk::Terminated => return Ok(Walk::Terminated),
                    Walk::Finished(outcome) => outcome.unwrap_or_else(UnitOutcome::completed),
                },
                JobElement::Split(split) => match run_split(ctx, split).await? {
                    Walk::Terminated => return Ok(Walk::Terminated),
                    Walk::Finished(outcome) => outcome.unwrap_or_else(UnitOutcome::completed),
                },
            };

            let next = match find_match(current.transitions(), &outcome.exit_status) {
                Some(Transition::Next { to, .. }) => Some(to.as_str()),
                Some(Transition::End { exit_status, .. }) => {
                    ctx.set_exit_status(exit_status.as_deref().unwrap_or(&outcome.exit_status));
                    info!(element = %current.id(), "Job ended by transition");
                    return Ok(Walk::Terminated);
                }
                Some(Transition::Fail { exit_status, .. }) => {
                    ctx.set_exit_status(exit_status.as_deref().unwrap_or(&outcome.exit_status));
                    ctx.update_batch_status(BatchStatus::Failed);
                    info!(element = %current.id(), "Job failed by transition");
                    return Ok(Walk::Terminated);
                }
                Some(Transition::Stop {
                    exit_status, restart, ..
                }) => {
                    ctx.set_exit_status(exit_status.as_deref().unwrap_or(&outcome.exit_status));
                    ctx.set_restart_position(restart.clone());
                    ctx.update_batch_status(BatchStatus::Stopped);
                    info!(element = %current.id(), restart = ?restart, "Job stopped by transition");
                    return Ok(Walk::Terminated);
                }
                None => match outcome.batch_status {
                    BatchStatus::Failed => {
                        ctx.update_batch_status(BatchStatus::Failed);
                        return Ok(Walk::Terminated);
                    }
                    BatchStatus::Stopped => {
                        if top_level {
                            ctx.set_restart_position(Some(current.id().to_string()));
                        }
                        ctx.update_batch_status(BatchStatus::Stopped);
                        return Ok(Walk::Terminated);
                    }
                    _ => current.next(),
                },
            };

            last = Some(outcome);
            match next {
                Some(id) => current = find(elements, id)?,
                None => return Ok(Walk::Finished(last)),
            }
        }
    }
    .boxed()
}

/// Ask the decider for an exit status; it also becomes the job exit status
async fn decide(ctx: &JobContext, decision: &Decision, executions: &[StepExecution]) -> Result<UnitOutcome> {
    let decider = ctx.factory().decider(&decision.decider, &decision.properties)?;
    let exit_status = decider
        .decide(ctx, executions)
        .await
        .map_err(|e| Error::collaborator(ArtifactRole::Decider, &decision.decider, "decide", e))?;

    info!(decision = %decision.id, exit_status = %exit_status, "Decision made");
    ctx.set_exit_status(&exit_status);
    Ok(UnitOutcome {
        batch_status: BatchStatus::Completed,
        exit_status,
        executions: executions.to_vec(),
    })
}

/// Run the flows of a split concurrently and wait for all of them, or for
/// the split timeout
async fn run_split(ctx: &JobContext, split: &Split) -> Result<Walk> {
    let cancel = ctx.cancel_token().child_token();
    let handles: Vec<_> = split
        .flows
        .iter()
        .map(|flow| {
            let flow_ctx = ctx.with_cancel_token(cancel.clone());
            let flow = flow.clone();
            let span = tracing::info_span!("flow", split = %split.id, flow = %flow.id);
            tokio::spawn(async move { walk(&flow_ctx, &flow.elements, None, false).await }.instrument(span))
        })
        .collect();

    info!(split = %split.id, flows = handles.len(), "Split started");
    let joined = join_all(handles);
    let results = match ctx.options().split_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, joined).await {
            Ok(results) => results,
            Err(_) => {
                cancel.cancel();
                return Err(Error::Timeout(format!(
                    "split {} did not finish within {}s",
                    split.id,
                    timeout.as_secs()
                )));
            }
        },
        None => joined.await,
    };

    let mut terminated = false;
    let mut worst = BatchStatus::Completed;
    let mut executions = Vec::new();
    let mut failure = None;
    for result in results {
        match result {
            Ok(Ok(Walk::Terminated)) => terminated = true,
            Ok(Ok(Walk::Finished(Some(outcome)))) => {
                worst = worst.worst(outcome.batch_status);
                executions.extend(outcome.executions);
            }
            Ok(Ok(Walk::Finished(None))) => {}
            Ok(Err(e)) => {
                if failure.is_none() {
                    failure = Some(e);
                } else {
                    warn!(split = %split.id, error = %e, "Additional flow failure");
                }
            }
            Err(join_err) => {
                if failure.is_none() {
                    failure = Some(Error::Internal(format!("flow task failed: {}", join_err)));
                }
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    if terminated {
        return Ok(Walk::Terminated);
    }
    Ok(Walk::Finished(Some(UnitOutcome {
        batch_status: worst,
        exit_status: worst.as_str().to_string(),
        executions,
    })))
}
