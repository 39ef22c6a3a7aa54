//! Partitioned step execution
//!
//! The parent step resolves its plan, spawns one task per partition (bounded
//! by a [`ConcurrencyLimiter`]) and consumes the reports partitions send back
//! until every partition finished or the partition timeout elapsed.
//!
//! ```text
//!   parent step ──spawn──▶ partition 0 ─┐
//!        │     ──spawn──▶ partition 1 ─┼─ PartitionReport ──▶ analyzer
//!        │     ──spawn──▶ partition n ─┘
//!        ▼
//!   reducer: begin … before_completion / rollback … after_completion
//! ```

use crate::batchlet::run_batchlet;
use crate::chunk::run_chunk;
use crate::concurrency::ConcurrencyLimiter;
use crate::context::{PartitionContext, PartitionReport, StepContext, UnitContext};
use crate::metrics::PARTITION_OUTCOMES_TOTAL;
use crate::{Error, Result};
use jobline_core::{
    ArtifactRole, BatchStatus, PartitionAnalyzer, PartitionConfig, PartitionExecution, PartitionPlan,
    PartitionReducer, ReducerOutcome, StepKind, StepRecord, StepScope,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn, Instrument};

/// Consumes partition reports until every partition finished.
///
/// Reports already queued when the deadline passes are still delivered;
/// only an empty queue at the deadline counts as a timeout.
pub struct PartitionWaiter {
    rx: mpsc::UnboundedReceiver<PartitionReport>,
    pending: usize,
    deadline: Option<Instant>,
}

impl PartitionWaiter {
    pub fn new(rx: mpsc::UnboundedReceiver<PartitionReport>, pending: usize, deadline: Option<Instant>) -> Self {
        Self { rx, pending, deadline }
    }

    /// Partitions that have not reported a final outcome yet
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Next report, `None` once every partition finished
    pub async fn next(&mut self) -> Result<Option<PartitionReport>> {
        if self.pending == 0 {
            return Ok(None);
        }

        let received = match self.deadline {
            Some(deadline) => match timeout_at(deadline, self.rx.recv()).await {
                Ok(received) => received,
                Err(_) => match self.rx.try_recv() {
                    Ok(report) => Some(report),
                    Err(_) => {
                        return Err(Error::Timeout(format!(
                            "{} partitions still running at the partition timeout",
                            self.pending
                        )))
                    }
                },
            },
            None => self.rx.recv().await,
        };

        match received {
            Some(report) => {
                if matches!(report, PartitionReport::Finished { .. }) {
                    self.pending -= 1;
                }
                Ok(Some(report))
            }
            None => Err(Error::Internal(format!(
                "{} partitions ended without reporting an outcome",
                self.pending
            ))),
        }
    }
}

/// Run a partitioned step and set its status to the worst partition outcome
pub async fn run_partitioned(ctx: &StepContext) -> Result<()> {
    let step = ctx.step();
    let config = step
        .partition
        .as_ref()
        .ok_or_else(|| Error::Execution(format!("step {} is not partitioned", step.id)))?;
    let factory = ctx.job_context().factory();

    let plan = resolve_plan(ctx, config).await?;
    plan.validate()
        .map_err(|reason| Error::Execution(format!("invalid partition plan for step {}: {}", step.id, reason)))?;

    let mut analyzer = match config.analyzer.as_deref() {
        Some(name) => Some((name, factory.partition_analyzer(name, &step.properties)?)),
        None => None,
    };
    let mut reducer = match config.reducer.as_deref() {
        Some(name) => Some((name, factory.partition_reducer(name, &step.properties)?)),
        None => None,
    };

    if let Some((name, reducer)) = reducer.as_mut() {
        reducer
            .begin(ctx)
            .await
            .map_err(|e| Error::collaborator(ArtifactRole::PartitionReducer, *name, "begin", e))?;
    }

    let result = run_plan(ctx, config, &plan, &mut analyzer).await;
    let committed = matches!(result, Ok(status) if status != BatchStatus::Failed);

    let reduced = match reducer.as_mut() {
        Some((name, reducer)) => complete_reducer(ctx, name, &mut **reducer, committed).await,
        None => Ok(()),
    };

    match (result, reduced) {
        (Ok(status), Ok(())) => {
            info!(step = %step.id, status = %status, "Partitioned step finished");
            ctx.cell().set_batch_status(status);
            Ok(())
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(e), reduced) => {
            if let Err(reducer_err) = reduced {
                warn!(step = %step.id, error = %reducer_err, "Reducer failed after partition failure");
            }
            Err(e)
        }
    }
}

async fn resolve_plan(ctx: &StepContext, config: &PartitionConfig) -> Result<PartitionPlan> {
    let step = ctx.step();
    match (config.mapper.as_deref(), &config.plan) {
        (Some(name), _) => {
            let mapper = ctx.job_context().factory().partition_mapper(name, &step.properties)?;
            mapper
                .map_partitions(ctx)
                .await
                .map_err(|e| Error::collaborator(ArtifactRole::PartitionMapper, name, "map_partitions", e))
        }
        (None, Some(plan)) => Ok(plan.clone()),
        (None, None) => Err(Error::Execution(format!(
            "step {} has neither a partition plan nor a mapper",
            step.id
        ))),
    }
}

async fn complete_reducer(
    ctx: &StepContext,
    name: &str,
    reducer: &mut dyn PartitionReducer,
    committed: bool,
) -> Result<()> {
    let fail = |phase: &str, e: anyhow::Error| Error::collaborator(ArtifactRole::PartitionReducer, name, phase, e);

    if committed {
        reducer
            .before_completion(ctx)
            .await
            .map_err(|e| fail("before_completion", e))?;
        reducer
            .after_completion(ctx, ReducerOutcome::Commit)
            .await
            .map_err(|e| fail("after_completion", e))
    } else {
        reducer.rollback(ctx).await.map_err(|e| fail("rollback", e))?;
        reducer
            .after_completion(ctx, ReducerOutcome::Rollback)
            .await
            .map_err(|e| fail("after_completion", e))
    }
}

/// Run every partition of the plan; returns the worst partition status
async fn run_plan(
    ctx: &StepContext,
    config: &PartitionConfig,
    plan: &PartitionPlan,
    analyzer: &mut Option<(&str, Box<dyn PartitionAnalyzer>)>,
) -> Result<BatchStatus> {
    let job = ctx.job_context();
    let step = ctx.step();

    let previous: HashMap<u32, PartitionExecution> = match ctx.original() {
        Some(original) if !plan.override_previous => job
            .repository()
            .partition_executions(original.id)
            .await?
            .into_iter()
            .map(|p| (p.partition_id, p))
            .collect(),
        _ => HashMap::new(),
    };

    let mut worst = BatchStatus::Completed;
    let parent = ctx.execution();
    for completed in previous
        .values()
        .filter(|p| p.state.batch_status == BatchStatus::Completed && p.partition_id < plan.partitions)
    {
        let mut copy = PartitionExecution::new(&parent, completed.partition_id);
        copy.state = completed.state.clone();
        job.repository()
            .save_persistent_data(&job.execution(), &StepRecord::Partition(copy))
            .await?;
        ctx.cell().update_metrics(|m| m.merge(&completed.state.metrics));
        debug!(step = %step.id, partition = completed.partition_id, "Partition completed previously, not rerun");
    }

    let threads = plan
        .effective_threads()
        .min(u32::try_from(job.config().max_partition_threads).unwrap_or(u32::MAX))
        .max(1);
    let limiter = ConcurrencyLimiter::new(threads as usize);
    let cancel = ctx.cancel_token().child_token();
    let (tx, rx) = mpsc::unbounded_channel();

    let mut pending = 0usize;
    for partition_id in 0..plan.partitions {
        let previous = previous.get(&partition_id);
        if previous.is_some_and(|p| p.state.batch_status == BatchStatus::Completed) {
            continue;
        }

        let partition = PartitionContext::new(
            ctx,
            partition_id,
            &plan.properties_for(partition_id),
            previous,
            cancel.clone(),
            tx.clone(),
        )?;
        spawn_partition(partition, limiter.clone());
        pending += 1;
    }
    drop(tx);

    info!(
        step = %step.id,
        partitions = plan.partitions,
        running = pending,
        threads,
        "Partitions started"
    );

    let timeout = config
        .timeout_seconds
        .map(Duration::from_secs)
        .or(job.options().partition_timeout);
    let mut waiter = PartitionWaiter::new(rx, pending, timeout.map(|t| Instant::now() + t));

    loop {
        let report = match waiter.next().await {
            Ok(Some(report)) => report,
            Ok(None) => break,
            Err(e) => {
                if e.is_timeout() {
                    PARTITION_OUTCOMES_TOTAL
                        .with_label_values(&["TIMED_OUT"])
                        .inc_by(waiter.pending() as u64);
                }
                error!(step = %step.id, pending = waiter.pending(), error = %e, "Abandoning in-flight partitions");
                cancel.cancel();
                limiter.close();
                return Err(e);
            }
        };

        match report {
            PartitionReport::Data { partition_id, data } => {
                if let Some((name, analyzer)) = analyzer.as_mut() {
                    if let Err(e) = analyzer.analyze_collector_data(ctx, data).await {
                        cancel.cancel();
                        return Err(Error::collaborator(
                            ArtifactRole::PartitionAnalyzer,
                            *name,
                            "analyze_collector_data",
                            e,
                        ));
                    }
                } else {
                    debug!(step = %step.id, partition = partition_id, "Collector data dropped, no analyzer");
                }
            }
            PartitionReport::Finished {
                partition_id,
                batch_status,
                exit_status,
                metrics,
            } => {
                PARTITION_OUTCOMES_TOTAL
                    .with_label_values(&[batch_status.as_str()])
                    .inc();
                debug!(step = %step.id, partition = partition_id, status = %batch_status, "Partition finished");

                worst = worst.worst(batch_status);
                ctx.cell().update_metrics(|m| m.merge(&metrics));
                if let Some((name, analyzer)) = analyzer.as_mut() {
                    if let Err(e) = analyzer.analyze_status(ctx, batch_status, &exit_status).await {
                        cancel.cancel();
                        return Err(Error::collaborator(
                            ArtifactRole::PartitionAnalyzer,
                            *name,
                            "analyze_status",
                            e,
                        ));
                    }
                }
            }
        }
    }

    Ok(worst)
}

/// Spawn the partition; if its task panics, record and report FAILED on its behalf
fn spawn_partition(partition: PartitionContext, limiter: ConcurrencyLimiter) {
    let partition = Arc::new(partition);
    let partition_id = partition.partition_id().unwrap_or_default();
    let span = tracing::info_span!("partition", step = %partition.step_name(), partition = partition_id);

    tokio::spawn(async move {
        let handle = tokio::spawn(run_partition(Arc::clone(&partition), limiter).instrument(span));
        if let Err(e) = handle.await {
            error!(partition = partition_id, error = %e, "Partition task panicked");
            partition
                .cell()
                .record_failure(&anyhow::anyhow!("partition {} task panicked: {}", partition_id, e));
            if let Err(e) = partition.save(true).await {
                error!(partition = partition_id, error = %e, "Failed to persist panicked partition");
            }
            partition.report_finished();
        }
    });
}

async fn run_partition(ctx: Arc<PartitionContext>, limiter: ConcurrencyLimiter) {
    let ctx = &*ctx;
    let result = match limiter.acquire().await {
        Ok(_permit) => execute_partition(ctx).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        warn!(error = %e, "Partition failed");
        ctx.cell().record_failure(&anyhow::Error::msg(e.to_string()));
    }
    match ctx.cell().batch_status() {
        BatchStatus::Started => {
            ctx.cell().set_batch_status(BatchStatus::Completed);
        }
        BatchStatus::Stopping => {
            ctx.cell().set_batch_status(BatchStatus::Stopped);
        }
        _ => {}
    }

    if let Err(e) = ctx.save(true).await {
        error!(error = %e, "Failed to persist partition outcome");
    }
    if !ctx.report_finished() {
        debug!("Parent step no longer waiting for this partition");
    }
}

async fn execute_partition(ctx: &PartitionContext) -> Result<()> {
    if ctx.cancel_token().is_cancelled() {
        ctx.cell().set_batch_status(BatchStatus::Stopping);
        return Ok(());
    }

    ctx.cell().set_batch_status(BatchStatus::Started);
    ctx.save(true).await?;

    match &ctx.step().kind {
        StepKind::Chunk { .. } => run_chunk(ctx).await?,
        StepKind::Batchlet { .. } => run_batchlet(ctx).await?,
    }
    ctx.collect().await
}
