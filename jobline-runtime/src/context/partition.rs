use super::{delegate_step_scope, JobContext, RecordCell, StepContext, UnitContext};
use async_trait::async_trait;
use crate::Error;
use jobline_core::{
    ArtifactRole, BatchStatus, CheckpointData, Metrics, PartitionCollector, PartitionExecution, Properties, Step, StepRecord,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Message a partition sends to its parent step
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionReport {
    /// Collector output, forwarded to the partition analyzer
    Data { partition_id: u32, data: CheckpointData },

    /// Final outcome of the partition
    Finished {
        partition_id: u32,
        batch_status: BatchStatus,
        exit_status: String,
        metrics: Metrics,
    },
}

impl PartitionReport {
    pub fn partition_id(&self) -> u32 {
        match self {
            PartitionReport::Data { partition_id, .. } | PartitionReport::Finished { partition_id, .. } => {
                *partition_id
            }
        }
    }
}

/// Runtime wrapper around one partition of a partitioned step.
///
/// Owns its own copy of the step definition and a forked job context, so
/// nothing it changes leaks into the parent or its siblings.
pub struct PartitionContext {
    job: JobContext,
    step: Arc<Step>,
    cell: RecordCell,
    collector: Mutex<Option<(String, Box<dyn PartitionCollector>)>>,
    reports: mpsc::UnboundedSender<PartitionReport>,
}

impl PartitionContext {
    pub fn new(
        parent: &StepContext,
        partition_id: u32,
        properties: &Properties,
        previous: Option<&PartitionExecution>,
        cancel: CancellationToken,
        reports: mpsc::UnboundedSender<PartitionReport>,
    ) -> crate::Result<Self> {
        let job = parent.job_context().fork(cancel);

        let parent_step = parent.step();
        let mut step = parent_step.clone();
        step.properties.extend(properties.clone());
        step.partition = None;

        let collector = match parent_step.partition.as_ref().and_then(|p| p.collector.as_deref()) {
            Some(name) => Some((
                name.to_string(),
                job.factory().partition_collector(name, &step.properties)?,
            )),
            None => None,
        };

        let mut record = PartitionExecution::new(&parent.execution(), partition_id);
        if let Some(previous) = previous {
            record.state.carry_forward_from(&previous.state);
            debug!(
                step = %step.id,
                partition = partition_id,
                "Carried partition checkpoints forward"
            );
        }

        Ok(Self {
            cell: RecordCell::new(StepRecord::Partition(record), job.codec().clone()),
            job,
            step: Arc::new(step),
            collector: Mutex::new(collector),
            reports,
        })
    }

    pub fn execution(&self) -> PartitionExecution {
        let record = self.cell.snapshot();
        PartitionExecution {
            step_execution_id: record.step_execution_id(),
            job_execution_id: record.job_execution_id(),
            step_name: record.step_name().to_string(),
            partition_id: self.partition_number(),
            state: record.state().clone(),
        }
    }

    /// Tell the parent how this partition ended.
    ///
    /// Returns false when the parent stopped listening.
    pub fn report_finished(&self) -> bool {
        let report = PartitionReport::Finished {
            partition_id: self.partition_number(),
            batch_status: self.cell.batch_status(),
            exit_status: self.cell.effective_exit_status(),
            metrics: self.cell.metrics(),
        };
        self.reports.send(report).is_ok()
    }

    fn partition_number(&self) -> u32 {
        self.cell.partition_id().unwrap_or_default()
    }
}

delegate_step_scope!(PartitionContext);

#[async_trait]
impl UnitContext for PartitionContext {
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

    async fn collect(&self) -> crate::Result<()> {
        let mut guard = self.collector.lock().await;
        let Some((name, collector)) = guard.as_mut() else {
            return Ok(());
        };

        let collected = collector
            .collect_partition_data(self)
            .await
            .map_err(|e| Error::collaborator(ArtifactRole::PartitionCollector, name, "collect_partition_data", e))?;
        if let Some(data) = collected {
            let report = PartitionReport::Data {
                partition_id: self.partition_number(),
                data,
            };
            if self.reports.send(report).is_err() {
                debug!(step = %self.step.id, "Parent no longer receiving partition data");
            }
        }
        Ok(())
    }
}
