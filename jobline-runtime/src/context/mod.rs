//! Execution context hierarchy
//!
//! A [`JobContext`] wraps the running job execution; a [`StepContext`] wraps a
//! step execution within it; a [`PartitionContext`] wraps one partition of a
//! partitioned step and is built from its parent step context. Contexts live
//! as long as the job runner that created them.
//!
//! Step and partition contexts share their record handling through
//! [`RecordCell`] and expose the same surface to step logic through
//! [`StepScope`](jobline_core::StepScope).

mod job;
mod partition;
mod step;

pub use job::{JobContext, RuntimeServices};
pub use partition::{PartitionContext, PartitionReport};
pub use step::StepContext;

use async_trait::async_trait;
use chrono::Utc;
use jobline_core::{
    BatchFailure, BatchStatus, CheckpointData, Metrics, PayloadCodec, Step, StepRecord, StepScope,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A step or partition record plus the codec its payloads go through
pub struct RecordCell {
    record: Mutex<StepRecord>,
    codec: PayloadCodec,
}

impl RecordCell {
    pub fn new(record: StepRecord, codec: PayloadCodec) -> Self {
        Self {
            record: Mutex::new(record),
            codec,
        }
    }

    pub fn snapshot(&self) -> StepRecord {
        self.record.lock().clone()
    }

    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    pub fn partition_id(&self) -> Option<u32> {
        self.record.lock().partition_id()
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.record.lock().state().batch_status
    }

    /// Apply a status change the state machine allows; refuse and log anything else
    pub fn set_batch_status(&self, to: BatchStatus) -> bool {
        let mut record = self.record.lock();
        let from = record.state().batch_status;
        if !from.can_transition_to(to) {
            warn!(
                step = %record.step_name(),
                partition = ?record.partition_id(),
                from = %from,
                to = %to,
                "Refusing invalid batch status transition"
            );
            return false;
        }

        let state = record.state_mut();
        state.batch_status = to;
        if to == BatchStatus::Started && state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            state.ended_at = Some(Utc::now());
        }
        true
    }

    pub fn exit_status(&self) -> Option<String> {
        self.record.lock().state().exit_status.clone()
    }

    pub fn effective_exit_status(&self) -> String {
        self.record.lock().state().effective_exit_status()
    }

    pub fn set_exit_status(&self, status: &str) {
        self.record.lock().state_mut().exit_status = Some(status.to_string());
    }

    pub fn persistent_user_data(&self) -> Option<CheckpointData> {
        self.record.lock().state().persistent_user_data.clone()
    }

    pub fn set_persistent_user_data(&self, data: Option<CheckpointData>) {
        self.record.lock().state_mut().persistent_user_data = data;
    }

    pub fn reader_checkpoint(&self) -> Option<CheckpointData> {
        self.record.lock().state().reader_checkpoint.clone()
    }

    pub fn writer_checkpoint(&self) -> Option<CheckpointData> {
        self.record.lock().state().writer_checkpoint.clone()
    }

    pub fn set_checkpoints(&self, reader: Option<CheckpointData>, writer: Option<CheckpointData>) {
        let mut record = self.record.lock();
        let state = record.state_mut();
        state.reader_checkpoint = reader;
        state.writer_checkpoint = writer;
    }

    pub fn metrics(&self) -> Metrics {
        self.record.lock().state().metrics.clone()
    }

    pub fn update_metrics(&self, update: impl FnOnce(&mut Metrics)) {
        update(&mut self.record.lock().state_mut().metrics);
    }

    pub fn exception(&self) -> Option<BatchFailure> {
        let data = self.record.lock().state().exception.clone()?;
        match self.codec.decode::<BatchFailure>(&data) {
            Ok(failure) => Some(failure),
            Err(e) => {
                warn!(error = %e, "Stored exception data could not be decoded");
                None
            }
        }
    }

    /// Store the failure as exception data and move to FAILED
    pub fn record_failure(&self, err: &anyhow::Error) {
        let failure = BatchFailure::from_error(err);
        match self.codec.encode(failure) {
            Ok(data) => self.record.lock().state_mut().exception = Some(data),
            Err(e) => warn!(error = %e, "Failed to encode exception data"),
        }
        self.set_batch_status(BatchStatus::Failed);
    }

    /// Persist through the repository.
    ///
    /// With `always == false` the write is skipped while this record or its
    /// stored copy is STOPPING; returns whether anything was written.
    pub async fn save(&self, job: &JobContext, always: bool) -> crate::Result<bool> {
        let record = self.snapshot();
        let execution = job.execution();
        let repository = job.repository();

        if always {
            repository.save_persistent_data(&execution, &record).await?;
            Ok(true)
        } else {
            Ok(repository
                .save_persistent_data_if_not_stopping(&execution, &record)
                .await?)
        }
    }
}

/// What the chunk and batchlet runners need from the unit they run in
#[async_trait]
pub trait UnitContext: StepScope + Sized {
    fn job_context(&self) -> &JobContext;

    /// Step definition as seen by this unit
    fn step(&self) -> &Step;

    fn cell(&self) -> &RecordCell;

    /// Signalled when this unit should stop at its next checkpoint boundary
    fn cancel_token(&self) -> &CancellationToken;

    /// Hook run after every chunk and when the unit ends
    async fn collect(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn save(&self, always: bool) -> crate::Result<bool> {
        self.cell().save(self.job_context(), always).await
    }
}

macro_rules! delegate_step_scope {
    ($ty:ty) => {
        impl jobline_core::StepScope for $ty {
            fn job(&self) -> &dyn jobline_core::JobScope {
                &self.job
            }

            fn step_name(&self) -> &str {
                &self.step.id
            }

            fn partition_id(&self) -> Option<u32> {
                self.cell.partition_id()
            }

            fn batch_status(&self) -> jobline_core::BatchStatus {
                self.cell.batch_status()
            }

            fn set_batch_status(&self, status: jobline_core::BatchStatus) {
                self.cell.set_batch_status(status);
            }

            fn exit_status(&self) -> Option<String> {
                self.cell.exit_status()
            }

            fn set_exit_status(&self, status: &str) {
                self.cell.set_exit_status(status);
            }

            fn properties(&self) -> &jobline_core::Properties {
                &self.step.properties
            }

            fn persistent_user_data(&self) -> Option<jobline_core::CheckpointData> {
                self.cell.persistent_user_data()
            }

            fn set_persistent_user_data(&self, data: Option<jobline_core::CheckpointData>) {
                self.cell.set_persistent_user_data(data);
            }

            fn metrics(&self) -> jobline_core::Metrics {
                self.cell.metrics()
            }

            fn exception(&self) -> Option<jobline_core::BatchFailure> {
                self.cell.exception()
            }

            fn codec(&self) -> &jobline_core::PayloadCodec {
                self.cell.codec()
            }
        }
    };
}

pub(crate) use delegate_step_scope;
