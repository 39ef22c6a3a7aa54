//! Prometheus metrics for Jobline runtime operations
//!
//! This module defines metrics for tracking job, step and partition outcomes.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec, IntCounterVec, IntGauge,
};

lazy_static! {
    /// Total number of finished job executions
    ///
    /// Labels:
    /// - status: final batch status ("COMPLETED", "FAILED", "STOPPED")
    pub static ref JOB_EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "jobline_job_executions_total",
        "Total number of finished job executions",
        &["status"]
    )
    .expect("jobline_job_executions_total metric registration");

    /// Job executions currently running in this process
    pub static ref ACTIVE_JOB_EXECUTIONS: IntGauge = register_int_gauge!(
        "jobline_active_job_executions",
        "Job executions currently running in this process"
    )
    .expect("jobline_active_job_executions metric registration");

    /// Duration of step executions in seconds
    ///
    /// Labels:
    /// - kind: "batchlet", "chunk", "partitioned"
    /// - status: final batch status of the step
    ///
    /// Buckets: 10ms to 1h
    pub static ref STEP_DURATION: HistogramVec = register_histogram_vec!(
        "jobline_step_duration_seconds",
        "Duration of step executions",
        &["kind", "status"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
    )
    .expect("jobline_step_duration_seconds metric registration");

    /// Total number of finished partitions
    ///
    /// Labels:
    /// - status: final batch status of the partition, or "TIMED_OUT" for
    ///   partitions abandoned at the partition timeout
    pub static ref PARTITION_OUTCOMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "jobline_partition_outcomes_total",
        "Total number of finished partitions",
        &["status"]
    )
    .expect("jobline_partition_outcomes_total metric registration");

    /// Total number of committed chunks
    ///
    /// Labels:
    /// - persisted: "true" if the checkpoint was saved, "false" if skipped while stopping
    pub static ref CHUNKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "jobline_chunks_total",
        "Total number of committed chunks",
        &["persisted"]
    )
    .expect("jobline_chunks_total metric registration");
}
