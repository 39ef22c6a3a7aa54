//! Prometheus metrics for repository operations
//!
//! This module defines metrics for:
//! - Repository operation latency
//! - Checkpoint saves skipped because a stop is in progress

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter, HistogramTimer, HistogramVec, IntCounter};

lazy_static! {
    /// Repository operation latency
    ///
    /// Labels:
    /// - operation: Repository method name (e.g., "save_persistent_data")
    pub static ref REPOSITORY_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "jobline_repository_operation_duration_seconds",
        "Repository operation duration in seconds",
        &["operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .expect("Failed to register repository_operation_duration metric");

    /// Conditional saves that were skipped
    ///
    /// Incremented when `save_persistent_data_if_not_stopping` finds the
    /// incoming or the stored record STOPPING.
    pub static ref CHECKPOINT_SAVES_SKIPPED_TOTAL: IntCounter = register_int_counter!(
        "jobline_repository_checkpoint_saves_skipped_total",
        "Total number of checkpoint saves skipped while stopping"
    )
    .expect("Failed to register checkpoint_saves_skipped_total metric");
}

/// Start timing a repository operation; the sample is recorded on drop
pub fn time_operation(operation: &str) -> HistogramTimer {
    REPOSITORY_OPERATION_DURATION
        .with_label_values(&[operation])
        .start_timer()
}
