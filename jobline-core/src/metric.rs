//! Step metrics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Counters kept per step and per partition execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    ReadCount,
    WriteCount,
    CommitCount,
    RollbackCount,
    ReadSkipCount,
    ProcessSkipCount,
    FilterCount,
    WriteSkipCount,
}

impl MetricType {
    pub const ALL: [MetricType; 8] = [
        MetricType::ReadCount,
        MetricType::WriteCount,
        MetricType::CommitCount,
        MetricType::RollbackCount,
        MetricType::ReadSkipCount,
        MetricType::ProcessSkipCount,
        MetricType::FilterCount,
        MetricType::WriteSkipCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::ReadCount => "read_count",
            MetricType::WriteCount => "write_count",
            MetricType::CommitCount => "commit_count",
            MetricType::RollbackCount => "rollback_count",
            MetricType::ReadSkipCount => "read_skip_count",
            MetricType::ProcessSkipCount => "process_skip_count",
            MetricType::FilterCount => "filter_count",
            MetricType::WriteSkipCount => "write_skip_count",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric counters; absent entries read as zero
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    counts: BTreeMap<MetricType, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: MetricType) -> u64 {
        self.counts.get(&metric).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, metric: MetricType, by: u64) {
        *self.counts.entry(metric).or_insert(0) += by;
    }

    pub fn set(&mut self, metric: MetricType, value: u64) {
        self.counts.insert(metric, value);
    }

    /// Add every counter of `other` into this set
    pub fn merge(&mut self, other: &Metrics) {
        for (metric, value) in &other.counts {
            self.increment(*metric, *value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricType, u64)> + '_ {
        MetricType::ALL.into_iter().map(|m| (m, self.get(m)))
    }
}
