//! Partition configuration
//!
//! A partitioned step runs the same step body once per partition, each slice
//! seeing its own properties merged over the step's. The plan comes either
//! from a static [`PartitionPlan`] or from a `PartitionMapper` artifact
//! resolved at run time.
//!
//! # Example
//!
//! ```
//! use jobline_core::partition::{PartitionConfig, PartitionPlan};
//!
//! let config = PartitionConfig::with_plan(
//!     PartitionPlan::new(3)
//!         .with_threads(2)
//!         .with_partition_property(0, "range", "0-99"),
//! )
//! .with_collector("row_counter")
//! .with_timeout_seconds(30);
//!
//! let plan = config.plan.as_ref().unwrap();
//! assert_eq!(plan.effective_threads(), 2);
//! assert_eq!(plan.properties_for(0).get("range").map(String::as_str), Some("0-99"));
//! assert!(plan.properties_for(2).is_empty());
//! ```

use crate::job::Properties;
use serde::{Deserialize, Serialize};

/// How many partitions to run, how many at once, and what each one sees
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub partitions: u32,

    /// Concurrent partitions; defaults to the partition count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,

    /// Rerun every partition on restart instead of only the unfinished ones
    #[serde(default)]
    pub override_previous: bool,

    /// Properties per partition, indexed by partition id
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition_properties: Vec<Properties>,
}

impl PartitionPlan {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            ..Default::default()
        }
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_override_previous(mut self, override_previous: bool) -> Self {
        self.override_previous = override_previous;
        self
    }

    pub fn with_partition_property(
        mut self,
        partition: u32,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let index = partition as usize;
        if self.partition_properties.len() <= index {
            self.partition_properties.resize_with(index + 1, Properties::new);
        }
        self.partition_properties[index].insert(key.into(), value.into());
        self
    }

    pub fn effective_threads(&self) -> u32 {
        self.threads.unwrap_or(self.partitions).max(1)
    }

    pub fn properties_for(&self, partition: u32) -> Properties {
        self.partition_properties
            .get(partition as usize)
            .cloned()
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.partitions == 0 {
            return Err("partition plan must have at least one partition".to_string());
        }
        if self.threads == Some(0) {
            return Err("partition plan thread count must be positive".to_string());
        }
        if self.partition_properties.len() > self.partitions as usize {
            return Err(format!(
                "partition plan has properties for {} partitions but only {} partitions",
                self.partition_properties.len(),
                self.partitions
            ));
        }
        Ok(())
    }
}

/// Partitioning of one step: where the plan comes from and which artifacts
/// aggregate the partitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Static plan, used when no mapper is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PartitionPlan>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapper: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<String>,

    /// Wins over the `jobline.partition.timeout.seconds` parameter when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl PartitionConfig {
    pub fn with_plan(plan: PartitionPlan) -> Self {
        Self {
            plan: Some(plan),
            ..Default::default()
        }
    }

    pub fn with_mapper(mapper: impl Into<String>) -> Self {
        Self {
            mapper: Some(mapper.into()),
            ..Default::default()
        }
    }

    pub fn with_collector(mut self, collector: impl Into<String>) -> Self {
        self.collector = Some(collector.into());
        self
    }

    pub fn with_analyzer(mut self, analyzer: impl Into<String>) -> Self {
        self.analyzer = Some(analyzer.into());
        self
    }

    pub fn with_reducer(mut self, reducer: impl Into<String>) -> Self {
        self.reducer = Some(reducer.into());
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}
