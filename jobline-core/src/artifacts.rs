//! Collaborator contracts and the artifact registry
//!
//! Step logic plugs into the engine through one trait per role. The engine
//! asks an [`ArtifactFactory`] for a fresh instance by reference name each
//! time a step, partition or job needs one, passing the properties in scope
//! so the artifact can configure itself.
//!
//! Collaborators report failures as `anyhow::Error`; the runner turns them
//! into FAILED status and stores a [`BatchFailure`](crate::checkpoint::BatchFailure).

use crate::checkpoint::CheckpointData;
use crate::execution::StepExecution;
use crate::job::Properties;
use crate::partition::PartitionPlan;
use crate::scope::{JobScope, StepScope};
use crate::status::BatchStatus;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Unit of data flowing through a chunk step
pub type Item = serde_json::Value;

#[async_trait]
pub trait ItemReader: Send {
    /// Position the reader; `checkpoint` is what it reported before a restart
    async fn open(&mut self, _scope: &dyn StepScope, _checkpoint: Option<&CheckpointData>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Next item, or `None` when the input is exhausted
    async fn read_item(&mut self) -> anyhow::Result<Option<Item>>;

    async fn checkpoint_info(&mut self, _scope: &dyn StepScope) -> anyhow::Result<Option<CheckpointData>> {
        Ok(None)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ItemProcessor: Send {
    /// Transform an item; `None` filters it out of the chunk
    async fn process_item(&mut self, item: Item) -> anyhow::Result<Option<Item>>;
}

#[async_trait]
pub trait ItemWriter: Send {
    async fn open(&mut self, _scope: &dyn StepScope, _checkpoint: Option<&CheckpointData>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn write_items(&mut self, items: Vec<Item>) -> anyhow::Result<()>;

    async fn checkpoint_info(&mut self, _scope: &dyn StepScope) -> anyhow::Result<Option<CheckpointData>> {
        Ok(None)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A task-oriented step body
#[async_trait]
pub trait Batchlet: Send + Sync {
    /// Run the task; the returned value becomes the step exit status
    async fn process(&self, scope: &dyn StepScope) -> anyhow::Result<Option<String>>;

    /// Called once if a stop is requested while `process` is running
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait JobListener: Send + Sync {
    async fn before_job(&self, _job: &dyn JobScope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_job(&self, _job: &dyn JobScope) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait StepListener: Send + Sync {
    async fn before_step(&self, _step: &dyn StepScope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_step(&self, _step: &dyn StepScope) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Chooses the exit status a decision routes on
#[async_trait]
pub trait Decider: Send + Sync {
    /// `executions` are the last executions that led to the decision: one
    /// step, or every step that ended the flows of a split
    async fn decide(&self, job: &dyn JobScope, executions: &[StepExecution]) -> anyhow::Result<String>;
}

/// Computes the partition plan of a step at run time
#[async_trait]
pub trait PartitionMapper: Send + Sync {
    async fn map_partitions(&self, step: &dyn StepScope) -> anyhow::Result<PartitionPlan>;
}

/// Runs inside each partition, after every chunk and when the partition ends
#[async_trait]
pub trait PartitionCollector: Send {
    async fn collect_partition_data(&mut self, partition: &dyn StepScope) -> anyhow::Result<Option<CheckpointData>>;
}

/// Runs in the parent step, receiving what the partitions report
#[async_trait]
pub trait PartitionAnalyzer: Send {
    async fn analyze_collector_data(&mut self, _step: &dyn StepScope, _data: CheckpointData) -> anyhow::Result<()> {
        Ok(())
    }

    async fn analyze_status(
        &mut self,
        _step: &dyn StepScope,
        _batch_status: BatchStatus,
        _exit_status: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Outcome passed to [`PartitionReducer::after_completion`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerOutcome {
    Commit,
    Rollback,
}

/// Brackets a partitioned step
#[async_trait]
pub trait PartitionReducer: Send {
    async fn begin(&mut self, _step: &dyn StepScope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_completion(&mut self, _step: &dyn StepScope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn rollback(&mut self, _step: &dyn StepScope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_completion(&mut self, _step: &dyn StepScope, _outcome: ReducerOutcome) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Collaborator roles, used when reporting unresolvable references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactRole {
    ItemReader,
    ItemProcessor,
    ItemWriter,
    Batchlet,
    JobListener,
    StepListener,
    Decider,
    PartitionMapper,
    PartitionCollector,
    PartitionAnalyzer,
    PartitionReducer,
}

impl fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactRole::ItemReader => "item reader",
            ArtifactRole::ItemProcessor => "item processor",
            ArtifactRole::ItemWriter => "item writer",
            ArtifactRole::Batchlet => "batchlet",
            ArtifactRole::JobListener => "job listener",
            ArtifactRole::StepListener => "step listener",
            ArtifactRole::Decider => "decider",
            ArtifactRole::PartitionMapper => "partition mapper",
            ArtifactRole::PartitionCollector => "partition collector",
            ArtifactRole::PartitionAnalyzer => "partition analyzer",
            ArtifactRole::PartitionReducer => "partition reducer",
        };
        f.write_str(name)
    }
}

/// Produces collaborators by reference name
pub trait ArtifactFactory: Send + Sync {
    fn item_reader(&self, name: &str, properties: &Properties) -> Result<Box<dyn ItemReader>>;

    fn item_processor(&self, name: &str, properties: &Properties) -> Result<Box<dyn ItemProcessor>>;

    fn item_writer(&self, name: &str, properties: &Properties) -> Result<Box<dyn ItemWriter>>;

    fn batchlet(&self, name: &str, properties: &Properties) -> Result<Arc<dyn Batchlet>>;

    fn job_listener(&self, name: &str, properties: &Properties) -> Result<Arc<dyn JobListener>>;

    fn step_listener(&self, name: &str, properties: &Properties) -> Result<Arc<dyn StepListener>>;

    fn decider(&self, name: &str, properties: &Properties) -> Result<Arc<dyn Decider>>;

    fn partition_mapper(&self, name: &str, properties: &Properties) -> Result<Arc<dyn PartitionMapper>>;

    fn partition_collector(&self, name: &str, properties: &Properties) -> Result<Box<dyn PartitionCollector>>;

    fn partition_analyzer(&self, name: &str, properties: &Properties) -> Result<Box<dyn PartitionAnalyzer>>;

    fn partition_reducer(&self, name: &str, properties: &Properties) -> Result<Box<dyn PartitionReducer>>;
}

type Ctor<T> = Arc<dyn Fn(&Properties) -> T + Send + Sync>;

#[derive(Clone)]
enum Constructor {
    ItemReader(Ctor<Box<dyn ItemReader>>),
    ItemProcessor(Ctor<Box<dyn ItemProcessor>>),
    ItemWriter(Ctor<Box<dyn ItemWriter>>),
    Batchlet(Ctor<Arc<dyn Batchlet>>),
    JobListener(Ctor<Arc<dyn JobListener>>),
    StepListener(Ctor<Arc<dyn StepListener>>),
    Decider(Ctor<Arc<dyn Decider>>),
    PartitionMapper(Ctor<Arc<dyn PartitionMapper>>),
    PartitionCollector(Ctor<Box<dyn PartitionCollector>>),
    PartitionAnalyzer(Ctor<Box<dyn PartitionAnalyzer>>),
    PartitionReducer(Ctor<Box<dyn PartitionReducer>>),
}

/// Name-to-constructor table implementing [`ArtifactFactory`].
///
/// Uses blocking locks; registration happens at startup, lookups copy the
/// constructor out before calling it.
#[derive(Clone, Default)]
pub struct ArtifactRegistry {
    inner: Arc<RwLock<HashMap<(ArtifactRole, String), Constructor>>>,
}

macro_rules! registry_role {
    ($register:ident, $lookup:ident, $variant:ident, $out:ty) => {
        pub fn $register<F>(&self, name: impl Into<String>, ctor: F) -> Result<()>
        where
            F: Fn(&Properties) -> $out + Send + Sync + 'static,
        {
            self.insert(ArtifactRole::$variant, name.into(), Constructor::$variant(Arc::new(ctor)))
        }

        fn $lookup(&self, name: &str, properties: &Properties) -> Result<$out> {
            match self.get(ArtifactRole::$variant, name)? {
                Constructor::$variant(ctor) => Ok(ctor(properties)),
                _ => Err(Error::Internal(format!(
                    "artifact {} registered under the wrong role",
                    name
                ))),
            }
        }
    };
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    registry_role!(register_item_reader, lookup_item_reader, ItemReader, Box<dyn ItemReader>);
    registry_role!(register_item_processor, lookup_item_processor, ItemProcessor, Box<dyn ItemProcessor>);
    registry_role!(register_item_writer, lookup_item_writer, ItemWriter, Box<dyn ItemWriter>);
    registry_role!(register_batchlet, lookup_batchlet, Batchlet, Arc<dyn Batchlet>);
    registry_role!(register_job_listener, lookup_job_listener, JobListener, Arc<dyn JobListener>);
    registry_role!(register_step_listener, lookup_step_listener, StepListener, Arc<dyn StepListener>);
    registry_role!(register_decider, lookup_decider, Decider, Arc<dyn Decider>);
    registry_role!(register_partition_mapper, lookup_partition_mapper, PartitionMapper, Arc<dyn PartitionMapper>);
    registry_role!(
        register_partition_collector,
        lookup_partition_collector,
        PartitionCollector,
        Box<dyn PartitionCollector>
    );
    registry_role!(
        register_partition_analyzer,
        lookup_partition_analyzer,
        PartitionAnalyzer,
        Box<dyn PartitionAnalyzer>
    );
    registry_role!(
        register_partition_reducer,
        lookup_partition_reducer,
        PartitionReducer,
        Box<dyn PartitionReducer>
    );

    pub fn contains(&self, role: ArtifactRole, name: &str) -> bool {
        self.inner
            .read()
            .map(|inner| inner.contains_key(&(role, name.to_string())))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, role: ArtifactRole, name: String, ctor: Constructor) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| Error::Internal("artifact registry lock poisoned".to_string()))?;

        let key = (role, name);
        if inner.contains_key(&key) {
            return Err(Error::DuplicateArtifact {
                role: key.0.to_string(),
                name: key.1,
            });
        }
        inner.insert(key, ctor);
        Ok(())
    }

    fn get(&self, role: ArtifactRole, name: &str) -> Result<Constructor> {
        let inner = self
            .inner
            .read()
            .map_err(|_| Error::Internal("artifact registry lock poisoned".to_string()))?;

        inner
            .get(&(role, name.to_string()))
            .cloned()
            .ok_or_else(|| Error::ArtifactNotFound {
                role: role.to_string(),
                name: name.to_string(),
            })
    }
}

impl ArtifactFactory for ArtifactRegistry {
    fn item_reader(&self, name: &str, properties: &Properties) -> Result<Box<dyn ItemReader>> {
        self.lookup_item_reader(name, properties)
    }

    fn item_processor(&self, name: &str, properties: &Properties) -> Result<Box<dyn ItemProcessor>> {
        self.lookup_item_processor(name, properties)
    }

    fn item_writer(&self, name: &str, properties: &Properties) -> Result<Box<dyn ItemWriter>> {
        self.lookup_item_writer(name, properties)
    }

    fn batchlet(&self, name: &str, properties: &Properties) -> Result<Arc<dyn Batchlet>> {
        self.lookup_batchlet(name, properties)
    }

    fn job_listener(&self, name: &str, properties: &Properties) -> Result<Arc<dyn JobListener>> {
        self.lookup_job_listener(name, properties)
    }

    fn step_listener(&self, name: &str, properties: &Properties) -> Result<Arc<dyn StepListener>> {
        self.lookup_step_listener(name, properties)
    }

    fn decider(&self, name: &str, properties: &Properties) -> Result<Arc<dyn Decider>> {
        self.lookup_decider(name, properties)
    }

    fn partition_mapper(&self, name: &str, properties: &Properties) -> Result<Arc<dyn PartitionMapper>> {
        self.lookup_partition_mapper(name, properties)
    }

    fn partition_collector(&self, name: &str, properties: &Properties) -> Result<Box<dyn PartitionCollector>> {
        self.lookup_partition_collector(name, properties)
    }

    fn partition_analyzer(&self, name: &str, properties: &Properties) -> Result<Box<dyn PartitionAnalyzer>> {
        self.lookup_partition_analyzer(name, properties)
    }

    fn partition_reducer(&self, name: &str, properties: &Properties) -> Result<Box<dyn PartitionReducer>> {
        self.lookup_partition_reducer(name, properties)
    }
}
