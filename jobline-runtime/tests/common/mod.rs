//! Shared collaborators for runtime integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use jobline_core::{
    ArtifactRegistry, Batchlet, CheckpointData, Decider, Item, ItemReader, ItemWriter, JobListener, JobScope,
    PartitionAnalyzer, PartitionCollector, PartitionReducer, Properties, ReducerOutcome, StepExecution, StepScope,
    StepScopeExt,
};
use jobline_runtime::{JobOperator, RuntimeConfig};
use jobline_storage::InMemoryRepository;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Everything the collaborators observed, in order
#[derive(Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Switches tests flip between runs
#[derive(Clone, Default)]
pub struct Switches {
    pub fail_batchlet: Arc<AtomicBool>,
    pub fail_read_at: Arc<AtomicUsize>,
}

pub struct Harness {
    pub operator: JobOperator,
    pub registry: ArtifactRegistry,
    pub repository: Arc<InMemoryRepository>,
    pub journal: Journal,
    pub written: Arc<Mutex<Vec<Item>>>,
    pub switches: Switches,
}

impl Harness {
    pub fn new() -> Self {
        let registry = ArtifactRegistry::new();
        let repository = Arc::new(InMemoryRepository::new());
        let operator = JobOperator::new(repository.clone(), Arc::new(registry.clone()), RuntimeConfig::default());

        let harness = Self {
            operator,
            registry,
            repository,
            journal: Journal::default(),
            written: Arc::new(Mutex::new(Vec::new())),
            switches: Switches::default(),
        };
        harness.switches.fail_read_at.store(usize::MAX, Ordering::SeqCst);
        harness.register_artifacts();
        harness
    }

    fn register_artifacts(&self) {
        let journal = self.journal.clone();
        self.registry
            .register_batchlet("record", move |props| {
                Arc::new(Recording {
                    journal: journal.clone(),
                    exit_status: props.get("exit_status").cloned(),
                    fail: props.get("fail").is_some_and(|v| v == "true"),
                }) as Arc<dyn Batchlet>
            })
            .unwrap();

        let journal = self.journal.clone();
        let fail = self.switches.fail_batchlet.clone();
        self.registry
            .register_batchlet("flaky", move |props| {
                Arc::new(Flaky {
                    journal: journal.clone(),
                    fail: fail.clone(),
                    sturdy: props.get("sturdy").is_some_and(|v| v == "true"),
                }) as Arc<dyn Batchlet>
            })
            .unwrap();

        let journal = self.journal.clone();
        self.registry
            .register_batchlet("slow", move |props| {
                let millis = props.get("millis").and_then(|v| v.parse().ok()).unwrap_or(5_000);
                Arc::new(Slow {
                    journal: journal.clone(),
                    duration: Duration::from_millis(millis),
                    stopped: Arc::new(AtomicBool::new(false)),
                }) as Arc<dyn Batchlet>
            })
            .unwrap();

        let journal = self.journal.clone();
        let fail_at = self.switches.fail_read_at.clone();
        self.registry
            .register_item_reader("range", move |props| {
                let count = props.get("count").and_then(|v| v.parse().ok()).unwrap_or(10);
                Box::new(RangeReader {
                    journal: journal.clone(),
                    next: 0,
                    count,
                    fail_at: fail_at.clone(),
                }) as Box<dyn ItemReader>
            })
            .unwrap();

        let journal = self.journal.clone();
        let written = self.written.clone();
        self.registry
            .register_item_writer("collect", move |_| {
                Box::new(CollectWriter {
                    journal: journal.clone(),
                    written: written.clone(),
                    count: 0,
                }) as Box<dyn ItemWriter>
            })
            .unwrap();

        self.registry
            .register_decider("fixed", |props| {
                Arc::new(Fixed(props.get("decision").cloned().unwrap_or_default())) as Arc<dyn Decider>
            })
            .unwrap();

        let journal = self.journal.clone();
        self.registry
            .register_job_listener("audit", move |props| {
                Arc::new(Audit {
                    journal: journal.clone(),
                    fail_before: props.get("fail_before_job").is_some_and(|v| v == "true"),
                }) as Arc<dyn JobListener>
            })
            .unwrap();

        self.registry
            .register_partition_collector("partition-id", |_| Box::new(PartitionIdCollector) as Box<dyn PartitionCollector>)
            .unwrap();

        let journal = self.journal.clone();
        self.registry
            .register_partition_analyzer("tally", move |_| {
                Box::new(Tally {
                    journal: journal.clone(),
                }) as Box<dyn PartitionAnalyzer>
            })
            .unwrap();

        let journal = self.journal.clone();
        self.registry
            .register_partition_reducer("bracket", move |_| {
                Box::new(Bracket {
                    journal: journal.clone(),
                }) as Box<dyn PartitionReducer>
            })
            .unwrap();
    }
}

fn label(scope: &dyn StepScope) -> String {
    match scope.partition_id() {
        Some(id) => format!("{}#{}", scope.step_name(), id),
        None => scope.step_name().to_string(),
    }
}

struct Recording {
    journal: Journal,
    exit_status: Option<String>,
    fail: bool,
}

#[async_trait]
impl Batchlet for Recording {
    async fn process(&self, scope: &dyn StepScope) -> anyhow::Result<Option<String>> {
        self.journal.push(format!("run:{}", label(scope)));
        if self.fail {
            anyhow::bail!("{} was told to fail", label(scope));
        }
        Ok(self.exit_status.clone())
    }
}

/// Counts its runs in the user data; fails while the switch is on unless sturdy
struct Flaky {
    journal: Journal,
    fail: Arc<AtomicBool>,
    sturdy: bool,
}

#[async_trait]
impl Batchlet for Flaky {
    async fn process(&self, scope: &dyn StepScope) -> anyhow::Result<Option<String>> {
        let runs: i64 = scope.user_data()?.unwrap_or(0);
        scope.put_user_data(runs + 1)?;
        self.journal.push(format!("run:{}", label(scope)));
        if self.fail.load(Ordering::SeqCst) && !self.sturdy {
            anyhow::bail!("flaky failure");
        }
        Ok(None)
    }
}

struct Slow {
    journal: Journal,
    duration: Duration,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl Batchlet for Slow {
    async fn process(&self, scope: &dyn StepScope) -> anyhow::Result<Option<String>> {
        self.journal.push(format!("run:{}", label(scope)));
        // A job parameter shortens the nap for restarts
        let duration = scope
            .job()
            .parameters()
            .get("millis")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.duration);
        let deadline = tokio::time::Instant::now() + duration;
        while tokio::time::Instant::now() < deadline {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(Some("INTERRUPTED".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(None)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.journal.push("stop:slow");
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Yields 0..count; the reader checkpoint is the next position
struct RangeReader {
    journal: Journal,
    next: i64,
    count: i64,
    fail_at: Arc<AtomicUsize>,
}

#[async_trait]
impl ItemReader for RangeReader {
    async fn open(&mut self, scope: &dyn StepScope, checkpoint: Option<&CheckpointData>) -> anyhow::Result<()> {
        if let Some(checkpoint) = checkpoint {
            self.next = scope.codec().decode(checkpoint)?;
        }
        self.journal.push(format!("open:{}:{}", label(scope), self.next));
        Ok(())
    }

    async fn read_item(&mut self) -> anyhow::Result<Option<Item>> {
        if self.next as usize == self.fail_at.load(Ordering::SeqCst) {
            anyhow::bail!("read failure at {}", self.next);
        }
        if self.next >= self.count {
            return Ok(None);
        }
        let item = serde_json::json!(self.next);
        self.next += 1;
        Ok(Some(item))
    }

    async fn checkpoint_info(&mut self, scope: &dyn StepScope) -> anyhow::Result<Option<CheckpointData>> {
        Ok(Some(scope.codec().encode(self.next)?))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.journal.push("close:reader");
        Ok(())
    }
}

/// Collects written items; the writer checkpoint is how many this unit wrote
struct CollectWriter {
    journal: Journal,
    written: Arc<Mutex<Vec<Item>>>,
    count: i64,
}

#[async_trait]
impl ItemWriter for CollectWriter {
    async fn open(&mut self, scope: &dyn StepScope, checkpoint: Option<&CheckpointData>) -> anyhow::Result<()> {
        if let Some(checkpoint) = checkpoint {
            self.count = scope.codec().decode(checkpoint)?;
        }
        Ok(())
    }

    async fn write_items(&mut self, items: Vec<Item>) -> anyhow::Result<()> {
        self.count += items.len() as i64;
        self.written.lock().extend(items);
        Ok(())
    }

    async fn checkpoint_info(&mut self, scope: &dyn StepScope) -> anyhow::Result<Option<CheckpointData>> {
        Ok(Some(scope.codec().encode(self.count)?))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.journal.push("close:writer");
        Ok(())
    }
}

struct Fixed(String);

#[async_trait]
impl Decider for Fixed {
    async fn decide(&self, _job: &dyn JobScope, executions: &[StepExecution]) -> anyhow::Result<String> {
        anyhow::ensure!(!executions.is_empty(), "decider saw no step executions");
        Ok(self.0.clone())
    }
}

struct Audit {
    journal: Journal,
    fail_before: bool,
}

#[async_trait]
impl JobListener for Audit {
    async fn before_job(&self, job: &dyn JobScope) -> anyhow::Result<()> {
        self.journal.push(format!("before_job:{}", job.job_name()));
        if self.fail_before {
            anyhow::bail!("before_job refused");
        }
        Ok(())
    }

    async fn after_job(&self, job: &dyn JobScope) -> anyhow::Result<()> {
        self.journal.push(format!("after_job:{}", job.job_name()));
        Ok(())
    }
}

struct PartitionIdCollector;

#[async_trait]
impl PartitionCollector for PartitionIdCollector {
    async fn collect_partition_data(&mut self, partition: &dyn StepScope) -> anyhow::Result<Option<CheckpointData>> {
        let id = partition.partition_id().unwrap_or_default() as i64;
        Ok(Some(partition.codec().encode(id)?))
    }
}

struct Tally {
    journal: Journal,
}

#[async_trait]
impl PartitionAnalyzer for Tally {
    async fn analyze_collector_data(&mut self, step: &dyn StepScope, data: CheckpointData) -> anyhow::Result<()> {
        let id: i64 = step.codec().decode(&data)?;
        self.journal.push(format!("data:{}", id));
        Ok(())
    }

    async fn analyze_status(
        &mut self,
        _step: &dyn StepScope,
        batch_status: jobline_core::BatchStatus,
        _exit_status: &str,
    ) -> anyhow::Result<()> {
        self.journal.push(format!("status:{}", batch_status));
        Ok(())
    }
}

struct Bracket {
    journal: Journal,
}

#[async_trait]
impl PartitionReducer for Bracket {
    async fn begin(&mut self, _step: &dyn StepScope) -> anyhow::Result<()> {
        self.journal.push("reducer:begin");
        Ok(())
    }

    async fn before_completion(&mut self, _step: &dyn StepScope) -> anyhow::Result<()> {
        self.journal.push("reducer:before_completion");
        Ok(())
    }

    async fn rollback(&mut self, _step: &dyn StepScope) -> anyhow::Result<()> {
        self.journal.push("reducer:rollback");
        Ok(())
    }

    async fn after_completion(&mut self, _step: &dyn StepScope, outcome: ReducerOutcome) -> anyhow::Result<()> {
        self.journal.push(format!("reducer:after_completion:{:?}", outcome));
        Ok(())
    }
}

/// Poll until the journal holds `event`
pub async fn wait_for(journal: &Journal, event: &str) {
    for _ in 0..500 {
        if journal.contains(event) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never happened; saw {:?}", event, journal.events());
}

/// Decode an `i64` checkpoint value
pub fn position(data: Option<&CheckpointData>) -> Option<i64> {
    data.and_then(|d| match d.primitive() {
        Some(jobline_core::Primitive::Long(v)) => Some(*v),
        _ => None,
    })
}

pub fn params(pairs: &[(&str, &str)]) -> Properties {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}
