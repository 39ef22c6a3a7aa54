//! Partitioned steps: plan execution, collector and analyzer traffic,
//! reducer bracketing, restart of failed partitions, partition timeout,
//! panicking partitions

mod common;

use async_trait::async_trait;
use common::{position, wait_for, Harness};
use jobline_core::{
    BatchFailure, BatchStatus, Batchlet, Job, MetricType, PartitionConfig, PartitionMapper, PartitionPlan, Properties,
    Step, StepScope,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn plan_with(key: &str, values: &[&str]) -> PartitionPlan {
    values
        .iter()
        .enumerate()
        .fold(PartitionPlan::new(values.len() as u32), |plan, (i, value)| {
            plan.with_partition_property(i as u32, key, *value)
        })
}

fn observed(config: PartitionConfig) -> PartitionConfig {
    config
        .with_collector("partition-id")
        .with_analyzer("tally")
        .with_reducer("bracket")
}

#[tokio::test]
async fn test_one_failed_partition_fails_the_step() {
    let harness = Harness::new();
    harness
        .operator
        .register_job(Job::new("fanout").with_element(
            Step::batchlet("spread", "record").with_partition(observed(PartitionConfig::with_plan(plan_with(
                "fail",
                &["false", "true", "false"],
            )))),
        ))
        .unwrap();

    let id = harness.operator.start("fanout", Properties::new()).await.unwrap();
    let execution = harness.operator.await_termination(id, None).await.unwrap();
    assert_eq!(execution.batch_status, BatchStatus::Failed);

    let step = &harness.operator.step_executions(id).await.unwrap()[0];
    assert_eq!(step.state.batch_status, BatchStatus::Failed);

    let partitions = harness.operator.partition_executions(step.id).await.unwrap();
    let statuses: Vec<_> = partitions.iter().map(|p| (p.partition_id, p.state.batch_status)).collect();
    assert_eq!(
        statuses,
        vec![
            (0, BatchStatus::Completed),
            (1, BatchStatus::Failed),
            (2, BatchStatus::Completed),
        ]
    );
    assert!(partitions[1].state.exception.is_some());

    // The failing partition never reached its collector
    assert!(harness.journal.contains("data:0"));
    assert!(harness.journal.contains("data:2"));
    assert!(!harness.journal.contains("data:1"));
    assert_eq!(harness.journal.count("status:"), 3);

    let events = harness.journal.events();
    let reducer: Vec<_> = events.iter().filter(|e| e.starts_with("reducer:")).collect();
    assert_eq!(
        reducer,
        vec!["reducer:begin", "reducer:rollback", "reducer:after_completion:Rollback"]
    );
}

#[tokio::test]
async fn test_successful_partitions_commit_and_merge_metrics() {
    let harness = Harness::new();
    harness
        .operator
        .register_job(
            Job::new("parallel-load").with_element(
                Step::chunk("copy", "range", "collect")
                    .with_item_count(4)
                    .with_partition(observed(PartitionConfig::with_plan(
                        plan_with("count", &["5", "7"]).with_threads(2),
                    ))),
            ),
        )
        .unwrap();

    let id = harness.operator.start("parallel-load", Properties::new()).await.unwrap();
    let execution = harness.operator.await_termination(id, None).await.unwrap();
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(harness.written.lock().len(), 12);

    let step = &harness.operator.step_executions(id).await.unwrap()[0];
    assert_eq!(step.state.batch_status, BatchStatus::Completed);
    assert_eq!(step.state.metrics.get(MetricType::ReadCount), 12);
    assert_eq!(step.state.metrics.get(MetricType::WriteCount), 12);

    let partitions = harness.operator.partition_executions(step.id).await.unwrap();
    assert_eq!(partitions[0].state.metrics.get(MetricType::ReadCount), 5);
    assert_eq!(partitions[1].state.metrics.get(MetricType::ReadCount), 7);

    assert!(harness.journal.contains("reducer:before_completion"));
    assert!(harness.journal.contains("reducer:after_completion:Commit"));
    assert!(!harness.journal.contains("reducer:rollback"));
}

fn uneven_copy() -> Job {
    Job::new("uneven-copy").with_element(
        Step::chunk("copy", "range", "collect")
            .with_item_count(4)
            .with_partition(PartitionConfig::with_plan(plan_with("count", &["5", "12", "6"]))),
    )
}

#[tokio::test]
async fn test_failed_chunk_partition_leaves_sibling_checkpoints_intact() {
    let harness = Harness::new();
    harness.switches.fail_read_at.store(8, Ordering::SeqCst);
    harness.operator.register_job(uneven_copy()).unwrap();

    let id = harness.operator.start("uneven-copy", Properties::new()).await.unwrap();
    let execution = harness.operator.await_termination(id, None).await.unwrap();
    assert_eq!(execution.batch_status, BatchStatus::Failed);
    assert_eq!(harness.written.lock().len(), 5 + 8 + 6);

    let step = &harness.operator.step_executions(id).await.unwrap()[0];
    let partitions = harness.operator.partition_executions(step.id).await.unwrap();
    let outcomes: Vec<_> = partitions
        .iter()
        .map(|p| {
            (
                p.partition_id,
                p.state.batch_status,
                position(p.state.reader_checkpoint.as_ref()),
                position(p.state.writer_checkpoint.as_ref()),
            )
        })
        .collect();
    assert_eq!(
        outcomes,
        vec![
            (0, BatchStatus::Completed, Some(5), Some(5)),
            (1, BatchStatus::Failed, Some(8), Some(8)),
            (2, BatchStatus::Completed, Some(6), Some(6)),
        ]
    );
    assert_eq!(harness.journal.count("close:reader"), 3);
}

#[tokio::test]
async fn test_restart_resumes_chunk_partition_from_its_checkpoint() {
    let harness = Harness::new();
    harness.switches.fail_read_at.store(8, Ordering::SeqCst);
    harness.operator.register_job(uneven_copy()).unwrap();

    let first = harness.operator.start("uneven-copy", Properties::new()).await.unwrap();
    let first = harness.operator.await_termination(first, None).await.unwrap();
    assert_eq!(first.batch_status, BatchStatus::Failed);

    harness.switches.fail_read_at.store(usize::MAX, Ordering::SeqCst);
    let second = harness.operator.restart(first.id, Properties::new()).await.unwrap();
    let second = harness.operator.await_termination(second, None).await.unwrap();
    assert_eq!(second.batch_status, BatchStatus::Completed);

    // Finished partitions are not reopened; the failed one resumes where it committed
    assert_eq!(harness.journal.count("open:copy#0:"), 1);
    assert_eq!(harness.journal.count("open:copy#2:"), 1);
    assert!(harness.journal.contains("open:copy#1:0"));
    assert!(harness.journal.contains("open:copy#1:8"));
    assert_eq!(harness.written.lock().len(), 5 + 12 + 6);

    let step = &harness.operator.step_executions(second.id).await.unwrap()[0];
    let partitions = harness.operator.partition_executions(step.id).await.unwrap();
    assert_eq!(partitions.len(), 3);
    assert!(partitions.iter().all(|p| p.state.batch_status == BatchStatus::Completed));

    let resumed = partitions.iter().find(|p| p.partition_id == 1).unwrap();
    assert_eq!(position(resumed.state.reader_checkpoint.as_ref()), Some(12));
    assert_eq!(position(resumed.state.writer_checkpoint.as_ref()), Some(12));
}

#[tokio::test]
async fn test_restart_reruns_only_unfinished_partitions() {
    let harness = Harness::new();
    harness.switches.fail_batchlet.store(true, Ordering::SeqCst);
    harness
        .operator
        .register_job(Job::new("retry-fanout").with_element(
            Step::batchlet("spread", "flaky").with_partition(PartitionConfig::with_plan(plan_with(
                "sturdy",
                &["true", "false", "true"],
            ))),
        ))
        .unwrap();

    let first = harness.operator.start("retry-fanout", Properties::new()).await.unwrap();
    let first = harness.operator.await_termination(first, None).await.unwrap();
    assert_eq!(first.batch_status, BatchStatus::Failed);

    harness.switches.fail_batchlet.store(false, Ordering::SeqCst);
    let second = harness.operator.restart(first.id, Properties::new()).await.unwrap();
    let second = harness.operator.await_termination(second, None).await.unwrap();
    assert_eq!(second.batch_status, BatchStatus::Completed);

    assert_eq!(harness.journal.count("run:spread#0"), 1);
    assert_eq!(harness.journal.count("run:spread#1"), 2);
    assert_eq!(harness.journal.count("run:spread#2"), 1);

    let step = &harness.operator.step_executions(second.id).await.unwrap()[0];
    let partitions = harness.operator.partition_executions(step.id).await.unwrap();
    assert_eq!(partitions.len(), 3);
    assert!(partitions.iter().all(|p| p.state.batch_status == BatchStatus::Completed));
}

#[tokio::test]
async fn test_partition_timeout_fails_step() {
    let harness = Harness::new();
    harness
        .operator
        .register_job(
            Job::new("stuck").with_element(
                Step::batchlet("wait", "slow").with_partition(
                    PartitionConfig::with_plan(PartitionPlan::new(2)).with_timeout_seconds(1),
                ),
            ),
        )
        .unwrap();

    let id = harness.operator.start("stuck", Properties::new()).await.unwrap();
    let execution = harness.operator.await_termination(id, None).await.unwrap();

    assert_eq!(execution.batch_status, BatchStatus::Failed);
    let step = &harness.operator.step_executions(id).await.unwrap()[0];
    assert_eq!(step.state.batch_status, BatchStatus::Failed);
    let failure: BatchFailure = harness
        .operator
        .codec()
        .decode(step.state.exception.as_ref().expect("timeout recorded on the step"))
        .unwrap();
    assert!(failure.message.contains("partition timeout"), "{}", failure.message);
}

#[tokio::test]
async fn test_partition_timeout_keeps_partitions_that_finished_in_time() {
    let harness = Harness::new();
    harness
        .operator
        .register_job(
            Job::new("half-stuck").with_element(
                Step::batchlet("wait", "slow").with_partition(
                    PartitionConfig::with_plan(plan_with("millis", &["10", "5000"])).with_timeout_seconds(1),
                ),
            ),
        )
        .unwrap();

    let id = harness.operator.start("half-stuck", Properties::new()).await.unwrap();
    let execution = harness.operator.await_termination(id, None).await.unwrap();
    assert_eq!(execution.batch_status, BatchStatus::Failed);

    let step = &harness.operator.step_executions(id).await.unwrap()[0];
    assert_eq!(step.state.batch_status, BatchStatus::Failed);

    let partitions = harness.operator.partition_executions(step.id).await.unwrap();
    let fast = partitions.iter().find(|p| p.partition_id == 0).unwrap();
    assert_eq!(fast.state.batch_status, BatchStatus::Completed);

    // The late partition is cancelled and its batchlet told to stop
    wait_for(&harness.journal, "stop:slow").await;
    assert_eq!(harness.journal.count("stop:slow"), 1);
}

struct ByProperty;

#[async_trait]
impl PartitionMapper for ByProperty {
    async fn map_partitions(&self, step: &dyn StepScope) -> anyhow::Result<PartitionPlan> {
        let partitions: u32 = step
            .properties()
            .get("parts")
            .ok_or_else(|| anyhow::anyhow!("parts not set"))?
            .parse()?;
        Ok(PartitionPlan::new(partitions))
    }
}

#[tokio::test]
async fn test_mapper_computes_plan_at_run_time() {
    let harness = Harness::new();
    harness
        .registry
        .register_partition_mapper("by-property", |_| Arc::new(ByProperty) as Arc<dyn PartitionMapper>)
        .unwrap();
    harness
        .operator
        .register_job(
            Job::new("mapped").with_element(
                Step::batchlet("spread", "record")
                    .with_property("parts", "4")
                    .with_partition(PartitionConfig::with_mapper("by-property")),
            ),
        )
        .unwrap();

    let id = harness.operator.start("mapped", Properties::new()).await.unwrap();
    let execution = harness.operator.await_termination(id, None).await.unwrap();

    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(harness.journal.count("run:spread#"), 4);
}

#[tokio::test]
async fn test_mapper_failure_fails_step_before_any_partition() {
    let harness = Harness::new();
    harness
        .registry
        .register_partition_mapper("by-property", |_| Arc::new(ByProperty) as Arc<dyn PartitionMapper>)
        .unwrap();
    harness
        .operator
        .register_job(Job::new("unmapped").with_element(
            Step::batchlet("spread", "record").with_partition(PartitionConfig::with_mapper("by-property")),
        ))
        .unwrap();

    let id = harness.operator.start("unmapped", Properties::new()).await.unwrap();
    let execution = harness.operator.await_termination(id, None).await.unwrap();

    assert_eq!(execution.batch_status, BatchStatus::Failed);
    assert_eq!(harness.journal.count("run:"), 0);
}

/// Panics in the second partition
struct Explode;

#[async_trait]
impl Batchlet for Explode {
    async fn process(&self, step: &dyn StepScope) -> anyhow::Result<Option<String>> {
        if step.partition_id() == Some(1) {
            panic!("partition {} blew up", step.step_name());
        }
        Ok(None)
    }
}

#[tokio::test]
async fn test_panicking_partition_is_recorded_as_failed() {
    let harness = Harness::new();
    harness
        .registry
        .register_batchlet("explode", |_| Arc::new(Explode) as Arc<dyn Batchlet>)
        .unwrap();
    harness
        .operator
        .register_job(Job::new("volatile").with_element(
            Step::batchlet("spread", "explode").with_partition(PartitionConfig::with_plan(PartitionPlan::new(3))),
        ))
        .unwrap();

    let id = harness.operator.start("volatile", Properties::new()).await.unwrap();
    let execution = harness.operator.await_termination(id, None).await.unwrap();
    assert_eq!(execution.batch_status, BatchStatus::Failed);

    let step = &harness.operator.step_executions(id).await.unwrap()[0];
    let partitions = harness.operator.partition_executions(step.id).await.unwrap();
    let statuses: Vec<_> = partitions.iter().map(|p| (p.partition_id, p.state.batch_status)).collect();
    assert_eq!(
        statuses,
        vec![
            (0, BatchStatus::Completed),
            (1, BatchStatus::Failed),
            (2, BatchStatus::Completed),
        ]
    );

    let failure: BatchFailure = harness
        .operator
        .codec()
        .decode(partitions[1].state.exception.as_ref().expect("panic recorded on the partition"))
        .unwrap();
    assert!(failure.message.contains("panicked"), "{}", failure.message);
}
