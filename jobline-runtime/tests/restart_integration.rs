//! Restart semantics: step reuse, checkpoint carry-forward, restart position
//! and the restart mode gates for in-flight executions

mod common;

use common::{params, wait_for, Harness};
use jobline_core::{BatchStatus, Job, Primitive, Properties, Step, Transition};
use jobline_runtime::Error;
use jobline_storage::JobRepository;
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;

fn etl() -> Job {
    Job::new("etl")
        .with_element(Step::batchlet("extract", "record").with_next("load"))
        .with_element(Step::batchlet("load", "flaky"))
}

#[tokio::test]
async fn test_restart_reuses_completed_steps_and_carries_user_data() {
    let harness = Harness::new();
    harness.operator.register_job(etl()).unwrap();
    harness.switches.fail_batchlet.store(true, Ordering::SeqCst);

    let first = harness.operator.start("etl", Properties::new()).await.unwrap();
    let first = harness.operator.await_termination(first, None).await.unwrap();
    assert_eq!(first.batch_status, BatchStatus::Failed);

    harness.switches.fail_batchlet.store(false, Ordering::SeqCst);
    let second = harness.operator.restart(first.id, Properties::new()).await.unwrap();
    let second = harness.operator.await_termination(second, None).await.unwrap();

    assert_eq!(second.batch_status, BatchStatus::Completed);
    assert_eq!(second.restarted_from, Some(first.id));
    assert_eq!(second.instance_id, first.instance_id);
    assert_eq!(harness.journal.count("run:extract"), 1);
    assert_eq!(harness.journal.count("run:load"), 2);

    // Only the rerun step gets a record under the new execution
    let steps = harness.operator.step_executions(second.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].step_name, "load");
    assert!(matches!(
        steps[0].state.persistent_user_data.as_ref().and_then(|d| d.primitive()),
        Some(Primitive::Long(2))
    ));
}

#[tokio::test]
async fn test_chunk_restart_resumes_at_reader_checkpoint() {
    let harness = Harness::new();
    harness.switches.fail_read_at.store(15, Ordering::SeqCst);
    harness
        .operator
        .register_job(
            Job::new("resumable").with_element(
                Step::chunk("copy", "range", "collect")
                    .with_item_count(5)
                    .with_property("count", "25"),
            ),
        )
        .unwrap();

    let first = harness.operator.start("resumable", Properties::new()).await.unwrap();
    let first = harness.operator.await_termination(first, None).await.unwrap();
    assert_eq!(first.batch_status, BatchStatus::Failed);
    assert_eq!(harness.written.lock().len(), 15);

    harness.switches.fail_read_at.store(usize::MAX, Ordering::SeqCst);
    let second = harness.operator.restart(first.id, Properties::new()).await.unwrap();
    let second = harness.operator.await_termination(second, None).await.unwrap();

    assert_eq!(second.batch_status, BatchStatus::Completed);
    assert!(harness.journal.contains("open:copy:15"));
    let written: Vec<i64> = harness
        .written
        .lock()
        .iter()
        .filter_map(|v| v.as_i64())
        .collect();
    assert_eq!(written, (0..25).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_allow_start_if_complete_reruns_step() {
    let harness = Harness::new();
    harness
        .operator
        .register_job(
            Job::new("always")
                .with_element(
                    Step::batchlet("refresh", "record")
                        .allow_start_if_complete(true)
                        .with_next("load"),
                )
                .with_element(Step::batchlet("load", "flaky")),
        )
        .unwrap();
    harness.switches.fail_batchlet.store(true, Ordering::SeqCst);

    let first = harness.operator.start("always", Properties::new()).await.unwrap();
    let first = harness.operator.await_termination(first, None).await.unwrap();

    harness.switches.fail_batchlet.store(false, Ordering::SeqCst);
    let second = harness.operator.restart(first.id, Properties::new()).await.unwrap();
    harness.operator.await_termination(second, None).await.unwrap();

    assert_eq!(harness.journal.count("run:refresh"), 2);
}

#[tokio::test]
async fn test_stop_transition_sets_restart_position() {
    let harness = Harness::new();
    harness
        .operator
        .register_job(
            Job::new("gated")
                .with_element(
                    Step::batchlet("gate", "record")
                        .with_property("exit_status", "HOLD")
                        .with_transition(Transition::stop("HOLD", Some("resume")))
                        .with_next("skipped"),
                )
                .with_element(Step::batchlet("skipped", "record"))
                .with_element(Step::batchlet("resume", "record")),
        )
        .unwrap();

    let first = harness.operator.start("gated", Properties::new()).await.unwrap();
    let first = harness.operator.await_termination(first, None).await.unwrap();
    assert_eq!(first.batch_status, BatchStatus::Stopped);
    assert_eq!(first.restart_position.as_deref(), Some("resume"));

    let second = harness.operator.restart(first.id, Properties::new()).await.unwrap();
    let second = harness.operator.await_termination(second, None).await.unwrap();

    assert_eq!(second.batch_status, BatchStatus::Completed);
    assert_eq!(harness.journal.events(), vec!["run:gate", "run:resume"]);
}

#[tokio::test]
async fn test_restart_position_parameter_must_name_top_level_element() {
    let harness = Harness::new();
    harness.operator.register_job(etl()).unwrap();
    harness.switches.fail_batchlet.store(true, Ordering::SeqCst);

    let first = harness.operator.start("etl", Properties::new()).await.unwrap();
    let first = harness.operator.await_termination(first, None).await.unwrap();

    let second = harness
        .operator
        .restart(first.id, params(&[("jobline.restart.position", "nowhere")]))
        .await
        .unwrap();
    let second = harness.operator.await_termination(second, None).await.unwrap();

    assert_eq!(second.batch_status, BatchStatus::Failed);
    assert_eq!(harness.journal.count("run:"), 2);
}

#[tokio::test]
async fn test_restart_position_parameter_ignored_on_fresh_start() {
    let harness = Harness::new();
    harness.operator.register_job(etl()).unwrap();

    let id = harness
        .operator
        .start("etl", params(&[("jobline.restart.position", "load")]))
        .await
        .unwrap();
    let execution = harness.operator.await_termination(id, None).await.unwrap();

    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(harness.journal.events(), vec!["run:extract", "run:load"]);
}

#[tokio::test]
async fn test_completed_execution_cannot_restart() {
    let harness = Harness::new();
    harness
        .operator
        .register_job(Job::new("once").with_element(Step::batchlet("only", "record")))
        .unwrap();

    let id = harness.operator.start("once", Properties::new()).await.unwrap();
    harness.operator.await_termination(id, None).await.unwrap();

    let err = harness.operator.restart(id, Properties::new()).await.unwrap_err();
    assert!(matches!(err, Error::Restart(_)));
}

#[tokio::test]
async fn test_only_most_recent_execution_restarts() {
    let harness = Harness::new();
    harness.operator.register_job(etl()).unwrap();
    harness.switches.fail_batchlet.store(true, Ordering::SeqCst);

    let first = harness.operator.start("etl", Properties::new()).await.unwrap();
    harness.operator.await_termination(first, None).await.unwrap();
    let second = harness.operator.restart(first, Properties::new()).await.unwrap();
    harness.operator.await_termination(second, None).await.unwrap();

    let err = harness.operator.restart(first, Properties::new()).await.unwrap_err();
    assert!(matches!(err, Error::Restart(_)));
}

#[tokio::test]
async fn test_non_restartable_job_refuses_restart() {
    let harness = Harness::new();
    harness
        .operator
        .register_job(
            Job::new("one-shot")
                .restartable(false)
                .with_element(Step::batchlet("boom", "record").with_property("fail", "true")),
        )
        .unwrap();

    let id = harness.operator.start("one-shot", Properties::new()).await.unwrap();
    harness.operator.await_termination(id, None).await.unwrap();

    let err = harness.operator.restart(id, Properties::new()).await.unwrap_err();
    assert!(matches!(err, Error::Restart(_)));
}

#[tokio::test]
async fn test_restart_modes_for_execution_running_here() {
    let harness = Harness::new();
    harness
        .operator
        .register_job(Job::new("sleepy").with_element(Step::batchlet("nap", "slow")))
        .unwrap();

    let first = harness.operator.start("sleepy", Properties::new()).await.unwrap();
    wait_for(&harness.journal, "run:nap").await;

    let strict = harness
        .operator
        .restart(first, params(&[("jobline.restart.mode", "strict")]))
        .await
        .unwrap_err();
    assert!(matches!(strict, Error::Restart(_)));

    let detect = harness.operator.restart(first, Properties::new()).await.unwrap_err();
    assert!(matches!(detect, Error::Restart(_)));

    let forced = harness
        .operator
        .restart(first, params(&[("jobline.restart.mode", "force"), ("millis", "10")]))
        .await
        .unwrap();

    let forced = harness.operator.await_termination(forced, None).await.unwrap();
    assert_eq!(forced.batch_status, BatchStatus::Completed);
    assert_eq!(forced.restarted_from, Some(first));

    // The forced-out execution was asked to stop
    harness.operator.await_termination(first, None).await.unwrap();
    assert!(harness.journal.contains("stop:slow"));
}

#[tokio::test]
async fn test_detect_mode_takes_over_orphaned_execution() {
    let harness = Harness::new();
    harness.operator.register_job(etl()).unwrap();

    // An execution left STARTED by a process that no longer runs it
    let instance = harness.repository.create_job_instance("etl").await.unwrap();
    let mut orphan = harness
        .repository
        .create_job_execution(&instance, Properties::new(), None)
        .await
        .unwrap();
    orphan.batch_status = BatchStatus::Started;
    harness.repository.update_job_execution(&orphan).await.unwrap();

    let strict = harness
        .operator
        .restart(orphan.id, params(&[("jobline.restart.mode", "strict")]))
        .await
        .unwrap_err();
    assert!(matches!(strict, Error::Restart(_)));

    let id = harness.operator.restart(orphan.id, Properties::new()).await.unwrap();
    let execution = harness.operator.await_termination(id, None).await.unwrap();
    assert_eq!(execution.batch_status, BatchStatus::Completed);

    let orphan = harness.operator.job_execution(orphan.id).await.unwrap();
    assert_eq!(orphan.batch_status, BatchStatus::Failed);
}
