//! End-to-end lifecycle tests.
//!
//! These tests run a task from discovery through its context pass and
//! implementation to archival, and check that state written by one
//! orchestrator is picked up correctly by the next: resumed polls,
//! interrupted submissions and the startup self-check.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use relay::backlog::TaskStore;
use relay::core::TaskStatus;
use relay::orchestration::{AssignOutcome, JobStatus, SlotState, WorkerSlot};
use relay::queue::QueueName;
use relay::state::{PoolSnapshot, StateStore};
use relay::Error;

use crate::fixtures::{id, settle, Harness};

/// Test: Full workflow from context pass to archive
/// Given a single task needing context
/// When its context job and then its implementation job succeed
/// Then it is archived, committed, recorded as completed and followed up
#[tokio::test(start_paused = true)]
async fn test_context_then_implementation_then_archive() {
    let harness = Harness::new(1);
    harness.backlog.write("billing", "name: Monthly Billing", "- [x] invoices\n");
    let mut orchestrator = harness.orchestrator();

    match orchestrator.tick().await.unwrap().assignment {
        AssignOutcome::Assigned { role, branch, .. } => {
            assert_eq!(role, QueueName::Context);
            assert_eq!(branch, "task/monthly-billing");
        }
        other => panic!("expected a context assignment, got {:?}", other),
    }
    settle(&mut orchestrator).await;

    // Context gathered: flag written, manifest present, next queue.
    assert!(harness.backlog.read("billing").contains("context_gathered: true"));
    assert!(harness.backlog.tasks.load_task(&id("billing")).unwrap().context_gathered);
    assert_eq!(
        orchestrator.queues().location(&id("billing")),
        Some(QueueName::Implementation)
    );
    assert!(orchestrator.completed().is_empty());

    match orchestrator.tick().await.unwrap().assignment {
        AssignOutcome::Assigned { role, .. } => assert_eq!(role, QueueName::Implementation),
        other => panic!("expected an implementation assignment, got {:?}", other),
    }
    settle(&mut orchestrator).await;

    assert!(harness.backlog.archived("billing"));
    assert!(!harness.backlog.task_path("billing").exists());
    assert!(orchestrator.completed().contains(&id("billing")));
    assert_eq!(
        harness.scm.commits(),
        vec!["Complete task billing: Monthly Billing".to_string()]
    );
    assert_eq!(orchestrator.pool().slot(0).unwrap().completed_count, 2);

    // Follow-up submissions finish before shutdown returns.
    orchestrator.shutdown().await.unwrap();
    assert_eq!(harness.executor.submitted().len(), 5);
    let persisted = harness.pool_store.current().unwrap();
    assert_eq!(persisted.completed_task_ids, vec![id("billing")]);
}

/// Test: The run loop drives work until shutdown
/// Given two independent tasks and two workers
/// When the loop runs for a while and is then cancelled
/// Then both tasks are archived and the loop returns cleanly
#[tokio::test(start_paused = true)]
async fn test_run_loop_completes_backlog() {
    let harness = Harness::new(2);
    harness.backlog.pending("search");
    harness.backlog.pending("export");
    let mut orchestrator = harness.orchestrator();

    let shutdown = CancellationToken::new();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        stopper.cancel();
    });
    orchestrator.run(shutdown).await.unwrap();

    assert!(harness.backlog.archived("search"));
    assert!(harness.backlog.archived("export"));
    assert_eq!(orchestrator.completed().len(), 2);
    assert!(orchestrator.queues().is_empty());
    assert_eq!(orchestrator.pool().working_count(), 0);
    let archived = harness.backlog.tasks.done_dir().join("search.md");
    assert!(std::fs::read_to_string(archived)
        .unwrap()
        .contains(&format!("status: {}", TaskStatus::Completed)));
}

/// Test: Submitted jobs survive a restart
/// Given a slot whose job was submitted before shutdown
/// When a new orchestrator starts over the same state
/// Then it resumes polling that job and handles its result
#[tokio::test(start_paused = true)]
async fn test_restart_resumes_polling_submitted_job() {
    let harness = Harness::new(1);
    harness.backlog.pending("ledger");
    let mut first = harness.orchestrator();
    first.tick().await.unwrap();
    // Only the submission is handled before the process stops.
    assert!(first.process_next_event().await.unwrap());
    first.shutdown().await.unwrap();
    drop(first);

    let persisted = harness.pool_store.current().unwrap();
    assert_eq!(persisted.slots[0].state, SlotState::Working);
    assert_eq!(persisted.slots[0].external_job_id.as_deref(), Some("job-1"));

    let mut second = harness.orchestrator();
    assert_eq!(second.pool().working_count(), 1);
    assert_eq!(second.resume().unwrap(), 1);
    settle(&mut second).await;

    assert_eq!(
        second.queues().location(&id("ledger")),
        Some(QueueName::Implementation)
    );
    // No second submission for the resumed job.
    assert_eq!(harness.executor.submitted().len(), 1);
}

/// Test: A slot interrupted before submission is failed on restart
/// Given persisted state with a working slot that has no job id
/// When the orchestrator resumes
/// Then the slot is released and the task charged one failure
#[tokio::test(start_paused = true)]
async fn test_restart_fails_slot_without_job() {
    let harness = Harness::new(1);
    harness.backlog.pending("ledger");
    let task = harness.backlog.tasks.load_task(&id("ledger")).unwrap();
    let mut slot = WorkerSlot::new(0);
    slot.state = SlotState::Working;
    slot.current_task = Some(task);
    slot.role = Some(QueueName::Context);
    slot.branch_name = Some("task/ledger".to_string());
    harness
        .pool_store
        .save(&PoolSnapshot {
            slots: vec![slot],
            ..Default::default()
        })
        .unwrap();

    let mut orchestrator = harness.orchestrator();
    assert_eq!(orchestrator.resume().unwrap(), 0);

    assert_eq!(orchestrator.pool().idle_count(), 1);
    assert_eq!(orchestrator.retries().failures(&id("ledger")), 1);
    let failures = harness.audit().failures().unwrap();
    assert!(failures[0].reason.contains("interrupted"));
}

/// Test: Startup self-check purges a few stale entries
/// Given ten queued tasks, one of whose files was deleted
/// When the self-check runs with purging
/// Then the missing entry is removed and the rest stay queued
#[tokio::test(start_paused = true)]
async fn test_self_check_purges_missing_entry() {
    let harness = Harness::new(1);
    for i in 0..10 {
        harness.backlog.pending(&format!("task-{}", i));
    }
    harness.orchestrator().rebuild().unwrap();
    harness.backlog.remove("task-4");

    let mut orchestrator = harness.orchestrator();
    let report = orchestrator.self_check(true).unwrap();

    assert_eq!(report.total, 10);
    assert_eq!(report.purged, 1);
    assert_eq!(orchestrator.queues().total_len(), 9);
    assert_eq!(orchestrator.queues().location(&id("task-4")), None);
}

/// Test: Startup refuses corrupted queues
/// Given ten queued tasks, two of whose files were deleted
/// When the orchestrator is started
/// Then it refuses with a queue-corruption error and purges nothing
#[tokio::test(start_paused = true)]
async fn test_run_refuses_corrupted_queues() {
    let harness = Harness::new(1);
    for i in 0..10 {
        harness.backlog.pending(&format!("task-{}", i));
    }
    harness.orchestrator().rebuild().unwrap();
    harness.backlog.remove("task-1");
    harness.backlog.remove("task-2");

    let mut orchestrator = harness.orchestrator();
    let err = orchestrator.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::QueueCorrupted { invalid: 2, total: 10 }));
    assert!(err.to_string().contains("relay rebuild"));
    assert_eq!(orchestrator.queues().total_len(), 10);
    assert!(harness.executor.submitted().is_empty());
}

/// Test: Rebuild forgets failure bookkeeping
/// Given a task that failed once and is waiting out its backoff
/// When the queues are rebuilt
/// Then the task is routed again immediately
#[tokio::test(start_paused = true)]
async fn test_rebuild_clears_pending_retries() {
    let harness = Harness::new(1);
    harness.backlog.pending("flaky");
    harness.executor.script("task/flaky", JobStatus::Failed);
    let mut orchestrator = harness.orchestrator();
    orchestrator.tick().await.unwrap();
    settle(&mut orchestrator).await;
    assert_eq!(orchestrator.retries().failures(&id("flaky")), 1);

    let summary = orchestrator.rebuild().unwrap();

    assert_eq!(summary.routed, 1);
    assert_eq!(orchestrator.retries().failures(&id("flaky")), 0);
    assert_eq!(
        orchestrator.queues().location(&id("flaky")),
        Some(QueueName::Context)
    );
}

/// Test: Rebuild recovers from a stale backlog
/// Given queued tasks untouched for longer than the staleness window
/// When startup refuses and the queues are rebuilt
/// Then the next self-check passes with nothing purged
#[tokio::test(start_paused = true)]
async fn test_rebuild_clears_stale_refusal() {
    let harness = Harness::new(1);
    for i in 0..5 {
        harness.backlog.pending(&format!("old-{}", i));
    }
    harness.orchestrator().rebuild().unwrap();
    harness.clock.advance(chrono::Duration::days(8));

    let mut orchestrator = harness.orchestrator();
    let err = orchestrator.self_check(true).unwrap_err();
    assert!(matches!(err, Error::QueueCorrupted { invalid: 5, total: 5 }));

    let summary = orchestrator.rebuild().unwrap();
    assert_eq!(summary.routed, 5);
    let report = orchestrator.self_check(true).unwrap();
    assert!(report.is_clean());
    assert_eq!(orchestrator.queues().total_len(), 5);
}
