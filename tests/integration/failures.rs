//! Failure handling integration tests.
//!
//! A failed task is never put straight back in a queue. These tests walk
//! a task through its retries until it is dead-lettered, and cover the
//! softer failure paths: rejected submissions, unfetchable context
//! branches and incomplete checklists.

use relay::orchestration::{AssignOutcome, JobStatus, SlotState, ViolationKind};
use relay::queue::{QueueName, ValidationIssue};

use crate::fixtures::{id, settle, Harness, MANIFEST};

/// Test: Failed tasks back off, retry and are finally dead-lettered
/// Given a task whose jobs always fail and a limit of 3 failures
/// When it is assigned, fails and the backoff elapses, three times over
/// Then it is retried twice and then dead-lettered for good
#[tokio::test(start_paused = true)]
async fn test_failure_backoff_retry_and_dead_letter() {
    let harness = Harness::new(1);
    harness.backlog.pending("flaky");
    harness.executor.script("task/flaky", JobStatus::Failed);
    let mut orchestrator = harness.orchestrator();

    assert!(matches!(
        orchestrator.tick().await.unwrap().assignment,
        AssignOutcome::Assigned { .. }
    ));
    settle(&mut orchestrator).await;

    // Failed -> idle, with nothing re-queued.
    assert_eq!(orchestrator.pool().slot(0).unwrap().state, SlotState::Idle);
    assert_eq!(orchestrator.queues().location(&id("flaky")), None);
    assert_eq!(orchestrator.retries().failures(&id("flaky")), 1);
    let failures = harness.audit().failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].role, QueueName::Context);
    assert_eq!(failures[0].job_id.as_deref(), Some("job-1"));

    // Still backing off: the rescan must not pick it up.
    let report = orchestrator.tick().await.unwrap();
    assert_eq!(report.rescan.map(|s| s.routed), Some(0));
    assert_eq!(report.assignment, AssignOutcome::Idle);

    for attempt in 2..=3 {
        harness.clock.advance(chrono::Duration::minutes(5));
        let report = orchestrator.tick().await.unwrap();
        assert_eq!(report.retried, vec![id("flaky")]);
        assert!(matches!(report.assignment, AssignOutcome::Assigned { .. }));
        settle(&mut orchestrator).await;
        assert_eq!(harness.audit().failures().unwrap().len(), attempt);
    }

    assert!(orchestrator.retries().is_dead_lettered(&id("flaky")));
    harness.clock.advance(chrono::Duration::hours(1));
    let report = orchestrator.tick().await.unwrap();
    assert!(report.retried.is_empty());
    assert_eq!(report.assignment, AssignOutcome::Idle);

    let status = orchestrator.status();
    assert_eq!(status.dead_letters.len(), 1);
    assert_eq!(status.dead_letters[0].failures, 3);
    assert_eq!(status.pending_retries, 0);
    assert_eq!(harness.executor.submitted().len(), 3);

    // Dead letters survive in the persisted pool state.
    let persisted = harness.pool_store.current().unwrap();
    assert_eq!(persisted.dead_letters[0].task_id, id("flaky"));
}

/// Test: A rejected submission fails the slot
/// Given an executor refusing submissions
/// When a task is assigned
/// Then the slot returns to idle and the failure is logged without a job id
#[tokio::test(start_paused = true)]
async fn test_rejected_submission_counts_as_failure() {
    let harness = Harness::new(1);
    harness.backlog.pending("upload");
    harness.executor.reject_submissions(true);
    let mut orchestrator = harness.orchestrator();

    orchestrator.tick().await.unwrap();
    settle(&mut orchestrator).await;

    assert_eq!(orchestrator.pool().idle_count(), 1);
    assert_eq!(orchestrator.retries().failures(&id("upload")), 1);
    let failures = harness.audit().failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].reason.contains("submission failed"));
    assert_eq!(failures[0].job_id, None);
}

/// Test: Unfetchable context branch sends the task back
/// Given a context pass that succeeds but whose branch cannot be fetched
/// When the result is handled
/// Then the task returns to the context queue flagged fetch-failed
#[tokio::test(start_paused = true)]
async fn test_fetch_failure_returns_task_to_context_queue() {
    let harness = Harness::new(1);
    harness.backlog.pending("cache");
    harness.scm.fail_fetches(2);
    let mut orchestrator = harness.orchestrator();

    orchestrator.tick().await.unwrap();
    settle(&mut orchestrator).await;

    let entry = orchestrator.queues().get(&id("cache")).unwrap();
    assert_eq!(
        orchestrator.queues().location(&id("cache")),
        Some(QueueName::Context)
    );
    assert_eq!(entry.validation_issue, Some(ValidationIssue::FetchFailed));
    assert!(!harness.backlog.read("cache").contains("context_gathered"));
    assert!(harness.scm.fetched().is_empty());
    // The job itself succeeded, so no retry is charged.
    assert_eq!(orchestrator.retries().failures(&id("cache")), 0);
}

/// Test: A transient fetch error is retried
/// Given a context branch whose first fetch fails
/// When the context result is handled
/// Then the second attempt succeeds and the task reaches implementation
#[tokio::test(start_paused = true)]
async fn test_transient_fetch_error_is_retried() {
    let harness = Harness::new(1);
    harness.backlog.pending("cache");
    harness.scm.fail_fetches(1);
    let mut orchestrator = harness.orchestrator();

    orchestrator.tick().await.unwrap();
    settle(&mut orchestrator).await;

    assert_eq!(harness.scm.fetched(), vec!["task/cache".to_string()]);
    assert_eq!(
        orchestrator.queues().location(&id("cache")),
        Some(QueueName::Implementation)
    );
}

/// Test: A context pass without a manifest does not unlock implementation
/// Given a context job that succeeds without adding a manifest
/// When the result is handled
/// Then the task is flagged but routed back to the context queue
#[tokio::test(start_paused = true)]
async fn test_context_pass_without_manifest_stays_in_context() {
    let harness = Harness::new(1);
    harness.backlog.pending("audit-trail");
    harness.scm.deliver_manifest(false);
    let mut orchestrator = harness.orchestrator();

    orchestrator.tick().await.unwrap();
    settle(&mut orchestrator).await;

    assert!(harness.backlog.read("audit-trail").contains("context_gathered: true"));
    let entry = orchestrator.queues().get(&id("audit-trail")).unwrap();
    assert_eq!(
        orchestrator.queues().location(&id("audit-trail")),
        Some(QueueName::Context)
    );
    assert_eq!(entry.validation_issue, Some(ValidationIssue::MissingManifest));
}

/// Test: Open checklist items block completion
/// Given an implementation job that succeeds while checklist items remain
/// When the completion protocol runs
/// Then nothing is archived, a violation is logged and a retry is charged
#[tokio::test(start_paused = true)]
async fn test_incomplete_checklist_is_a_failure() {
    let harness = Harness::new(1);
    harness.backlog.write(
        "payments",
        "context_gathered: true",
        &format!("- [x] schema\n- [ ] refunds\n{}", MANIFEST),
    );
    let mut orchestrator = harness.orchestrator();

    match orchestrator.tick().await.unwrap().assignment {
        AssignOutcome::Assigned { role, .. } => assert_eq!(role, QueueName::Implementation),
        other => panic!("expected an assignment, got {:?}", other),
    }
    settle(&mut orchestrator).await;

    assert!(!harness.backlog.archived("payments"));
    assert!(orchestrator.completed().is_empty());
    assert_eq!(orchestrator.retries().failures(&id("payments")), 1);
    let violations = harness.audit().violations().unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].kind, ViolationKind::ChecklistIncomplete);
    assert!(violations[0].detail.contains("refunds"));
    assert!(harness.scm.commits().is_empty());
}

/// Test: A checklist that stays open exhausts the failure budget
/// Given an implementation task whose checklist is never finished
/// When its job succeeds but completion is refused on every attempt
/// Then failures accumulate across attempts and the task is dead-lettered
#[tokio::test(start_paused = true)]
async fn test_repeated_checklist_failures_dead_letter() {
    let harness = Harness::new(1);
    harness.backlog.write(
        "payments",
        "context_gathered: true",
        &format!("- [x] schema\n- [ ] refunds\n{}", MANIFEST),
    );
    let mut orchestrator = harness.orchestrator();

    for attempt in 1..=3 {
        let report = orchestrator.tick().await.unwrap();
        assert!(
            matches!(report.assignment, AssignOutcome::Assigned { .. }),
            "attempt {} was not assigned: {:?}",
            attempt,
            report.assignment
        );
        settle(&mut orchestrator).await;
        if attempt < 3 {
            assert_eq!(orchestrator.retries().failures(&id("payments")), attempt);
        }
        harness.clock.advance(chrono::Duration::minutes(6));
    }

    assert!(orchestrator.retries().is_dead_lettered(&id("payments")));
    let report = orchestrator.tick().await.unwrap();
    assert_eq!(report.assignment, AssignOutcome::Idle);
    assert_eq!(harness.executor.submitted().len(), 3);
    assert_eq!(harness.audit().violations().unwrap().len(), 3);
    assert!(!harness.backlog.archived("payments"));
}
