//! Queue selection and assignment tests.
//!
//! These tests drive `tick` and `assign_next` against a real task
//! directory and check which queue is served, which slot gets the task,
//! and what pre-flight validation does to tasks that are not ready.

use relay::orchestration::{AssignOutcome, SlotState, ViolationKind};
use relay::queue::{QueueName, ValidationIssue};

use crate::fixtures::{id, settle, Harness};

/// Test: Context queue is served when it dominates the backlog
/// Given 7 tasks needing context and 3 ready for implementation
/// When the first tick runs
/// Then the assignment comes from the context queue
#[tokio::test(start_paused = true)]
async fn test_context_backlog_above_threshold_selects_context_queue() {
    let harness = Harness::new(1);
    for i in 0..7 {
        harness.backlog.pending(&format!("ctx-{}", i));
    }
    for i in 0..3 {
        harness.backlog.ready(&format!("impl-{}", i));
    }
    let mut orchestrator = harness.orchestrator();

    let report = orchestrator.tick().await.unwrap();

    let rescan = report.rescan.expect("empty queues trigger a rescan");
    assert_eq!(rescan.routed, 10);
    match report.assignment {
        AssignOutcome::Assigned { role, task_id, .. } => {
            assert_eq!(role, QueueName::Context);
            assert!(task_id.as_str().starts_with("ctx-"));
        }
        other => panic!("expected an assignment, got {:?}", other),
    }
    assert_eq!(orchestrator.queues().len(QueueName::Context), 6);
    assert_eq!(orchestrator.queues().len(QueueName::Implementation), 3);
}

/// Test: The ratio threshold is strict
/// Given 6 tasks needing context and 4 ready for implementation (ratio 0.6)
/// When an assignment is made
/// Then the implementation queue is served because 0.6 is not above 0.6
#[tokio::test(start_paused = true)]
async fn test_ratio_at_threshold_selects_implementation_queue() {
    let harness = Harness::new(1);
    for i in 0..6 {
        harness.backlog.pending(&format!("ctx-{}", i));
    }
    for i in 0..4 {
        harness.backlog.ready(&format!("impl-{}", i));
    }
    let mut orchestrator = harness.orchestrator();
    orchestrator.rebuild().unwrap();
    assert_eq!(orchestrator.queues().context_ratio(), Some(0.6));

    match orchestrator.assign_next().await.unwrap() {
        AssignOutcome::Assigned { role, .. } => assert_eq!(role, QueueName::Implementation),
        other => panic!("expected an assignment, got {:?}", other),
    }
}

/// Test: Empty implementation queue falls back to context
/// Given only tasks needing context
/// When ticks run until every slot is busy
/// Then each slot holds a different task and the rest wait for a slot
#[tokio::test(start_paused = true)]
async fn test_no_task_is_assigned_twice() {
    let harness = Harness::new(2);
    harness.backlog.pending("alpha");
    harness.backlog.pending("beta");
    harness.backlog.pending("gamma");
    let mut orchestrator = harness.orchestrator();

    let first = orchestrator.tick().await.unwrap().assignment;
    let second = orchestrator.tick().await.unwrap().assignment;
    let third = orchestrator.tick().await.unwrap().assignment;

    let (a, b) = match (first, second) {
        (
            AssignOutcome::Assigned { slot: s1, task_id: t1, .. },
            AssignOutcome::Assigned { slot: s2, task_id: t2, .. },
        ) => {
            assert_ne!(s1, s2);
            (t1, t2)
        }
        other => panic!("expected two assignments, got {:?}", other),
    };
    assert_ne!(a, b);
    assert!(matches!(third, AssignOutcome::NoIdleSlot { .. }));

    // In-flight tasks are neither queued nor picked up again by a rescan.
    assert_eq!(orchestrator.queues().location(&a), None);
    assert_eq!(orchestrator.queues().location(&b), None);
    assert_eq!(orchestrator.pool().working_count(), 2);
    assert_eq!(orchestrator.queues().total_len(), 1);
}

/// Test: Dependencies gate eligibility
/// Given `report` depending on `schema`, both needing context
/// When the first tick runs
/// Then `schema` is assigned and `report` stays queued
#[tokio::test(start_paused = true)]
async fn test_blocked_task_waits_for_dependency() {
    let harness = Harness::new(2);
    harness.backlog.pending("schema");
    harness.backlog.write("report", "depends_on: [schema]", "- [x] chart\n");
    let mut orchestrator = harness.orchestrator();

    match orchestrator.tick().await.unwrap().assignment {
        AssignOutcome::Assigned { task_id, .. } => assert_eq!(task_id, id("schema")),
        other => panic!("expected schema, got {:?}", other),
    }
    assert_eq!(
        orchestrator.assign_next().await.unwrap(),
        AssignOutcome::NoEligible(QueueName::Context)
    );
    assert_eq!(
        orchestrator.queues().location(&id("report")),
        Some(QueueName::Context)
    );
}

/// Test: Taken branch names get a numeric suffix
/// Given a task whose derived branch already exists on the remote
/// When it is assigned
/// Then the job targets the first free suffixed branch
#[tokio::test(start_paused = true)]
async fn test_assignment_uses_free_branch_name() {
    let harness = Harness::new(1);
    harness.backlog.write("login", "name: Add Login", "- [x] form\n");
    harness.scm.take_branch("task/add-login");
    harness.scm.take_branch("task/add-login-1");
    let mut orchestrator = harness.orchestrator();

    match orchestrator.tick().await.unwrap().assignment {
        AssignOutcome::Assigned { branch, .. } => assert_eq!(branch, "task/add-login-2"),
        other => panic!("expected an assignment, got {:?}", other),
    }
    settle(&mut orchestrator).await;
    assert_eq!(harness.executor.submitted_branches()[0], "task/add-login-2");
}

/// Test: Implementation without a manifest is pulled back
/// Given a task routed to the implementation queue whose manifest was
/// later deleted from the file
/// When assignment is attempted
/// Then the task is rerouted to the context queue and a violation logged
#[tokio::test(start_paused = true)]
async fn test_preflight_reroutes_task_without_manifest() {
    let harness = Harness::new(1);
    harness.backlog.ready("search");
    let mut orchestrator = harness.orchestrator();
    orchestrator.rebuild().unwrap();
    assert_eq!(
        orchestrator.queues().location(&id("search")),
        Some(QueueName::Implementation)
    );

    harness
        .backlog
        .write("search", "context_gathered: true", "- [x] index\n");
    let outcome = orchestrator.assign_next().await.unwrap();

    assert!(matches!(outcome, AssignOutcome::Rerouted { .. }));
    let entry = orchestrator.queues().get(&id("search")).unwrap();
    assert_eq!(
        orchestrator.queues().location(&id("search")),
        Some(QueueName::Context)
    );
    assert_eq!(
        entry.validation_issue,
        Some(ValidationIssue::ContextGateViolation)
    );
    let violations = harness.audit().violations().unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].kind, ViolationKind::ContextGate);
    assert_eq!(orchestrator.pool().slot(0).unwrap().state, SlotState::Idle);
}

/// Test: Emptied task files are rejected at pre-flight
/// Given a queued task whose file is emptied before assignment
/// When assignment is attempted
/// Then the task is dropped from its queue without touching a slot
#[tokio::test(start_paused = true)]
async fn test_preflight_rejects_empty_task_file() {
    let harness = Harness::new(1);
    harness.backlog.pending("ghost");
    let mut orchestrator = harness.orchestrator();
    orchestrator.rebuild().unwrap();

    std::fs::write(harness.backlog.task_path("ghost"), "   \n").unwrap();
    let outcome = orchestrator.assign_next().await.unwrap();

    assert!(matches!(outcome, AssignOutcome::Rejected { .. }));
    assert!(orchestrator.queues().is_empty());
    assert_eq!(orchestrator.pool().idle_count(), 1);
}

/// Test: Dependencies added after routing are honoured
/// Given a routed task whose file now depends on an unfinished task
/// When assignment is attempted
/// Then the task is re-routed, reported as blocked and a violation logged
#[tokio::test(start_paused = true)]
async fn test_dependency_change_blocks_assignment() {
    let harness = Harness::new(1);
    harness.backlog.pending("export");
    let mut orchestrator = harness.orchestrator();
    orchestrator.rebuild().unwrap();

    harness
        .backlog
        .write("export", "depends_on: [billing]", "- [x] csv\n");
    let outcome = orchestrator.assign_next().await.unwrap();

    match outcome {
        AssignOutcome::Blocked { task_id, blocking } => {
            assert_eq!(task_id, id("export"));
            assert_eq!(blocking, vec![id("billing")]);
        }
        other => panic!("expected blocked, got {:?}", other),
    }
    assert_eq!(
        orchestrator.queues().location(&id("export")),
        Some(QueueName::Context)
    );
    let violations = harness.audit().violations().unwrap();
    assert_eq!(violations[0].kind, ViolationKind::DependencyBlocked);
    assert_eq!(orchestrator.pool().working_count(), 0);
}

/// Test: Discovery feed feeds the queues
/// Given a task referenced in the discovery feed
/// When a tick runs
/// Then the task is routed without a full rescan and assigned
#[tokio::test(start_paused = true)]
async fn test_discovered_task_is_routed_and_assigned() {
    let harness = Harness::new(1);
    harness.backlog.pending("webhook");
    let mut orchestrator = harness.orchestrator_with_feed();
    harness.feed().append("tasks/webhook.md").unwrap();

    let report = orchestrator.tick().await.unwrap();

    assert_eq!(report.discovered, 1);
    assert!(report.rescan.is_none());
    assert!(matches!(
        report.assignment,
        AssignOutcome::Assigned { ref task_id, .. } if task_id == &id("webhook")
    ));

    // The feed offset was committed; nothing is read twice.
    let again = orchestrator.tick().await.unwrap();
    assert_eq!(again.discovered, 0);
}
