//! The orchestrator.
//!
//! Owns the worker pool and drives the queue manager through the
//! validate -> assign -> execute -> complete/fail cycle. All bookkeeping
//! runs on the task that calls [`Orchestrator::run`]; job submission,
//! polling and follow-up submissions run on spawned tasks that report back
//! through a bounded channel of [`WorkerEvent`]s, so slot transitions and
//! queue mutations never interleave.

use futures::future::join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backlog::{DiscoveryFeed, TaskStore};
use crate::config::Config;
use crate::core::{TaskId, TaskStatus};
use crate::git::SourceControl;
use crate::orchestration::audit::{AuditLog, ViolationKind};
use crate::orchestration::completion::{CompletionOutcome, CompletionProtocol};
use crate::orchestration::executor::{JobExecutor, JobRequest, JobStatus};
use crate::orchestration::health::{self, HealthPolicy, HealthReport};
use crate::orchestration::pool::{ReleasedWork, SlotState, WorkerEvent, WorkerPool, WorkerSlot};
use crate::orchestration::retry::{DeadLetter, FailureVerdict, RetryTracker};
use crate::orchestration::validation::{preflight, PreflightOutcome};
use crate::queue::{scoring, IngestSummary, PriorityQueueManager, QueueName, ValidationIssue};
use crate::state::{PoolSnapshot, QueueSnapshot, StateStore};
use crate::util::Clock;
use crate::{rlog, rlog_debug, rlog_error, rlog_trace, rlog_warn, Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Timing and policy knobs, usually taken from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub tick_interval: Duration,
    /// Delay before the follow-up assignment after a completion or failure.
    pub reassign_delay: Duration,
    pub poll_warmup: Duration,
    pub poll_interval: Duration,
    pub fetch_attempts: u32,
    pub fetch_retry_delay: Duration,
    pub context_ratio_threshold: f64,
    pub max_task_failures: u32,
    pub retry_backoff: chrono::Duration,
    pub health: HealthPolicy,
    /// Repository reference passed to the executor.
    pub source: String,
    /// Branch workers start from.
    pub base_branch: String,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers,
            tick_interval: config.tick_interval(),
            reassign_delay: config.reassign_delay(),
            poll_warmup: config.poll_warmup(),
            poll_interval: config.poll_interval(),
            fetch_attempts: config.fetch_attempts.max(1),
            fetch_retry_delay: config.fetch_retry_delay(),
            context_ratio_threshold: config.context_ratio_threshold,
            max_task_failures: config.max_task_failures,
            retry_backoff: config.retry_backoff(),
            health: HealthPolicy {
                stale_after: config.stale_after(),
                max_invalid_ratio: config.max_invalid_ratio,
            },
            source: config.executor.source.clone().unwrap_or_default(),
            base_branch: config.base_branch.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// External collaborators the orchestrator drives.
pub struct Collaborators {
    pub tasks: Arc<dyn TaskStore>,
    pub scm: Arc<dyn SourceControl>,
    pub executor: Arc<dyn JobExecutor>,
    pub clock: Arc<dyn Clock>,
    pub queue_store: Arc<dyn StateStore<QueueSnapshot>>,
    pub pool_store: Arc<dyn StateStore<PoolSnapshot>>,
    pub feed: Option<DiscoveryFeed>,
    pub audit: AuditLog,
}

/// Result of one assignment attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignOutcome {
    /// Both queues are empty.
    Idle,
    /// Nothing eligible in the chosen queue.
    NoEligible(QueueName),
    Rejected { task_id: TaskId, reason: String },
    Rerouted { task_id: TaskId, reason: String },
    Blocked { task_id: TaskId, blocking: Vec<TaskId> },
    /// Every slot is busy; the task stays queued.
    NoIdleSlot { task_id: TaskId },
    AlreadyAssigned { task_id: TaskId, slot: usize },
    Assigned {
        slot: usize,
        task_id: TaskId,
        role: QueueName,
        branch: String,
    },
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Tasks routed from the discovery feed.
    pub discovered: usize,
    /// Failed tasks re-routed after their backoff.
    pub retried: Vec<TaskId>,
    /// Present when both queues were empty and a full rescan ran.
    pub rescan: Option<IngestSummary>,
    pub assignment: AssignOutcome,
}

/// Point-in-time view for the `status` command.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorStatus {
    pub context_queue: Vec<TaskId>,
    pub implementation_queue: Vec<TaskId>,
    pub slots: Vec<WorkerSlot>,
    pub completed: usize,
    pub pending_retries: usize,
    pub dead_letters: Vec<DeadLetter>,
}

impl OrchestratorStatus {
    pub fn from_snapshots(queues: &QueueSnapshot, pool: &PoolSnapshot) -> Self {
        Self {
            context_queue: queues.context_queue.iter().map(|e| e.id().clone()).collect(),
            implementation_queue: queues
                .implementation_queue
                .iter()
                .map(|e| e.id().clone())
                .collect(),
            slots: pool.slots.clone(),
            completed: pool.completed_task_ids.len(),
            pending_retries: pool.retries.values().filter(|r| r.awaiting_retry).count(),
            dead_letters: pool.dead_letters.clone(),
        }
    }

    pub fn context_ratio(&self) -> Option<f64> {
        scoring::context_ratio(self.context_queue.len(), self.implementation_queue.len())
    }
}

impl std::fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Queues: context={} implementation={} ratio={}",
            self.context_queue.len(),
            self.implementation_queue.len(),
            self.context_ratio()
                .map(|r| format!("{:.2}", r))
                .unwrap_or_else(|| "-".to_string())
        )?;
        for (name, ids) in [
            ("context", &self.context_queue),
            ("implementation", &self.implementation_queue),
        ] {
            if !ids.is_empty() {
                let head: Vec<&str> = ids.iter().take(5).map(TaskId::as_str).collect();
                writeln!(f, "  {}: {}", name, head.join(", "))?;
            }
        }
        writeln!(f, "Slots:")?;
        for slot in &self.slots {
            match slot.task_id() {
                Some(task) => writeln!(
                    f,
                    "  [{}] {} task={} role={} job={} completed={}",
                    slot.id,
                    slot.state,
                    task,
                    slot.role.map(|r| r.as_str()).unwrap_or("-"),
                    slot.external_job_id.as_deref().unwrap_or("-"),
                    slot.completed_count
                )?,
                None => writeln!(
                    f,
                    "  [{}] {} completed={}",
                    slot.id, slot.state, slot.completed_count
                )?,
            }
        }
        writeln!(
            f,
            "Completed: {}  Pending retries: {}  Dead-lettered: {}",
            self.completed,
            self.pending_retries,
            self.dead_letters.len()
        )?;
        for dead in &self.dead_letters {
            writeln!(f, "  {} after {} failures: {}", dead.task_id, dead.failures, dead.reason)?;
        }
        Ok(())
    }
}

/// Submits one job and polls it; cheap to clone into spawned tasks.
#[derive(Clone)]
struct JobRunner {
    executor: Arc<dyn JobExecutor>,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
    warmup: Duration,
    interval: Duration,
}

impl JobRunner {
    async fn submit_and_poll(self, slot: usize, task_id: TaskId, request: JobRequest) {
        let submitted = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.executor.submit(&request) => result,
        };
        match submitted {
            Ok(job_id) => {
                self.send(WorkerEvent::Submitted {
                    slot,
                    task_id: task_id.clone(),
                    job_id: job_id.clone(),
                })
                .await;
                self.poll_until_done(slot, task_id, job_id, self.warmup).await;
            }
            Err(e) => {
                self.send(WorkerEvent::SubmitFailed {
                    slot,
                    task_id,
                    error: e.to_string(),
                })
                .await
            }
        }
    }

    // Poll errors are retried on the interval; they never fail the task.
    async fn poll_until_done(
        &self,
        slot: usize,
        task_id: TaskId,
        job_id: String,
        first_delay: Duration,
    ) {
        let mut delay = first_delay;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.interval;
            match self.executor.poll(&job_id).await {
                Ok(poll) if poll.status.is_terminal() => {
                    self.send(WorkerEvent::Finished {
                        slot,
                        task_id,
                        job_id,
                        status: poll.status,
                        artifact_ref: poll.artifact_ref,
                    })
                    .await;
                    return;
                }
                Ok(poll) => {
                    rlog_trace!("slot={} task={} job={} {}", slot, task_id, job_id, poll.status)
                }
                Err(e) => rlog_warn!(
                    "slot={} task={} poll of job {} failed, retrying: {}",
                    slot,
                    task_id,
                    job_id,
                    e
                ),
            }
        }
    }

    async fn send(&self, event: WorkerEvent) {
        if self.events.send(event).await.is_err() {
            rlog_debug!("Event channel closed, dropping worker event");
        }
    }
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    queues: PriorityQueueManager,
    pool: WorkerPool,
    completed: BTreeSet<TaskId>,
    retries: RetryTracker,
    tasks: Arc<dyn TaskStore>,
    scm: Arc<dyn SourceControl>,
    clock: Arc<dyn Clock>,
    pool_store: Arc<dyn StateStore<PoolSnapshot>>,
    feed: Option<DiscoveryFeed>,
    audit: AuditLog,
    completion: CompletionProtocol,
    runner: JobRunner,
    events: mpsc::Receiver<WorkerEvent>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Restore queues and pool from their stores.
    pub fn new(settings: OrchestratorSettings, collaborators: Collaborators) -> Result<Self> {
        if settings.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        let Collaborators {
            tasks,
            scm,
            executor,
            clock,
            queue_store,
            pool_store,
            feed,
            audit,
        } = collaborators;

        let queues =
            PriorityQueueManager::load(queue_store, Arc::clone(&tasks), Arc::clone(&clock))?
                .with_context_threshold(settings.context_ratio_threshold);

        let snapshot = pool_store.load()?.unwrap_or_default();
        let pool = if snapshot.slots.is_empty() {
            WorkerPool::new(settings.workers)
        } else {
            WorkerPool::restore(snapshot.slots, settings.workers)
        };
        let retries = RetryTracker::restore(
            snapshot.retries,
            snapshot.dead_letters,
            settings.max_task_failures,
            settings.retry_backoff,
        );

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let runner = JobRunner {
            executor: Arc::clone(&executor),
            events: tx,
            cancel: cancel.clone(),
            warmup: settings.poll_warmup,
            interval: settings.poll_interval,
        };
        let completion = CompletionProtocol::new(
            Arc::clone(&tasks),
            Arc::clone(&scm),
            executor,
            settings.source.clone(),
        );

        rlog!(
            "Orchestrator ready: run={} slots={} context={} implementation={}",
            audit.run_id(),
            pool.size(),
            queues.len(QueueName::Context),
            queues.len(QueueName::Implementation)
        );

        Ok(Self {
            settings,
            queues,
            pool,
            completed: snapshot.completed_task_ids.into_iter().collect(),
            retries,
            tasks,
            scm,
            clock,
            pool_store,
            feed,
            audit,
            completion,
            runner,
            events: rx,
            handles: Vec::new(),
            cancel,
        })
    }

    // ========== Accessors ==========

    pub fn queues(&self) -> &PriorityQueueManager {
        &self.queues
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn retries(&self) -> &RetryTracker {
        &self.retries
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Implementation tasks finished in this or earlier runs.
    pub fn completed(&self) -> &BTreeSet<TaskId> {
        &self.completed
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus::from_snapshots(&self.queues.snapshot(), &self.pool_snapshot())
    }

    fn completed_set(&self) -> HashSet<TaskId> {
        self.completed.iter().cloned().collect()
    }

    /// Tasks a rescan or feed ingestion must not route.
    fn excluded(&self) -> HashSet<TaskId> {
        let mut exclude = self.pool.in_flight();
        exclude.extend(self.retries.excluded());
        exclude.extend(self.completed.iter().cloned());
        exclude
    }

    fn pool_snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            slots: self.pool.slots().to_vec(),
            completed_task_ids: self.completed.iter().cloned().collect(),
            retries: self.retries.records().clone(),
            dead_letters: self.retries.dead_letters().to_vec(),
            last_updated: Some(self.clock.now()),
        }
    }

    fn persist_pool(&self) -> Result<()> {
        self.pool_store.save(&self.pool_snapshot())
    }

    fn track(&mut self, handle: JoinHandle<()>) {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(handle);
    }

    // ========== Startup ==========

    /// Validate the persisted queues; with `purge`, drop invalid entries.
    pub fn self_check(&mut self, purge: bool) -> Result<HealthReport> {
        health::self_check(
            &mut self.queues,
            self.tasks.as_ref(),
            self.clock.now(),
            &self.settings.health,
            purge,
        )
    }

    /// Pick up slots left working by a previous process.
    ///
    /// Slots with a job id resume polling; slots that never got one count
    /// as failed. Returns the number of resumed polls.
    pub fn resume(&mut self) -> Result<usize> {
        let working: Vec<(usize, TaskId, Option<String>)> = self
            .pool
            .slots()
            .iter()
            .filter(|s| s.state == SlotState::Working)
            .filter_map(|s| s.task_id().map(|t| (s.id, t.clone(), s.external_job_id.clone())))
            .collect();

        let mut resumed = 0;
        for (slot, task_id, job) in working {
            match job {
                Some(job_id) => {
                    rlog!("slot={} task={} resuming poll of job {}", slot, task_id, job_id);
                    let runner = self.runner.clone();
                    let delay = self.settings.poll_interval;
                    self.track(tokio::spawn(async move {
                        runner.poll_until_done(slot, task_id, job_id, delay).await
                    }));
                    resumed += 1;
                }
                None => self.on_failure(slot, "interrupted before the job was submitted")?,
            }
        }
        Ok(resumed)
    }

    /// Clear the queues and failure bookkeeping, then re-ingest every task.
    pub fn rebuild(&mut self) -> Result<IngestSummary> {
        self.queues.clear()?;
        self.retries.clear();
        self.persist_pool()?;
        let items = self.tasks.list()?;
        let exclude = self.excluded();
        let summary = self.queues.process_all(&items, &exclude)?;
        rlog!("Rebuilt queues: {} routed from {} tasks", summary.routed, summary.scanned);
        Ok(summary)
    }

    // ========== Main loop ==========

    /// Run until `shutdown` is cancelled.
    ///
    /// Refuses to start with [`Error::QueueCorrupted`] when the self-check
    /// finds too many invalid entries.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let report = self.self_check(true)?;
        rlog!(
            "Self-check: {} queued, {} invalid, {} purged",
            report.total,
            report.invalid.len(),
            report.purged
        );
        self.resume()?;

        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => rlog_trace!("Tick: {:?}", report),
                        Err(e) => rlog_error!("Tick failed: {}", e),
                    }
                }
                Some(event) = self.events.recv() => {
                    if let Err(e) = self.handle_event(event).await {
                        rlog_error!("Worker event handling failed: {}", e);
                    }
                }
            }
        }
        self.shutdown().await
    }

    /// Stop background work and persist the pool.
    ///
    /// Jobs already submitted keep running remotely; their slots stay
    /// working so the next start resumes polling them.
    pub async fn shutdown(&mut self) -> Result<()> {
        rlog!("Shutting down, {} slots working", self.pool.working_count());
        self.cancel.cancel();
        for result in join_all(std::mem::take(&mut self.handles)).await {
            if let Err(e) = result {
                rlog_warn!("Background task ended abnormally: {}", e);
            }
        }
        self.persist_pool()
    }

    /// Feed ingestion, retry recovery, rescan when idle, one assignment.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let discovered = self.ingest_feed()?;
        let retried = self.recover_retries()?;
        let rescan = if self.queues.is_empty() {
            Some(self.rescan()?)
        } else {
            None
        };
        let assignment = self.assign_next().await?;
        Ok(TickReport {
            discovered,
            retried,
            rescan,
            assignment,
        })
    }

    fn ingest_feed(&mut self) -> Result<usize> {
        let exclude = self.excluded();
        let Some(feed) = &self.feed else {
            return Ok(0);
        };
        let batch = match feed.read_new() {
            Ok(batch) => batch,
            Err(e) => {
                rlog_warn!("Discovery feed unreadable: {}", e);
                return Ok(0);
            }
        };
        let summary = self.queues.ingest_discovered(&batch.refs, &exclude)?;
        feed.commit(&batch)?;
        if summary.routed > 0 {
            rlog!("Discovered {} new tasks", summary.routed);
        }
        Ok(summary.routed)
    }

    fn recover_retries(&mut self) -> Result<Vec<TaskId>> {
        let due = self.retries.take_due(self.clock.now());
        if due.is_empty() {
            return Ok(due);
        }
        let mut requeued = Vec::new();
        for id in due {
            if self.pool.assigned_slot(&id).is_some() || self.queues.location(&id).is_some() {
                continue;
            }
            match self.tasks.load_task(&id) {
                Some(task) if task.status != TaskStatus::Completed => {
                    let outcome = self.queues.route_task(task, &[])?;
                    rlog!(
                        "task={} retry after {} failures, routed to {}",
                        id,
                        self.retries.failures(&id),
                        outcome.queue
                    );
                    requeued.push(id);
                }
                _ => {
                    rlog_warn!("task={} not retried, task file unavailable", id);
                    self.retries.reset(&id);
                }
            }
        }
        self.persist_pool()?;
        Ok(requeued)
    }

    fn rescan(&mut self) -> Result<IngestSummary> {
        let items = self.tasks.list()?;
        let exclude = self.excluded();
        self.queues.process_all(&items, &exclude)
    }

    /// Choose a queue, validate its best eligible task and hand it to an
    /// idle slot.
    pub async fn assign_next(&mut self) -> Result<AssignOutcome> {
        let context_len = self.queues.len(QueueName::Context);
        let implementation_len = self.queues.len(QueueName::Implementation);
        let Some(ratio) = scoring::context_ratio(context_len, implementation_len) else {
            return Ok(AssignOutcome::Idle);
        };
        let queue = if ratio > self.settings.context_ratio_threshold || implementation_len == 0 {
            QueueName::Context
        } else {
            QueueName::Implementation
        };

        let completed = self.completed_set();
        let Some(entry) = self.queues.next_eligible(queue, &completed)? else {
            rlog_trace!("No eligible task in {} queue", queue);
            return Ok(AssignOutcome::NoEligible(queue));
        };
        let id = entry.id().clone();

        let task = match preflight(&entry, queue, self.tasks.as_ref(), self.scm.as_ref()).await {
            PreflightOutcome::Ready(task) => task,
            PreflightOutcome::Rejected { reason } => {
                self.queues.remove_from_queue(&id, queue)?;
                rlog_warn!("task={} queue={} rejected: {}", id, queue, reason);
                return Ok(AssignOutcome::Rejected { task_id: id, reason });
            }
            PreflightOutcome::Rerouted { reason } => {
                self.queues
                    .force_context(&entry.task, ValidationIssue::ContextGateViolation)?;
                self.audit
                    .record_violation(&id, ViolationKind::ContextGate, &reason);
                return Ok(AssignOutcome::Rerouted { task_id: id, reason });
            }
        };

        // The file may have changed its dependencies since it was routed.
        if task.depends_on != entry.task.depends_on {
            let outcome = self.queues.route_task(task.clone(), &[])?;
            let check = self.queues.dependency_check(&id, &completed);
            if !check.satisfied {
                let blocking: Vec<&str> = check.blocking.iter().map(TaskId::as_str).collect();
                let detail = format!("dependencies changed, blocked by {}", blocking.join(", "));
                rlog_warn!("task={} {}", id, detail);
                self.audit
                    .record_violation(&id, ViolationKind::DependencyBlocked, &detail);
                return Ok(AssignOutcome::Blocked {
                    task_id: id,
                    blocking: check.blocking,
                });
            }
            if outcome.queue != queue {
                return Ok(AssignOutcome::Rerouted {
                    task_id: id,
                    reason: format!("dependencies changed, now in {} queue", outcome.queue),
                });
            }
        }

        let content = match self.tasks.read(&id) {
            Ok(content) => content,
            Err(e) => {
                self.queues.remove_from_queue(&id, queue)?;
                let reason = format!("task file unreadable: {}", e);
                rlog_warn!("task={} queue={} rejected: {}", id, queue, reason);
                return Ok(AssignOutcome::Rejected { task_id: id, reason });
            }
        };

        let Some(slot) = self.pool.idle_slot() else {
            rlog_trace!("task={} waiting for an idle slot", id);
            return Ok(AssignOutcome::NoIdleSlot { task_id: id });
        };
        if let Some(other) = self.pool.assigned_slot(&id) {
            rlog_warn!("task={} already assigned to slot {}, skipping", id, other);
            return Ok(AssignOutcome::AlreadyAssigned {
                task_id: id,
                slot: other,
            });
        }

        let branch = task.branch.clone().unwrap_or_else(|| task.derived_branch());
        let request = JobRequest::for_task(
            queue,
            &task,
            &content,
            &self.settings.source,
            &self.settings.base_branch,
            &branch,
        );

        // Dequeue together with the slot transition, before any I/O.
        self.pool.assign(slot, task, queue, &branch, self.clock.now())?;
        self.queues.remove_from_queue(&id, queue)?;
        self.persist_pool()?;
        rlog!("slot={} task={} role={} assigned branch={}", slot, id, queue, branch);

        let runner = self.runner.clone();
        self.track(tokio::spawn(runner.submit_and_poll(slot, id.clone(), request)));

        Ok(AssignOutcome::Assigned {
            slot,
            task_id: id,
            role: queue,
            branch,
        })
    }

    // ========== Worker events ==========

    /// Wait for the next worker event and handle it. False once the channel
    /// has closed.
    pub async fn process_next_event(&mut self) -> Result<bool> {
        match self.events.recv().await {
            Some(event) => {
                self.handle_event(event).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn handle_event(&mut self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Submitted {
                slot,
                task_id,
                job_id,
            } => {
                if self.pool.set_job(slot, &task_id, &job_id) {
                    rlog!("slot={} task={} submitted job={}", slot, task_id, job_id);
                    self.persist_pool()?;
                } else {
                    rlog_warn!("slot={} task={} stale submission {}", slot, task_id, job_id);
                }
            }
            WorkerEvent::SubmitFailed {
                slot,
                task_id,
                error,
            } => {
                if self.pool.holds(slot, &task_id) {
                    self.on_failure(slot, &format!("submission failed: {}", error))?;
                }
            }
            WorkerEvent::Finished {
                slot,
                task_id,
                job_id,
                status,
                artifact_ref,
            } => {
                if !self.pool.holds(slot, &task_id) {
                    rlog_warn!("slot={} task={} stale result for job {}", slot, task_id, job_id);
                    return Ok(());
                }
                match status {
                    JobStatus::Succeeded => self.on_success(slot, artifact_ref).await?,
                    other => self.on_failure(slot, &format!("job {} {}", job_id, other))?,
                }
            }
            WorkerEvent::Kick => {
                let outcome = self.assign_next().await?;
                rlog_debug!("Follow-up assignment: {:?}", outcome);
            }
        }
        Ok(())
    }

    /// working -> idle after a successful job.
    pub async fn on_success(&mut self, slot: usize, artifact_ref: Option<String>) -> Result<()> {
        let Some(work) = self.pool.complete(slot)? else {
            return Ok(());
        };
        self.pool.shrink_to(self.settings.workers);
        self.persist_pool()?;
        rlog!("slot={} task={} role={} succeeded", slot, work.task.id, work.role);

        let branch = artifact_ref
            .or_else(|| work.branch.clone())
            .unwrap_or_else(|| work.task.derived_branch());
        match work.role {
            QueueName::Context => self.advance_context(&work, &branch).await?,
            QueueName::Implementation => self.finish_implementation(&work, &branch).await?,
        }
        self.schedule_kick();
        Ok(())
    }

    /// working -> failed -> idle. The task is not re-queued here; the
    /// retry tracker decides whether a later tick picks it up again.
    pub fn on_failure(&mut self, slot: usize, reason: &str) -> Result<()> {
        let Some(work) = self.pool.fail(slot)? else {
            return Ok(());
        };
        self.pool.shrink_to(self.settings.workers);
        self.record_failure(&work, reason);
        self.persist_pool()?;
        self.schedule_kick();
        Ok(())
    }

    fn record_failure(&mut self, work: &ReleasedWork, reason: &str) {
        let id = &work.task.id;
        rlog_error!(
            "slot={} task={} role={} failed: {}",
            work.slot,
            id,
            work.role,
            reason
        );
        self.audit
            .record_failure(work.slot, id, work.role, reason, work.job_id.as_deref());
        match self.retries.record_failure(id, reason, self.clock.now()) {
            FailureVerdict::RetryLater { failures } => rlog!(
                "task={} will be retried ({}/{} failures)",
                id,
                failures,
                self.settings.max_task_failures
            ),
            FailureVerdict::DeadLettered { failures } => {
                rlog_error!("task={} dead-lettered after {} failures", id, failures)
            }
        }
    }

    async fn advance_context(&mut self, work: &ReleasedWork, branch: &str) -> Result<()> {
        let task = &work.task;
        if !self.fetch_with_retries(branch).await {
            rlog_warn!("task={} context branch {} not fetched, back to context queue", task.id, branch);
            self.queues.force_context(task, ValidationIssue::FetchFailed)?;
            return Ok(());
        }
        self.retries.reset(&task.id);
        self.persist_pool()?;

        let path = self.tasks.path(&task.id);
        if let Err(e) = self.scm.checkout_path(branch, &path).await {
            rlog_warn!("task={} could not take task file from {}: {}", task.id, branch, e);
        }
        if let Err(e) = self.tasks.set_flag(&task.id, "context_gathered", true) {
            rlog_warn!("task={} could not set context_gathered: {}", task.id, e);
            self.queues.force_context(task, ValidationIssue::FetchFailed)?;
            return Ok(());
        }

        match self.tasks.load_task(&task.id) {
            Some(fresh) => {
                let outcome = self.queues.route_task(fresh, &[])?;
                if outcome.queue == QueueName::Implementation {
                    rlog!("task={} context gathered, queued for implementation", task.id);
                } else {
                    rlog_warn!("task={} context pass left no manifest", task.id);
                }
            }
            None => rlog_warn!("task={} unreadable after context pass", task.id),
        }
        Ok(())
    }

    async fn fetch_with_retries(&self, branch: &str) -> bool {
        let attempts = self.settings.fetch_attempts;
        for attempt in 1..=attempts {
            match self.scm.fetch_branch(branch).await {
                Ok(()) => return true,
                Err(e) => {
                    rlog_warn!("Fetch of {} failed ({}/{}): {}", branch, attempt, attempts, e);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.fetch_retry_delay).await;
                    }
                }
            }
        }
        false
    }

    async fn finish_implementation(&mut self, work: &ReleasedWork, branch: &str) -> Result<()> {
        let id = &work.task.id;
        let report = self.completion.run(&work.task, branch).await;
        if let Some(handle) = report.followups {
            self.track(handle);
        }
        match report.outcome {
            CompletionOutcome::Completed { .. } => {
                self.retries.reset(id);
                // Context passes never land here, so they do not unblock dependents.
                self.completed.insert(id.clone());
                self.queues.mark_completed(id)?;
            }
            CompletionOutcome::ChecklistIncomplete(items) => {
                self.audit
                    .record_violation(id, ViolationKind::ChecklistIncomplete, &items.join("; "));
                self.record_failure(
                    work,
                    &format!("{} checklist items still open", items.len()),
                );
            }
        }
        self.persist_pool()
    }

    fn schedule_kick(&mut self) {
        let events = self.runner.events.clone();
        let cancel = self.cancel.clone();
        let delay = self.settings.reassign_delay;
        self.track(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if events.send(WorkerEvent::Kick).await.is_err() {
                        rlog_debug!("Event channel closed, dropping kick");
                    }
                }
            }
        }));
    }
}
