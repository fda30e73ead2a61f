//! The priority queue manager.
//!
//! Owns the context and implementation queues, the processed-id set and
//! the dependency graph. Every mutating call ends with a full snapshot
//! written through the injected [`StateStore`].

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::backlog::TaskStore;
use crate::core::{DependencyCheck, DependencyGraph, Task, TaskId, TaskStatus};
use crate::queue::entry::{QueueEntry, QueueName, ValidationIssue};
use crate::queue::scoring::{self, ScoreInput};
use crate::state::{QueueSnapshot, StateStore};
use crate::util::{minutes_between, Clock};
use crate::{rlog, rlog_debug, rlog_trace, rlog_warn, Result};

/// Where a routed task ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub id: TaskId,
    pub queue: QueueName,
    pub validation_issue: Option<ValidationIssue>,
}

/// One item a bulk ingestion could not route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestError {
    pub task_ref: String,
    pub reason: String,
}

/// Counts from a bulk ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub scanned: usize,
    pub routed: usize,
    pub skipped: usize,
    pub errors: Vec<IngestError>,
}

impl IngestSummary {
    fn merge(&mut self, other: IngestSummary) {
        self.scanned += other.scanned;
        self.routed += other.routed;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

pub struct PriorityQueueManager {
    context: Vec<QueueEntry>,
    implementation: Vec<QueueEntry>,
    graph: DependencyGraph,
    processed: BTreeSet<TaskId>,
    last_updated: Option<DateTime<Utc>>,
    context_threshold: f64,
    store: Arc<dyn StateStore<QueueSnapshot>>,
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl PriorityQueueManager {
    /// Restore from the store, or start empty if nothing was saved.
    pub fn load(
        store: Arc<dyn StateStore<QueueSnapshot>>,
        tasks: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let snapshot = store.load()?.unwrap_or_default();
        rlog_debug!(
            "PriorityQueueManager::load context={} implementation={} processed={}",
            snapshot.context_queue.len(),
            snapshot.implementation_queue.len(),
            snapshot.processed_ids.len()
        );
        Ok(Self {
            graph: DependencyGraph::deserialize(&snapshot.dependency_graph),
            context: snapshot.context_queue,
            implementation: snapshot.implementation_queue,
            processed: snapshot.processed_ids.into_iter().collect(),
            last_updated: snapshot.last_updated,
            context_threshold: 0.6,
            store,
            tasks,
            clock,
        })
    }

    pub fn with_context_threshold(mut self, threshold: f64) -> Self {
        self.context_threshold = threshold;
        self
    }

    pub fn context_threshold(&self) -> f64 {
        self.context_threshold
    }

    // ========== Read access ==========

    pub fn queue(&self, name: QueueName) -> &[QueueEntry] {
        match name {
            QueueName::Context => &self.context,
            QueueName::Implementation => &self.implementation,
        }
    }

    pub fn len(&self, name: QueueName) -> usize {
        self.queue(name).len()
    }

    pub fn total_len(&self) -> usize {
        self.context.len() + self.implementation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// The queue currently holding `id`, if any.
    pub fn location(&self, id: &TaskId) -> Option<QueueName> {
        if self.context.iter().any(|e| e.id() == id) {
            Some(QueueName::Context)
        } else if self.implementation.iter().any(|e| e.id() == id) {
            Some(QueueName::Implementation)
        } else {
            None
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&QueueEntry> {
        self.context
            .iter()
            .chain(self.implementation.iter())
            .find(|e| e.id() == id)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn is_processed(&self, id: &TaskId) -> bool {
        self.processed.contains(id)
    }

    pub fn context_ratio(&self) -> Option<f64> {
        scoring::context_ratio(self.context.len(), self.implementation.len())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            context_queue: self.context.clone(),
            implementation_queue: self.implementation.clone(),
            processed_ids: self.processed.iter().cloned().collect(),
            dependency_graph: self.graph.serialize(),
            last_updated: self.last_updated,
        }
    }

    fn persist(&mut self) -> Result<()> {
        self.last_updated = Some(self.clock.now());
        self.store.save(&self.snapshot())
    }

    fn queue_mut(&mut self, name: QueueName) -> &mut Vec<QueueEntry> {
        match name {
            QueueName::Context => &mut self.context,
            QueueName::Implementation => &mut self.implementation,
        }
    }

    fn take(&mut self, id: &TaskId) -> Option<(QueueName, QueueEntry)> {
        for name in [QueueName::Context, QueueName::Implementation] {
            let queue = self.queue_mut(name);
            if let Some(pos) = queue.iter().position(|e| e.id() == id) {
                return Some((name, queue.remove(pos)));
            }
        }
        None
    }

    // ========== Routing ==========

    /// Route a task to the queue matching its readiness.
    ///
    /// A task declaring `context_gathered` without a populated manifest is
    /// sent to the context queue with [`ValidationIssue::MissingManifest`];
    /// the task file is not touched.
    pub fn route_task(&mut self, task: Task, extra_deps: &[TaskId]) -> Result<RouteOutcome> {
        let outcome = self.route_inner(task, extra_deps);
        self.persist()?;
        Ok(outcome)
    }

    fn route_inner(&mut self, mut task: Task, extra_deps: &[TaskId]) -> RouteOutcome {
        task.merge_dependencies(extra_deps.iter().map(TaskId::as_str));

        let mut issue = None;
        if task.context_gathered && !self.tasks.has_manifest(&task.id) {
            rlog_warn!(
                "task={} declares context_gathered but has no manifest, routing to context",
                task.id
            );
            task.context_gathered = false;
            issue = Some(ValidationIssue::MissingManifest);
        }
        let queue = QueueName::for_readiness(task.context_gathered);
        let id = task.id.clone();

        self.graph.add(&task);
        self.processed.insert(id.clone());

        let now = self.clock.now();
        let queued_at = self.take(&id).map(|(_, e)| e.queued_at).unwrap_or(now);
        let mut entry = QueueEntry::new(task, queued_at);
        entry.validation_issue = issue;
        self.queue_mut(queue).push(entry);

        rlog_debug!("Routed task={} queue={} issue={:?}", id, queue, issue);
        RouteOutcome {
            id,
            queue,
            validation_issue: issue,
        }
    }

    /// Pull a task back to the context queue with `issue` recorded.
    ///
    /// Returns false when it was already waiting in the context queue.
    pub fn force_context(&mut self, task: &Task, issue: ValidationIssue) -> Result<bool> {
        if self.location(&task.id) == Some(QueueName::Context) {
            return Ok(false);
        }
        let queued_at = self
            .take(&task.id)
            .map(|(_, e)| e.queued_at)
            .unwrap_or_else(|| self.clock.now());
        let scheduled = task.with_context_gathered(false);
        self.graph.add(&scheduled);
        self.processed.insert(scheduled.id.clone());

        let mut entry = QueueEntry::new(scheduled, queued_at);
        entry.validation_issue = Some(issue);
        self.context.push(entry);
        self.persist()?;
        rlog!("task={} rerouted to context queue ({})", task.id, issue);
        Ok(true)
    }

    /// Move a task from the context queue to the implementation queue
    /// after its context pass completed out of band.
    pub fn move_to_implementation(&mut self, id: &TaskId) -> Result<bool> {
        let Some(pos) = self.context.iter().position(|e| e.id() == id) else {
            return Ok(false);
        };
        let mut entry = self.context.remove(pos);
        entry.task.context_gathered = true;
        entry.validation_issue = None;
        entry.transitioned_at = Some(self.clock.now());
        self.graph.add(&entry.task);
        self.implementation.push(entry);
        self.persist()?;
        rlog_debug!("task={} moved to implementation queue", id);
        Ok(true)
    }

    // ========== Removal ==========

    pub fn remove_from_queue(&mut self, id: &TaskId, queue: QueueName) -> Result<bool> {
        let list = self.queue_mut(queue);
        let before = list.len();
        list.retain(|e| e.id() != id);
        let removed = list.len() != before;
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Remove a task from whichever queue holds it.
    pub fn remove(&mut self, id: &TaskId) -> Result<Option<QueueName>> {
        let removed = self.take(id).map(|(name, _)| name);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Drop several entries at once (startup purge).
    pub fn purge(&mut self, ids: &[TaskId]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if self.take(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Forget all queues, the graph and the processed set.
    pub fn clear(&mut self) -> Result<()> {
        self.context.clear();
        self.implementation.clear();
        self.graph = DependencyGraph::new();
        self.processed.clear();
        self.persist()
    }

    pub fn mark_completed(&mut self, id: &TaskId) -> Result<()> {
        if self.graph.set_status(id, TaskStatus::Completed) {
            self.persist()?;
        }
        Ok(())
    }

    // ========== Scoring and selection ==========

    /// Dependency check using artifact existence for untracked deps.
    pub fn dependency_check(&self, id: &TaskId, completed: &HashSet<TaskId>) -> DependencyCheck {
        let tasks = Arc::clone(&self.tasks);
        let exists = move |dep: &TaskId| tasks.artifact_exists(dep);
        self.graph
            .check_dependencies_satisfied(id, completed, Some(&exists))
    }

    pub fn score(&self, entry: &QueueEntry, completed: &HashSet<TaskId>) -> f64 {
        let satisfied = self.dependency_check(entry.id(), completed).satisfied;
        self.score_with(entry, satisfied)
    }

    fn score_with(&self, entry: &QueueEntry, satisfied: bool) -> f64 {
        let input = ScoreInput {
            priority: entry.task.priority,
            leverage: entry.task.leverage,
            context_gathered: entry.task.context_gathered,
            dependencies_satisfied: satisfied,
            minutes_queued: minutes_between(entry.queued_at, self.clock.now()),
            context_ratio: self.context_ratio().unwrap_or(0.0),
        };
        scoring::score(&input, self.context_threshold)
    }

    /// Highest-scoring entry of `queue` whose dependencies are satisfied.
    ///
    /// Candidates whose task file has disappeared are dropped from the queue
    /// on the way. The returned entry stays queued.
    pub fn next_eligible(
        &mut self,
        queue: QueueName,
        completed: &HashSet<TaskId>,
    ) -> Result<Option<QueueEntry>> {
        let mut ranked: Vec<(f64, QueueEntry)> = self
            .queue(queue)
            .iter()
            .filter(|e| queue == QueueName::Context || e.task.context_gathered)
            .filter_map(|e| {
                let check = self.dependency_check(e.id(), completed);
                if !check.satisfied {
                    rlog_trace!("task={} blocked by {:?}", e.id(), check.blocking);
                    return None;
                }
                Some((self.score_with(e, true), e.clone()))
            })
            .collect();
        // Stable: equal scores keep queue order.
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut dropped = Vec::new();
        let mut chosen = None;
        for (score, entry) in ranked {
            if !self.tasks.exists(entry.id()) {
                rlog_warn!("task={} no longer exists, dropping from {} queue", entry.id(), queue);
                dropped.push(entry.id().clone());
                continue;
            }
            rlog_trace!("task={} selected from {} with score {:.2}", entry.id(), queue, score);
            chosen = Some(entry);
            break;
        }

        if !dropped.is_empty() {
            self.queue_mut(queue).retain(|e| !dropped.contains(e.id()));
            self.persist()?;
        }
        Ok(chosen)
    }

    // ========== Bulk ingestion ==========

    /// Route every item of an inventory not already queued or excluded.
    ///
    /// Unreadable items are reported in the summary; they never abort the
    /// batch.
    pub fn process_all(
        &mut self,
        items: &[TaskId],
        exclude: &HashSet<TaskId>,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        for id in items {
            summary.merge(self.ingest_one(id, id.as_str(), exclude));
        }
        if summary.routed > 0 {
            self.persist()?;
        }
        rlog!(
            "process_all scanned={} routed={} skipped={} errors={}",
            summary.scanned,
            summary.routed,
            summary.skipped,
            summary.errors.len()
        );
        Ok(summary)
    }

    /// Route feed references that have never been routed before.
    pub fn ingest_discovered(
        &mut self,
        refs: &[String],
        exclude: &HashSet<TaskId>,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        for raw in refs {
            let id = TaskId::canonical(raw);
            if id.is_empty() || self.processed.contains(&id) {
                summary.scanned += 1;
                summary.skipped += 1;
                continue;
            }
            summary.merge(self.ingest_one(&id, raw, exclude));
        }
        if summary.routed > 0 {
            self.persist()?;
        }
        if summary.scanned > 0 {
            rlog_debug!(
                "ingest_discovered scanned={} routed={} skipped={}",
                summary.scanned,
                summary.routed,
                summary.skipped
            );
        }
        Ok(summary)
    }

    fn ingest_one(&mut self, id: &TaskId, raw: &str, exclude: &HashSet<TaskId>) -> IngestSummary {
        let mut summary = IngestSummary {
            scanned: 1,
            ..Default::default()
        };
        if self.location(id).is_some() || exclude.contains(id) {
            summary.skipped = 1;
            return summary;
        }
        match self.tasks.load_task(id) {
            Some(task) if task.status == TaskStatus::Completed => {
                summary.skipped = 1;
            }
            Some(task) => {
                self.route_inner(task, &[]);
                summary.routed = 1;
            }
            None => {
                let reason = if self.tasks.exists(id) {
                    "unparsable front matter"
                } else {
                    "task file not found"
                };
                rlog_warn!("Skipping {}: {}", raw, reason);
                summary.errors.push(IngestError {
                    task_ref: raw.to_string(),
                    reason: reason.to_string(),
                });
            }
        }
        summary
    }
}
