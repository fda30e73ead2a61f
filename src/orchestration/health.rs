//! Startup self-check of the persisted queues.
//!
//! Every queued entry must still have its task file, and the entry must
//! have been routed, or its file edited, within the staleness window. A
//! rebuild re-queues every entry and so clears staleness. Invalid entries
//! are purged. When the invalid share exceeds the tolerated ratio the
//! discovery pipeline itself is suspect, and the check refuses with
//! [`Error::QueueCorrupted`] so the operator rebuilds the queues.

use chrono::{DateTime, Duration, Utc};

use crate::backlog::TaskStore;
use crate::core::TaskId;
use crate::queue::{PriorityQueueManager, QueueName};
use crate::{rlog, rlog_error, rlog_warn, Error, Result};

/// Default days a queued task may sit untouched.
pub const DEFAULT_STALE_AFTER_DAYS: i64 = 7;

/// Default share of invalid entries tolerated at startup.
pub const DEFAULT_MAX_INVALID_RATIO: f64 = 0.10;

/// Thresholds for the self-check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    /// Entries neither queued nor edited within this window are stale.
    pub stale_after: Duration,
    /// Refuse to start above this share of invalid entries.
    pub max_invalid_ratio: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::days(DEFAULT_STALE_AFTER_DAYS),
            max_invalid_ratio: DEFAULT_MAX_INVALID_RATIO,
        }
    }
}

/// Why a queued entry failed the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Missing,
    Stale,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidReason::Missing => write!(f, "task file missing"),
            InvalidReason::Stale => write!(f, "entry stale"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidEntry {
    pub id: TaskId,
    pub queue: QueueName,
    pub reason: InvalidReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub total: usize,
    pub invalid: Vec<InvalidEntry>,
    /// Entries actually removed (0 when not purging).
    pub purged: usize,
}

impl HealthReport {
    pub fn invalid_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.invalid.len() as f64 / self.total as f64
        }
    }

    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Classify every queued entry without touching the queues.
pub fn inspect(
    queues: &PriorityQueueManager,
    tasks: &dyn TaskStore,
    now: DateTime<Utc>,
    policy: &HealthPolicy,
) -> HealthReport {
    let mut report = HealthReport::default();
    for name in [QueueName::Context, QueueName::Implementation] {
        for entry in queues.queue(name) {
            report.total += 1;
            let id = entry.id();
            let reason = if !tasks.exists(id) {
                Some(InvalidReason::Missing)
            } else {
                let touched = tasks
                    .modified_at(id)
                    .map_or(entry.queued_at, |m| m.max(entry.queued_at));
                if now - touched <= policy.stale_after {
                    None
                } else {
                    Some(InvalidReason::Stale)
                }
            };
            if let Some(reason) = reason {
                report.invalid.push(InvalidEntry {
                    id: id.clone(),
                    queue: name,
                    reason,
                });
            }
        }
    }
    report
}

/// Run the startup check; with `purge`, invalid entries are removed.
///
/// Fails with [`Error::QueueCorrupted`] when more than
/// `policy.max_invalid_ratio` of the entries are invalid. Nothing is purged
/// in that case.
pub fn self_check(
    queues: &mut PriorityQueueManager,
    tasks: &dyn TaskStore,
    now: DateTime<Utc>,
    policy: &HealthPolicy,
    purge: bool,
) -> Result<HealthReport> {
    let mut report = inspect(queues, tasks, now, policy);
    for entry in &report.invalid {
        rlog_warn!(
            "Self-check: task={} queue={} {}",
            entry.id,
            entry.queue,
            entry.reason
        );
    }

    if report.invalid_ratio() > policy.max_invalid_ratio {
        rlog_error!(
            "Self-check failed: {} of {} queued entries invalid",
            report.invalid.len(),
            report.total
        );
        return Err(Error::QueueCorrupted {
            invalid: report.invalid.len(),
            total: report.total,
        });
    }

    if purge && !report.invalid.is_empty() {
        let ids: Vec<TaskId> = report.invalid.iter().map(|e| e.id.clone()).collect();
        report.purged = queues.purge(&ids)?;
        rlog!("Self-check purged {} stale entries", report.purged);
    }
    Ok(report)
}
