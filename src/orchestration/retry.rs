//! Consecutive-failure tracking with bounded retry and dead-lettering.
//!
//! The failure handler never re-queues a task itself. Each tick asks the
//! tracker which failed tasks are due for another attempt; a task whose
//! consecutive failures reach the budget is dead-lettered instead and
//! stays out of every rescan until the queues are rebuilt.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::core::TaskId;

/// Failure history of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub failures: u32,
    pub last_failure: DateTime<Utc>,
    pub last_reason: String,
    /// Waiting for its backoff to elapse before being re-routed.
    #[serde(default)]
    pub awaiting_retry: bool,
}

/// A task that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub task_id: TaskId,
    pub failures: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// What happened to a task after a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Will be re-routed once the backoff elapses.
    RetryLater { failures: u32 },
    DeadLettered { failures: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryTracker {
    records: BTreeMap<TaskId, RetryRecord>,
    dead_letters: Vec<DeadLetter>,
    max_failures: u32,
    backoff: Duration,
}

impl RetryTracker {
    pub fn new(max_failures: u32, backoff: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            dead_letters: Vec::new(),
            max_failures,
            backoff,
        }
    }

    /// Rebuild from persisted state.
    pub fn restore(
        records: BTreeMap<TaskId, RetryRecord>,
        dead_letters: Vec<DeadLetter>,
        max_failures: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            records,
            dead_letters,
            max_failures,
            backoff,
        }
    }

    pub fn records(&self) -> &BTreeMap<TaskId, RetryRecord> {
        &self.records
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead_letters
    }

    /// Consecutive failures so far (0 if none).
    pub fn failures(&self, id: &TaskId) -> u32 {
        self.records.get(id).map(|r| r.failures).unwrap_or(0)
    }

    pub fn is_dead_lettered(&self, id: &TaskId) -> bool {
        self.dead_letters.iter().any(|d| &d.task_id == id)
    }

    pub fn record_failure(
        &mut self,
        id: &TaskId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> FailureVerdict {
        let record = self.records.entry(id.clone()).or_insert(RetryRecord {
            failures: 0,
            last_failure: now,
            last_reason: String::new(),
            awaiting_retry: false,
        });
        record.failures += 1;
        record.last_failure = now;
        record.last_reason = reason.to_string();
        let failures = record.failures;

        if failures >= self.max_failures {
            self.records.remove(id);
            self.dead_letters.retain(|d| &d.task_id != id);
            self.dead_letters.push(DeadLetter {
                task_id: id.clone(),
                failures,
                reason: reason.to_string(),
                dead_lettered_at: now,
            });
            FailureVerdict::DeadLettered { failures }
        } else {
            record.awaiting_retry = true;
            FailureVerdict::RetryLater { failures }
        }
    }

    /// Tasks whose backoff has elapsed. They are marked as no longer
    /// awaiting, so each is returned once per failure.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let backoff = self.backoff;
        self.records
            .iter_mut()
            .filter(|(_, r)| r.awaiting_retry && now - r.last_failure >= backoff)
            .map(|(id, r)| {
                r.awaiting_retry = false;
                id.clone()
            })
            .collect()
    }

    /// Tasks a rescan must not pick up: waiting out a backoff or
    /// dead-lettered.
    pub fn excluded(&self) -> HashSet<TaskId> {
        self.records
            .iter()
            .filter(|(_, r)| r.awaiting_retry)
            .map(|(id, _)| id.clone())
            .chain(self.dead_letters.iter().map(|d| d.task_id.clone()))
            .collect()
    }

    /// A success clears the consecutive-failure count.
    pub fn reset(&mut self, id: &TaskId) {
        self.records.remove(id);
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.dead_letters.clear();
    }
}
