use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{GraphSnapshot, TaskId};
use crate::orchestration::pool::WorkerSlot;
use crate::orchestration::retry::{DeadLetter, RetryRecord};
use crate::queue::QueueEntry;

/// Queue manager state: both queues, the processed set and the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    #[serde(default)]
    pub context_queue: Vec<QueueEntry>,
    #[serde(default)]
    pub implementation_queue: Vec<QueueEntry>,
    #[serde(default)]
    pub processed_ids: Vec<TaskId>,
    #[serde(default)]
    pub dependency_graph: GraphSnapshot,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl QueueSnapshot {
    pub fn total_queued(&self) -> usize {
        self.context_queue.len() + self.implementation_queue.len()
    }
}

/// Worker pool state plus failure bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    #[serde(default)]
    pub slots: Vec<WorkerSlot>,
    #[serde(default)]
    pub completed_task_ids: Vec<TaskId>,
    #[serde(default)]
    pub retries: BTreeMap<TaskId, RetryRecord>,
    #[serde(default)]
    pub dead_letters: Vec<DeadLetter>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}
