//! Worker pool.
//!
//! The `WorkerPool` holds a fixed number of logical worker slots for the
//! lifetime of the process. Slots are never created or destroyed after
//! startup, only moved between idle and working. Slot transitions are
//! driven by the orchestrator; spawned I/O tasks report back through
//! [`WorkerEvent`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::{Task, TaskId};
use crate::orchestration::executor::JobStatus;
use crate::queue::QueueName;
use crate::{Error, Result};

/// Events sent from spawned submit/poll tasks back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The executor accepted the job.
    Submitted {
        slot: usize,
        task_id: TaskId,
        job_id: String,
    },
    /// The executor rejected the submission or could not be reached.
    SubmitFailed {
        slot: usize,
        task_id: TaskId,
        error: String,
    },
    /// The job reached a terminal status.
    Finished {
        slot: usize,
        task_id: TaskId,
        job_id: String,
        status: JobStatus,
        artifact_ref: Option<String>,
    },
    /// Try another assignment now rather than at the next tick.
    Kick,
}

/// Lifecycle state of a slot. `Failed` is transient and always returns to
/// `Idle` within the same transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    #[default]
    Idle,
    Working,
    Failed,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Idle => write!(f, "idle"),
            SlotState::Working => write!(f, "working"),
            SlotState::Failed => write!(f, "failed"),
        }
    }
}

/// One logical execution lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSlot {
    pub id: usize,
    #[serde(rename = "status")]
    pub state: SlotState,
    #[serde(default)]
    pub current_task: Option<Task>,
    #[serde(default)]
    pub role: Option<QueueName>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_count: u32,
    #[serde(default)]
    pub external_job_id: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
}

impl WorkerSlot {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: SlotState::Idle,
            current_task: None,
            role: None,
            started_at: None,
            completed_count: 0,
            external_job_id: None,
            branch_name: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        self.current_task.as_ref().map(|t| &t.id)
    }

    fn reset(&mut self) {
        self.state = SlotState::Idle;
        self.current_task = None;
        self.role = None;
        self.started_at = None;
        self.external_job_id = None;
        self.branch_name = None;
    }
}

/// What a slot was doing when it was released.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasedWork {
    pub slot: usize,
    pub task: Task,
    pub role: QueueName,
    pub branch: Option<String>,
    pub job_id: Option<String>,
}

/// Fixed-size pool of worker slots.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(WorkerSlot::new).collect(),
        }
    }

    /// Rebuild from persisted slots, resized to `size`.
    ///
    /// Surplus slots that were still working are kept so their jobs can be
    /// reconciled; idle surplus slots are dropped.
    pub fn restore(mut slots: Vec<WorkerSlot>, size: usize) -> Self {
        slots.sort_by_key(|s| s.id);
        slots.retain(|s| s.id < size || !s.is_idle());
        for id in 0..size {
            if !slots.iter().any(|s| s.id == id) {
                slots.push(WorkerSlot::new(id));
            }
        }
        slots.sort_by_key(|s| s.id);
        Self { slots }
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn slot(&self, id: usize) -> Option<&WorkerSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    fn slot_mut(&mut self, id: usize) -> Result<&mut WorkerSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::Validation(format!("no worker slot {}", id)))
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn idle_slot(&self) -> Option<usize> {
        self.slots.iter().find(|s| s.is_idle()).map(|s| s.id)
    }

    pub fn idle_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_idle()).count()
    }

    pub fn working_count(&self) -> usize {
        self.slots.len() - self.idle_count()
    }

    /// Slot currently working on `task_id`, if any.
    pub fn assigned_slot(&self, task_id: &TaskId) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| !s.is_idle() && s.task_id() == Some(task_id))
            .map(|s| s.id)
    }

    /// Ids of every task currently held by a slot.
    pub fn in_flight(&self) -> HashSet<TaskId> {
        self.slots.iter().filter_map(|s| s.task_id().cloned()).collect()
    }

    /// Mark an idle slot as working on `task`.
    pub fn assign(
        &mut self,
        slot_id: usize,
        task: Task,
        role: QueueName,
        branch: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(other) = self.assigned_slot(&task.id) {
            return Err(Error::Validation(format!(
                "task {} already assigned to slot {}",
                task.id, other
            )));
        }
        let slot = self.slot_mut(slot_id)?;
        if !slot.is_idle() {
            return Err(Error::Validation(format!("slot {} is not idle", slot_id)));
        }
        slot.state = SlotState::Working;
        slot.current_task = Some(task);
        slot.role = Some(role);
        slot.started_at = Some(now);
        slot.branch_name = Some(branch.to_string());
        slot.external_job_id = None;
        Ok(())
    }

    /// Record the executor job id for a working slot.
    pub fn set_job(&mut self, slot_id: usize, task_id: &TaskId, job_id: &str) -> bool {
        match self.slot_mut(slot_id) {
            Ok(slot) if slot.task_id() == Some(task_id) && !slot.is_idle() => {
                slot.external_job_id = Some(job_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Whether `slot_id` is still working on `task_id` (guards stale events).
    pub fn holds(&self, slot_id: usize, task_id: &TaskId) -> bool {
        self.slot(slot_id)
            .map(|s| s.state == SlotState::Working && s.task_id() == Some(task_id))
            .unwrap_or(false)
    }

    fn release(&mut self, slot_id: usize) -> Result<Option<ReleasedWork>> {
        let slot = self.slot_mut(slot_id)?;
        let work = match (slot.current_task.take(), slot.role) {
            (Some(task), Some(role)) => Some(ReleasedWork {
                slot: slot_id,
                task,
                role,
                branch: slot.branch_name.clone(),
                job_id: slot.external_job_id.clone(),
            }),
            _ => None,
        };
        slot.reset();
        Ok(work)
    }

    /// working -> idle, counting a completion.
    pub fn complete(&mut self, slot_id: usize) -> Result<Option<ReleasedWork>> {
        let work = self.release(slot_id)?;
        if work.is_some() {
            self.slot_mut(slot_id)?.completed_count += 1;
        }
        Ok(work)
    }

    /// working -> failed -> idle.
    pub fn fail(&mut self, slot_id: usize) -> Result<Option<ReleasedWork>> {
        self.slot_mut(slot_id)?.state = SlotState::Failed;
        self.release(slot_id)
    }

    /// Drop surplus slots once they have gone idle.
    pub fn shrink_to(&mut self, size: usize) {
        self.slots.retain(|s| s.id < size || !s.is_idle());
    }
}
