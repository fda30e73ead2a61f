//! Durable audit logs.
//!
//! `errors.jsonl` records every worker failure and `violations.jsonl`
//! records dependency and context-gate violations, one JSON object per
//! line, for later review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::core::TaskId;
use crate::queue::QueueName;
use crate::{rlog_error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub slot: usize,
    pub task_id: TaskId,
    pub role: QueueName,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    /// An implementation-queue task without gathered context.
    ContextGate,
    /// A task whose refreshed dependencies are not satisfied.
    DependencyBlocked,
    /// Completion attempted with open checklist items.
    ChecklistIncomplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub task_id: TaskId,
    pub kind: ViolationKind,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    run_id: Uuid,
    errors_path: PathBuf,
    violations_path: PathBuf,
}

impl AuditLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            errors_path: state_dir.join("errors.jsonl"),
            violations_path: state_dir.join("violations.jsonl"),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record_failure(
        &self,
        slot: usize,
        task_id: &TaskId,
        role: QueueName,
        reason: &str,
        job_id: Option<&str>,
    ) {
        let record = FailureRecord {
            timestamp: Utc::now(),
            run_id: self.run_id,
            slot,
            task_id: task_id.clone(),
            role,
            reason: reason.to_string(),
            job_id: job_id.map(String::from),
        };
        if let Err(e) = append_line(&self.errors_path, &record) {
            rlog_error!("Failed to write error log {}: {}", self.errors_path.display(), e);
        }
    }

    pub fn record_violation(&self, task_id: &TaskId, kind: ViolationKind, detail: &str) {
        let record = ViolationRecord {
            timestamp: Utc::now(),
            run_id: self.run_id,
            task_id: task_id.clone(),
            kind,
            detail: detail.to_string(),
        };
        if let Err(e) = append_line(&self.violations_path, &record) {
            rlog_error!(
                "Failed to write violation log {}: {}",
                self.violations_path.display(),
                e
            );
        }
    }

    pub fn failures(&self) -> Result<Vec<FailureRecord>> {
        read_lines(&self.errors_path)
    }

    pub fn violations(&self) -> Result<Vec<ViolationRecord>> {
        read_lines(&self.violations_path)
    }
}

fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(record)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

// Lines that fail to parse (e.g. a torn final write) are skipped.
fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(fs::read_to_string(path)?
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
