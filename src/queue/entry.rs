use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Task, TaskId};

/// Which of the two queues an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Context,
    Implementation,
}

impl QueueName {
    pub fn for_readiness(context_gathered: bool) -> Self {
        if context_gathered {
            QueueName::Implementation
        } else {
            QueueName::Context
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Context => "context",
            QueueName::Implementation => "implementation",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why routing overrode a task's declared readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationIssue {
    /// Declared `context_gathered: true` but no populated manifest section.
    MissingManifest,
    /// Pulled back from the implementation queue at pre-flight.
    ContextGateViolation,
    /// Context pass finished but its branch could not be fetched.
    FetchFailed,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationIssue::MissingManifest => write!(f, "missing-manifest"),
            ValidationIssue::ContextGateViolation => write!(f, "context-gate-violation"),
            ValidationIssue::FetchFailed => write!(f, "fetch-failed"),
        }
    }
}

/// A task plus its queue bookkeeping.
///
/// `task.context_gathered` is the scheduling view, which may differ from
/// the task file when routing overrode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub task: Task,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_issue: Option<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitioned_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(task: Task, queued_at: DateTime<Utc>) -> Self {
        Self {
            task,
            queued_at,
            validation_issue: None,
            transitioned_at: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.task.id
    }
}
