//! Pre-flight validation run before a task is handed to a worker.

use regex::Regex;
use std::sync::OnceLock;

use crate::backlog::TaskStore;
use crate::core::Task;
use crate::git::SourceControl;
use crate::queue::{QueueEntry, QueueName};
use crate::{rlog_debug, rlog_warn, Error, Result};

/// Suffixes probed after the base name (`name-1` ..= `name-100`).
pub const MAX_BRANCH_SUFFIX: u32 = 100;

fn branch_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9._/-]+$").ok())
        .as_ref()
}

pub fn is_valid_branch_name(name: &str) -> bool {
    branch_pattern().is_some_and(|re| re.is_match(name))
}

/// First free branch name among `base`, `base-1`, ... `base-100`.
pub async fn validate_branch(scm: &dyn SourceControl, base: &str) -> Result<String> {
    if !is_valid_branch_name(base) {
        return Err(Error::Validation(format!("invalid branch name '{}'", base)));
    }
    let candidates = std::iter::once(base.to_string())
        .chain((1..=MAX_BRANCH_SUFFIX).map(|n| format!("{}-{}", base, n)));
    for candidate in candidates {
        if !scm.branch_exists(&candidate).await? {
            if candidate != base {
                rlog_debug!("Branch {} taken, using {}", base, candidate);
            }
            return Ok(candidate);
        }
    }
    Err(Error::BranchExhausted {
        base: base.to_string(),
        attempts: MAX_BRANCH_SUFFIX + 1,
    })
}

/// Result of pre-flight validation.
#[derive(Debug, Clone, PartialEq)]
pub enum PreflightOutcome {
    /// Ready to assign, with its validated branch recorded.
    Ready(Task),
    /// Drop the task from its queue.
    Rejected { reason: String },
    /// An implementation task without confirmed context; it belongs in the
    /// context queue.
    Rerouted { reason: String },
}

/// Check that a queued task can be assigned right now.
///
/// Returns a fresh [`Task`] built from the file on disk; the queued copy is
/// only used for its id and the scheduling-level readiness override.
pub async fn preflight(
    entry: &QueueEntry,
    queue: QueueName,
    tasks: &dyn TaskStore,
    scm: &dyn SourceControl,
) -> PreflightOutcome {
    let id = entry.id();
    let content = match tasks.read(id) {
        Ok(c) => c,
        Err(_) => {
            return PreflightOutcome::Rejected {
                reason: "task file no longer exists".to_string(),
            }
        }
    };
    if content.trim().is_empty() {
        return PreflightOutcome::Rejected {
            reason: "task file is empty".to_string(),
        };
    }
    let Some(task) = tasks.load_task(id) else {
        return PreflightOutcome::Rejected {
            reason: "task front matter is unparsable".to_string(),
        };
    };

    if queue == QueueName::Implementation {
        if !task.context_gathered || !entry.task.context_gathered {
            return PreflightOutcome::Rerouted {
                reason: "context_gathered is not set".to_string(),
            };
        }
        if !tasks.has_manifest(id) {
            return PreflightOutcome::Rerouted {
                reason: "context manifest is missing".to_string(),
            };
        }
    }

    let base = task.derived_branch();
    match validate_branch(scm, &base).await {
        Ok(branch) => PreflightOutcome::Ready(task.with_branch(&branch)),
        Err(e) => {
            rlog_warn!("task={} branch validation failed: {}", id, e);
            PreflightOutcome::Rejected {
                reason: format!("branch validation failed: {}", e),
            }
        }
    }
}
