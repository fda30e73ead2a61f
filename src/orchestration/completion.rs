//! Completion protocol for implementation tasks.
//!
//! Runs after an implementation job succeeds: checklist gate, follow-up
//! sub-workers, done-area index, archive, commit. Only the checklist gate
//! can fail the protocol; every later step is soft.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::backlog::{ArchiveOutcome, TaskStore};
use crate::core::Task;
use crate::git::SourceControl;
use crate::orchestration::executor::{JobExecutor, JobRequest};
use crate::{rlog, rlog_debug, rlog_warn};

/// Follow-up passes submitted after a task completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    Review,
    Documentation,
    Logging,
}

impl Followup {
    pub const ALL: [Followup; 3] = [Followup::Review, Followup::Documentation, Followup::Logging];

    pub fn as_str(&self) -> &'static str {
        match self {
            Followup::Review => "review",
            Followup::Documentation => "documentation",
            Followup::Logging => "logging",
        }
    }

    fn instruction(&self, task: &Task, branch: &str) -> String {
        let goal = match self {
            Followup::Review => "Review the changes on this branch for correctness and style.",
            Followup::Documentation => {
                "Update the documentation affected by the changes on this branch."
            }
            Followup::Logging => "Record a short work log entry for the completed task.",
        };
        format!(
            "{}\n\nTask: {} ({})\nBranch: {}",
            goal, task.display_name, task.id, branch
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed {
        /// `None` when the task file was already gone.
        archived_to: Option<PathBuf>,
        commit: Option<String>,
    },
    /// Open checklist items; nothing was archived.
    ChecklistIncomplete(Vec<String>),
}

/// Outcome plus the handle of the follow-up submissions, which run
/// detached from the caller.
#[derive(Debug)]
pub struct CompletionReport {
    pub outcome: CompletionOutcome,
    pub followups: Option<JoinHandle<()>>,
}

pub struct CompletionProtocol {
    tasks: Arc<dyn TaskStore>,
    scm: Arc<dyn SourceControl>,
    executor: Arc<dyn JobExecutor>,
    source: String,
}

impl CompletionProtocol {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        scm: Arc<dyn SourceControl>,
        executor: Arc<dyn JobExecutor>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            tasks,
            scm,
            executor,
            source: source.into(),
        }
    }

    pub async fn run(&self, task: &Task, branch: &str) -> CompletionReport {
        let id = &task.id;

        let open = match self.tasks.unchecked_items(id) {
            Ok(items) => items,
            Err(e) => {
                rlog_warn!("task={} checklist unreadable ({}), continuing", id, e);
                Vec::new()
            }
        };
        if !open.is_empty() {
            rlog_warn!("task={} has {} open checklist items", id, open.len());
            return CompletionReport {
                outcome: CompletionOutcome::ChecklistIncomplete(open),
                followups: None,
            };
        }

        let followups = self.spawn_followups(task, branch);

        if let Err(e) = self.tasks.update_index(id, &task.display_name) {
            rlog_warn!("task={} index update failed: {}", id, e);
        }

        let archived_to = match self.tasks.archive(id) {
            Ok(ArchiveOutcome::Archived(path)) => Some(path),
            Ok(ArchiveOutcome::SourceMissing) => None,
            Err(e) => {
                rlog_warn!("task={} archive failed: {}", id, e);
                None
            }
        };

        let message = format!("Complete task {}: {}", id, task.display_name);
        let commit = match self.scm.commit_all(&message).await {
            Ok(commit) => commit,
            Err(e) => {
                rlog_warn!("task={} commit failed: {}", id, e);
                None
            }
        };

        rlog!("task={} completed (archived={})", id, archived_to.is_some());
        CompletionReport {
            outcome: CompletionOutcome::Completed {
                archived_to,
                commit,
            },
            followups: Some(followups),
        }
    }

    // Submitted one after another; failures are only logged.
    fn spawn_followups(&self, task: &Task, branch: &str) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let requests: Vec<(Followup, JobRequest)> = Followup::ALL
            .iter()
            .map(|kind| {
                (
                    *kind,
                    JobRequest {
                        instruction: kind.instruction(task, branch),
                        source: self.source.clone(),
                        target_branch: branch.to_string(),
                    },
                )
            })
            .collect();
        let id = task.id.clone();
        tokio::spawn(async move {
            for (kind, request) in requests {
                match executor.submit(&request).await {
                    Ok(job) => rlog_debug!("task={} {} job={}", id, kind.as_str(), job),
                    Err(e) => rlog_warn!("task={} {} submission failed: {}", id, kind.as_str(), e),
                }
            }
        })
    }
}
