//! Remote job executor.
//!
//! The executor runs task work remotely: a job is submitted with a
//! generated instruction, and its status is polled until it is terminal.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::core::Task;
use crate::queue::QueueName;
use crate::{rlog_debug, rlog_warn, Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "queued" | "pending" => Some(JobStatus::Queued),
            "running" | "in_progress" | "in-progress" => Some(JobStatus::Running),
            "succeeded" | "success" | "completed" | "done" => Some(JobStatus::Succeeded),
            "failed" | "error" => Some(JobStatus::Failed),
            "cancelled" | "canceled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// Unknown spellings read as still running so polling continues.
impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(JobStatus::parse(&raw).unwrap_or_else(|| {
            rlog_warn!("Unknown job status '{}', treating as running", raw);
            JobStatus::Running
        }))
    }
}

/// A job submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRequest {
    pub instruction: String,
    pub source: String,
    pub target_branch: String,
}

impl JobRequest {
    /// Instruction for a context-gathering or implementation pass.
    pub fn for_task(
        role: QueueName,
        task: &Task,
        content: &str,
        source: &str,
        base_branch: &str,
        branch: &str,
    ) -> Self {
        let goal = match role {
            QueueName::Context => {
                "Gather the context needed to implement this task. Add a \
                 `## Context Manifest` section to the task file listing the \
                 relevant files, interfaces and constraints. Do not implement \
                 the task."
            }
            QueueName::Implementation => {
                "Implement this task using its Context Manifest. Check off each \
                 checklist item as it is completed."
            }
        };
        let deps = if task.depends_on.is_empty() {
            "none".to_string()
        } else {
            task.depends_on
                .iter()
                .map(|d| d.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let instruction = format!(
            "{goal}\n\nTask: {name} ({id})\nPriority: {priority}\nLeverage: {leverage}\n\
             Depends on: {deps}\nBranch from: {base}\nWork on branch: {branch}\n\n\
             --- task file ---\n{content}",
            goal = goal,
            name = task.display_name,
            id = task.id,
            priority = task.priority,
            leverage = task.leverage,
            deps = deps,
            base = base_branch,
            branch = branch,
            content = content,
        );
        Self {
            instruction,
            source: source.to_string(),
            target_branch: branch.to_string(),
        }
    }
}

/// Status reported by a poll.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobPoll {
    pub status: JobStatus,
    #[serde(default)]
    pub artifact_ref: Option<String>,
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Submit a job and return its id.
    async fn submit(&self, request: &JobRequest) -> Result<String>;
    async fn poll(&self, job_id: &str) -> Result<JobPoll>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

/// JSON-over-HTTP executor client.
#[derive(Clone)]
pub struct HttpJobExecutor {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpJobExecutor {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url,
            api_key: api_key.into(),
            client,
        })
    }
}

#[async_trait]
impl JobExecutor for HttpJobExecutor {
    async fn submit(&self, request: &JobRequest) -> Result<String> {
        let url = format!("{}/jobs", self.base_url);
        rlog_debug!("POST {} target_branch={}", url, request.target_branch);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Executor(format!(
                "job submission failed: {} - {}",
                status, text
            )));
        }
        let parsed: SubmitResponse = serde_json::from_str(&text)?;
        Ok(parsed.id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobPoll> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Executor(format!(
                "job poll failed for {}: {} - {}",
                job_id, status, text
            )));
        }
        Ok(serde_json::from_str(&text)?)
    }
}
