//! Shared fixtures for the integration tests.
//!
//! Provides a temporary backlog, scripted stand-ins for the remote
//! executor and source control, and a harness that wires them into an
//! [`Orchestrator`] with in-memory state stores and a manual clock.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use relay::backlog::{DiscoveryFeed, FsTaskStore};
use relay::core::TaskId;
use relay::orchestration::{
    AuditLog, Collaborators, HealthPolicy, JobExecutor, JobPoll, JobRequest, JobStatus,
    Orchestrator, OrchestratorSettings,
};
use relay::git::SourceControl;
use relay::state::{MemoryStore, PoolSnapshot, QueueSnapshot};
use relay::util::ManualClock;
use relay::{Error, Result};

/// Manifest section appended by a successful context pass.
pub const MANIFEST: &str = "\n## Context Manifest\n- src/lib.rs: entry point\n";

/// A temporary repository with a task directory.
pub struct Backlog {
    dir: TempDir,
    pub tasks: Arc<FsTaskStore>,
}

impl Backlog {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let tasks_dir = dir.path().join("tasks");
        fs::create_dir_all(&tasks_dir).expect("Failed to create tasks dir");
        let tasks = Arc::new(FsTaskStore::new(&tasks_dir, tasks_dir.join("done")));
        Self { dir, tasks }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join(".relay")
    }

    pub fn task_path(&self, id: &str) -> PathBuf {
        self.tasks.tasks_dir().join(format!("{}.md", id))
    }

    /// Write a task file; `front` is raw YAML and may be empty.
    pub fn write(&self, id: &str, front: &str, body: &str) {
        let content = if front.is_empty() {
            format!("# {}\n\n{}", id, body)
        } else {
            format!("---\n{}\n---\n# {}\n\n{}", front, id, body)
        };
        fs::write(self.task_path(id), content).expect("Failed to write task");
    }

    /// A task waiting for its context pass.
    pub fn pending(&self, id: &str) {
        self.write(id, "", "- [x] describe the change\n");
    }

    /// A task whose context is gathered and whose checklist is done.
    pub fn ready(&self, id: &str) {
        self.write(
            id,
            "context_gathered: true",
            &format!("- [x] describe the change\n{}", MANIFEST),
        );
    }

    pub fn read(&self, id: &str) -> String {
        fs::read_to_string(self.task_path(id)).expect("Failed to read task")
    }

    pub fn remove(&self, id: &str) {
        fs::remove_file(self.task_path(id)).expect("Failed to remove task");
    }

    pub fn archived(&self, id: &str) -> bool {
        self.tasks.done_dir().join(format!("{}.md", id)).is_file()
    }
}

/// Executor whose job outcomes are scripted per target branch.
pub struct FakeExecutor {
    submitted: Mutex<Vec<JobRequest>>,
    jobs: Mutex<HashMap<String, String>>,
    outcomes: Mutex<HashMap<String, JobStatus>>,
    default_status: Mutex<JobStatus>,
    reject_submissions: AtomicBool,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            submitted: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(HashMap::new()),
            default_status: Mutex::new(JobStatus::Succeeded),
            reject_submissions: AtomicBool::new(false),
        }
    }

    /// Jobs targeting `branch` finish with `status`.
    pub fn script(&self, branch: &str, status: JobStatus) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(branch.to_string(), status);
    }

    pub fn reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<JobRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn submitted_branches(&self) -> Vec<String> {
        self.submitted()
            .into_iter()
            .map(|r| r.target_branch)
            .collect()
    }
}

#[async_trait]
impl JobExecutor for FakeExecutor {
    async fn submit(&self, request: &JobRequest) -> Result<String> {
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(Error::Executor("submission rejected: 503".to_string()));
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(request.clone());
        let job_id = format!("job-{}", submitted.len());
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.clone(), request.target_branch.clone());
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobPoll> {
        let branch = self.jobs.lock().unwrap().get(job_id).cloned();
        let status = branch
            .and_then(|b| self.outcomes.lock().unwrap().get(&b).copied())
            .unwrap_or(*self.default_status.lock().unwrap());
        Ok(JobPoll {
            status,
            artifact_ref: None,
        })
    }
}

/// Source control stand-in with a fixed set of remote branches.
pub struct FakeScm {
    taken: Mutex<HashSet<String>>,
    fetch_failures: AtomicU32,
    manifest_on_checkout: AtomicBool,
    fetched: Mutex<Vec<String>>,
    commits: Mutex<Vec<String>>,
}

impl FakeScm {
    pub fn new() -> Self {
        Self {
            taken: Mutex::new(HashSet::new()),
            fetch_failures: AtomicU32::new(0),
            manifest_on_checkout: AtomicBool::new(true),
            fetched: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
        }
    }

    pub fn take_branch(&self, name: &str) {
        self.taken.lock().unwrap().insert(name.to_string());
    }

    /// The next `n` fetches fail.
    pub fn fail_fetches(&self, n: u32) {
        self.fetch_failures.store(n, Ordering::SeqCst);
    }

    /// Whether checking out a task file from a context branch brings a
    /// manifest with it.
    pub fn deliver_manifest(&self, deliver: bool) {
        self.manifest_on_checkout.store(deliver, Ordering::SeqCst);
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceControl for FakeScm {
    async fn branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self.taken.lock().unwrap().contains(name))
    }

    async fn fetch_branch(&self, name: &str) -> Result<()> {
        let remaining = self.fetch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fetch_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Validation(format!("couldn't find remote ref {}", name)));
        }
        self.fetched.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn checkout_path(&self, _branch: &str, path: &Path) -> Result<()> {
        if !self.manifest_on_checkout.load(Ordering::SeqCst) {
            return Ok(());
        }
        let content = fs::read_to_string(path)?;
        if !content.contains("## Context Manifest") {
            fs::write(path, format!("{}{}", content, MANIFEST))?;
        }
        Ok(())
    }

    async fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let mut commits = self.commits.lock().unwrap();
        commits.push(message.to_string());
        Ok(Some(format!("c0ffee{}", commits.len())))
    }
}

/// Settings with short timings for paused-clock tests.
pub fn test_settings(workers: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        workers,
        tick_interval: Duration::from_secs(1),
        reassign_delay: Duration::from_secs(5),
        poll_warmup: Duration::from_secs(1),
        poll_interval: Duration::from_secs(1),
        fetch_attempts: 2,
        fetch_retry_delay: Duration::from_secs(1),
        context_ratio_threshold: 0.6,
        max_task_failures: 3,
        retry_backoff: chrono::Duration::minutes(5),
        health: HealthPolicy::default(),
        source: "git@example.com:acme/app.git".to_string(),
        base_branch: "main".to_string(),
    }
}

/// Everything an orchestrator needs, kept around so tests can inspect
/// the fakes and build a second orchestrator over the same state.
pub struct Harness {
    pub backlog: Backlog,
    pub executor: Arc<FakeExecutor>,
    pub scm: Arc<FakeScm>,
    pub clock: Arc<ManualClock>,
    pub queue_store: Arc<MemoryStore<QueueSnapshot>>,
    pub pool_store: Arc<MemoryStore<PoolSnapshot>>,
    pub settings: OrchestratorSettings,
}

impl Harness {
    pub fn new(workers: usize) -> Self {
        Self {
            backlog: Backlog::new(),
            executor: Arc::new(FakeExecutor::new()),
            scm: Arc::new(FakeScm::new()),
            clock: Arc::new(ManualClock::default()),
            queue_store: Arc::new(MemoryStore::new()),
            pool_store: Arc::new(MemoryStore::new()),
            settings: test_settings(workers),
        }
    }

    pub fn feed(&self) -> DiscoveryFeed {
        DiscoveryFeed::new(self.backlog.state_dir().join("discovered.log"))
    }

    pub fn audit(&self) -> AuditLog {
        AuditLog::new(&self.backlog.state_dir())
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.build(None)
    }

    pub fn orchestrator_with_feed(&self) -> Orchestrator {
        self.build(Some(self.feed()))
    }

    fn build(&self, feed: Option<DiscoveryFeed>) -> Orchestrator {
        let collaborators = Collaborators {
            tasks: self.backlog.tasks.clone(),
            scm: self.scm.clone(),
            executor: self.executor.clone(),
            clock: self.clock.clone(),
            queue_store: self.queue_store.clone(),
            pool_store: self.pool_store.clone(),
            feed,
            audit: self.audit(),
        };
        Orchestrator::new(self.settings.clone(), collaborators).expect("Failed to build orchestrator")
    }
}

/// Handle worker events until no slot is working.
pub async fn settle(orchestrator: &mut Orchestrator) {
    while orchestrator.pool().working_count() > 0 {
        let open = orchestrator
            .process_next_event()
            .await
            .expect("Event handling failed");
        assert!(open, "event channel closed while slots were working");
    }
}

pub fn id(raw: &str) -> TaskId {
    TaskId::from(raw)
}
