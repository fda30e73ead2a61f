use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use git2::{BranchType, ErrorCode, IndexAddOption, Repository, Signature};
use tokio::process::Command;

use crate::util::{blocking, blocking_with_timeout};
use crate::{rlog_debug, rlog_warn, Error, Result};

const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);
const COMMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Source-control operations the scheduler depends on.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Whether `name` exists on the remote, falling back to local branches
    /// when the remote cannot be reached.
    async fn branch_exists(&self, name: &str) -> Result<bool>;
    /// Fetch a branch produced by a worker.
    async fn fetch_branch(&self, name: &str) -> Result<()>;
    /// Replace one working-tree file with its version on a fetched branch.
    async fn checkout_path(&self, branch: &str, path: &Path) -> Result<()>;
    /// Stage everything and commit. `None` when there was nothing to commit.
    async fn commit_all(&self, message: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct GitSourceControl {
    repo_path: PathBuf,
    remote: String,
}

impl GitSourceControl {
    pub fn new(repo_path: &Path, remote: &str) -> Result<Self> {
        rlog_debug!("GitSourceControl::new path={} remote={}", repo_path.display(), remote);
        let _ = Repository::discover(repo_path)?;
        if which::which("git").is_err() {
            return Err(Error::Config("git executable not found on PATH".to_string()));
        }
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            remote: remote.to_string(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.repo_path).kill_on_drop(true);
        match tokio::time::timeout(REMOTE_TIMEOUT, cmd.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(Error::Timeout(REMOTE_TIMEOUT)),
        }
    }

    async fn remote_branch_exists(&self, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", name);
        let output = self
            .git(&["ls-remote", "--exit-code", "--heads", &self.remote, &refname])
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            // --exit-code reports "no matching refs" as 2.
            Some(2) => Ok(false),
            _ => Err(Error::Git(git2::Error::from_str(
                String::from_utf8_lossy(&output.stderr).trim(),
            ))),
        }
    }

    /// Local branch or remote-tracking branch of the configured remote.
    pub fn local_branch_exists(&self, name: &str) -> Result<bool> {
        let repo = self.repo()?;
        for (candidate, kind) in [
            (name.to_string(), BranchType::Local),
            (format!("{}/{}", self.remote, name), BranchType::Remote),
        ] {
            match repo.find_branch(&candidate, kind) {
                Ok(_) => return Ok(true),
                Err(e) if e.code() == ErrorCode::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl SourceControl for GitSourceControl {
    async fn branch_exists(&self, name: &str) -> Result<bool> {
        match self.remote_branch_exists(name).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                rlog_warn!(
                    "Remote branch lookup failed for '{}' ({}), using local branches",
                    name,
                    e
                );
                let this = self.clone();
                let name = name.to_string();
                blocking(move || this.local_branch_exists(&name)).await
            }
        }
    }

    async fn fetch_branch(&self, name: &str) -> Result<()> {
        rlog_debug!("GitSourceControl::fetch_branch {} {}", self.remote, name);
        let output = self.git(&["fetch", &self.remote, name]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Git(git2::Error::from_str(&format!(
                "git fetch {} {} failed: {}",
                self.remote,
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            ))))
        }
    }

    async fn checkout_path(&self, branch: &str, path: &Path) -> Result<()> {
        let source = format!("{}/{}", self.remote, branch);
        let target = path.to_string_lossy();
        let output = self.git(&["checkout", &source, "--", &target]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Git(git2::Error::from_str(&format!(
                "git checkout {} -- {} failed: {}",
                source,
                target,
                String::from_utf8_lossy(&output.stderr).trim()
            ))))
        }
    }

    async fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let repo_path = self.repo_path.clone();
        let message = message.to_string();
        blocking_with_timeout(COMMIT_TIMEOUT, move || commit_all_sync(&repo_path, &message)).await
    }
}

fn commit_all_sync(repo_path: &Path, message: &str) -> Result<Option<String>> {
    rlog_debug!("commit_all path={} message={}", repo_path.display(), message);
    let repo = Repository::discover(repo_path)?;
    let mut index = repo.index()?;
    index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["."].iter(), None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::UnbornBranch => None,
        Err(e) => return Err(e.into()),
    };
    if let Some(parent) = &parent {
        if parent.tree_id() == tree_id {
            rlog_debug!("commit_all: nothing to commit");
            return Ok(None);
        }
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = repo
        .signature()
        .or_else(|_| Signature::now("Relay", "relay@localhost"))?;
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    rlog_debug!("Commit created: {}", commit_id);
    Ok(Some(commit_id.to_string()))
}
