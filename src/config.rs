use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{rlog_debug, Error, Result};

/// Remote job executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub endpoint: Option<String>,
    pub api_key_env: String,
    /// Repository reference handed to the executor with every job.
    pub source: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: "RELAY_EXECUTOR_KEY".to_string(),
            source: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub tasks_dir: String,
    pub done_dir: String,
    pub state_dir: String,
    pub discovery_feed: String,
    pub workers: usize,
    pub tick_interval_secs: u64,
    pub reassign_delay_secs: u64,
    pub poll_warmup_secs: u64,
    pub poll_interval_secs: u64,
    pub fetch_attempts: u32,
    pub fetch_retry_delay_secs: u64,
    pub stale_after_days: i64,
    pub max_invalid_ratio: f64,
    pub context_ratio_threshold: f64,
    /// Consecutive failures after which a task is dead-lettered; a task
    /// gets `max_task_failures - 1` retries.
    pub max_task_failures: u32,
    pub retry_backoff_secs: u64,
    pub remote: String,
    pub base_branch: String,
    pub executor: ExecutorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tasks_dir: "tasks".to_string(),
            done_dir: "tasks/done".to_string(),
            state_dir: ".relay".to_string(),
            discovery_feed: ".relay/discovered.log".to_string(),
            workers: 3,
            tick_interval_secs: 30,
            reassign_delay_secs: 5,
            poll_warmup_secs: 60,
            poll_interval_secs: 30,
            fetch_attempts: 2,
            fetch_retry_delay_secs: 10,
            stale_after_days: 7,
            max_invalid_ratio: 0.10,
            context_ratio_threshold: 0.6,
            max_task_failures: 3,
            retry_backoff_secs: 300,
            remote: "origin".to_string(),
            base_branch: "main".to_string(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl Config {
    pub fn default_path(repo: &Path) -> PathBuf {
        repo.join(".relay").join("relay.toml")
    }

    /// Load from an explicit path, or from the repository default location.
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load_for_repo(repo: &Path, explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                Self::load(path)
            }
            None => {
                let path = Self::default_path(repo);
                if !path.exists() {
                    rlog_debug!("Config file not found, using defaults");
                    return Ok(Self::default());
                }
                Self::load(&path)
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        rlog_debug!("Config::load path={}", path.display());
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        rlog_debug!(
            "Config loaded: workers={}, tasks_dir={}, endpoint={:?}",
            config.workers,
            config.tasks_dir,
            config.executor.endpoint
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.context_ratio_threshold) {
            return Err(Error::Config(format!(
                "context_ratio_threshold must be within 0..=1, got {}",
                self.context_ratio_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.max_invalid_ratio) {
            return Err(Error::Config(format!(
                "max_invalid_ratio must be within 0..=1, got {}",
                self.max_invalid_ratio
            )));
        }
        if self.fetch_attempts == 0 {
            return Err(Error::Config("fetch_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Endpoint and API key for the job executor, required before `run`.
    pub fn executor_credentials(&self) -> Result<(String, String)> {
        let endpoint = self
            .executor
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::Config("executor.endpoint is not set".to_string()))?;
        let key = std::env::var(&self.executor.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "executor API key missing: set {}",
                    self.executor.api_key_env
                ))
            })?;
        Ok((endpoint.trim_end_matches('/').to_string(), key))
    }

    // ========== Paths ==========

    pub fn resolve(&self, repo: &Path, rel: &str) -> PathBuf {
        let expanded = expand_tilde(rel);
        if expanded.is_absolute() {
            expanded
        } else {
            repo.join(expanded)
        }
    }

    pub fn tasks_path(&self, repo: &Path) -> PathBuf {
        self.resolve(repo, &self.tasks_dir)
    }

    pub fn done_path(&self, repo: &Path) -> PathBuf {
        self.resolve(repo, &self.done_dir)
    }

    pub fn state_path(&self, repo: &Path) -> PathBuf {
        self.resolve(repo, &self.state_dir)
    }

    pub fn feed_path(&self, repo: &Path) -> PathBuf {
        self.resolve(repo, &self.discovery_feed)
    }

    pub fn queue_state_file(&self, repo: &Path) -> PathBuf {
        self.state_path(repo).join("queues.json")
    }

    pub fn pool_state_file(&self, repo: &Path) -> PathBuf {
        self.state_path(repo).join("pool.json")
    }

    // ========== Durations ==========

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn reassign_delay(&self) -> Duration {
        Duration::from_secs(self.reassign_delay_secs)
    }

    pub fn poll_warmup(&self) -> Duration {
        Duration::from_secs(self.poll_warmup_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn fetch_retry_delay(&self) -> Duration {
        Duration::from_secs(self.fetch_retry_delay_secs)
    }

    pub fn retry_backoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_backoff_secs as i64)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::days(self.stale_after_days)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
