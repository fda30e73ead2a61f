use chrono::{DateTime, Utc};
use serde_yaml::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::backlog::frontmatter;
use crate::core::{Task, TaskId, TaskMeta, TaskStatus};
use crate::{rlog_debug, rlog_warn, Error, Result};

/// Result of archiving a task file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived(PathBuf),
    /// The active file was already gone.
    SourceMissing,
}

/// Access to the task backlog.
pub trait TaskStore: Send + Sync {
    /// Ids of every active task file.
    fn list(&self) -> Result<Vec<TaskId>>;
    /// Path of the active task file (which may not exist).
    fn path(&self, id: &TaskId) -> PathBuf;
    /// Whether the active task file exists.
    fn exists(&self, id: &TaskId) -> bool;
    fn read(&self, id: &TaskId) -> Result<String>;
    /// `None` when the file is missing or its front matter is unparsable.
    fn read_meta(&self, id: &TaskId) -> Option<TaskMeta>;
    fn has_manifest(&self, id: &TaskId) -> bool;
    fn unchecked_items(&self, id: &TaskId) -> Result<Vec<String>>;
    fn set_flag(&self, id: &TaskId, key: &str, value: bool) -> Result<()>;
    /// Mark completed and move to the done area.
    fn archive(&self, id: &TaskId) -> Result<ArchiveOutcome>;
    /// Record an archived task in the done-area index.
    fn update_index(&self, id: &TaskId, summary: &str) -> Result<()>;
    fn modified_at(&self, id: &TaskId) -> Option<DateTime<Utc>>;
    /// Whether the task exists either active or archived.
    fn artifact_exists(&self, id: &TaskId) -> bool;

    /// Load a task with defaults applied.
    fn load_task(&self, id: &TaskId) -> Option<Task> {
        let meta = self.read_meta(id)?;
        Some(Task::from_meta(&self.path(id), &meta))
    }
}

/// Task files under a directory, archived into a `done` subdirectory.
#[derive(Debug, Clone)]
pub struct FsTaskStore {
    tasks_dir: PathBuf,
    done_dir: PathBuf,
}

const TASK_EXT: &str = "md";
const INDEX_FILE: &str = "INDEX.md";
const SKIPPED_FILES: &[&str] = &["README.md", INDEX_FILE];

impl FsTaskStore {
    pub fn new(tasks_dir: impl Into<PathBuf>, done_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
            done_dir: done_dir.into(),
        }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    pub fn done_dir(&self) -> &Path {
        &self.done_dir
    }

    fn done_path(&self, id: &TaskId) -> PathBuf {
        self.done_dir.join(format!("{}.{}", id, TASK_EXT))
    }
}

impl TaskStore for FsTaskStore {
    fn list(&self) -> Result<Vec<TaskId>> {
        if !self.tasks_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.tasks_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(TASK_EXT) {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if SKIPPED_FILES.contains(&name) {
                continue;
            }
            ids.push(TaskId::from_path(&path));
        }
        ids.sort();
        Ok(ids)
    }

    fn path(&self, id: &TaskId) -> PathBuf {
        self.tasks_dir.join(format!("{}.{}", id, TASK_EXT))
    }

    fn exists(&self, id: &TaskId) -> bool {
        self.path(id).is_file()
    }

    fn read(&self, id: &TaskId) -> Result<String> {
        let path = self.path(id);
        if !path.is_file() {
            return Err(Error::TaskNotFound(id.to_string()));
        }
        Ok(fs::read_to_string(path)?)
    }

    fn read_meta(&self, id: &TaskId) -> Option<TaskMeta> {
        let content = self.read(id).ok()?;
        let meta = frontmatter::parse_meta(&content);
        if meta.is_none() {
            rlog_warn!("Unparsable front matter in {}", self.path(id).display());
        }
        meta
    }

    fn has_manifest(&self, id: &TaskId) -> bool {
        self.read(id)
            .map(|c| frontmatter::has_manifest(&c))
            .unwrap_or(false)
    }

    fn unchecked_items(&self, id: &TaskId) -> Result<Vec<String>> {
        Ok(frontmatter::unchecked_items(&self.read(id)?))
    }

    fn set_flag(&self, id: &TaskId, key: &str, value: bool) -> Result<()> {
        let content = self.read(id)?;
        let updated = frontmatter::set_key(&content, key, Value::Bool(value))?;
        fs::write(self.path(id), updated)?;
        rlog_debug!("set_flag task={} {}={}", id, key, value);
        Ok(())
    }

    fn archive(&self, id: &TaskId) -> Result<ArchiveOutcome> {
        let source = self.path(id);
        if !source.is_file() {
            rlog_warn!("Archive skipped, source already missing: {}", source.display());
            return Ok(ArchiveOutcome::SourceMissing);
        }
        let content = fs::read_to_string(&source)?;
        let updated = frontmatter::set_key(
            &content,
            "status",
            Value::String(TaskStatus::Completed.to_string()),
        )?;

        fs::create_dir_all(&self.done_dir)?;
        let target = self.done_path(id);
        fs::write(&target, updated)?;
        fs::remove_file(&source)?;
        rlog_debug!("Archived {} -> {}", source.display(), target.display());
        Ok(ArchiveOutcome::Archived(target))
    }

    fn update_index(&self, id: &TaskId, summary: &str) -> Result<()> {
        fs::create_dir_all(&self.done_dir)?;
        let index = self.done_dir.join(INDEX_FILE);
        let is_new = !index.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&index)?;
        if is_new {
            writeln!(file, "# Completed tasks\n")?;
        }
        writeln!(
            file,
            "- [{}]({}.{}) {}: {}",
            id,
            id,
            TASK_EXT,
            Utc::now().format("%Y-%m-%d"),
            summary
        )?;
        Ok(())
    }

    fn modified_at(&self, id: &TaskId) -> Option<DateTime<Utc>> {
        let modified = fs::metadata(self.path(id)).ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }

    fn artifact_exists(&self, id: &TaskId) -> bool {
        self.exists(id) || self.done_path(id).is_file()
    }
}
