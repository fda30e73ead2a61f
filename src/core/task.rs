//! Task data model.
//!
//! A task is one Markdown file in the backlog. Its identifier is derived
//! from the file path, and its scheduling metadata (priority, leverage,
//! dependencies, readiness) comes from the file's front matter. Defaults
//! are applied once, when a [`Task`] is built from a [`TaskMeta`].

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// Canonical identifier of a task.
///
/// Built from a file path or a dependency reference by dropping any
/// directory components and a trailing file extension, so `tasks/foo.md`,
/// `foo.md` and `foo` all name the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Normalize a raw reference into its canonical id.
    pub fn canonical(raw: &str) -> Self {
        let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'');
        let last = trimmed
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or(trimmed);
        let stem = match last.rfind('.') {
            Some(pos) if pos > 0 && is_extension(&last[pos + 1..]) => &last[..pos],
            _ => last,
        };
        Self(stem.to_string())
    }

    /// Canonical id for a task file.
    pub fn from_path(path: &Path) -> Self {
        Self::canonical(&path.to_string_lossy())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Only short alphabetic suffixes count as extensions, so `v1.2-upgrade`
// keeps its dot.
fn is_extension(s: &str) -> bool {
    !s.is_empty() && s.len() <= 8 && s.chars().all(|c| c.is_ascii_alphabetic())
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(raw: &str) -> Self {
        Self::canonical(raw)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::canonical(s))
    }
}

/// Four-step importance scale shared by priority and leverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Low,
    #[default]
    Medium,
    High,
    UltraHigh,
}

/// How urgent a task is.
pub type Priority = Level;
/// How much a task unlocks once done.
pub type Leverage = Level;

impl Level {
    /// Numeric weight used by the scorer (1..=4).
    pub fn value(&self) -> u8 {
        match self {
            Level::Low => 1,
            Level::Medium => 2,
            Level::High => 3,
            Level::UltraHigh => 4,
        }
    }

    /// Lenient parse of front-matter spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "low" => Some(Level::Low),
            "medium" | "med" | "normal" => Some(Level::Medium),
            "high" => Some(Level::High),
            "ultra-high" | "ultrahigh" | "ultra" | "critical" => Some(Level::UltraHigh),
            _ => None,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Low => write!(f, "low"),
            Level::Medium => write!(f, "medium"),
            Level::High => write!(f, "high"),
            Level::UltraHigh => write!(f, "ultra-high"),
        }
    }
}

/// Task status as recorded in the task file and mirrored in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "pending" | "todo" | "open" => Some(TaskStatus::Pending),
            "in-progress" | "active" | "working" => Some(TaskStatus::InProgress),
            "completed" | "complete" | "done" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in-progress"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Metadata exactly as declared in a task file's front matter.
///
/// Every field is optional; unknown enum spellings read as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de_level", skip_serializing_if = "Option::is_none")]
    pub priority: Option<Level>,
    #[serde(default, deserialize_with = "de_level", skip_serializing_if = "Option::is_none")]
    pub leverage: Option<Level>,
    #[serde(default, alias = "dependencies", deserialize_with = "de_dependencies")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_gathered: Option<bool>,
    #[serde(default, deserialize_with = "de_status", skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

fn de_level<'de, D>(d: D) -> std::result::Result<Option<Level>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_yaml::Value> = Option::deserialize(d)?;
    Ok(raw.as_ref().and_then(|v| v.as_str()).and_then(Level::parse))
}

fn de_status<'de, D>(d: D) -> std::result::Result<Option<TaskStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_yaml::Value> = Option::deserialize(d)?;
    Ok(raw.as_ref().and_then(|v| v.as_str()).and_then(TaskStatus::parse))
}

fn de_dependencies<'de, D>(d: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let raw: Option<OneOrMany> = Option::deserialize(d)?;
    Ok(match raw {
        None => Vec::new(),
        Some(OneOrMany::One(s)) if s.trim().is_empty() => Vec::new(),
        Some(OneOrMany::One(s)) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Some(OneOrMany::Many(v)) => v,
    })
}

/// A schedulable unit of work with defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Canonical identifier.
    pub id: TaskId,
    /// Human-readable name (front matter `name`, else the id).
    pub display_name: String,
    /// Path of the backing task file.
    pub path: PathBuf,
    pub priority: Priority,
    pub leverage: Leverage,
    /// Canonical dependency ids, deduplicated, declaration order kept.
    pub depends_on: Vec<TaskId>,
    /// False until the context-gathering pass has produced a manifest.
    pub context_gathered: bool,
    pub status: TaskStatus,
    /// Declared target branch, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl Task {
    /// Build a task from its file path and declared metadata.
    pub fn from_meta(path: &Path, meta: &TaskMeta) -> Self {
        let id = TaskId::from_path(path);
        let display_name = meta
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .unwrap_or_else(|| id.to_string());
        let mut task = Self {
            display_name,
            path: path.to_path_buf(),
            priority: meta.priority.unwrap_or_default(),
            leverage: meta.leverage.unwrap_or_default(),
            depends_on: Vec::new(),
            context_gathered: meta.context_gathered.unwrap_or(false),
            status: meta.status.unwrap_or_default(),
            branch: meta
                .branch
                .as_deref()
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(String::from),
            id,
        };
        task.merge_dependencies(meta.depends_on.iter().map(String::as_str));
        task
    }

    /// A minimal pending task, mostly useful in tests and fixtures.
    pub fn new(id: &str) -> Self {
        Self::from_meta(Path::new(&format!("{}.md", id)), &TaskMeta::default())
    }

    /// Append canonicalized dependencies, skipping duplicates. A task naming
    /// itself is kept so the graph reports the self-loop.
    pub fn merge_dependencies<'a>(&mut self, extra: impl IntoIterator<Item = &'a str>) {
        for raw in extra {
            let dep = TaskId::canonical(raw);
            if dep.is_empty() || self.depends_on.contains(&dep) {
                continue;
            }
            self.depends_on.push(dep);
        }
    }

    /// Return a copy with the given branch recorded.
    pub fn with_branch(&self, branch: &str) -> Self {
        Self {
            branch: Some(branch.to_string()),
            ..self.clone()
        }
    }

    /// Return a copy with the readiness flag overridden.
    pub fn with_context_gathered(&self, gathered: bool) -> Self {
        Self {
            context_gathered: gathered,
            ..self.clone()
        }
    }

    /// Branch name derived from the display name when none was declared.
    pub fn derived_branch(&self) -> String {
        if let Some(branch) = &self.branch {
            return branch.clone();
        }
        let slug: String = self
            .display_name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let slug = slug
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        if slug.is_empty() {
            format!("task/{}", self.id)
        } else {
            format!("task/{}", slug)
        }
    }
}
