//! The task backlog on disk: Markdown task files with YAML front matter,
//! plus the append-only discovery feed.

pub mod discovery;
pub mod frontmatter;
pub mod store;

pub use discovery::DiscoveryFeed;
pub use store::{ArchiveOutcome, FsTaskStore, TaskStore};
