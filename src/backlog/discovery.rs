//! Append-only discovery feed.
//!
//! Producers append one task reference per line. The consumer tracks the
//! byte offset it has processed in a `<feed>.offset` sidecar so restarts
//! never reprocess old lines. A trailing line without a newline is still
//! being written and is left for the next read.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::{rlog_debug, rlog_warn, Result};

/// New references read from the feed, not yet committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedBatch {
    pub refs: Vec<String>,
    pub end_offset: u64,
}

#[derive(Debug, Clone)]
pub struct DiscoveryFeed {
    path: PathBuf,
    offset_path: PathBuf,
}

impl DiscoveryFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut offset_name = path.as_os_str().to_owned();
        offset_name.push(".offset");
        Self {
            offset_path: PathBuf::from(offset_name),
            path,
        }
    }

    /// Append a reference (used by producers and tests).
    pub fn append(&self, task_ref: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", task_ref.trim())?;
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        fs::read_to_string(&self.offset_path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Read complete lines past the committed offset.
    pub fn read_new(&self) -> Result<FeedBatch> {
        let mut offset = self.offset();
        if !self.path.exists() {
            return Ok(FeedBatch {
                refs: Vec::new(),
                end_offset: offset,
            });
        }

        let mut file = fs::File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < offset {
            rlog_warn!(
                "Discovery feed {} shrank below offset {}, rereading from start",
                self.path.display(),
                offset
            );
            offset = 0;
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let complete = match buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        let text = String::from_utf8_lossy(&buf[..complete]);
        let refs: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(String::from)
            .collect();

        Ok(FeedBatch {
            refs,
            end_offset: offset + complete as u64,
        })
    }

    /// Persist the offset after a batch has been ingested.
    pub fn commit(&self, batch: &FeedBatch) -> Result<()> {
        if let Some(parent) = self.offset_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.offset_path, batch.end_offset.to_string())?;
        rlog_debug!(
            "Discovery feed offset -> {} ({} refs)",
            batch.end_offset,
            batch.refs.len()
        );
        Ok(())
    }
}
