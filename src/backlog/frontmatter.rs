//! YAML front matter in Markdown task files.

use serde_yaml::{Mapping, Value};

use crate::core::TaskMeta;
use crate::{Error, Result};

const FENCE: &str = "---";
const MANIFEST_HEADING: &str = "context manifest";

/// Split `content` into (front matter YAML, body).
///
/// Returns `None` when the file has no front matter block.
pub fn split(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix(FENCE)?;
    // The opening fence must be alone on its line.
    let rest = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))?;
    if let Some(body) = rest.strip_prefix(FENCE) {
        return Some(("", skip_line(body)));
    }
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let body = skip_line(&rest[end + 4..]);
    Some((yaml, body))
}

fn skip_line(s: &str) -> &str {
    match s.find('\n') {
        Some(pos) => &s[pos + 1..],
        None => "",
    }
}

/// Parse task metadata. A file without front matter yields empty metadata;
/// front matter that fails to parse yields `None`.
pub fn parse_meta(content: &str) -> Option<TaskMeta> {
    match split(content) {
        None => Some(TaskMeta::default()),
        Some((yaml, _)) if yaml.trim().is_empty() => Some(TaskMeta::default()),
        Some((yaml, _)) => serde_yaml::from_str::<TaskMeta>(yaml).ok(),
    }
}

/// The Markdown body without front matter.
pub fn body(content: &str) -> &str {
    split(content).map(|(_, body)| body).unwrap_or(content)
}

/// Rewrite one front-matter key, leaving the body untouched.
pub fn set_key(content: &str, key: &str, value: Value) -> Result<String> {
    let (mut mapping, body) = match split(content) {
        Some((yaml, body)) if yaml.trim().is_empty() => (Mapping::new(), body),
        Some((yaml, body)) => match serde_yaml::from_str::<Value>(yaml)? {
            Value::Mapping(m) => (m, body),
            _ => {
                return Err(Error::Validation(
                    "front matter is not a key/value mapping".to_string(),
                ))
            }
        },
        None => (Mapping::new(), content),
    };
    mapping.insert(Value::String(key.to_string()), value);
    let yaml = serde_yaml::to_string(&Value::Mapping(mapping))?;
    Ok(format!("{}\n{}{}\n{}", FENCE, yaml, FENCE, body))
}

/// True when the body has a `## Context Manifest` section with content.
pub fn has_manifest(content: &str) -> bool {
    let mut in_section = false;
    for line in body(content).lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("## ") {
            if in_section {
                return false;
            }
            in_section = heading.trim().to_lowercase() == MANIFEST_HEADING;
            continue;
        }
        if in_section && trimmed.starts_with("# ") {
            return false;
        }
        if in_section && !trimmed.is_empty() {
            return true;
        }
    }
    false
}

/// Open checklist items (`- [ ] ...`).
pub fn unchecked_items(content: &str) -> Vec<String> {
    body(content)
        .lines()
        .map(str::trim_start)
        .filter_map(|line| {
            line.strip_prefix("- [ ]")
                .or_else(|| line.strip_prefix("* [ ]"))
        })
        .map(|item| item.trim().to_string())
        .collect()
}
