use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::{rlog_debug, Error, Result};

/// Load/save boundary for one snapshot document.
pub trait StateStore<T>: Send + Sync {
    /// `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<T>>;
    fn save(&self, snapshot: &T) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Pretty-printed JSON file written via a temp file and rename, keeping
/// the previous version as `.bak`.
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> StateStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>> {
        if !self.path.exists() {
            rlog_debug!("State file not found: {}", self.path.display());
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&contents)?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &T) -> Result<()> {
        let contents = serde_json::to_string_pretty(snapshot)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        if self.path.exists() {
            fs::copy(&self.path, self.path.with_extension("json.bak"))?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// In-memory store for tests and dry runs.
pub struct MemoryStore<T> {
    value: Mutex<Option<T>>,
    saves: AtomicUsize,
}

impl<T: Clone> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn with(snapshot: T) -> Self {
        Self {
            value: Mutex::new(Some(snapshot)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of `save` calls so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<T> {
        self.value.lock().ok().and_then(|v| v.clone())
    }
}

impl<T: Clone> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> StateStore<T> for MemoryStore<T> {
    fn load(&self) -> Result<Option<T>> {
        Ok(self.current())
    }

    fn save(&self, snapshot: &T) -> Result<()> {
        let mut value = self
            .value
            .lock()
            .map_err(|_| Error::Validation("state store lock poisoned".to_string()))?;
        *value = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if let Ok(mut value) = self.value.lock() {
            *value = None;
        }
        Ok(())
    }
}
