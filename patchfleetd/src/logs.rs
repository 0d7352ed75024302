//! Storage for the test logs attached to reports.
//!
//! Logs are keyed by [`patchfleet_common::log_name`]. With a directory they
//! live as plain files under it; without one they are kept in memory.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use patchfleet_common::ArtifactStore;
use tracing::debug;

pub enum LogStore {
    Memory(RwLock<HashMap<String, String>>),
    Disk(PathBuf),
}

impl LogStore {
    pub fn in_memory() -> Self {
        Self::Memory(RwLock::new(HashMap::new()))
    }

    pub fn on_disk(dir: PathBuf) -> Self {
        Self::Disk(dir)
    }

    pub fn store(&self, key: &str, text: &str) -> std::io::Result<()> {
        match self {
            Self::Memory(logs) => {
                let mut logs = logs.write().unwrap_or_else(|e| e.into_inner());
                logs.insert(key.to_string(), text.to_string());
                Ok(())
            }
            Self::Disk(dir) => {
                let path = key_path(dir, key);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, text)?;
                debug!("Stored log {:?}", path);
                Ok(())
            }
        }
    }

    pub fn fetch(&self, key: &str) -> std::io::Result<Option<String>> {
        match self {
            Self::Memory(logs) => {
                let logs = logs.read().unwrap_or_else(|e| e.into_inner());
                Ok(logs.get(key).cloned())
            }
            Self::Disk(dir) => match std::fs::read_to_string(key_path(dir, key)) {
                Ok(text) => Ok(Some(text)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            },
        }
    }
}

impl ArtifactStore for LogStore {
    fn release(&self, key: &str) -> std::io::Result<()> {
        match self {
            Self::Memory(logs) => {
                let mut logs = logs.write().unwrap_or_else(|e| e.into_inner());
                logs.remove(key);
                Ok(())
            }
            Self::Disk(dir) => match std::fs::remove_file(key_path(dir, key)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            },
        }
    }
}

/// Map a log key onto a path below `dir`. Components that could escape the
/// directory are neutralized.
fn key_path(dir: &Path, key: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    for piece in key.split('/').filter(|p| !p.is_empty()) {
        match Path::new(piece).components().next() {
            Some(Component::Normal(_)) => path.push(piece),
            _ => path.push(piece.replace('.', "_")),
        }
    }
    path
}
