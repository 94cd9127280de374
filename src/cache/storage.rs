//! Flat string-keyed persistent stores backing the data cache.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::{OrgCheckError, Result};

/// Flat string-keyed store.
pub trait Storage: Send + Sync {
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn get_item(&self, key: &str) -> Option<String>;
    fn remove_item(&self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// In-process store with an optional byte quota.
///
/// The quota counts key and value bytes of every entry. A write that would
/// exceed it fails and leaves the store unchanged, the same way browser
/// storage rejects writes over its quota.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota: Some(bytes),
        }
    }

    /// Bytes currently held (keys plus values).
    pub fn used_bytes(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0)
    }
}

impl Storage for MemoryStorage {
    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| OrgCheckError::Storage("memory storage lock poisoned".to_string()))?;
        if let Some(quota) = self.quota {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = used + key.len() + value.len();
            if needed > quota {
                return Err(OrgCheckError::Storage(format!(
                    "quota exceeded writing {key}: {needed} bytes needed, quota is {quota}"
                )));
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_item(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn remove_item(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// One file per key under a directory.
///
/// File names are the hex encoding of the key, so any key is a valid name
/// and [`keys()`](Storage::keys) can recover it. Writes go to a temporary
/// file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

const ENTRY_EXTENSION: &str = "entry";

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            OrgCheckError::Storage(format!(
                "failed to create cache dir {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    /// Default directory: `~/.cache/orgcheck`.
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("orgcheck")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(hex::encode(key))
            .with_extension(ENTRY_EXTENSION)
    }
}

impl Storage for FileStorage {
    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, value).map_err(|e| {
            OrgCheckError::Storage(format!(
                "failed to write cache file {}: {e}",
                tmp_path.display()
            ))
        })?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            OrgCheckError::Storage(format!(
                "failed to rename cache file {} → {}: {e}",
                tmp_path.display(),
                path.display()
            ))
        })
    }

    fn get_item(&self, key: &str) -> Option<String> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(value) => Some(value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read cache file");
                None
            }
        }
    }

    fn remove_item(&self, key: &str) {
        let path = self.path_for(key);
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }

    fn keys(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to list cache dir");
                return Vec::new();
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION))
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?;
                String::from_utf8(hex::decode(stem).ok()?).ok()
            })
            .collect()
    }
}
