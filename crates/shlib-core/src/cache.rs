//! Persisted plugin verification cache.
//!
//! Classifying a plugin means reading its image; the cache remembers decoded
//! records keyed by absolute path and file modification time so later runs
//! can skip that work. Only positive results are stored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::metadata::{PluginRecord, RuntimeVersion};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One cached record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Packed `0xMMmmpp` version.
    pub version: u32,
    pub debug: bool,
    pub build_key: String,
    pub last_modified: DateTime<Utc>,
}

impl CacheEntry {
    fn record(&self) -> PluginRecord {
        PluginRecord {
            version: RuntimeVersion::from_packed(self.version),
            debug: self.debug,
            build_key: self.build_key.clone(),
        }
    }
}

/// File-backed map from plugin path to its verification record.
#[derive(Debug)]
pub struct PluginCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl PluginCache {
    /// Opens the cache at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt plugin cache");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot read plugin cache");
                HashMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The cached record for `file`, if its timestamp still matches.
    pub fn lookup(&self, file: &Path, modified: DateTime<Utc>) -> Option<PluginRecord> {
        let entries = self.entries.lock();
        let entry = entries.get(&key(file))?;
        (entry.last_modified == modified).then(|| entry.record())
    }

    /// Records `record` for `file` and writes the cache back to disk.
    pub fn store(
        &self,
        file: &Path,
        modified: DateTime<Utc>,
        record: &PluginRecord,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        entries.insert(
            key(file),
            CacheEntry {
                version: record.version.packed(),
                debug: record.debug,
                build_key: record.build_key.clone(),
                last_modified: modified,
            },
        );
        let json = serde_json::to_vec_pretty(&*entries)?;
        self.persist(&json)
    }

    fn persist(&self, json: &[u8]) -> Result<(), CacheError> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CacheError::Io { path, source }
        };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io(dir))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json).map_err(io(&tmp))?;
        std::fs::rename(&tmp, &self.path).map_err(io(&self.path))
    }
}

fn key(file: &Path) -> String {
    file.to_string_lossy().into_owned()
}

/// Modification time of `file`.
pub fn modified_time(file: &Path) -> std::io::Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(std::fs::metadata(file)?.modified()?))
}
