//! The metadata index: one JSON document holding every [`CacheEntry`].

use super::entry::CacheEntry;
use super::CacheError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataIndex {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

impl Default for MetadataIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl MetadataIndex {
    /// Load the index at `path`. A missing file is an empty index; an
    /// unreadable one is quarantined and replaced by an empty index.
    pub fn load_or_recover(path: &Path) -> Result<Self, CacheError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        match Self::load(path) {
            Ok(index) => Ok(index),
            Err(CacheError::Index(msg)) => {
                let quarantine = path.with_extension("json.quarantined");
                warn!(
                    path = %path.display(),
                    error = %msg,
                    "quarantining corrupt metadata index"
                );
                fs::rename(path, &quarantine).map_err(|e| CacheError::io(path, e))?;
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Strict load: any decoding problem is an error.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let content = fs::read_to_string(path).map_err(|e| CacheError::io(path, e))?;
        let index: MetadataIndex = serde_json::from_str(&content)
            .map_err(|e| CacheError::Index(format!("decode {}: {e}", path.display())))?;
        if index.version > INDEX_VERSION {
            return Err(CacheError::Index(format!(
                "index version {} is newer than supported {INDEX_VERSION}",
                index.version
            )));
        }
        Ok(index)
    }

    /// Atomic rewrite: write to `.tmp`, rename into place.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| CacheError::Index(format!("encode: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| CacheError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CacheError::io(path, e)
        })
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// Insert, returning the entry it replaced.
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.key.clone(), entry)
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }
}
