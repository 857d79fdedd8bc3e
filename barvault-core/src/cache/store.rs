//! `CacheStore`: keyed reads and writes over the index and blob directory.

use super::entry::{CacheEntry, WriteMeta};
use super::frame::{frame_span, normalize_frame, read_parquet, slice_frame, write_parquet};
use super::index::MetadataIndex;
use super::key::{cache_key, CacheParams, RecordKind};
use super::CacheError;
use crate::config::CacheConfig;
use crate::domain::{DateSpan, Instrument};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use polars::prelude::DataFrame;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

pub const INDEX_FILE: &str = "index.json";
pub const BLOB_DIR: &str = "blobs";

/// A blob read back from the cache, already date-normalised and sliced.
#[derive(Debug, Clone)]
pub struct CachedFrame {
    pub frame: DataFrame,
    pub entry: CacheEntry,
}

/// Selects entries for `clear` and `export`. Empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub kind: Option<RecordKind>,
    pub instrument: Option<String>,
}

impl EntryFilter {
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        let kind_ok = self.kind.map_or(true, |k| k == entry.kind);
        let instrument_ok = self
            .instrument
            .as_deref()
            .map_or(true, |i| entry.instrument() == Some(i));
        kind_ok && instrument_ok
    }
}

pub struct CacheStore {
    root: PathBuf,
    config: CacheConfig,
    pub(super) index: Mutex<MetadataIndex>,
    nonce: AtomicU64,
}

impl CacheStore {
    /// Open (or create) the cache at `config.root`.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let root = config.root.clone();
        fs::create_dir_all(root.join(BLOB_DIR)).map_err(|e| CacheError::io(&root, e))?;
        let index = MetadataIndex::load_or_recover(&root.join(INDEX_FILE))?;
        info!(root = %root.display(), entries = index.len(), "opened cache");
        Ok(Self {
            root,
            config,
            index: Mutex::new(index),
            nonce: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(super) fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub(super) fn blob_abs(&self, entry: &CacheEntry) -> PathBuf {
        self.root.join(&entry.blob_path)
    }

    /// Metadata only; does not touch the blob or `last_accessed_at`.
    pub fn entry(&self, kind: RecordKind, params: &CacheParams) -> Option<CacheEntry> {
        self.index.lock().get(&cache_key(kind, params)).cloned()
    }

    /// Snapshot of every entry, in key order.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.index.lock().entries().cloned().collect()
    }

    /// Read an entry's blob, optionally sliced to `range`.
    ///
    /// Returns `Ok(None)` on a miss, including an expired `range_slice` and
    /// a blob that fails to decode (which is quarantined and its entry
    /// dropped).
    pub fn get(
        &self,
        kind: RecordKind,
        params: &CacheParams,
        range: Option<DateSpan>,
    ) -> Result<Option<CachedFrame>, CacheError> {
        let key = cache_key(kind, params);

        // A concurrent rewrite can delete the blob between our index read and
        // the file open; one retry picks up the replacement.
        for _ in 0..2 {
            let entry = match self.index.lock().get(&key) {
                Some(e) => e.clone(),
                None => return Ok(None),
            };

            if entry.is_expired(self.config.ttl(), Utc::now()) {
                debug!(key = %key, "expired entry");
                self.remove_if_current(&entry)?;
                return Ok(None);
            }

            let frame = match read_parquet(&self.blob_abs(&entry)).and_then(|df| normalize_frame(kind, df)) {
                Ok(frame) => frame,
                Err(e) => {
                    if self.is_current(&entry) {
                        warn!(key = %key, error = %e, "unreadable blob, treating as miss");
                        self.discard_corrupt(&entry)?;
                        return Ok(None);
                    }
                    continue;
                }
            };

            let frame = match range {
                Some(span) => slice_frame(&frame, span)?,
                None => frame,
            };

            let entry = self.touch(&key).unwrap_or(entry);
            debug!(key = %key, rows = frame.height(), "cache hit");
            return Ok(Some(CachedFrame { frame, entry }));
        }
        Ok(None)
    }

    /// Write `frame` under `(kind, params)` with only the completeness flag.
    pub fn set(
        &self,
        kind: RecordKind,
        params: &CacheParams,
        frame: &DataFrame,
        is_complete: bool,
    ) -> Result<CacheEntry, CacheError> {
        self.set_with(kind, params, frame, WriteMeta::complete(is_complete))
    }

    /// Write `frame` under `(kind, params)`, replacing any prior entry.
    ///
    /// The blob is written to a fresh path first; the index swap and the old
    /// blob's deletion happen afterwards, so readers never see a key with no
    /// blob behind it.
    pub fn set_with(
        &self,
        kind: RecordKind,
        params: &CacheParams,
        frame: &DataFrame,
        meta: WriteMeta,
    ) -> Result<CacheEntry, CacheError> {
        let entry = self.write_entry(kind, params, frame, meta, None)?;
        if let Some(budget) = self.config.max_bytes() {
            self.evict_to_budget(budget)?;
        }
        Ok(entry)
    }

    /// Shared write path for `set_with` and `import`. `stamps` carries the
    /// timestamps of an imported entry.
    pub(super) fn write_entry(
        &self,
        kind: RecordKind,
        params: &CacheParams,
        frame: &DataFrame,
        meta: WriteMeta,
        stamps: Option<&CacheEntry>,
    ) -> Result<CacheEntry, CacheError> {
        let key = cache_key(kind, params);
        let frame = normalize_frame(kind, frame.clone())?;
        let span = match meta.span {
            Some(span) => Some(span),
            None => frame_span(&frame)?,
        };

        let rel = self.blob_rel_path(kind, params, &key);
        let abs = self.root.join(&rel);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        let tmp = abs.with_extension("parquet.tmp");
        write_parquet(&frame, &tmp)?;
        fs::rename(&tmp, &abs).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CacheError::io(&abs, e)
        })?;

        let bytes = fs::read(&abs).map_err(|e| CacheError::io(&abs, e))?;
        let now = Utc::now();

        let (entry, prior) = {
            let mut index = self.index.lock();
            let first_seen = index.get(&key).map(|e| e.created_at);
            let entry = CacheEntry {
                key: key.clone(),
                kind,
                params: params.clone(),
                blob_path: rel,
                row_count: frame.height(),
                size_bytes: bytes.len() as u64,
                is_complete: meta.is_complete,
                best_effort: meta.best_effort,
                partial_streak: meta.partial_streak,
                span,
                content_hash: blake3::hash(&bytes).to_hex().to_string(),
                created_at: stamps
                    .map(|s| s.created_at)
                    .or(first_seen)
                    .unwrap_or(now),
                updated_at: stamps.map_or(now, |s| s.updated_at),
                last_accessed_at: stamps.map_or(now, |s| s.last_accessed_at),
            };
            let prior = index.insert(entry.clone());
            if let Err(e) = index.save(&self.index_path()) {
                // Roll back the in-memory swap so memory matches disk.
                match &prior {
                    Some(p) => {
                        index.insert(p.clone());
                    }
                    None => {
                        index.remove(&key);
                    }
                }
                let _ = fs::remove_file(&abs);
                return Err(e);
            }
            (entry, prior)
        };

        if let Some(prior) = prior {
            if prior.blob_path != entry.blob_path {
                remove_blob_quiet(&self.blob_abs(&prior));
            }
        }

        info!(
            key = %key,
            rows = entry.row_count,
            bytes = entry.size_bytes,
            complete = entry.is_complete,
            "cache write"
        );
        Ok(entry)
    }

    /// Remove one entry and its blob. Returns whether anything was removed.
    pub fn remove(&self, kind: RecordKind, params: &CacheParams) -> Result<bool, CacheError> {
        let key = cache_key(kind, params);
        let removed = {
            let mut index = self.index.lock();
            let removed = index.remove(&key);
            if removed.is_some() {
                index.save(&self.index_path())?;
            }
            removed
        };
        if let Some(entry) = &removed {
            remove_blob_quiet(&self.blob_abs(entry));
            debug!(key = %key, "removed entry");
        }
        Ok(removed.is_some())
    }

    /// Remove every entry matching `filter`. Returns the number removed.
    pub fn clear(&self, filter: &EntryFilter) -> Result<usize, CacheError> {
        let removed: Vec<CacheEntry> = {
            let mut index = self.index.lock();
            let keys: Vec<String> = index
                .entries()
                .filter(|e| filter.matches(e))
                .map(|e| e.key.clone())
                .collect();
            let removed: Vec<CacheEntry> = keys.iter().filter_map(|k| index.remove(k)).collect();
            if !removed.is_empty() {
                index.save(&self.index_path())?;
            }
            removed
        };
        for entry in &removed {
            remove_blob_quiet(&self.blob_abs(entry));
        }
        info!(removed = removed.len(), "cleared cache entries");
        Ok(removed.len())
    }

    fn is_current(&self, entry: &CacheEntry) -> bool {
        self.index
            .lock()
            .get(&entry.key)
            .is_some_and(|e| e.blob_path == entry.blob_path)
    }

    /// Drop `entry` only if the index still points at the same blob.
    pub(super) fn remove_if_current(&self, entry: &CacheEntry) -> Result<bool, CacheError> {
        {
            let mut index = self.index.lock();
            let current = index
                .get(&entry.key)
                .is_some_and(|e| e.blob_path == entry.blob_path);
            if !current {
                return Ok(false);
            }
            index.remove(&entry.key);
            index.save(&self.index_path())?;
        }
        remove_blob_quiet(&self.blob_abs(entry));
        Ok(true)
    }

    fn discard_corrupt(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let blob = self.blob_abs(entry);
        if blob.exists() {
            let quarantine = blob.with_extension("parquet.quarantined");
            warn!(path = %blob.display(), "quarantining corrupt blob");
            let _ = fs::rename(&blob, &quarantine);
        }
        let mut index = self.index.lock();
        if index
            .get(&entry.key)
            .is_some_and(|e| e.blob_path == entry.blob_path)
        {
            index.remove(&entry.key);
            index.save(&self.index_path())?;
        }
        Ok(())
    }

    /// Bump `last_accessed_at`. A failed index write is logged, not raised:
    /// the read itself succeeded.
    fn touch(&self, key: &str) -> Option<CacheEntry> {
        let mut index = self.index.lock();
        let entry = index.get_mut(key)?;
        entry.last_accessed_at = Utc::now();
        let updated = entry.clone();
        if let Err(e) = index.save(&self.index_path()) {
            warn!(key = %key, error = %e, "failed to persist access time");
        }
        Some(updated)
    }

    /// `blobs/full_history/{EXCHANGE}/…` for full histories, `blobs/{kind}/…`
    /// otherwise. The nonce makes every write land on a fresh path.
    fn blob_rel_path(&self, kind: RecordKind, params: &CacheParams, key: &str) -> PathBuf {
        let mut dir = PathBuf::from(BLOB_DIR).join(kind.as_str());
        if kind == RecordKind::FullHistory {
            let exchange = params
                .instrument()
                .and_then(|i| Instrument::parse(i).ok())
                .map_or("OTHER", |i| i.exchange().code());
            dir = dir.join(exchange);
        }
        let slug: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
            .collect();
        let seq = self.nonce.fetch_add(1, Ordering::Relaxed);
        let stamp = write_stamp(Utc::now());
        dir.join(format!("{slug}_{stamp}_{seq}.parquet"))
    }
}

fn write_stamp(now: DateTime<Utc>) -> String {
    format!(
        "{}{:09}",
        now.format("%Y%m%d%H%M%S"),
        now.timestamp_subsec_nanos()
    )
}

pub(super) fn remove_blob_quiet(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to delete blob");
        }
    }
}
