//! Copy cache entries between cache roots.
//!
//! An export is itself a valid cache root (`index.json` plus `blobs/`), so
//! it can be opened directly or imported into another cache.

use super::entry::{CacheEntry, WriteMeta};
use super::frame::{normalize_frame, read_parquet};
use super::index::MetadataIndex;
use super::store::{CacheStore, EntryFilter, INDEX_FILE};
use super::CacheError;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Keep whichever side has the newer `updated_at` per key.
    Merge,
    /// Clear this cache first, then take everything from the source.
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferReport {
    pub copied: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl CacheStore {
    /// Copy matching entries and their blobs into `target`.
    pub fn export(&self, target: &Path, filter: &EntryFilter) -> Result<TransferReport, CacheError> {
        fs::create_dir_all(target).map_err(|e| CacheError::io(target, e))?;

        let mut report = TransferReport::default();
        let mut exported = MetadataIndex::default();

        for entry in self.entries().into_iter().filter(|e| filter.matches(e)) {
            let src = self.blob_abs(&entry);
            let dst = target.join(&entry.blob_path);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
            }
            match fs::copy(&src, &dst) {
                Ok(_) => {
                    exported.insert(entry);
                    report.copied += 1;
                }
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "skipping entry with unreadable blob");
                    report.failed += 1;
                }
            }
        }

        exported.save(&target.join(INDEX_FILE))?;
        info!(
            target = %target.display(),
            copied = report.copied,
            failed = report.failed,
            "exported cache"
        );
        Ok(report)
    }

    /// Bring entries from the cache root at `source` into this cache.
    ///
    /// Every imported entry goes through the normal write path, so the
    /// one-entry-per-key rule holds and blobs get fresh local paths.
    pub fn import(&self, source: &Path, mode: ImportMode) -> Result<TransferReport, CacheError> {
        let incoming = MetadataIndex::load(&source.join(INDEX_FILE))?;

        if mode == ImportMode::Replace {
            self.clear(&EntryFilter::default())?;
        }

        let mut report = TransferReport::default();
        for entry in incoming.entries() {
            if mode == ImportMode::Merge {
                if let Some(existing) = self.entry(entry.kind, &entry.params) {
                    if existing.updated_at >= entry.updated_at {
                        report.skipped += 1;
                        continue;
                    }
                }
            }

            let blob = source.join(&entry.blob_path);
            let frame = match read_parquet(&blob).and_then(|df| normalize_frame(entry.kind, df)) {
                Ok(f) => f,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "skipping unreadable imported blob");
                    report.failed += 1;
                    continue;
                }
            };

            self.write_entry(entry.kind, &entry.params, &frame, meta_of(entry), Some(entry))?;
            report.copied += 1;
        }

        if let Some(budget) = self.config().max_bytes() {
            self.evict_to_budget(budget)?;
        }

        info!(
            source = %source.display(),
            copied = report.copied,
            skipped = report.skipped,
            failed = report.failed,
            "imported cache"
        );
        Ok(report)
    }
}

fn meta_of(entry: &CacheEntry) -> WriteMeta {
    WriteMeta {
        is_complete: entry.is_complete,
        best_effort: entry.best_effort,
        partial_streak: entry.partial_streak,
        span: entry.span,
    }
}
