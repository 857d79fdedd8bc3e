//! Eviction, expiry, reporting and verification.

use super::entry::CacheEntry;
use super::frame::{frame_dates, normalize_frame, read_parquet};
use super::key::RecordKind;
use super::store::{remove_blob_quiet, CacheStore};
use super::CacheError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    pub removed: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
    /// False when only permanent entries remain and the budget is still exceeded.
    pub budget_met: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgeStats {
    pub oldest_update: DateTime<Utc>,
    pub newest_update: DateTime<Utc>,
    pub mean_age_hours: f64,
    pub least_recent_access: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheReport {
    pub total_size: u64,
    pub total_entries: usize,
    pub counts_by_kind: BTreeMap<RecordKind, usize>,
    pub complete_count: usize,
    pub incomplete_count: usize,
    pub best_effort_count: usize,
    pub instrument_count: usize,
    pub age_stats: Option<AgeStats>,
}

/// Outcome of [`CacheStore::verify`]. Each list holds entry keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub healthy: usize,
    pub missing_blob: Vec<String>,
    pub unreadable: Vec<String>,
    pub duplicate_dates: Vec<String>,
    pub row_count_mismatch: Vec<String>,
    pub hash_mismatch: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.checked == self.healthy
    }
}

impl CacheStore {
    /// Evict least-recently-accessed `range_slice` entries until the cache is
    /// at or below `evict_target_ratio * max_bytes`. No-op when already
    /// within budget. Permanent kinds are never touched.
    pub fn evict_to_budget(&self, max_bytes: u64) -> Result<EvictionReport, CacheError> {
        let target = (max_bytes as f64 * self.config().evict_target_ratio) as u64;

        let (removed, remaining) = {
            let mut index = self.index.lock();
            let total = index.total_size();
            if total <= max_bytes {
                return Ok(EvictionReport {
                    remaining_bytes: total,
                    budget_met: true,
                    ..EvictionReport::default()
                });
            }

            let mut candidates: Vec<(DateTime<Utc>, String)> = index
                .entries()
                .filter(|e| !e.kind.is_permanent())
                .map(|e| (e.last_accessed_at, e.key.clone()))
                .collect();
            candidates.sort();

            let mut current = total;
            let mut removed = Vec::new();
            for (_, key) in candidates {
                if current <= target {
                    break;
                }
                if let Some(entry) = index.remove(&key) {
                    current = current.saturating_sub(entry.size_bytes);
                    removed.push(entry);
                }
            }
            if !removed.is_empty() {
                index.save(&self.index_path())?;
            }
            (removed, current)
        };

        for entry in &removed {
            remove_blob_quiet(&self.blob_abs(entry));
        }

        let report = EvictionReport {
            removed: removed.len(),
            freed_bytes: removed.iter().map(|e| e.size_bytes).sum(),
            remaining_bytes: remaining,
            budget_met: remaining <= max_bytes,
        };
        if report.budget_met {
            info!(
                removed = report.removed,
                freed = report.freed_bytes,
                remaining = report.remaining_bytes,
                "evicted range slices"
            );
        } else {
            warn!(
                remaining = report.remaining_bytes,
                budget = max_bytes,
                "cache over budget with only permanent entries left"
            );
        }
        Ok(report)
    }

    /// Remove every `range_slice` older than the configured TTL.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let Some(ttl) = self.config().ttl() else {
            return Ok(0);
        };
        let now = Utc::now();
        let removed: Vec<CacheEntry> = {
            let mut index = self.index.lock();
            let keys: Vec<String> = index
                .entries()
                .filter(|e| e.is_expired(Some(ttl), now))
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
        info!(removed = removed.len(), "purged expired entries");
        Ok(removed.len())
    }

    pub fn report(&self) -> CacheReport {
        let entries = self.entries();
        let now = Utc::now();

        let mut counts_by_kind = BTreeMap::new();
        let mut instruments = BTreeSet::new();
        for entry in &entries {
            *counts_by_kind.entry(entry.kind).or_insert(0) += 1;
            if let Some(i) = entry.instrument() {
                instruments.insert(i.to_string());
            }
        }

        let age_stats = (!entries.is_empty()).then(|| {
            let total_hours: f64 = entries
                .iter()
                .map(|e| (now - e.updated_at).num_minutes() as f64 / 60.0)
                .sum();
            AgeStats {
                oldest_update: entries.iter().map(|e| e.updated_at).min().unwrap_or(now),
                newest_update: entries.iter().map(|e| e.updated_at).max().unwrap_or(now),
                mean_age_hours: total_hours / entries.len() as f64,
                least_recent_access: entries
                    .iter()
                    .map(|e| e.last_accessed_at)
                    .min()
                    .unwrap_or(now),
            }
        });

        let complete_count = entries.iter().filter(|e| e.is_complete).count();
        CacheReport {
            total_size: entries.iter().map(|e| e.size_bytes).sum(),
            total_entries: entries.len(),
            counts_by_kind,
            complete_count,
            incomplete_count: entries.len() - complete_count,
            best_effort_count: entries.iter().filter(|e| e.best_effort).count(),
            instrument_count: instruments.len(),
            age_stats,
        }
    }

    /// Check every entry against its blob: exists, decodes, has no repeated
    /// dates, and matches the recorded row count and content hash.
    /// Read-only; nothing is quarantined or removed.
    pub fn verify(&self) -> VerifyReport {
        let mut report = VerifyReport::default();

        for entry in self.entries() {
            report.checked += 1;
            let path = self.blob_abs(&entry);

            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(_) => {
                    report.missing_blob.push(entry.key);
                    continue;
                }
            };

            let frame = match read_parquet(&path).and_then(|df| normalize_frame(entry.kind, df)) {
                Ok(f) => f,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "blob does not decode");
                    report.unreadable.push(entry.key);
                    continue;
                }
            };

            let mut healthy = true;
            if let Ok(dates) = frame_dates(&frame) {
                let distinct: BTreeSet<_> = dates.iter().collect();
                if distinct.len() != dates.len() {
                    report.duplicate_dates.push(entry.key.clone());
                    healthy = false;
                }
            }
            if frame.height() != entry.row_count {
                report.row_count_mismatch.push(entry.key.clone());
                healthy = false;
            }
            if !entry.content_hash.is_empty()
                && blake3::hash(&bytes).to_hex().as_str() != entry.content_hash
            {
                report.hash_mismatch.push(entry.key.clone());
                healthy = false;
            }
            if healthy {
                report.healthy += 1;
            }
        }

        info!(
            checked = report.checked,
            healthy = report.healthy,
            "verified cache"
        );
        report
    }
}
