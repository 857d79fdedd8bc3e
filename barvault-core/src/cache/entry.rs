use super::key::{CacheParams, RecordKind};
use crate::domain::DateSpan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One row of the metadata index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    #[serde(rename = "record_kind")]
    pub kind: RecordKind,
    pub params: CacheParams,
    /// Relative to the cache root.
    pub blob_path: PathBuf,
    pub row_count: usize,
    pub size_bytes: u64,
    pub is_complete: bool,
    /// Accepted as final although not exactly complete.
    #[serde(default)]
    pub best_effort: bool,
    /// Consecutive incomplete rewrites of this key.
    #[serde(default)]
    pub partial_streak: u32,
    /// First and last covered date. For full histories the start is the
    /// listing date, not necessarily the first row.
    #[serde(default)]
    pub span: Option<DateSpan>,
    /// BLAKE3 of the blob bytes.
    #[serde(default)]
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn instrument(&self) -> Option<&str> {
        self.params.instrument()
    }

    /// True when a TTL applies to this entry and it has elapsed.
    pub fn is_expired(&self, ttl: Option<chrono::Duration>, now: DateTime<Utc>) -> bool {
        match ttl {
            Some(ttl) if !self.kind.is_permanent() => now - self.updated_at > ttl,
            _ => false,
        }
    }
}

/// Bookkeeping supplied alongside a blob write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteMeta {
    pub is_complete: bool,
    pub best_effort: bool,
    pub partial_streak: u32,
    /// Defaults to the min/max of the frame's date column.
    pub span: Option<DateSpan>,
}

impl WriteMeta {
    pub fn complete(is_complete: bool) -> Self {
        Self {
            is_complete,
            ..Self::default()
        }
    }

    pub fn with_span(mut self, span: DateSpan) -> Self {
        self.span = Some(span);
        self
    }
}
