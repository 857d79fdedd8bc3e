//! Persistent cache: a JSON metadata index plus one Parquet blob per entry.
//!
//! Layout under the cache root:
//!
//! ```text
//! index.json
//! blobs/full_history/{EXCHANGE}/{key}_{nonce}.parquet
//! blobs/{kind}/{key}_{nonce}.parquet
//! ```
//!
//! Features:
//! - At most one live entry per key; a rewrite deletes the prior blob
//! - Atomic writes for blobs and the index (write to .tmp, rename into place)
//! - Date column normalised to `Date` on every read
//! - Corrupt blobs and index files are quarantined (`*.quarantined`)
//! - LRU eviction and TTL expiry for `range_slice` entries only
//! - Report, verify, export and import for maintenance

pub mod entry;
pub mod frame;
pub mod index;
pub mod key;
pub mod locks;
pub mod maintenance;
pub mod store;
pub mod transfer;

pub use entry::{CacheEntry, WriteMeta};
pub use key::{cache_key, CacheParams, RecordKind};
pub use locks::KeyLocks;
pub use maintenance::{AgeStats, CacheReport, EvictionReport, VerifyReport};
pub use store::{CacheStore, CachedFrame, EntryFilter};
pub use transfer::{ImportMode, TransferReport};

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("metadata index error: {0}")]
    Index(String),

    #[error("invalid blob: {0}")]
    InvalidBlob(String),
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
