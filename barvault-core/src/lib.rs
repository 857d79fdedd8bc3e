//! barvault core: market-data cache and persistence for an equity backtester.
//!
//! This crate owns everything between a backtest and the upstream data
//! vendors:
//! - Domain types (instruments, adjustment modes, daily bars)
//! - Cache store: JSON metadata index plus one Parquet blob per entry
//! - Trading calendar and suspension services
//! - Completeness model (expected rows vs. stored rows)
//! - Providers (Tushare, Eastmoney, Yahoo) with retry and circuit breaking
//! - Acquisition orchestrator with ordered failover
//! - Incremental sync engine and batch sync
//!
//! Downstream code only needs [`SyncEngine::get_daily_series`].

pub mod acquisition;
pub mod batch;
pub mod cache;
pub mod calendar;
pub mod completeness;
pub mod config;
pub mod domain;
pub mod provider;
pub mod suspension;
pub mod sync;

pub use acquisition::{Acquired, AcquisitionError, ListingDate, Orchestrator, ProviderFailure};
pub use batch::{sync_many, BatchSummary, LogProgress, StdoutProgress, SyncProgress, SyncRequest};
pub use cache::{CacheError, CacheStore};
pub use completeness::{Assessment, CompletenessCalculator, Expectation};
pub use config::{Config, ConfigError};
pub use domain::{AdjustMode, DailyBar, Exchange, Instrument};
pub use sync::{DailySeries, SeriesSource, SyncEngine, SyncError};
