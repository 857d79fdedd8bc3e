//! Parallel sync of many instruments on a private rayon pool.

use crate::domain::{AdjustMode, Instrument};
use crate::sync::{DailySeries, SyncEngine, SyncError};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// One `get_daily_series` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub instrument: Instrument,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub adj: AdjustMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub instrument: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Succeeded, but the series is not complete.
    pub incomplete: usize,
    pub errors: Vec<BatchFailure>,
}

/// Progress callbacks for a batch. Called from worker threads.
pub trait SyncProgress: Send + Sync {
    fn on_start(&self, instrument: &Instrument, index: usize, total: usize);

    fn on_complete(
        &self,
        instrument: &Instrument,
        index: usize,
        total: usize,
        result: &Result<DailySeries, SyncError>,
    );

    fn on_batch_complete(&self, summary: &BatchSummary);
}

/// Reports through `tracing`.
pub struct LogProgress;

impl SyncProgress for LogProgress {
    fn on_start(&self, instrument: &Instrument, index: usize, total: usize) {
        info!(%instrument, n = index + 1, total, "syncing");
    }

    fn on_complete(
        &self,
        instrument: &Instrument,
        _index: usize,
        _total: usize,
        result: &Result<DailySeries, SyncError>,
    ) {
        match result {
            Ok(s) => info!(
                %instrument,
                rows = s.bars.len(),
                complete = s.is_complete,
                source = %s.source,
                "synced"
            ),
            Err(e) => warn!(%instrument, error = %e, "sync failed"),
        }
    }

    fn on_batch_complete(&self, summary: &BatchSummary) {
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            incomplete = summary.incomplete,
            "batch complete"
        );
    }
}

/// Plain progress lines on stdout.
pub struct StdoutProgress;

impl SyncProgress for StdoutProgress {
    fn on_start(&self, instrument: &Instrument, index: usize, total: usize) {
        println!("[{}/{}] Syncing {instrument}...", index + 1, total);
    }

    fn on_complete(
        &self,
        instrument: &Instrument,
        _index: usize,
        _total: usize,
        result: &Result<DailySeries, SyncError>,
    ) {
        match result {
            Ok(s) if s.is_complete => {
                println!("  OK: {instrument} ({} rows, {})", s.bars.len(), s.source)
            }
            Ok(s) => println!(
                "  PARTIAL: {instrument} ({}/{} rows, {})",
                s.bars.len(),
                s.expected_rows,
                s.source
            ),
            Err(e) => println!("  FAIL: {instrument}: {e}"),
        }
    }

    fn on_batch_complete(&self, summary: &BatchSummary) {
        println!(
            "\nSync complete: {}/{} succeeded ({} incomplete), {} failed",
            summary.succeeded, summary.total, summary.incomplete, summary.failed
        );
    }
}

enum Outcome {
    Complete,
    Incomplete,
    Failed(BatchFailure),
}

/// Run every request on `workers` threads and summarise.
///
/// Distinct instruments proceed in parallel; requests for the same
/// instrument and adjustment serialise on the engine's per-key lock.
pub fn sync_many(
    engine: &SyncEngine,
    requests: &[SyncRequest],
    workers: usize,
    progress: &dyn SyncProgress,
) -> Result<BatchSummary, BatchError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()?;
    let total = requests.len();

    let outcomes: Vec<Outcome> = pool.install(|| {
        requests
            .par_iter()
            .enumerate()
            .map(|(index, req)| {
                progress.on_start(&req.instrument, index, total);
                let result = engine.get_daily_series(&req.instrument, req.start, req.end, req.adj);
                progress.on_complete(&req.instrument, index, total, &result);
                match result {
                    Ok(series) if series.is_complete => Outcome::Complete,
                    Ok(_) => Outcome::Incomplete,
                    Err(e) => Outcome::Failed(BatchFailure {
                        instrument: req.instrument.to_string(),
                        error: e.to_string(),
                    }),
                }
            })
            .collect()
    });

    let mut summary = BatchSummary {
        total,
        ..BatchSummary::default()
    };
    for outcome in outcomes {
        match outcome {
            Outcome::Complete => summary.succeeded += 1,
            Outcome::Incomplete => {
                summary.succeeded += 1;
                summary.incomplete += 1;
            }
            Outcome::Failed(failure) => {
                summary.failed += 1;
                summary.errors.push(failure);
            }
        }
    }
    progress.on_batch_complete(&summary);
    Ok(summary)
}
