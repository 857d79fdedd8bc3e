//! Incremental sync: the one entry point downstream code uses.
//!
//! `get_daily_series` serves a window of daily bars from the permanent
//! full-history record of `(instrument, adjustment)`, extending it with a
//! delta fetch when an expected trading day lies past its last row. When no
//! provider can extend the history, an exact range fetch is tried and cached
//! as an evictable `range_slice`; failing that, the stale history is served
//! marked incomplete.

use crate::acquisition::{AcquisitionError, ListingDate, Orchestrator};
use crate::cache::frame::{bars_to_frame, frame_to_bars};
use crate::cache::{CacheEntry, CacheError, CacheParams, CacheStore, KeyLocks, RecordKind, WriteMeta};
use crate::calendar::CalendarService;
use crate::completeness::{Assessment, CompletenessCalculator, Expectation};
use crate::config::{CompletenessConfig, Config};
use crate::domain::{dedupe_by_date, slice_bars, AdjustMode, DailyBar, DateSpan, Instrument};
use crate::provider::{ProviderError, ProviderSet};
use crate::suspension::SuspensionService;
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error(transparent)]
    Exhausted(#[from] AcquisitionError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("provider setup failed: {0}")]
    Setup(#[from] ProviderError),
}

/// Where the rows of a [`DailySeries`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesSource {
    /// A complete cached `range_slice` for exactly this window.
    RangeSlice,
    /// The full history already covered the window.
    FullHistoryCache,
    /// The full history was extended by a delta fetch.
    DeltaMerged,
    /// No history existed; fetched from the listing date.
    FirstFetch,
    /// An incomplete history was re-fetched and merged.
    Repaired,
    /// History unavailable; the window was fetched on its own.
    DirectRange,
    /// Every provider failed; the existing history was served as-is.
    StaleHistory,
}

impl fmt::Display for SeriesSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SeriesSource::RangeSlice => "range_slice",
            SeriesSource::FullHistoryCache => "full_history_cache",
            SeriesSource::DeltaMerged => "delta_merged",
            SeriesSource::FirstFetch => "first_fetch",
            SeriesSource::Repaired => "repaired",
            SeriesSource::DirectRange => "direct_range",
            SeriesSource::StaleHistory => "stale_history",
        })
    }
}

/// Date-ordered, duplicate-free rows for one requested window.
#[derive(Debug, Clone)]
pub struct DailySeries {
    pub instrument: Instrument,
    pub adj: AdjustMode,
    pub bars: Vec<DailyBar>,
    /// Row count equals the expected count for the window (clipped to the
    /// listing date).
    pub is_complete: bool,
    pub expected_rows: usize,
    /// Calendar estimated or suspension data unavailable.
    pub degraded: bool,
    /// History accepted as final after repeated incomplete fetches.
    pub best_effort: bool,
    pub source: SeriesSource,
    /// Provider that served any newly fetched rows.
    pub provider: Option<String>,
}

/// Stored full history after loading, sorted and deduplicated.
struct History {
    entry: CacheEntry,
    bars: Vec<DailyBar>,
    listing: NaiveDate,
    /// Last date the record is known to cover, which can lie past the last
    /// row when trailing days had no data upstream.
    coverage_end: NaiveDate,
    duplicates: usize,
}

enum HistoryOutcome {
    Served(DailySeries),
    Failed {
        error: AcquisitionError,
        stale: Option<History>,
    },
}

pub struct SyncEngine {
    store: Arc<CacheStore>,
    orchestrator: Orchestrator,
    completeness: CompletenessCalculator,
    locks: KeyLocks,
    max_partial_retries: u32,
}

impl SyncEngine {
    pub fn new(
        store: Arc<CacheStore>,
        orchestrator: Orchestrator,
        completeness: CompletenessCalculator,
        max_partial_retries: u32,
    ) -> Self {
        Self {
            store,
            orchestrator,
            completeness,
            locks: KeyLocks::new(),
            max_partial_retries,
        }
    }

    /// Wire the services over `store` from an already-built provider set.
    pub fn with_providers(
        store: Arc<CacheStore>,
        providers: ProviderSet,
        settings: &CompletenessConfig,
    ) -> Self {
        let calendar = Arc::new(
            CalendarService::new(Arc::clone(&store), providers.calendars)
                .with_estimate_ttl(settings.calendar_estimate_ttl()),
        );
        let suspensions = Arc::new(SuspensionService::new(Arc::clone(&store), providers.suspensions));
        let completeness = CompletenessCalculator::new(calendar, suspensions, settings.tolerance);
        let orchestrator = Orchestrator::new(providers.bars, settings.history_origin);
        Self::new(store, orchestrator, completeness, settings.max_partial_retries)
    }

    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        let store = Arc::new(CacheStore::open(config.cache.clone())?);
        let providers = ProviderSet::from_settings(&config.providers)?;
        info!(providers = ?providers.names(), root = %store.root().display(), "sync engine ready");
        Ok(Self::with_providers(store, providers, &config.completeness))
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn completeness(&self) -> &CompletenessCalculator {
        &self.completeness
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Daily bars for `[start, end]`, fetching only what the cache lacks.
    ///
    /// An `end` in the future is clipped to today.
    pub fn get_daily_series(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
        adj: AdjustMode,
    ) -> Result<DailySeries, SyncError> {
        let end = end.min(Local::now().date_naive());
        let span = DateSpan::new(start, end).ok_or(SyncError::InvalidRange { start, end })?;

        if let Some(series) = self.complete_range_slice(instrument, span, adj)? {
            return Ok(series);
        }

        let outcome = self
            .locks
            .with_lock(&format!("{instrument}|{adj}"), || self.sync_history(instrument, span, adj))?;

        let (history_error, stale) = match outcome {
            HistoryOutcome::Served(series) => return Ok(series),
            HistoryOutcome::Failed { error, stale } => (error, stale),
        };
        warn!(%instrument, %adj, error = %history_error, "full history unavailable, fetching window directly");

        let listing_hint = stale.as_ref().map(|h| h.listing);
        let direct_error = match self.orchestrator.fetch_range(instrument, span.start, span.end, adj) {
            Ok(acquired) => {
                let listing = listing_hint.unwrap_or(span.start);
                let mut series = self.window_series(instrument, adj, span, listing, &acquired.bars)?;
                let meta = WriteMeta::complete(series.is_complete);
                self.store.set_with(
                    RecordKind::RangeSlice,
                    &CacheParams::range_slice(instrument, span, adj),
                    &bars_to_frame(&series.bars)?,
                    meta,
                )?;
                series.source = SeriesSource::DirectRange;
                series.provider = Some(acquired.provider);
                return Ok(series);
            }
            Err(e) => e,
        };

        if let Some(history) = stale {
            warn!(%instrument, %adj, "all providers failed; serving stale history");
            let mut series = self.window_series(instrument, adj, span, history.listing, &history.bars)?;
            series.is_complete = false;
            series.best_effort = history.entry.best_effort;
            series.source = SeriesSource::StaleHistory;
            return Ok(series);
        }

        let AcquisitionError::Exhausted { instrument: name, mut failures } = history_error;
        failures.extend(direct_error.failures().iter().cloned());
        Err(AcquisitionError::Exhausted {
            instrument: name,
            failures,
        }
        .into())
    }

    fn complete_range_slice(
        &self,
        instrument: &Instrument,
        span: DateSpan,
        adj: AdjustMode,
    ) -> Result<Option<DailySeries>, SyncError> {
        let params = CacheParams::range_slice(instrument, span, adj);
        let Some(hit) = self.store.get(RecordKind::RangeSlice, &params, None)? else {
            return Ok(None);
        };
        if !hit.entry.is_complete {
            return Ok(None);
        }
        let bars = frame_to_bars(&hit.frame)?;
        debug!(%instrument, %adj, rows = bars.len(), "served complete range slice");
        Ok(Some(DailySeries {
            instrument: instrument.clone(),
            adj,
            expected_rows: bars.len(),
            bars,
            is_complete: true,
            degraded: false,
            best_effort: false,
            source: SeriesSource::RangeSlice,
            provider: None,
        }))
    }

    /// Caller holds the `(instrument, adj)` lock.
    fn sync_history(
        &self,
        instrument: &Instrument,
        span: DateSpan,
        adj: AdjustMode,
    ) -> Result<HistoryOutcome, SyncError> {
        let Some(history) = self.load_history(instrument, adj)? else {
            return self.first_fetch(instrument, span, adj);
        };

        let trailing = history.bars.last().map_or(history.listing, |b| b.date);
        // Days past the last row that were already tried are not retried once
        // the record is accepted as best effort.
        let probe_from = if history.entry.best_effort {
            trailing.max(history.coverage_end)
        } else {
            trailing
        };

        if let Some(from) = self.first_expected_after(instrument, probe_from, span.end)? {
            return self.extend(instrument, span, adj, history, from);
        }

        if !history.entry.is_complete && !history.entry.best_effort {
            let coverage = self
                .completeness
                .expected_count(instrument, history.listing, history.coverage_end)?;
            if !coverage.estimated {
                return self.repair(instrument, span, adj, history);
            }
            debug!(%instrument, %adj, "calendar estimated; repair deferred");
        }

        let mut best_effort = history.entry.best_effort;
        if history.duplicates > 0 {
            warn!(%instrument, %adj, duplicates = history.duplicates, "stored history had duplicate dates; rewriting");
            let entry = self.persist_history(
                instrument,
                adj,
                history.listing,
                history.coverage_end,
                &history.bars,
                Some(&history.entry),
            )?;
            best_effort = entry.best_effort;
        }

        let mut series = self.window_series(instrument, adj, span, history.listing, &history.bars)?;
        series.best_effort = best_effort;
        Ok(HistoryOutcome::Served(series))
    }

    fn load_history(&self, instrument: &Instrument, adj: AdjustMode) -> Result<Option<History>, SyncError> {
        let params = CacheParams::full_history(instrument, adj);
        let Some(hit) = self.store.get(RecordKind::FullHistory, &params, None)? else {
            return Ok(None);
        };
        let mut bars = frame_to_bars(&hit.frame)?;
        let duplicates = dedupe_by_date(&mut bars);
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            warn!(%instrument, %adj, "stored history has no rows; refetching");
            return Ok(None);
        };
        let listing = hit.entry.span.map_or(first.date, |s| s.start.min(first.date));
        let coverage_end = hit.entry.span.map_or(last.date, |s| s.end.max(last.date));
        Ok(Some(History {
            entry: hit.entry,
            bars,
            listing,
            coverage_end,
            duplicates,
        }))
    }

    fn first_fetch(
        &self,
        instrument: &Instrument,
        span: DateSpan,
        adj: AdjustMode,
    ) -> Result<HistoryOutcome, SyncError> {
        let listing = self.orchestrator.listing_date(instrument);
        let from = listing.date();
        if from > span.end {
            debug!(%instrument, listing = %from, "window ends before listing");
            let series = self.window_series(instrument, adj, span, from, &[])?;
            return Ok(HistoryOutcome::Served(series));
        }

        info!(%instrument, %adj, %from, to = %span.end, "first full-history fetch");
        let acquired = match self.orchestrator.fetch_range(instrument, from, span.end, adj) {
            Ok(acquired) => acquired,
            Err(error) => return Ok(HistoryOutcome::Failed { error, stale: None }),
        };

        let listing = match (listing, acquired.bars.first()) {
            (ListingDate::Known(date), _) => date,
            (ListingDate::Origin(_), Some(first)) => first.date,
            (ListingDate::Origin(origin), None) => origin,
        };
        let entry = self.persist_history(instrument, adj, listing, span.end, &acquired.bars, None)?;

        let mut series = self.window_series(instrument, adj, span, listing, &acquired.bars)?;
        series.best_effort = entry.best_effort;
        series.source = SeriesSource::FirstFetch;
        series.provider = Some(acquired.provider);
        Ok(HistoryOutcome::Served(series))
    }

    /// Delta fetch `[from, span.end]` and merge it into the history.
    fn extend(
        &self,
        instrument: &Instrument,
        span: DateSpan,
        adj: AdjustMode,
        history: History,
        from: NaiveDate,
    ) -> Result<HistoryOutcome, SyncError> {
        let coverage_end = history.coverage_end.max(span.end);
        info!(%instrument, %adj, %from, to = %span.end, "history stale, fetching delta");

        let (merged, provider) = match self.orchestrator.fetch_range(instrument, from, span.end, adj) {
            Ok(acquired) => {
                let mut merged = history.bars.clone();
                merged.extend(acquired.bars);
                let dropped = dedupe_by_date(&mut merged);
                if dropped > 0 {
                    warn!(%instrument, %adj, dropped, "delta overlapped stored rows; kept stored values");
                }
                (merged, Some(acquired.provider))
            }
            Err(error) if only_empty(&error) && span.end < Local::now().date_naive() => {
                // Upstream has nothing for those days; record them as tried.
                info!(%instrument, %adj, %from, to = %span.end, "no rows upstream for delta window");
                (history.bars.clone(), None)
            }
            Err(error) => {
                return Ok(HistoryOutcome::Failed {
                    error,
                    stale: Some(history),
                })
            }
        };

        let entry = self.persist_history(
            instrument,
            adj,
            history.listing,
            coverage_end,
            &merged,
            Some(&history.entry),
        )?;
        let mut series = self.window_series(instrument, adj, span, history.listing, &merged)?;
        series.best_effort = entry.best_effort;
        series.source = SeriesSource::DeltaMerged;
        series.provider = provider;
        Ok(HistoryOutcome::Served(series))
    }

    /// Re-fetch an incomplete history from its listing date and merge.
    fn repair(
        &self,
        instrument: &Instrument,
        span: DateSpan,
        adj: AdjustMode,
        history: History,
    ) -> Result<HistoryOutcome, SyncError> {
        info!(
            %instrument, %adj,
            attempt = history.entry.partial_streak,
            "history incomplete, re-fetching from listing date"
        );

        let fetched = self.orchestrator.fetch_range(
            instrument,
            history.listing,
            history.coverage_end,
            adj,
        );
        let (merged, provider) = match fetched {
            Ok(acquired) => {
                let mut merged = history.bars.clone();
                merged.extend(acquired.bars);
                dedupe_by_date(&mut merged);
                (merged, Some(acquired.provider))
            }
            Err(error) if only_empty(&error) => (history.bars.clone(), None),
            Err(error) => {
                warn!(%instrument, %adj, %error, "repair fetch failed; serving stored history");
                let mut series = self.window_series(instrument, adj, span, history.listing, &history.bars)?;
                series.best_effort = history.entry.best_effort;
                return Ok(HistoryOutcome::Served(series));
            }
        };

        let entry = self.persist_history(
            instrument,
            adj,
            history.listing,
            history.coverage_end,
            &merged,
            Some(&history.entry),
        )?;
        let mut series = self.window_series(instrument, adj, span, history.listing, &merged)?;
        series.best_effort = entry.best_effort;
        series.source = SeriesSource::Repaired;
        series.provider = provider;
        Ok(HistoryOutcome::Served(series))
    }

    /// Validate `bars` over `[listing, coverage_end]` and write the history.
    fn persist_history(
        &self,
        instrument: &Instrument,
        adj: AdjustMode,
        listing: NaiveDate,
        coverage_end: NaiveDate,
        bars: &[DailyBar],
        prior: Option<&CacheEntry>,
    ) -> Result<CacheEntry, SyncError> {
        let coverage = DateSpan {
            start: listing,
            end: coverage_end.max(listing),
        };
        let expectation = self
            .completeness
            .expected_count(instrument, coverage.start, coverage.end)?;
        let verdict = self.completeness.assess(bars.len(), &expectation);
        match verdict {
            Assessment::Complete => {}
            Assessment::Missing(n) => {
                debug!(%instrument, %adj, missing = n, expected = expectation.expected, "history incomplete");
            }
            Assessment::Excess(n) => {
                warn!(%instrument, %adj, excess = n, expected = expectation.expected, "more rows than expected trading days");
            }
        }

        let is_complete = verdict.is_complete();
        let prior_streak = prior.map_or(0, |p| p.partial_streak);
        let partial_streak = if is_complete {
            0
        } else if expectation.estimated {
            // A weekday estimate counts holidays as missing rows.
            prior_streak
        } else {
            prior_streak + 1
        };
        let best_effort = !is_complete && partial_streak > self.max_partial_retries;
        if best_effort && !prior.is_some_and(|p| p.best_effort) {
            warn!(
                %instrument, %adj, partial_streak,
                "history still incomplete after retries; keeping as best effort"
            );
        }

        let meta = WriteMeta {
            is_complete,
            best_effort,
            partial_streak,
            span: Some(coverage),
        };
        let entry = self.store.set_with(
            RecordKind::FullHistory,
            &CacheParams::full_history(instrument, adj),
            &bars_to_frame(bars)?,
            meta,
        )?;
        Ok(entry)
    }

    /// First expected trading day in `(after, end]`.
    fn first_expected_after(
        &self,
        instrument: &Instrument,
        after: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<NaiveDate>, SyncError> {
        let calendar = self.completeness.calendar();
        let Some(from) = calendar.next_trading_date(instrument.exchange(), after, end)? else {
            return Ok(None);
        };
        let expected = self.completeness.expected_dates(instrument, from, end)?;
        Ok(expected.dates.first().copied())
    }

    /// Slice `bars` to the window and judge it against the expectation for
    /// the window clipped to the listing date.
    fn window_series(
        &self,
        instrument: &Instrument,
        adj: AdjustMode,
        span: DateSpan,
        listing: NaiveDate,
        bars: &[DailyBar],
    ) -> Result<DailySeries, SyncError> {
        let rows = slice_bars(bars, span.start, span.end).to_vec();
        let from = span.start.max(listing);
        let expectation = if from <= span.end {
            self.completeness.expected_count(instrument, from, span.end)?
        } else {
            Expectation::default()
        };
        let verdict = self.completeness.assess(rows.len(), &expectation);

        Ok(DailySeries {
            instrument: instrument.clone(),
            adj,
            is_complete: verdict.is_complete(),
            expected_rows: expectation.expected,
            degraded: expectation.degraded,
            bars: rows,
            best_effort: false,
            source: SeriesSource::FullHistoryCache,
            provider: None,
        })
    }
}

/// Every provider answered, and none had rows.
fn only_empty(error: &AcquisitionError) -> bool {
    let failures = error.failures();
    !failures.is_empty()
        && failures
            .iter()
            .all(|f| f.error == ProviderError::EmptyResult)
}
