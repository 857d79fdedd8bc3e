//! Trading calendars per (exchange, year).
//!
//! Lookup order: in-process memo, then the cache (`trading_calendar_year`,
//! permanent), then each calendar source in priority order. If every source
//! fails, a weekday-only estimate is served, flagged `estimated` and never
//! persisted. An estimate stays memoised only for `estimate_ttl`; after that
//! the next lookup asks the sources again.

use crate::cache::frame::{dates_to_frame, frame_dates};
use crate::cache::{CacheError, CacheParams, CacheStore, KeyLocks, RecordKind};
use crate::domain::{DateSpan, Exchange};
use crate::provider::CalendarProvider;
use chrono::{Datelike, Local, NaiveDate, Weekday};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Open days of one exchange in one calendar year, ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarYear {
    pub exchange: Exchange,
    pub year: i32,
    pub dates: Vec<NaiveDate>,
    /// Weekday-only fallback; holidays are not excluded.
    pub estimated: bool,
}

/// Open days across a date range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradingDays {
    pub dates: Vec<NaiveDate>,
    pub estimated: bool,
}

const DEFAULT_ESTIMATE_TTL: Duration = Duration::from_secs(600);

struct Memo {
    calendar: Arc<CalendarYear>,
    loaded_at: Instant,
}

pub struct CalendarService {
    store: Arc<CacheStore>,
    sources: Vec<Arc<dyn CalendarProvider>>,
    memo: Mutex<HashMap<(Exchange, i32), Memo>>,
    locks: KeyLocks,
    estimate_ttl: Duration,
}

impl CalendarService {
    pub fn new(store: Arc<CacheStore>, sources: Vec<Arc<dyn CalendarProvider>>) -> Self {
        Self {
            store,
            sources,
            memo: Mutex::new(HashMap::new()),
            locks: KeyLocks::new(),
            estimate_ttl: DEFAULT_ESTIMATE_TTL,
        }
    }

    /// How long a weekday estimate is reused before the sources are retried.
    pub fn with_estimate_ttl(mut self, ttl: Duration) -> Self {
        self.estimate_ttl = ttl;
        self
    }

    pub fn trading_dates(&self, exchange: Exchange, year: i32) -> Result<Arc<CalendarYear>, CacheError> {
        if let Some(hit) = self.memoised(exchange, year) {
            return Ok(hit);
        }

        // One upstream fetch per key even when many instruments ask at once.
        self.locks
            .with_lock(&format!("{exchange}|{year}"), || -> Result<_, CacheError> {
                if let Some(hit) = self.memoised(exchange, year) {
                    return Ok(hit);
                }
                let calendar = Arc::new(self.load(exchange, year)?);
                self.memo.lock().insert(
                    (exchange, year),
                    Memo {
                        calendar: Arc::clone(&calendar),
                        loaded_at: Instant::now(),
                    },
                );
                Ok(calendar)
            })
    }

    fn memoised(&self, exchange: Exchange, year: i32) -> Option<Arc<CalendarYear>> {
        let memo = self.memo.lock();
        let hit = memo.get(&(exchange, year))?;
        if hit.calendar.estimated && hit.loaded_at.elapsed() >= self.estimate_ttl {
            debug!(%exchange, year, "calendar estimate expired");
            return None;
        }
        Some(Arc::clone(&hit.calendar))
    }

    fn load(&self, exchange: Exchange, year: i32) -> Result<CalendarYear, CacheError> {
        let params = CacheParams::calendar_year(exchange, year);

        if let Some(cached) = self.store.get(RecordKind::TradingCalendarYear, &params, None)? {
            let mut dates = frame_dates(&cached.frame)?;
            dates.sort_unstable();
            debug!(%exchange, year, days = dates.len(), "calendar from cache");
            return Ok(CalendarYear {
                exchange,
                year,
                dates,
                estimated: false,
            });
        }

        for source in &self.sources {
            if !source.is_available() {
                debug!(source = source.name(), "calendar source unavailable");
                continue;
            }
            match source.trading_dates(exchange, year) {
                Ok(mut dates) if !dates.is_empty() => {
                    dates.sort_unstable();
                    dates.dedup();
                    if is_settled(year, &dates, Local::now().date_naive()) {
                        self.store.set(
                            RecordKind::TradingCalendarYear,
                            &params,
                            &dates_to_frame(&dates)?,
                            true,
                        )?;
                    }
                    info!(%exchange, year, days = dates.len(), source = source.name(), "fetched calendar");
                    return Ok(CalendarYear {
                        exchange,
                        year,
                        dates,
                        estimated: false,
                    });
                }
                Ok(_) => {
                    warn!(%exchange, year, source = source.name(), "calendar source returned no dates");
                }
                Err(e) => {
                    warn!(%exchange, year, source = source.name(), error = %e, "calendar source failed");
                }
            }
        }

        warn!(%exchange, year, "no calendar source succeeded; estimating weekdays");
        Ok(CalendarYear {
            exchange,
            year,
            dates: weekdays_of(year),
            estimated: true,
        })
    }

    /// Open days in `[start, end]`.
    pub fn trading_dates_between(
        &self,
        exchange: Exchange,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<TradingDays, CacheError> {
        let Some(span) = DateSpan::new(start, end) else {
            return Ok(TradingDays::default());
        };
        let mut out = TradingDays::default();
        for year in span.years() {
            let calendar = self.trading_dates(exchange, year)?;
            out.estimated |= calendar.estimated;
            out.dates
                .extend(calendar.dates.iter().copied().filter(|d| span.contains(*d)));
        }
        Ok(out)
    }

    /// First open day in `(after, until]`. Only the years of that window are
    /// consulted.
    pub fn next_trading_date(
        &self,
        exchange: Exchange,
        after: NaiveDate,
        until: NaiveDate,
    ) -> Result<Option<NaiveDate>, CacheError> {
        let Some(span) = after.succ_opt().and_then(|from| DateSpan::new(from, until)) else {
            return Ok(None);
        };
        for year in span.years() {
            let calendar = self.trading_dates(exchange, year)?;
            if let Some(d) = calendar.dates.iter().copied().find(|d| span.contains(*d)) {
                return Ok(Some(d));
            }
        }
        Ok(None)
    }
}

/// A fetched year is only persisted once it cannot change: either it lies
/// in the past, or the source already published dates beyond today.
fn is_settled(year: i32, dates: &[NaiveDate], today: NaiveDate) -> bool {
    year < today.year() || dates.last().is_some_and(|d| *d > today)
}

fn weekdays_of(year: i32) -> Vec<NaiveDate> {
    let Some(first) = NaiveDate::from_ymd_opt(year, 1, 1) else {
        return Vec::new();
    };
    first
        .iter_days()
        .take_while(|d| d.year() == year)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .collect()
}
