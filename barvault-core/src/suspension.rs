//! Trading suspensions per (instrument, year).
//!
//! Fetched years, including empty ones, are cached permanently. When the
//! source is missing, denies entitlement or cannot be reached, the year is
//! served as "no suspensions" with `degraded` set; such years are memoised
//! for the life of the process but never persisted.

use crate::cache::frame::{dates_to_frame, frame_dates};
use crate::cache::{CacheError, CacheParams, CacheStore, KeyLocks, RecordKind};
use crate::domain::{DateSpan, Instrument};
use crate::provider::{ProviderError, SuspensionProvider};
use chrono::{Datelike, Local, NaiveDate};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SuspensionYear {
    pub dates: BTreeSet<NaiveDate>,
    /// Served without upstream data; assumed to have no suspensions.
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuspendedDays {
    pub dates: BTreeSet<NaiveDate>,
    pub degraded: bool,
}

pub struct SuspensionService {
    store: Arc<CacheStore>,
    source: Option<Arc<dyn SuspensionProvider>>,
    memo: Mutex<HashMap<(String, i32), Arc<SuspensionYear>>>,
    locks: KeyLocks,
}

impl SuspensionService {
    pub fn new(store: Arc<CacheStore>, source: Option<Arc<dyn SuspensionProvider>>) -> Self {
        Self {
            store,
            source,
            memo: Mutex::new(HashMap::new()),
            locks: KeyLocks::new(),
        }
    }

    pub fn suspension_dates(
        &self,
        instrument: &Instrument,
        year: i32,
    ) -> Result<Arc<SuspensionYear>, CacheError> {
        let memo_key = (instrument.to_string(), year);
        if let Some(hit) = self.memo.lock().get(&memo_key) {
            return Ok(Arc::clone(hit));
        }

        self.locks.with_lock(&format!("{instrument}|{year}"), || -> Result<_, CacheError> {
            if let Some(hit) = self.memo.lock().get(&memo_key) {
                return Ok(Arc::clone(hit));
            }
            let year_data = Arc::new(self.load(instrument, year)?);
            self.memo.lock().insert(memo_key.clone(), Arc::clone(&year_data));
            Ok(year_data)
        })
    }

    fn load(&self, instrument: &Instrument, year: i32) -> Result<SuspensionYear, CacheError> {
        let params = CacheParams::suspension_year(instrument, year);

        if let Some(cached) = self.store.get(RecordKind::SuspensionYear, &params, None)? {
            let dates: BTreeSet<NaiveDate> = frame_dates(&cached.frame)?.into_iter().collect();
            debug!(%instrument, year, days = dates.len(), "suspensions from cache");
            return Ok(SuspensionYear {
                dates,
                degraded: false,
            });
        }

        let Some(source) = self.source.as_ref().filter(|s| s.is_available()) else {
            warn!(%instrument, year, "no suspension source available; assuming none");
            return Ok(degraded());
        };

        let fetched = match source.suspended_dates(instrument, year) {
            Ok(dates) => dates,
            Err(ProviderError::EmptyResult) => Vec::new(),
            Err(e) => {
                warn!(%instrument, year, source = source.name(), error = %e,
                      "suspension data unavailable; assuming none");
                return Ok(degraded());
            }
        };

        let dates: BTreeSet<NaiveDate> = fetched.into_iter().collect();
        // The current year can still gain suspensions.
        if year < Local::now().date_naive().year() {
            let ordered: Vec<NaiveDate> = dates.iter().copied().collect();
            self.store.set(
                RecordKind::SuspensionYear,
                &params,
                &dates_to_frame(&ordered)?,
                true,
            )?;
        }
        info!(%instrument, year, days = dates.len(), source = source.name(), "fetched suspensions");
        Ok(SuspensionYear {
            dates,
            degraded: false,
        })
    }

    /// Suspended dates in `[start, end]`.
    pub fn suspension_dates_between(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SuspendedDays, CacheError> {
        let Some(span) = DateSpan::new(start, end) else {
            return Ok(SuspendedDays::default());
        };
        let mut out = SuspendedDays::default();
        for year in span.years() {
            let year_data = self.suspension_dates(instrument, year)?;
            out.degraded |= year_data.degraded;
            out.dates
                .extend(year_data.dates.iter().copied().filter(|d| span.contains(*d)));
        }
        Ok(out)
    }
}

fn degraded() -> SuspensionYear {
    SuspensionYear {
        dates: BTreeSet::new(),
        degraded: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::provider::Provider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        calls: AtomicUsize,
        reply: Result<Vec<NaiveDate>, ProviderError>,
    }

    impl Provider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
    }

    impl SuspensionProvider for Scripted {
        fn suspended_dates(&self, _: &Instrument, _: i32) -> Result<Vec<NaiveDate>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn setup(
        dir: &std::path::Path,
        reply: Result<Vec<NaiveDate>, ProviderError>,
    ) -> (SuspensionService, Arc<Scripted>, Arc<CacheStore>) {
        let store = Arc::new(CacheStore::open(CacheConfig::at(dir)).unwrap());
        let source = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            reply,
        });
        let svc = SuspensionService::new(
            Arc::clone(&store),
            Some(source.clone() as Arc<dyn SuspensionProvider>),
        );
        (svc, source, store)
    }

    #[test]
    fn fetched_years_are_persisted_even_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sym = Instrument::parse("000001.SZ").unwrap();
        let (svc, source, store) = setup(dir.path(), Ok(vec![]));

        let year = svc.suspension_dates(&sym, 2022).unwrap();
        assert!(year.dates.is_empty());
        assert!(!year.degraded);
        let entry = store
            .entry(RecordKind::SuspensionYear, &CacheParams::suspension_year(&sym, 2022))
            .unwrap();
        assert!(entry.is_complete);
        assert_eq!(entry.row_count, 0);

        svc.suspension_dates(&sym, 2022).unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn entitlement_denial_degrades_without_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let sym = Instrument::parse("600519.SH").unwrap();
        let (svc, source, store) =
            setup(dir.path(), Err(ProviderError::QuotaExhausted("no permission".into())));

        let year = svc.suspension_dates(&sym, 2023).unwrap();
        assert!(year.degraded);
        assert!(year.dates.is_empty());
        assert!(store
            .entry(RecordKind::SuspensionYear, &CacheParams::suspension_year(&sym, 2023))
            .is_none());

        // Memoised: no second upstream call in this process.
        svc.suspension_dates(&sym, 2023).unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_source_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::open(CacheConfig::at(dir.path())).unwrap());
        let svc = SuspensionService::new(store, None);
        let sym = Instrument::parse("600519.SH").unwrap();
        let days = svc
            .suspension_dates_between(&sym, d(2023, 1, 1), d(2023, 12, 31))
            .unwrap();
        assert!(days.degraded);
    }

    #[test]
    fn range_filters_dates() {
        let dir = tempfile::tempdir().unwrap();
        let sym = Instrument::parse("600519.SH").unwrap();
        let (svc, _, _) = setup(dir.path(), Ok(vec![d(2023, 3, 1), d(2023, 3, 2), d(2023, 9, 1)]));
        let days = svc
            .suspension_dates_between(&sym, d(2023, 3, 2), d(2023, 12, 31))
            .unwrap();
        assert_eq!(days.dates.into_iter().collect::<Vec<_>>(), vec![d(2023, 3, 2), d(2023, 9, 1)]);
        assert!(!days.degraded);
    }
}
