//! In-memory providers and helpers shared by the integration suites.
//!
//! The fake market trades every weekday. Bars exist from an instrument's
//! listing date through `last_available`, minus its suspended days.

#![allow(dead_code)]

use barvault_core::config::CompletenessConfig;
use barvault_core::domain::{AdjustMode, DailyBar, Exchange, Instrument};
use barvault_core::provider::{
    CalendarProvider, DailyBarProvider, Provider, ProviderError, ProviderSet, SuspensionProvider,
};
use barvault_core::{CacheStore, SyncEngine};
use barvault_core::config::CacheConfig;
use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

pub fn sym(s: &str) -> Instrument {
    Instrument::parse(s).unwrap()
}

/// Every Monday to Friday in `[start, end]`.
pub fn weekdays(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .collect()
}

fn price_on(date: NaiveDate) -> f64 {
    100.0 + f64::from(date.ordinal() % 50)
}

pub struct FakeBars {
    name: &'static str,
    listing: NaiveDate,
    last_available: NaiveDate,
    suspended: BTreeSet<NaiveDate>,
    /// Requests spanning more days than this are refused.
    max_window_days: Option<i64>,
    failure: Mutex<Option<ProviderError>>,
    calls: Mutex<Vec<(NaiveDate, NaiveDate)>>,
}

impl FakeBars {
    pub fn new(name: &'static str, listing: NaiveDate, last_available: NaiveDate) -> Self {
        Self {
            name,
            listing,
            last_available,
            suspended: BTreeSet::new(),
            max_window_days: None,
            failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn suspended(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.suspended.extend(dates);
        self
    }

    pub fn max_window_days(mut self, days: i64) -> Self {
        self.max_window_days = Some(days);
        self
    }

    pub fn fail_with(&self, error: Option<ProviderError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<(NaiveDate, NaiveDate)> {
        self.calls.lock().unwrap().clone()
    }

    /// The rows this market holds for `[start, end]`.
    pub fn rows(&self, start: NaiveDate, end: NaiveDate) -> Vec<DailyBar> {
        let from = start.max(self.listing);
        let to = end.min(self.last_available);
        if from > to {
            return Vec::new();
        }
        weekdays(from, to)
            .into_iter()
            .filter(|d| !self.suspended.contains(d))
            .map(|date| {
                let p = price_on(date);
                DailyBar {
                    date,
                    open: p,
                    high: p + 1.0,
                    low: p - 1.0,
                    close: p + 0.5,
                    volume: 1_000.0,
                    amount: p * 1_000.0,
                }
            })
            .collect()
    }
}

impl Provider for FakeBars {
    fn name(&self) -> &str {
        self.name
    }
}

impl DailyBarProvider for FakeBars {
    fn fetch_range(
        &self,
        _instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
        _adj: AdjustMode,
    ) -> Result<Vec<DailyBar>, ProviderError> {
        self.calls.lock().unwrap().push((start, end));
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        if let Some(max) = self.max_window_days {
            if (end - start).num_days() > max {
                return Err(ProviderError::MalformedResult("window too large".into()));
            }
        }
        let rows = self.rows(start, end);
        if rows.is_empty() {
            return Err(ProviderError::EmptyResult);
        }
        Ok(rows)
    }

    fn listing_date(&self, _instrument: &Instrument) -> Result<Option<NaiveDate>, ProviderError> {
        Ok(Some(self.listing))
    }
}

/// Weekdays minus `holidays`; can be switched into an outage.
#[derive(Default)]
pub struct FakeCalendar {
    calls: AtomicUsize,
    holidays: Mutex<BTreeSet<NaiveDate>>,
    down: AtomicBool,
}

impl FakeCalendar {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_holidays(&self, dates: impl IntoIterator<Item = NaiveDate>) {
        *self.holidays.lock().unwrap() = dates.into_iter().collect();
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl Provider for FakeCalendar {
    fn name(&self) -> &str {
        "fake_calendar"
    }
}

impl CalendarProvider for FakeCalendar {
    fn trading_dates(&self, _exchange: Exchange, year: i32) -> Result<Vec<NaiveDate>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(ProviderError::Network("calendar unreachable".into()));
        }
        let holidays = self.holidays.lock().unwrap();
        Ok(weekdays(d(year, 1, 1), d(year, 12, 31))
            .into_iter()
            .filter(|d| !holidays.contains(d))
            .collect())
    }
}

#[derive(Default)]
pub struct FakeSuspensions {
    dates: BTreeSet<NaiveDate>,
    deny: bool,
    calls: AtomicUsize,
}

impl FakeSuspensions {
    pub fn with_dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            dates: dates.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Every request fails with an entitlement error.
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Provider for FakeSuspensions {
    fn name(&self) -> &str {
        "fake_suspensions"
    }
}

impl SuspensionProvider for FakeSuspensions {
    fn suspended_dates(&self, _instrument: &Instrument, year: i32) -> Result<Vec<NaiveDate>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(ProviderError::QuotaExhausted("no permission for suspend_d".into()));
        }
        Ok(self.dates.iter().copied().filter(|d| d.year() == year).collect())
    }
}

/// A sync engine over a scratch cache root with fake providers.
pub struct Harness {
    pub engine: SyncEngine,
    pub calendar: Arc<FakeCalendar>,
    pub suspensions: Arc<FakeSuspensions>,
}

pub fn harness(root: &Path, bars: &[Arc<FakeBars>], suspensions: FakeSuspensions) -> Harness {
    harness_with(root, bars, suspensions, CompletenessConfig::default())
}

pub fn harness_with(
    root: &Path,
    bars: &[Arc<FakeBars>],
    suspensions: FakeSuspensions,
    completeness: CompletenessConfig,
) -> Harness {
    let store = Arc::new(CacheStore::open(CacheConfig::at(root)).unwrap());
    let calendar = Arc::new(FakeCalendar::default());
    let suspensions = Arc::new(suspensions);
    let providers = ProviderSet {
        bars: bars
            .iter()
            .map(|b| Arc::clone(b) as Arc<dyn DailyBarProvider>)
            .collect(),
        calendars: vec![Arc::clone(&calendar) as Arc<dyn CalendarProvider>],
        suspensions: Some(Arc::clone(&suspensions) as Arc<dyn SuspensionProvider>),
    };
    Harness {
        engine: SyncEngine::with_providers(store, providers, &completeness),
        calendar,
        suspensions,
    }
}
