//! Expected row counts and the completeness test.
//!
//! The expected number of daily rows for an instrument over `[start, end]`
//! is the exchange's open days in that range minus the instrument's
//! suspended days. Only suspended days that are also open days are
//! subtracted, so the result can never go negative.

use crate::cache::CacheError;
use crate::calendar::CalendarService;
use crate::domain::Instrument;
use crate::suspension::SuspensionService;
use chrono::NaiveDate;
use std::sync::Arc;

/// Expected row count for one window, with the inputs that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expectation {
    pub expected: usize,
    pub trading_days: usize,
    pub suspended_days: usize,
    /// Calendar estimated or suspension data unavailable.
    pub degraded: bool,
    /// Trading days came from a weekday estimate, so `expected` counts
    /// holidays too.
    pub estimated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    Complete,
    Missing(usize),
    Excess(usize),
}

impl Assessment {
    pub fn is_complete(self) -> bool {
        self == Assessment::Complete
    }
}

/// The dates an instrument should have rows for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectedDates {
    pub dates: Vec<NaiveDate>,
    pub trading_days: usize,
    pub degraded: bool,
    pub estimated: bool,
}

impl ExpectedDates {
    pub fn expectation(&self) -> Expectation {
        Expectation {
            expected: self.dates.len(),
            trading_days: self.trading_days,
            suspended_days: self.trading_days - self.dates.len(),
            degraded: self.degraded,
            estimated: self.estimated,
        }
    }
}

pub struct CompletenessCalculator {
    calendar: Arc<CalendarService>,
    suspensions: Arc<SuspensionService>,
    tolerance: f64,
}

impl CompletenessCalculator {
    pub fn new(calendar: Arc<CalendarService>, suspensions: Arc<SuspensionService>, tolerance: f64) -> Self {
        Self {
            calendar,
            suspensions,
            tolerance,
        }
    }

    pub fn calendar(&self) -> &CalendarService {
        &self.calendar
    }

    /// Open days in `[start, end]` on which the instrument was not suspended.
    pub fn expected_dates(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ExpectedDates, CacheError> {
        let trading = self
            .calendar
            .trading_dates_between(instrument.exchange(), start, end)?;
        let suspended = self
            .suspensions
            .suspension_dates_between(instrument, start, end)?;

        let trading_days = trading.dates.len();
        let dates = trading
            .dates
            .into_iter()
            .filter(|d| !suspended.dates.contains(d))
            .collect();
        Ok(ExpectedDates {
            dates,
            trading_days,
            degraded: trading.estimated || suspended.degraded,
            estimated: trading.estimated,
        })
    }

    pub fn expected_count(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Expectation, CacheError> {
        Ok(self.expected_dates(instrument, start, end)?.expectation())
    }

    pub fn assess(&self, actual: usize, expectation: &Expectation) -> Assessment {
        assess(actual, expectation.expected, self.tolerance)
    }
}

/// Compare an actual row count with the expected one.
///
/// `tolerance` only relaxes the lower bound; an excess is never complete.
pub fn assess(actual: usize, expected: usize, tolerance: f64) -> Assessment {
    if actual > expected {
        return Assessment::Excess(actual - expected);
    }
    let floor = (expected as f64 * tolerance.clamp(0.0, 1.0)).ceil() as usize;
    if actual >= floor {
        Assessment::Complete
    } else {
        Assessment::Missing(expected - actual)
    }
}
