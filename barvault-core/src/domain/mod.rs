//! Domain types shared by every layer of the cache.

pub mod bar;
pub mod instrument;

pub use bar::{dedupe_by_date, drop_defective, duplicate_dates, slice_bars, BarDefect, DailyBar};
pub use instrument::{AdjustMode, Exchange, Instrument, InstrumentError};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    /// Returns `None` when `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Calendar years touched by the span, ascending.
    pub fn years(&self) -> std::ops::RangeInclusive<i32> {
        self.start.year()..=self.end.year()
    }

    /// Smallest span covering both.
    pub fn union(&self, other: &DateSpan) -> DateSpan {
        DateSpan {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Parse `YYYYMMDD` or `YYYY-MM-DD`.
pub fn parse_compact_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    let s = s.trim();
    if s.contains('-') {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
    } else {
        NaiveDate::parse_from_str(s, "%Y%m%d")
    }
}

/// Render as `YYYYMMDD`, the form upstream APIs and cache keys use.
pub fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}
