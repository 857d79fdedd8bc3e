//! DailyBar: one trading day of OHLCV data for one instrument.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Daily OHLCV bar as stored in the cache.
///
/// Prices are already adjusted according to the [`AdjustMode`](super::AdjustMode)
/// the series was requested with. `volume` and `amount` are floats because
/// mainland providers report volume in lots and turnover in thousands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub amount: f64,
}

/// Why a provider row was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarDefect {
    /// An OHLC price is NaN or infinite.
    MissingPrice,
    /// `high` is below `low`, or open/close sit outside that range.
    OutsideRange,
    NegativeVolume,
}

impl DailyBar {
    /// First problem that makes this row unfit for the cache, if any.
    ///
    /// Sign is not checked on prices: forward-adjusted series can reach zero
    /// or below in early years. `volume` and `amount` may be NaN (some feeds
    /// omit turnover).
    pub fn defect(&self) -> Option<BarDefect> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return Some(BarDefect::MissingPrice);
        }
        let inside = |p: f64| self.low <= p && p <= self.high;
        if !inside(self.open) || !inside(self.close) {
            return Some(BarDefect::OutsideRange);
        }
        if self.volume < 0.0 {
            return Some(BarDefect::NegativeVolume);
        }
        None
    }
}

/// Remove rows with a [`BarDefect`], returning how many went and the first
/// defect seen.
pub fn drop_defective(bars: &mut Vec<DailyBar>) -> (usize, Option<BarDefect>) {
    let mut first = None;
    let before = bars.len();
    bars.retain(|b| match b.defect() {
        Some(defect) => {
            first.get_or_insert(defect);
            false
        }
        None => true,
    });
    (before - bars.len(), first)
}

/// Sort bars by date and drop repeated dates, keeping the first occurrence.
///
/// Returns the number of rows dropped. The sort is stable so "first" means
/// first in the input order.
pub fn dedupe_by_date(bars: &mut Vec<DailyBar>) -> usize {
    let before = bars.len();
    bars.sort_by_key(|b| b.date);
    bars.dedup_by_key(|b| b.date);
    before - bars.len()
}

/// Count repeated dates without modifying the input.
pub fn duplicate_dates(bars: &[DailyBar]) -> usize {
    let mut dates: Vec<NaiveDate> = bars.iter().map(|b| b.date).collect();
    let before = dates.len();
    dates.sort_unstable();
    dates.dedup();
    before - dates.len()
}

/// Rows whose date falls inside `[start, end]`. Input must be date-sorted.
pub fn slice_bars(bars: &[DailyBar], start: NaiveDate, end: NaiveDate) -> &[DailyBar] {
    let lo = bars.partition_point(|b| b.date < start);
    let hi = bars.partition_point(|b| b.date <= end);
    if lo >= hi {
        &[]
    } else {
        &bars[lo..hi]
    }
}
