//! Price adjustment from cumulative adjustment factors.
//!
//! `qfq` (forward): `price * factor / latest_factor`, so the latest bar keeps
//! its traded price. `hfq` (backward): `price * factor`. Volume and turnover
//! are left unscaled.

use crate::domain::{AdjustMode, DailyBar};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Apply `factors` to date-sorted `bars` in place.
///
/// A bar with no factor of its own uses the most recent earlier factor, or
/// 1.0 when none precedes it.
pub fn apply_factors(bars: &mut [DailyBar], factors: &BTreeMap<NaiveDate, f64>, adj: AdjustMode) {
    if adj == AdjustMode::None || factors.is_empty() || bars.is_empty() {
        return;
    }

    let factor_at = |date: NaiveDate| -> f64 {
        factors
            .range(..=date)
            .next_back()
            .map(|(_, f)| *f)
            .filter(|f| f.is_finite() && *f > 0.0)
            .unwrap_or(1.0)
    };

    let base = match adj {
        AdjustMode::Qfq => bars.last().map_or(1.0, |b| factor_at(b.date)),
        _ => 1.0,
    };

    for bar in bars.iter_mut() {
        scale(bar, factor_at(bar.date) / base);
    }
}

/// Adjust using per-bar ratios of adjusted to raw close (Yahoo style).
///
/// The ratios are already forward-adjusted (1.0 on the latest bar). For
/// `hfq` they are rebased to the first bar of the window.
pub fn apply_close_ratios(bars: &mut [DailyBar], ratios: &[f64], adj: AdjustMode) {
    if adj == AdjustMode::None || bars.len() != ratios.len() || bars.is_empty() {
        return;
    }
    let sane = |r: f64| if r.is_finite() && r > 0.0 { r } else { 1.0 };
    let base = match adj {
        AdjustMode::Hfq => sane(ratios[0]),
        _ => 1.0,
    };
    for (bar, ratio) in bars.iter_mut().zip(ratios) {
        scale(bar, sane(*ratio) / base);
    }
}

fn scale(bar: &mut DailyBar, k: f64) {
    bar.open *= k;
    bar.high *= k;
    bar.low *= k;
    bar.close *= k;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn flat(day: u32, price: f64) -> DailyBar {
        DailyBar {
            date: d(day),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 10.0,
            amount: price * 10.0,
        }
    }

    fn factors() -> BTreeMap<NaiveDate, f64> {
        // A 2-for-1 split effective on the 4th.
        BTreeMap::from([(d(2), 1.0), (d(3), 1.0), (d(4), 2.0), (d(5), 2.0)])
    }

    #[test]
    fn qfq_keeps_latest_price() {
        let mut bars = vec![flat(2, 20.0), flat(3, 20.0), flat(4, 10.0), flat(5, 10.0)];
        apply_factors(&mut bars, &factors(), AdjustMode::Qfq);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![10.0, 10.0, 10.0, 10.0]);
        assert_eq!(bars[0].volume, 10.0);
    }

    #[test]
    fn hfq_keeps_first_price() {
        let mut bars = vec![flat(2, 20.0), flat(3, 20.0), flat(4, 10.0), flat(5, 10.0)];
        apply_factors(&mut bars, &factors(), AdjustMode::Hfq);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![20.0, 20.0, 20.0, 20.0]);
    }

    #[test]
    fn missing_factor_carries_forward() {
        let sparse = BTreeMap::from([(d(2), 1.0), (d(4), 2.0)]);
        let mut bars = vec![flat(2, 20.0), flat(3, 20.0), flat(4, 10.0), flat(5, 10.0)];
        apply_factors(&mut bars, &sparse, AdjustMode::Hfq);
        assert_eq!(bars[1].close, 20.0);
        assert_eq!(bars[3].close, 20.0);
    }

    #[test]
    fn none_is_untouched() {
        let mut bars = vec![flat(2, 20.0), flat(4, 10.0)];
        apply_factors(&mut bars, &factors(), AdjustMode::None);
        assert_eq!(bars[0].close, 20.0);
    }

    #[test]
    fn close_ratios() {
        let mut bars = vec![flat(2, 20.0), flat(4, 10.0)];
        apply_close_ratios(&mut bars, &[0.5, 1.0], AdjustMode::Qfq);
        assert_eq!(bars[0].close, 10.0);
        assert_eq!(bars[1].close, 10.0);

        let mut bars = vec![flat(2, 20.0), flat(4, 10.0)];
        apply_close_ratios(&mut bars, &[0.5, 1.0], AdjustMode::Hfq);
        assert_eq!(bars[0].close, 20.0);
        assert_eq!(bars[1].close, 20.0);
    }
}
