//! Suspensions, degraded mode and the retry cap, seen through the sync engine.

mod common;

use barvault_core::cache::{CacheParams, RecordKind};
use barvault_core::config::CompletenessConfig;
use barvault_core::domain::{duplicate_dates, AdjustMode};
use barvault_core::SeriesSource;
use common::*;
use std::sync::Arc;

#[test]
fn suspended_through_end_triggers_no_delta_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let s = sym("600519.SH");
    let halted = weekdays(d(2023, 12, 18), d(2023, 12, 29));
    let market = Arc::new(
        FakeBars::new("fake", d(2023, 1, 2), d(2024, 12, 31)).suspended(halted.iter().copied()),
    );
    let h = harness(dir.path(), &[Arc::clone(&market)], FakeSuspensions::with_dates(halted.clone()));

    let first = h
        .engine
        .get_daily_series(&s, d(2023, 1, 1), d(2023, 12, 31), AdjustMode::Qfq)
        .unwrap();
    assert!(first.is_complete);
    assert_eq!(first.bars.last().unwrap().date, d(2023, 12, 15));
    assert_eq!(
        first.expected_rows,
        weekdays(d(2023, 1, 1), d(2023, 12, 31)).len() - halted.len()
    );

    let again = h
        .engine
        .get_daily_series(&s, d(2023, 6, 1), d(2023, 12, 31), AdjustMode::Qfq)
        .unwrap();
    assert_eq!(market.call_count(), 1);
    assert!(again.is_complete);
    assert_eq!(again.source, SeriesSource::FullHistoryCache);
}

#[test]
fn degraded_mismatch_is_retried_a_bounded_number_of_times() {
    let dir = tempfile::tempdir().unwrap();
    let s = sym("000001.SZ");
    let market = Arc::new(
        FakeBars::new("fake", d(2023, 1, 2), d(2024, 12, 31))
            .suspended(weekdays(d(2023, 6, 5), d(2023, 6, 9))),
    );
    let settings = CompletenessConfig {
        max_partial_retries: 2,
        ..CompletenessConfig::default()
    };
    let h = harness_with(dir.path(), &[Arc::clone(&market)], FakeSuspensions::denying(), settings);

    let mut last = None;
    for _ in 0..6 {
        last = Some(
            h.engine
                .get_daily_series(&s, d(2023, 1, 1), d(2023, 12, 31), AdjustMode::None)
                .unwrap(),
        );
    }
    let last = last.unwrap();

    // One first fetch plus two repairs, then accepted as best effort.
    assert_eq!(market.call_count(), 3);
    assert!(last.degraded);
    assert!(last.best_effort);
    assert!(!last.is_complete);
    assert_eq!(last.expected_rows - last.bars.len(), 5);

    let entry = h
        .engine
        .store()
        .entry(RecordKind::FullHistory, &CacheParams::full_history(&s, AdjustMode::None))
        .unwrap();
    assert!(entry.best_effort);
    assert_eq!(entry.partial_streak, 3);

    // Degraded suspension years are never written to the cache.
    assert!(h
        .engine
        .store()
        .entries()
        .iter()
        .all(|e| e.kind != RecordKind::SuspensionYear));
    assert_eq!(h.suspensions.call_count(), 1);
}

#[test]
fn empty_tail_upstream_is_recorded_and_capped() {
    let dir = tempfile::tempdir().unwrap();
    let s = sym("600000.SH");
    // Data stops at the end of 2023, with no suspension record to explain it.
    let market = Arc::new(FakeBars::new("fake", d(2023, 1, 2), d(2023, 12, 31)));
    let settings = CompletenessConfig {
        max_partial_retries: 1,
        ..CompletenessConfig::default()
    };
    let h = harness_with(dir.path(), &[Arc::clone(&market)], FakeSuspensions::default(), settings);

    h.engine
        .get_daily_series(&s, d(2023, 1, 1), d(2023, 12, 31), AdjustMode::Qfq)
        .unwrap();
    for _ in 0..4 {
        let series = h
            .engine
            .get_daily_series(&s, d(2023, 1, 1), d(2024, 1, 31), AdjustMode::Qfq)
            .unwrap();
        assert!(!series.is_complete);
        assert_eq!(series.bars.last().unwrap().date, d(2023, 12, 29));
    }

    // First fetch, then two empty deltas before the tail is accepted.
    assert_eq!(market.call_count(), 3);
    let entry = h
        .engine
        .store()
        .entry(RecordKind::FullHistory, &CacheParams::full_history(&s, AdjustMode::Qfq))
        .unwrap();
    assert!(entry.best_effort);
    assert_eq!(entry.span.unwrap().end, d(2024, 1, 31));
}

#[test]
fn concurrent_syncs_of_one_instrument_fetch_once() {
    let dir = tempfile::tempdir().unwrap();
    let s = sym("600519.SH");
    let market = Arc::new(FakeBars::new("fake", d(2022, 1, 4), d(2024, 12, 31)));
    let h = harness(dir.path(), &[Arc::clone(&market)], FakeSuspensions::default());

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    h.engine
                        .get_daily_series(&s, d(2023, 1, 1), d(2023, 12, 31), AdjustMode::Qfq)
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(market.call_count(), 1);
    assert_eq!(h.calendar.call_count(), 2);
    for series in &results {
        assert!(series.is_complete);
        assert_eq!(series.bars, results[0].bars);
        assert_eq!(duplicate_dates(&series.bars), 0);
    }

    let entry = h
        .engine
        .store()
        .entry(RecordKind::FullHistory, &CacheParams::full_history(&s, AdjustMode::Qfq))
        .unwrap();
    assert_eq!(entry.row_count, weekdays(d(2022, 1, 4), d(2023, 12, 31)).len());
}

#[test]
fn calendar_outage_does_not_spend_retries() {
    let dir = tempfile::tempdir().unwrap();
    let s = sym("600519.SH");
    let holidays = weekdays(d(2023, 5, 1), d(2023, 5, 3));
    let market = Arc::new(
        FakeBars::new("fake", d(2023, 1, 2), d(2024, 12, 31)).suspended(holidays.iter().copied()),
    );
    let settings = CompletenessConfig {
        max_partial_retries: 1,
        calendar_estimate_ttl_secs: 0,
        ..CompletenessConfig::default()
    };
    let h = harness_with(dir.path(), &[Arc::clone(&market)], FakeSuspensions::default(), settings);
    h.calendar.set_holidays(holidays.iter().copied());
    h.calendar.set_down(true);

    for _ in 0..4 {
        let series = h
            .engine
            .get_daily_series(&s, d(2023, 1, 1), d(2023, 12, 31), AdjustMode::Qfq)
            .unwrap();
        assert!(series.degraded);
        assert!(!series.is_complete);
        assert!(!series.best_effort);
    }
    // Estimated holidays read as missing rows, yet nothing was re-fetched.
    assert_eq!(market.call_count(), 1);
    let params = CacheParams::full_history(&s, AdjustMode::Qfq);
    let entry = h.engine.store().entry(RecordKind::FullHistory, &params).unwrap();
    assert_eq!(entry.partial_streak, 0);
    assert!(!entry.best_effort);

    // The estimate expires and the real calendar settles the history.
    h.calendar.set_down(false);
    let series = h
        .engine
        .get_daily_series(&s, d(2023, 1, 1), d(2023, 12, 31), AdjustMode::Qfq)
        .unwrap();
    assert!(series.is_complete);
    assert!(!series.degraded);
    assert_eq!(series.expected_rows, weekdays(d(2023, 1, 2), d(2023, 12, 31)).len() - 3);
    assert_eq!(market.call_count(), 2);
    let entry = h.engine.store().entry(RecordKind::FullHistory, &params).unwrap();
    assert!(entry.is_complete);
}
