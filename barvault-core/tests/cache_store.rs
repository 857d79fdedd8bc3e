//! Cache store behaviour across kinds, files and cache roots.

mod common;

use barvault_core::cache::frame::{bars_to_frame, dates_to_frame, frame_to_bars, write_parquet};
use barvault_core::cache::{CacheParams, EntryFilter, ImportMode, RecordKind};
use barvault_core::config::CacheConfig;
use barvault_core::domain::{AdjustMode, DateSpan, Exchange, Instrument};
use barvault_core::{CacheStore, SeriesSource};
use common::*;
use polars::prelude::*;
use std::sync::Arc;

fn populated(root: &std::path::Path) -> CacheStore {
    let store = CacheStore::open(CacheConfig::at(root)).unwrap();
    let s = sym("600519.SH");
    let market = FakeBars::new("fake", d(2023, 1, 2), d(2023, 12, 31));

    let history = bars_to_frame(&market.rows(d(2023, 1, 1), d(2023, 12, 31))).unwrap();
    store
        .set(RecordKind::FullHistory, &CacheParams::full_history(&s, AdjustMode::Qfq), &history, true)
        .unwrap();
    store
        .set(
            RecordKind::TradingCalendarYear,
            &CacheParams::calendar_year(Exchange::Sse, 2023),
            &dates_to_frame(&weekdays(d(2023, 1, 1), d(2023, 12, 31))).unwrap(),
            true,
        )
        .unwrap();
    store
        .set(
            RecordKind::SuspensionYear,
            &CacheParams::suspension_year(&s, 2023),
            &dates_to_frame(&[]).unwrap(),
            true,
        )
        .unwrap();
    for month in 1..=3 {
        let span = DateSpan::new(d(2023, month, 1), d(2023, month, 28)).unwrap();
        let rows = bars_to_frame(&market.rows(span.start, span.end)).unwrap();
        store
            .set(RecordKind::RangeSlice, &CacheParams::range_slice(&s, span, AdjustMode::Qfq), &rows, true)
            .unwrap();
    }
    store
}

#[test]
fn eviction_only_touches_range_slices() {
    let dir = tempfile::tempdir().unwrap();
    let store = populated(dir.path());
    assert_eq!(store.entries().len(), 6);

    let report = store.evict_to_budget(1).unwrap();
    assert_eq!(report.removed, 3);
    assert!(!report.budget_met);

    let kinds: Vec<RecordKind> = store.entries().iter().map(|e| e.kind).collect();
    assert!(kinds.iter().all(|k| k.is_permanent()));
    assert_eq!(kinds.len(), 3);
}

#[test]
fn report_counts_by_kind() {
    let dir = tempfile::tempdir().unwrap();
    let store = populated(dir.path());
    let report = store.report();
    assert_eq!(report.total_entries, 6);
    assert_eq!(report.counts_by_kind[&RecordKind::RangeSlice], 3);
    assert_eq!(report.counts_by_kind[&RecordKind::FullHistory], 1);
    assert_eq!(report.complete_count, 6);
    assert_eq!(report.instrument_count, 1);
    assert!(report.age_stats.is_some());
    assert!(store.verify().is_clean());
}

#[test]
fn export_import_keeps_one_entry_per_key() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let source = populated(src.path());

    let exported = source.export(out.path(), &EntryFilter::default()).unwrap();
    assert_eq!(exported.copied, 6);

    let target = CacheStore::open(CacheConfig::at(dst.path())).unwrap();
    let first = target.import(out.path(), ImportMode::Merge).unwrap();
    assert_eq!(first.copied, 6);
    let second = target.import(out.path(), ImportMode::Merge).unwrap();
    assert_eq!(second.copied, 0);
    assert_eq!(second.skipped, 6);

    assert_eq!(target.entries().len(), 6);
    let blobs = walk_parquet(&dst.path().join("blobs"));
    assert_eq!(blobs, 6);
    assert!(target.verify().is_clean());

    // Only one instrument's range slices.
    let partial = tempfile::tempdir().unwrap();
    let filter = EntryFilter {
        kind: Some(RecordKind::RangeSlice),
        instrument: Some("600519.SH".into()),
    };
    assert_eq!(source.export(partial.path(), &filter).unwrap().copied, 3);
}

fn walk_parquet(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .map(|p| {
            if p.is_dir() {
                walk_parquet(&p)
            } else {
                usize::from(p.extension().is_some_and(|x| x == "parquet"))
            }
        })
        .sum()
}

#[test]
fn string_and_integer_date_columns_are_normalised_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(CacheConfig::at(dir.path())).unwrap();
    let s = sym("000001.SZ");
    let params = CacheParams::full_history(&s, AdjustMode::None);
    let market = FakeBars::new("fake", d(2024, 1, 2), d(2024, 1, 5));
    let entry = store
        .set(RecordKind::FullHistory, &params, &bars_to_frame(&market.rows(d(2024, 1, 1), d(2024, 1, 5))).unwrap(), true)
        .unwrap();
    let blob = dir.path().join(&entry.blob_path);

    let date_forms = [
        Column::new("date".into(), ["20240102", "2024-01-03", "20240104", "20240105"]),
        Column::new("date".into(), [20240102i64, 20240103, 20240104, 20240105]),
    ];
    for dates in date_forms {
        let values = |v: f64| [v, v, v, v];
        let df = DataFrame::new(vec![
            dates,
            Column::new("open".into(), values(1.0)),
            Column::new("high".into(), values(2.0)),
            Column::new("low".into(), values(0.5)),
            Column::new("close".into(), values(1.5)),
            Column::new("volume".into(), values(10.0)),
            Column::new("amount".into(), values(15.0)),
        ])
        .unwrap();
        write_parquet(&df, &blob).unwrap();

        let hit = store
            .get(
                RecordKind::FullHistory,
                &params,
                Some(DateSpan::new(d(2024, 1, 3), d(2024, 1, 4)).unwrap()),
            )
            .unwrap()
            .unwrap();
        assert_eq!(hit.frame.column("date").unwrap().dtype(), &DataType::Date);
        let bars = frame_to_bars(&hit.frame).unwrap();
        let dates: Vec<_> = bars.iter().map(|b| b.date).collect();
        assert_eq!(dates, vec![d(2024, 1, 3), d(2024, 1, 4)]);
    }
}

#[test]
fn corrupt_history_blob_is_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let s = sym("600519.SH");
    let market = Arc::new(FakeBars::new("fake", d(2023, 1, 2), d(2024, 12, 31)));
    let h = harness(dir.path(), &[Arc::clone(&market)], FakeSuspensions::default());

    h.engine
        .get_daily_series(&s, d(2023, 1, 1), d(2023, 6, 30), AdjustMode::Qfq)
        .unwrap();
    let entry = h
        .engine
        .store()
        .entry(RecordKind::FullHistory, &CacheParams::full_history(&s, AdjustMode::Qfq))
        .unwrap();
    let blob = dir.path().join(&entry.blob_path);
    std::fs::write(&blob, b"definitely not parquet").unwrap();

    let series = h
        .engine
        .get_daily_series(&s, d(2023, 1, 1), d(2023, 6, 30), AdjustMode::Qfq)
        .unwrap();
    assert_eq!(series.source, SeriesSource::FirstFetch);
    assert!(series.is_complete);
    assert_eq!(market.call_count(), 2);
    assert!(blob.with_extension("parquet.quarantined").exists());
}

fn overwrite_history_blob(
    h: &Harness,
    root: &std::path::Path,
    s: &Instrument,
    df: &DataFrame,
) -> std::path::PathBuf {
    let entry = h
        .engine
        .store()
        .entry(RecordKind::FullHistory, &CacheParams::full_history(s, AdjustMode::Qfq))
        .unwrap();
    let blob = root.join(&entry.blob_path);
    write_parquet(df, &blob).unwrap();
    blob
}

#[test]
fn history_blob_without_price_columns_is_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let s = sym("600519.SH");
    let market = Arc::new(FakeBars::new("fake", d(2023, 1, 2), d(2024, 12, 31)));
    let h = harness(dir.path(), &[Arc::clone(&market)], FakeSuspensions::default());

    h.engine
        .get_daily_series(&s, d(2023, 1, 1), d(2023, 6, 30), AdjustMode::Qfq)
        .unwrap();
    let blob = overwrite_history_blob(
        &h,
        dir.path(),
        &s,
        &dates_to_frame(&weekdays(d(2023, 1, 2), d(2023, 6, 30))).unwrap(),
    );

    let series = h
        .engine
        .get_daily_series(&s, d(2023, 1, 1), d(2023, 6, 30), AdjustMode::Qfq)
        .unwrap();
    assert_eq!(series.source, SeriesSource::FirstFetch);
    assert!(series.is_complete);
    assert_eq!(market.call_count(), 2);
    assert!(blob.with_extension("parquet.quarantined").exists());
}

#[test]
fn history_blob_with_text_prices_is_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let s = sym("600519.SH");
    let market = Arc::new(FakeBars::new("fake", d(2023, 1, 2), d(2024, 12, 31)));
    let h = harness(dir.path(), &[Arc::clone(&market)], FakeSuspensions::default());

    let first = h
        .engine
        .get_daily_series(&s, d(2023, 1, 1), d(2023, 6, 30), AdjustMode::Qfq)
        .unwrap();
    let dates: Vec<_> = first.bars.iter().map(|b| b.date).collect();
    let n = dates.len();
    let mut df = dates_to_frame(&dates).unwrap();
    for name in ["open", "high", "low", "volume", "amount"] {
        df.with_column(Column::new(name.into(), vec![1.0f64; n])).unwrap();
    }
    df.with_column(Column::new("close".into(), vec!["n/a"; n])).unwrap();
    overwrite_history_blob(&h, dir.path(), &s, &df);

    let series = h
        .engine
        .get_daily_series(&s, d(2023, 1, 1), d(2023, 6, 30), AdjustMode::Qfq)
        .unwrap();
    assert_eq!(market.call_count(), 2);
    assert!(series.is_complete);
    assert_eq!(series.bars.len(), n);
    assert!(series.bars.iter().all(|b| !b.close.is_nan()));
}
