//! Property tests for cache invariants.
//!
//! Uses proptest to verify:
//! 1. Key uniqueness: distinct (kind, params) never share a key
//! 2. Completeness exactness: complete iff equal, excess never complete
//! 3. Dedupe: sorted, duplicate-free, first occurrence wins
//! 4. Delta merge: history plus overlapping delta has no repeated dates

use barvault_core::cache::{cache_key, CacheParams, RecordKind};
use barvault_core::completeness::{assess, Assessment};
use barvault_core::domain::{dedupe_by_date, duplicate_dates, DailyBar, Exchange, Instrument};
use chrono::NaiveDate;
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_instrument() -> impl Strategy<Value = Instrument> {
    (0u32..1_000_000, prop_oneof![Just("SH"), Just("SZ"), Just("BJ")])
        .prop_map(|(code, suffix)| Instrument::parse(&format!("{code:06}.{suffix}")).unwrap())
}

fn arb_kind() -> impl Strategy<Value = RecordKind> {
    prop_oneof![
        Just(RecordKind::FullHistory),
        Just(RecordKind::RangeSlice),
        Just(RecordKind::TradingCalendarYear),
        Just(RecordKind::SuspensionYear),
    ]
}

fn arb_params() -> impl Strategy<Value = CacheParams> {
    prop::collection::btree_map("[a-z_]{1,12}", "[A-Za-z0-9.]{0,16}", 0..5).prop_map(
        |map: BTreeMap<String, String>| {
            map.into_iter()
                .fold(CacheParams::new(), |p, (k, v)| p.with(&k, v))
        },
    )
}

fn arb_bars() -> impl Strategy<Value = Vec<DailyBar>> {
    prop::collection::vec((0i64..60, 1.0..500.0_f64), 0..80).prop_map(|rows| {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        rows.into_iter()
            .map(|(offset, px)| DailyBar {
                date: base + chrono::Duration::days(offset),
                open: px,
                high: px,
                low: px,
                close: px,
                volume: 1.0,
                amount: px,
            })
            .collect()
    })
}

// ── 1. Key Uniqueness ────────────────────────────────────────────────

proptest! {
    /// Different (kind, params) pairs render different keys.
    #[test]
    fn distinct_inputs_distinct_keys(
        a_kind in arb_kind(), a in arb_params(),
        b_kind in arb_kind(), b in arb_params(),
    ) {
        prop_assume!(a_kind != b_kind || a != b);
        prop_assert_ne!(cache_key(a_kind, &a), cache_key(b_kind, &b));
    }

    /// Keys stay bounded however many parameters there are.
    #[test]
    fn keys_are_bounded(kind in arb_kind(), params in arb_params()) {
        prop_assert!(cache_key(kind, &params).len() <= 120);
    }

    /// One history key per instrument, one calendar key per exchange-year.
    #[test]
    fn builder_keys_are_unique(instruments in prop::collection::vec(arb_instrument(), 1..20)) {
        let distinct: HashSet<_> = instruments.iter().collect();
        let keys: HashSet<_> = instruments
            .iter()
            .map(|i| cache_key(RecordKind::FullHistory, &CacheParams::full_history(i, barvault_core::AdjustMode::Qfq)))
            .collect();
        prop_assert_eq!(keys.len(), distinct.len());

        let years: HashSet<_> = (1990..2030)
            .flat_map(|y| [Exchange::Sse, Exchange::Szse].map(|e| cache_key(RecordKind::TradingCalendarYear, &CacheParams::calendar_year(e, y))))
            .collect();
        prop_assert_eq!(years.len(), 80);
    }
}

// ── 2. Completeness Exactness ────────────────────────────────────────

proptest! {
    #[test]
    fn complete_iff_exact(actual in 0usize..400, expected in 0usize..400) {
        let verdict = assess(actual, expected, 1.0);
        prop_assert_eq!(verdict == Assessment::Complete, actual == expected);
    }

    /// No tolerance setting lets an excess through.
    #[test]
    fn excess_never_complete(expected in 0usize..400, extra in 1usize..50, tol in 0.01..=1.0_f64) {
        prop_assert_eq!(assess(expected + extra, expected, tol), Assessment::Excess(extra));
    }
}

// ── 3. Dedupe ────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn dedupe_keeps_first_occurrence(bars in arb_bars()) {
        let mut first_seen: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for b in &bars {
            first_seen.entry(b.date).or_insert(b.close);
        }

        let mut deduped = bars.clone();
        let dropped = dedupe_by_date(&mut deduped);

        prop_assert_eq!(dropped, bars.len() - first_seen.len());
        prop_assert_eq!(duplicate_dates(&deduped), 0);
        prop_assert!(deduped.windows(2).all(|w| w[0].date < w[1].date));
        for b in &deduped {
            prop_assert_eq!(Some(&b.close), first_seen.get(&b.date));
        }
    }

    /// Appending an overlapping delta and deduping keeps stored values.
    #[test]
    fn delta_merge_has_no_duplicates(stored in arb_bars(), delta in arb_bars()) {
        let mut history = stored.clone();
        dedupe_by_date(&mut history);
        let kept = history.clone();

        history.extend(delta);
        dedupe_by_date(&mut history);

        prop_assert_eq!(duplicate_dates(&history), 0);
        for old in &kept {
            let merged = history.iter().find(|b| b.date == old.date).unwrap();
            prop_assert_eq!(merged.close, old.close);
        }
    }
}
