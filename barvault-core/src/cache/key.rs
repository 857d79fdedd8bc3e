//! Cache keys: `{kind}_{k=v}_{k=v}...` over a sorted parameter map.

use crate::domain::{compact_date, AdjustMode, DateSpan, Exchange, Instrument};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Keys longer than this are collapsed to `{kind}_h{blake3}`.
pub const MAX_KEY_LEN: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    FullHistory,
    RangeSlice,
    TradingCalendarYear,
    SuspensionYear,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::FullHistory,
        RecordKind::RangeSlice,
        RecordKind::TradingCalendarYear,
        RecordKind::SuspensionYear,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::FullHistory => "full_history",
            RecordKind::RangeSlice => "range_slice",
            RecordKind::TradingCalendarYear => "trading_calendar_year",
            RecordKind::SuspensionYear => "suspension_year",
        }
    }

    /// Permanent kinds are never evicted and never expire.
    pub fn is_permanent(self) -> bool {
        !matches!(self, RecordKind::RangeSlice)
    }

    /// Kinds whose blobs hold daily bars rather than a bare date list.
    pub fn holds_bars(self) -> bool {
        matches!(self, RecordKind::FullHistory | RecordKind::RangeSlice)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown record kind '{s}'"))
    }
}

/// Sorted parameter map identifying one entry within its kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheParams(BTreeMap<String, String>);

impl CacheParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The `instrument` parameter, if this entry is instrument-scoped.
    pub fn instrument(&self) -> Option<&str> {
        self.get("instrument")
    }

    pub fn full_history(instrument: &Instrument, adj: AdjustMode) -> Self {
        Self::new()
            .with("instrument", instrument)
            .with("adj", adj)
    }

    pub fn range_slice(instrument: &Instrument, span: DateSpan, adj: AdjustMode) -> Self {
        Self::new()
            .with("instrument", instrument)
            .with("adj", adj)
            .with("start", compact_date(span.start))
            .with("end", compact_date(span.end))
    }

    pub fn calendar_year(exchange: Exchange, year: i32) -> Self {
        Self::new().with("exchange", exchange).with("year", year)
    }

    pub fn suspension_year(instrument: &Instrument, year: i32) -> Self {
        Self::new()
            .with("instrument", instrument)
            .with("year", year)
    }
}

/// Deterministic key for `(kind, params)`.
pub fn cache_key(kind: RecordKind, params: &CacheParams) -> String {
    let rendered = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("_");

    let key = if rendered.is_empty() {
        kind.as_str().to_string()
    } else {
        format!("{}_{}", kind.as_str(), rendered)
    };

    if key.len() <= MAX_KEY_LEN {
        return key;
    }
    let hash = blake3::hash(rendered.as_bytes()).to_hex();
    format!("{}_h{}", kind.as_str(), &hash[..32])
}
