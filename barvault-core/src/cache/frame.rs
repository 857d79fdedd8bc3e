//! DataFrame conversion and Parquet I/O helpers.
//!
//! Every blob read passes through [`normalize_frame`] so callers can rely on
//! `date` being a proper `Date` column regardless of how an older writer (or
//! an imported cache) stored it, and on bar blobs carrying numeric prices.

use super::key::RecordKind;
use super::CacheError;
use crate::domain::{parse_compact_date, DailyBar, DateSpan};
use chrono::NaiveDate;
use polars::prelude::*;
use std::fs;
use std::path::Path;

pub const DATE_COL: &str = "date";
pub const BAR_COLUMNS: [&str; 6] = ["open", "high", "low", "close", "volume", "amount"];

fn to_epoch_days(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}

fn from_epoch_days(days: i64) -> NaiveDate {
    NaiveDate::default() + chrono::Duration::days(days)
}

fn parquet_err(context: &str) -> impl Fn(PolarsError) -> CacheError + '_ {
    move |e| CacheError::Parquet(format!("{context}: {e}"))
}

fn date_column(dates: &[NaiveDate]) -> Result<Column, CacheError> {
    let days: Vec<i32> = dates.iter().map(|d| to_epoch_days(*d)).collect();
    Column::new(DATE_COL.into(), days)
        .cast(&DataType::Date)
        .map_err(parquet_err("date cast"))
}

/// Convert bars to the blob schema: `date` plus six Float64 columns.
pub fn bars_to_frame(bars: &[DailyBar]) -> Result<DataFrame, CacheError> {
    let dates: Vec<NaiveDate> = bars.iter().map(|b| b.date).collect();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
    let amounts: Vec<f64> = bars.iter().map(|b| b.amount).collect();

    DataFrame::new(vec![
        date_column(&dates)?,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        Column::new("amount".into(), amounts),
    ])
    .map_err(parquet_err("dataframe creation"))
}

/// Single-column frame used by calendar and suspension blobs.
pub fn dates_to_frame(dates: &[NaiveDate]) -> Result<DataFrame, CacheError> {
    DataFrame::new(vec![date_column(dates)?]).map_err(parquet_err("dataframe creation"))
}

/// Read the `date` column of a frame in any supported representation.
pub fn frame_dates(df: &DataFrame) -> Result<Vec<NaiveDate>, CacheError> {
    let column = df
        .column(DATE_COL)
        .map_err(|_| CacheError::InvalidBlob(format!("missing '{DATE_COL}' column")))?;
    column_to_dates(column)
}

fn column_to_dates(column: &Column) -> Result<Vec<NaiveDate>, CacheError> {
    let null_at = |i: usize| CacheError::InvalidBlob(format!("null or unparseable date at row {i}"));

    match column.dtype() {
        DataType::Date => {
            let ca = column.date().map_err(parquet_err("date column type"))?;
            (0..ca.len())
                .map(|i| ca.get(i).map(|d| from_epoch_days(d as i64)).ok_or_else(|| null_at(i)))
                .collect()
        }
        DataType::Datetime(_, _) => {
            let as_date = column
                .cast(&DataType::Date)
                .map_err(parquet_err("datetime cast"))?;
            column_to_dates(&as_date)
        }
        DataType::String => {
            let ca = column.str().map_err(parquet_err("string date column"))?;
            ca.into_iter()
                .enumerate()
                .map(|(i, v)| {
                    v.and_then(|s| parse_compact_date(s).ok())
                        .ok_or_else(|| null_at(i))
                })
                .collect()
        }
        dtype if dtype.is_integer() => {
            let as_i64 = column
                .cast(&DataType::Int64)
                .map_err(parquet_err("integer date cast"))?;
            let ca = as_i64.i64().map_err(parquet_err("integer date column"))?;
            ca.into_iter()
                .enumerate()
                .map(|(i, v)| v.and_then(integer_to_date).ok_or_else(|| null_at(i)))
                .collect()
        }
        other => Err(CacheError::InvalidBlob(format!(
            "unsupported '{DATE_COL}' column type {other:?}"
        ))),
    }
}

/// `yyyymmdd` integers are recognised by magnitude; anything else is
/// taken as days since 1970-01-01.
fn integer_to_date(v: i64) -> Option<NaiveDate> {
    if (10_000_101..=99_991_231).contains(&v) {
        let (y, md) = (v / 10_000, v % 10_000);
        NaiveDate::from_ymd_opt(y as i32, (md / 100) as u32, (md % 100) as u32)
    } else if v.abs() < 1_000_000 {
        Some(from_epoch_days(v))
    } else {
        None
    }
}

/// Rewrite the `date` column as `Date` if it is stored any other way.
pub fn normalize_date_column(mut df: DataFrame) -> Result<DataFrame, CacheError> {
    let dates = frame_dates(&df)?;
    let already_date = matches!(df.column(DATE_COL).map(|c| c.dtype()), Ok(DataType::Date));
    if !already_date {
        df.with_column(date_column(&dates)?)
            .map_err(parquet_err("replace date column"))?;
    }
    Ok(df)
}

/// Check the bar columns: all present, convertible to Float64 without
/// loss, no nulls, and no NaN prices. Columns stored as anything other than
/// Float64 are rewritten as Float64.
pub fn normalize_bar_columns(mut df: DataFrame) -> Result<DataFrame, CacheError> {
    for (i, name) in BAR_COLUMNS.into_iter().enumerate() {
        let column = df
            .column(name)
            .map_err(|_| CacheError::InvalidBlob(format!("missing column '{name}'")))?;
        let needs_rewrite = column.dtype() != &DataType::Float64;
        let as_f64 = column
            .strict_cast(&DataType::Float64)
            .map_err(|e| CacheError::InvalidBlob(format!("column '{name}' is not numeric: {e}")))?;
        if as_f64.null_count() > 0 {
            return Err(CacheError::InvalidBlob(format!(
                "column '{name}' has {} null values",
                as_f64.null_count()
            )));
        }
        // open/high/low/close; volume and amount may be unknown upstream.
        if i < 4 {
            let ca = as_f64.f64().map_err(parquet_err("numeric column type"))?;
            if ca.into_iter().any(|v| v.is_some_and(f64::is_nan)) {
                return Err(CacheError::InvalidBlob(format!("column '{name}' has NaN prices")));
            }
        }
        if needs_rewrite {
            df.with_column(as_f64)
                .map_err(parquet_err("replace numeric column"))?;
        }
    }
    Ok(df)
}

/// Everything a blob of `kind` must satisfy before it is served: a proper
/// `Date` column, plus the full bar schema for bar kinds.
pub fn normalize_frame(kind: RecordKind, df: DataFrame) -> Result<DataFrame, CacheError> {
    let df = normalize_date_column(df)?;
    if kind.holds_bars() {
        normalize_bar_columns(df)
    } else {
        Ok(df)
    }
}

/// Rows whose date falls inside `span`.
pub fn slice_frame(df: &DataFrame, span: DateSpan) -> Result<DataFrame, CacheError> {
    let dates = frame_dates(df)?;
    let mask: Vec<bool> = dates.iter().map(|d| span.contains(*d)).collect();
    let mask = BooleanChunked::from_slice("mask".into(), &mask);
    df.filter(&mask).map_err(parquet_err("range filter"))
}

/// First and last date present, if any.
pub fn frame_span(df: &DataFrame) -> Result<Option<DateSpan>, CacheError> {
    let dates = frame_dates(df)?;
    let min = dates.iter().min().copied();
    let max = dates.iter().max().copied();
    Ok(min.zip(max).and_then(|(a, b)| DateSpan::new(a, b)))
}

/// Convert a blob frame back to bars, in stored order.
pub fn frame_to_bars(df: &DataFrame) -> Result<Vec<DailyBar>, CacheError> {
    let dates = frame_dates(df)?;

    let mut values: Vec<Vec<f64>> = Vec::with_capacity(BAR_COLUMNS.len());
    for name in BAR_COLUMNS {
        let column = df
            .column(name)
            .map_err(|_| CacheError::InvalidBlob(format!("missing column '{name}'")))?;
        let as_f64 = column
            .strict_cast(&DataType::Float64)
            .map_err(|e| CacheError::InvalidBlob(format!("column '{name}' is not numeric: {e}")))?;
        let ca = as_f64.f64().map_err(parquet_err("numeric column type"))?;
        let column_values = ca
            .into_iter()
            .enumerate()
            .map(|(row, v)| {
                v.ok_or_else(|| CacheError::InvalidBlob(format!("null '{name}' at row {row}")))
            })
            .collect::<Result<Vec<f64>, CacheError>>()?;
        values.push(column_values);
    }

    Ok(dates
        .into_iter()
        .enumerate()
        .map(|(i, date)| DailyBar {
            date,
            open: values[0][i],
            high: values[1][i],
            low: values[2][i],
            close: values[3][i],
            volume: values[4][i],
            amount: values[5][i],
        })
        .collect())
}

/// Write a frame to `path`. The caller is responsible for atomic placement.
pub fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), CacheError> {
    let file = fs::File::create(path).map_err(|e| CacheError::io(path, e))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(parquet_err("write parquet"))?;
    Ok(())
}

pub fn read_parquet(path: &Path) -> Result<DataFrame, CacheError> {
    let file = fs::File::open(path).map_err(|e| CacheError::io(path, e))?;
    ParquetReader::new(file)
        .finish()
        .map_err(parquet_err("read parquet"))
}
