//! Eastmoney provider (secondary, free, no token).
//!
//! Uses the push2his kline endpoint. Each kline is a comma-joined string
//! `date,open,close,high,low,volume,amount`. The trading calendar is derived
//! from the SSE Composite index history: mainland exchanges share one
//! calendar, so the index's open days are every exchange's open days.

use super::circuit_breaker::CircuitBreaker;
use super::http::HttpPolicy;
use super::{CalendarProvider, DailyBarProvider, Provider, ProviderError};
use crate::domain::{compact_date, parse_compact_date, AdjustMode, DailyBar, Exchange, Instrument};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;

const NAME: &str = "eastmoney";
const KLINE_URL: &str = "https://push2his.eastmoney.com/api/qt/stock/kline/get";
/// SSE Composite index.
const CALENDAR_SECID: &str = "1.000001";

#[derive(Debug, Deserialize)]
struct KlineResponse {
    #[serde(default)]
    data: Option<KlineData>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(default)]
    klines: Vec<String>,
}

pub struct EastmoneyProvider {
    client: reqwest::blocking::Client,
    policy: HttpPolicy,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl EastmoneyProvider {
    pub fn new(policy: HttpPolicy, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, ProviderError> {
        Ok(Self {
            client: policy.client()?,
            policy,
            circuit_breaker,
        })
    }

    /// Market prefix 1 is Shanghai; Shenzhen and Beijing both use 0.
    fn secid(instrument: &Instrument) -> String {
        let market = match instrument.exchange() {
            Exchange::Sse => 1,
            Exchange::Szse | Exchange::Bse => 0,
        };
        format!("{market}.{}", instrument.code())
    }

    fn fqt(adj: AdjustMode) -> &'static str {
        match adj {
            AdjustMode::None => "0",
            AdjustMode::Qfq => "1",
            AdjustMode::Hfq => "2",
        }
    }

    fn klines(
        &self,
        secid: &str,
        start: NaiveDate,
        end: NaiveDate,
        fqt: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let (beg, end) = (compact_date(start), compact_date(end));
        let resp = self.policy.send(NAME, &self.circuit_breaker, || {
            self.client.get(KLINE_URL).query(&[
                ("secid", secid),
                ("fields1", "f1,f2,f3,f4,f5,f6"),
                ("fields2", "f51,f52,f53,f54,f55,f56,f57"),
                ("klt", "101"),
                ("fqt", fqt),
                ("beg", beg.as_str()),
                ("end", end.as_str()),
            ])
        })?;
        let parsed: KlineResponse = resp
            .json()
            .map_err(|e| ProviderError::MalformedResult(format!("failed to parse klines: {e}")))?;
        Ok(parsed.data.map(|d| d.klines).unwrap_or_default())
    }
}

/// Parse one `date,open,close,high,low,volume,amount` line.
fn parse_kline(line: &str) -> Result<DailyBar, ProviderError> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 7 {
        return Err(ProviderError::MalformedResult(format!(
            "kline has {} fields: {line}",
            parts.len()
        )));
    }
    let date = parse_compact_date(parts[0])
        .map_err(|_| ProviderError::MalformedResult(format!("bad kline date: {line}")))?;
    let num = |i: usize| parts[i].trim().parse::<f64>().unwrap_or(f64::NAN);
    Ok(DailyBar {
        date,
        open: num(1),
        close: num(2),
        high: num(3),
        low: num(4),
        volume: num(5),
        amount: num(6),
    })
}

fn kline_date(line: &str) -> Result<NaiveDate, ProviderError> {
    line.split(',')
        .next()
        .and_then(|d| parse_compact_date(d).ok())
        .ok_or_else(|| ProviderError::MalformedResult(format!("bad kline date: {line}")))
}

impl Provider for EastmoneyProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

impl DailyBarProvider for EastmoneyProvider {
    fn fetch_range(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
        adj: AdjustMode,
    ) -> Result<Vec<DailyBar>, ProviderError> {
        let lines = self.klines(&Self::secid(instrument), start, end, Self::fqt(adj))?;
        if lines.is_empty() {
            return Err(ProviderError::EmptyResult);
        }
        lines.iter().map(|l| parse_kline(l)).collect()
    }
}

impl CalendarProvider for EastmoneyProvider {
    fn trading_dates(&self, _exchange: Exchange, year: i32) -> Result<Vec<NaiveDate>, ProviderError> {
        let start = NaiveDate::from_ymd_opt(year, 1, 1)
            .ok_or_else(|| ProviderError::MalformedResult(format!("bad year {year}")))?;
        let end = NaiveDate::from_ymd_opt(year, 12, 31)
            .ok_or_else(|| ProviderError::MalformedResult(format!("bad year {year}")))?;
        let lines = self.klines(CALENDAR_SECID, start, end, "0")?;
        if lines.is_empty() {
            return Err(ProviderError::EmptyResult);
        }
        let mut dates = lines
            .iter()
            .map(|l| kline_date(l))
            .collect::<Result<Vec<_>, _>>()?;
        dates.sort_unstable();
        dates.dedup();
        Ok(dates)
    }
}
