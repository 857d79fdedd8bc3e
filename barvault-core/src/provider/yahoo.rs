//! Yahoo Finance provider (tertiary).
//!
//! Fetches daily bars from Yahoo's v8 chart API. Shanghai listings use the
//! `.SS` suffix there; Beijing listings are not covered. Adjusted prices are
//! derived from the `adjclose` series.
//!
//! Yahoo Finance has no official API and is subject to unannounced format changes.

use super::adjust::apply_close_ratios;
use super::circuit_breaker::CircuitBreaker;
use super::http::HttpPolicy;
use super::{DailyBarProvider, Provider, ProviderError};
use crate::domain::{AdjustMode, DailyBar, Exchange, Instrument};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;

const NAME: &str = "yahoo_finance";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

pub struct YahooProvider {
    client: reqwest::blocking::Client,
    policy: HttpPolicy,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl YahooProvider {
    pub fn new(policy: HttpPolicy, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, ProviderError> {
        Ok(Self {
            client: policy.client()?,
            policy,
            circuit_breaker,
        })
    }

    fn symbol(instrument: &Instrument) -> Option<String> {
        match instrument.exchange() {
            Exchange::Sse => Some(format!("{}.SS", instrument.code())),
            Exchange::Szse => Some(format!("{}.SZ", instrument.code())),
            Exchange::Bse => None,
        }
    }

    fn chart_url(symbol: &str, start: NaiveDate, end: NaiveDate) -> String {
        let start_ts = start.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp();
        let end_ts = end.and_hms_opt(23, 59, 59).unwrap_or_default().and_utc().timestamp();
        format!(
            "https://query2.finance.yahoo.com/v8/finance/chart/{symbol}\
             ?period1={start_ts}&period2={end_ts}&interval=1d\
             &includeAdjustedClose=true"
        )
    }

    /// Parse the chart response into raw bars plus, per bar, the ratio of
    /// adjusted to raw close.
    fn parse_response(resp: ChartResponse) -> Result<(Vec<DailyBar>, Vec<f64>), ProviderError> {
        let result = resp.chart.result.ok_or_else(|| match resp.chart.error {
            Some(err) if err.code == "Not Found" => ProviderError::EmptyResult,
            Some(err) => ProviderError::MalformedResult(format!("{}: {}", err.code, err.description)),
            None => ProviderError::MalformedResult("empty result with no error".into()),
        })?;

        let data = result
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResult("result array is empty".into()))?;

        // A valid symbol with no bars in range omits timestamps entirely.
        let Some(timestamps) = data.timestamp else {
            return Err(ProviderError::EmptyResult);
        };

        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResult("no quote data".into()))?;

        let adj_closes = data
            .indicators
            .adjclose
            .and_then(|v| v.into_iter().next())
            .map(|a| a.adjclose);

        let mut bars = Vec::with_capacity(timestamps.len());
        let mut ratios = Vec::with_capacity(timestamps.len());

        for (i, &ts) in timestamps.iter().enumerate() {
            // Exchange-local trading date: Shanghai is UTC+8, bars stamp at 09:30.
            let date = chrono::DateTime::from_timestamp(ts + 8 * 3600, 0)
                .map(|dt| dt.date_naive())
                .ok_or_else(|| ProviderError::MalformedResult(format!("invalid timestamp: {ts}")))?;

            let open = quote.open.get(i).copied().flatten();
            let high = quote.high.get(i).copied().flatten();
            let low = quote.low.get(i).copied().flatten();
            let close = quote.close.get(i).copied().flatten();
            let volume = quote.volume.get(i).copied().flatten();

            // Skip rows where all OHLCV are None (holidays, halted days).
            if open.is_none() && high.is_none() && low.is_none() && close.is_none() && volume.is_none() {
                continue;
            }

            let close = close.unwrap_or(f64::NAN);
            let ratio = adj_closes
                .as_ref()
                .and_then(|v| v.get(i).copied().flatten())
                .map_or(1.0, |adj| adj / close);

            bars.push(DailyBar {
                date,
                open: open.unwrap_or(f64::NAN),
                high: high.unwrap_or(f64::NAN),
                low: low.unwrap_or(f64::NAN),
                close,
                volume: volume.unwrap_or(0.0),
                amount: f64::NAN,
            });
            ratios.push(ratio);
        }

        if bars.is_empty() {
            return Err(ProviderError::EmptyResult);
        }
        Ok((bars, ratios))
    }
}

impl Provider for YahooProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

impl DailyBarProvider for YahooProvider {
    fn fetch_range(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
        adj: AdjustMode,
    ) -> Result<Vec<DailyBar>, ProviderError> {
        let Some(symbol) = Self::symbol(instrument) else {
            return Err(ProviderError::EmptyResult);
        };
        let url = Self::chart_url(&symbol, start, end);
        let resp = self
            .policy
            .send(NAME, &self.circuit_breaker, || self.client.get(&url))?;
        let chart: ChartResponse = resp.json().map_err(|e| {
            ProviderError::MalformedResult(format!("failed to parse response for {symbol}: {e}"))
        })?;

        let (mut bars, ratios) = Self::parse_response(chart)?;
        apply_close_ratios(&mut bars, &ratios, adj);
        Ok(bars)
    }
}
