//! Tushare Pro provider (primary, token-gated).
//!
//! Every call is a JSON POST of `{api_name, token, params, fields}`; the
//! response is `{code, msg, data: {fields, items}}`, a column-named table.
//! Non-zero codes distinguish entitlement denials (no retry, breaker
//! tripped) from per-minute rate limits.

use super::adjust::apply_factors;
use super::circuit_breaker::CircuitBreaker;
use super::http::HttpPolicy;
use super::{CalendarProvider, DailyBarProvider, Provider, ProviderError, SuspensionProvider};
use crate::domain::{compact_date, parse_compact_date, AdjustMode, DailyBar, Exchange, Instrument};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const NAME: &str = "tushare";

/// Entitlement errors: token lacks the points for this API.
const CODE_NO_PERMISSION: i64 = 40203;
const CODE_BAD_TOKEN: i64 = 40101;

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    api_name: &'a str,
    token: &'a str,
    params: Value,
    fields: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Table>,
}

#[derive(Debug, Deserialize)]
struct Table {
    fields: Vec<String>,
    items: Vec<Vec<Value>>,
}

impl Table {
    fn column(&self, name: &str) -> Result<usize, ProviderError> {
        self.fields
            .iter()
            .position(|f| f == name)
            .ok_or_else(|| ProviderError::MalformedResult(format!("missing field '{name}'")))
    }

    fn date_at(&self, row: &[Value], idx: usize) -> Result<NaiveDate, ProviderError> {
        row.get(idx)
            .and_then(Value::as_str)
            .and_then(|s| parse_compact_date(s).ok())
            .ok_or_else(|| ProviderError::MalformedResult(format!("bad date in row {row:?}")))
    }

    fn f64_at(row: &[Value], idx: usize) -> f64 {
        match row.get(idx) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
            Some(Value::String(s)) => s.parse().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }
}

pub struct TushareProvider {
    client: reqwest::blocking::Client,
    token: String,
    endpoint: String,
    policy: HttpPolicy,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl TushareProvider {
    pub fn new(
        token: String,
        endpoint: String,
        policy: HttpPolicy,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: policy.client()?,
            token,
            endpoint,
            policy,
            circuit_breaker,
        })
    }

    fn query(&self, api_name: &str, params: Value, fields: &str) -> Result<Table, ProviderError> {
        let body = ApiRequest {
            api_name,
            token: &self.token,
            params,
            fields,
        };
        let resp = self.policy.send(NAME, &self.circuit_breaker, || {
            self.client.post(&self.endpoint).json(&body)
        })?;
        let parsed: ApiResponse = resp.json().map_err(|e| {
            ProviderError::MalformedResult(format!("failed to parse {api_name} response: {e}"))
        })?;
        debug!(api = api_name, code = parsed.code, "tushare response");
        self.check(api_name, parsed)
    }

    fn check(&self, api_name: &str, resp: ApiResponse) -> Result<Table, ProviderError> {
        match classify_response(resp) {
            Err(ProviderError::QuotaExhausted(msg)) => {
                self.circuit_breaker.trip();
                warn!(
                    api = api_name,
                    msg = %msg,
                    "tushare entitlement denied; try a different provider or upgrade entitlement"
                );
                Err(ProviderError::QuotaExhausted(msg))
            }
            Err(ProviderError::RateLimited { retry_after_secs }) => {
                self.circuit_breaker.record_failure();
                Err(ProviderError::RateLimited { retry_after_secs })
            }
            other => other,
        }
    }

    fn adj_factors(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, f64>, ProviderError> {
        let table = self.query(
            "adj_factor",
            json!({
                "ts_code": instrument.ts_code(),
                "start_date": compact_date(start),
                "end_date": compact_date(end),
            }),
            "trade_date,adj_factor",
        )?;
        parse_factors(&table)
    }
}

/// Map a response envelope to its table or a typed failure.
fn classify_response(resp: ApiResponse) -> Result<Table, ProviderError> {
    if resp.code == 0 {
        return resp
            .data
            .ok_or_else(|| ProviderError::MalformedResult("code 0 without data".into()));
    }
    let msg = resp.msg.unwrap_or_default();
    // 40203 covers both per-minute limits and missing entitlement; the
    // message tells them apart.
    if msg.contains("每分钟") || msg.contains("频率") || msg.contains("最多访问") || msg.contains("rate limit") {
        return Err(ProviderError::RateLimited {
            retry_after_secs: 60,
        });
    }
    if resp.code == CODE_NO_PERMISSION
        || resp.code == CODE_BAD_TOKEN
        || msg.contains("权限")
        || msg.contains("permission")
    {
        return Err(ProviderError::QuotaExhausted(format!("{} {msg}", resp.code)));
    }
    Err(ProviderError::MalformedResult(format!("code {}: {msg}", resp.code)))
}

fn parse_daily(table: &Table) -> Result<Vec<DailyBar>, ProviderError> {
    let date = table.column("trade_date")?;
    let open = table.column("open")?;
    let high = table.column("high")?;
    let low = table.column("low")?;
    let close = table.column("close")?;
    let vol = table.column("vol")?;
    let amount = table.column("amount")?;

    table
        .items
        .iter()
        .map(|row| {
            Ok(DailyBar {
                date: table.date_at(row, date)?,
                open: Table::f64_at(row, open),
                high: Table::f64_at(row, high),
                low: Table::f64_at(row, low),
                close: Table::f64_at(row, close),
                volume: Table::f64_at(row, vol),
                amount: Table::f64_at(row, amount),
            })
        })
        .collect()
}

fn parse_factors(table: &Table) -> Result<BTreeMap<NaiveDate, f64>, ProviderError> {
    let date = table.column("trade_date")?;
    let factor = table.column("adj_factor")?;
    table
        .items
        .iter()
        .map(|row| Ok((table.date_at(row, date)?, Table::f64_at(row, factor))))
        .collect()
}

fn parse_open_dates(table: &Table) -> Result<Vec<NaiveDate>, ProviderError> {
    let date = table.column("cal_date")?;
    let is_open = table.column("is_open")?;
    let mut dates = Vec::new();
    for row in &table.items {
        let open = match row.get(is_open) {
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            Some(Value::String(s)) => s == "1",
            _ => false,
        };
        if open {
            dates.push(table.date_at(row, date)?);
        }
    }
    dates.sort_unstable();
    dates.dedup();
    Ok(dates)
}

fn parse_dates(table: &Table, field: &str) -> Result<Vec<NaiveDate>, ProviderError> {
    let idx = table.column(field)?;
    let mut dates = table
        .items
        .iter()
        .map(|row| table.date_at(row, idx))
        .collect::<Result<Vec<_>, _>>()?;
    dates.sort_unstable();
    dates.dedup();
    Ok(dates)
}

fn year_bounds(year: i32) -> (String, String) {
    (format!("{year}0101"), format!("{year}1231"))
}

impl Provider for TushareProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

impl DailyBarProvider for TushareProvider {
    fn fetch_range(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
        adj: AdjustMode,
    ) -> Result<Vec<DailyBar>, ProviderError> {
        let table = self.query(
            "daily",
            json!({
                "ts_code": instrument.ts_code(),
                "start_date": compact_date(start),
                "end_date": compact_date(end),
            }),
            "trade_date,open,high,low,close,vol,amount",
        )?;
        let mut bars = parse_daily(&table)?;
        if bars.is_empty() {
            return Err(ProviderError::EmptyResult);
        }
        bars.sort_by_key(|b| b.date);

        if adj != AdjustMode::None {
            let factors = self.adj_factors(instrument, start, end)?;
            apply_factors(&mut bars, &factors, adj);
        }
        Ok(bars)
    }

    fn listing_date(&self, instrument: &Instrument) -> Result<Option<NaiveDate>, ProviderError> {
        let table = self.query(
            "stock_basic",
            json!({ "ts_code": instrument.ts_code() }),
            "ts_code,list_date",
        )?;
        Ok(parse_dates(&table, "list_date")?.into_iter().next())
    }
}

impl CalendarProvider for TushareProvider {
    fn trading_dates(&self, exchange: Exchange, year: i32) -> Result<Vec<NaiveDate>, ProviderError> {
        let (start, end) = year_bounds(year);
        let table = self.query(
            "trade_cal",
            json!({
                "exchange": exchange.code(),
                "start_date": start,
                "end_date": end,
            }),
            "cal_date,is_open",
        )?;
        let dates = parse_open_dates(&table)?;
        if dates.is_empty() {
            return Err(ProviderError::EmptyResult);
        }
        Ok(dates)
    }
}

impl SuspensionProvider for TushareProvider {
    fn suspended_dates(
        &self,
        instrument: &Instrument,
        year: i32,
    ) -> Result<Vec<NaiveDate>, ProviderError> {
        let (start, end) = year_bounds(year);
        let table = self.query(
            "suspend_d",
            json!({
                "ts_code": instrument.ts_code(),
                "start_date": start,
                "end_date": end,
                "suspend_type": "S",
            }),
            "ts_code,trade_date,suspend_type",
        )?;
        parse_dates(&table, "trade_date")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> ApiResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_daily_table() {
        let resp = response(
            r#"{"code":0,"msg":"","data":{
                "fields":["trade_date","open","high","low","close","vol","amount"],
                "items":[["20240103",1700.0,1710.0,1690.0,1705.0,3000.5,512000.0],
                         ["20240102",1680.0,1702.0,1675.0,1699.0,2500.0,420000.0]]}}"#,
        );
        let table = classify_response(resp).unwrap();
        let bars = parse_daily(&table).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert_eq!(bars[0].volume, 3000.5);
    }

    #[test]
    fn entitlement_denial_is_quota_exhausted() {
        let resp = response(r#"{"code":40203,"msg":"抱歉，您没有访问该接口的权限","data":null}"#);
        assert!(matches!(
            classify_response(resp),
            Err(ProviderError::QuotaExhausted(_))
        ));
    }

    #[test]
    fn per_minute_limit_is_rate_limited() {
        let resp = response(r#"{"code":40203,"msg":"每分钟最多访问该接口200次"}"#);
        assert!(matches!(
            classify_response(resp),
            Err(ProviderError::RateLimited { retry_after_secs: 60 })
        ));

        let resp = response(r#"{"code":-2001,"msg":"每分钟最多访问该接口200次"}"#);
        assert!(matches!(
            classify_response(resp),
            Err(ProviderError::RateLimited { retry_after_secs: 60 })
        ));
    }

    #[test]
    fn calendar_keeps_open_days_only() {
        let resp = response(
            r#"{"code":0,"data":{"fields":["cal_date","is_open"],
                "items":[["20240101",0],["20240103","1"],["20240102",1]]}}"#,
        );
        let dates = parse_open_dates(&classify_response(resp).unwrap()).unwrap();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            ]
        );
    }

    #[test]
    fn factors_and_missing_fields() {
        let resp = response(
            r#"{"code":0,"data":{"fields":["trade_date","adj_factor"],
                "items":[["20240102",8.5],["20240103","8.6"]]}}"#,
        );
        let factors = parse_factors(&classify_response(resp).unwrap()).unwrap();
        assert_eq!(factors.len(), 2);
        assert_eq!(factors[&NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()], 8.6);

        let resp = response(r#"{"code":0,"data":{"fields":["trade_date"],"items":[]}}"#);
        assert!(matches!(
            parse_factors(&classify_response(resp).unwrap()),
            Err(ProviderError::MalformedResult(_))
        ));
    }

    #[test]
    fn empty_suspension_table_is_valid() {
        let resp = response(
            r#"{"code":0,"data":{"fields":["ts_code","trade_date","suspend_type"],"items":[]}}"#,
        );
        assert!(parse_dates(&classify_response(resp).unwrap(), "trade_date")
            .unwrap()
            .is_empty());
    }
}
