//! Upstream data providers and their structured error taxonomy.
//!
//! Capabilities are split into three traits so a source can serve any subset:
//! Tushare serves all three, Eastmoney bars and calendars, Yahoo bars only.
//! The cache layer sits above these traits; providers don't know about it.

pub mod adjust;
pub mod circuit_breaker;
pub mod eastmoney;
pub mod http;
pub mod tushare;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use eastmoney::EastmoneyProvider;
pub use http::HttpPolicy;
pub use tushare::TushareProvider;
pub use yahoo::YahooProvider;

use crate::config::ProviderSettings;
use crate::domain::{AdjustMode, DailyBar, Exchange, Instrument};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Why one provider call failed. Every variant advances the failover chain.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("quota or entitlement exhausted: {0}")]
    QuotaExhausted(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("network unreachable: {0}")]
    Network(String),

    #[error("provider returned no rows")]
    EmptyResult,

    #[error("response format changed: {0}")]
    MalformedResult(String),
}

impl ProviderError {
    /// Stable snake_case tag for logs and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::QuotaExhausted(_) => "quota_exhausted",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Network(_) => "network",
            ProviderError::EmptyResult => "empty_result",
            ProviderError::MalformedResult(_) => "malformed_result",
        }
    }
}

/// Configured provider identity, used in `providers.priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Tushare,
    Eastmoney,
    Yahoo,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Tushare => "tushare",
            ProviderKind::Eastmoney => "eastmoney",
            ProviderKind::Yahoo => "yahoo",
        })
    }
}

/// Common surface of every upstream source.
pub trait Provider: Send + Sync {
    /// Human-readable name, recorded in failure chains and series metadata.
    fn name(&self) -> &str;

    /// False while the provider refuses requests (circuit breaker open).
    fn is_available(&self) -> bool {
        true
    }
}

/// Daily OHLCV bars.
pub trait DailyBarProvider: Provider {
    /// Bars in `[start, end]`, adjusted per `adj`. Order and uniqueness are
    /// not guaranteed; the orchestrator normalises both.
    fn fetch_range(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
        adj: AdjustMode,
    ) -> Result<Vec<DailyBar>, ProviderError>;

    /// First trading date of the instrument, if this source knows it.
    fn listing_date(&self, _instrument: &Instrument) -> Result<Option<NaiveDate>, ProviderError> {
        Ok(None)
    }
}

/// Exchange trading calendars.
pub trait CalendarProvider: Provider {
    /// Open dates of `exchange` in calendar year `year`.
    fn trading_dates(&self, exchange: Exchange, year: i32) -> Result<Vec<NaiveDate>, ProviderError>;
}

/// Per-instrument trading halts.
pub trait SuspensionProvider: Provider {
    /// Dates in `year` on which `instrument` did not trade although its
    /// exchange was open. An empty vec is a valid answer.
    fn suspended_dates(
        &self,
        instrument: &Instrument,
        year: i32,
    ) -> Result<Vec<NaiveDate>, ProviderError>;
}

/// The concrete providers wired up from configuration.
#[derive(Clone, Default)]
pub struct ProviderSet {
    pub bars: Vec<Arc<dyn DailyBarProvider>>,
    pub calendars: Vec<Arc<dyn CalendarProvider>>,
    pub suspensions: Option<Arc<dyn SuspensionProvider>>,
}

impl ProviderSet {
    /// Build providers in `settings.priority` order. Tushare is skipped
    /// (with a warning) when no token is configured.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let policy = HttpPolicy::from_settings(settings);
        let mut set = ProviderSet::default();

        for kind in &settings.priority {
            let breaker = Arc::new(CircuitBreaker::new(settings.breaker_cooldown()));
            match kind {
                ProviderKind::Tushare => {
                    let Some(token) = settings.tushare.token.clone().filter(|t| !t.is_empty())
                    else {
                        warn!("tushare listed in providers.priority but no token configured; skipping");
                        continue;
                    };
                    let tushare = Arc::new(TushareProvider::new(
                        token,
                        settings.tushare.endpoint.clone(),
                        policy.clone(),
                        breaker,
                    )?);
                    set.bars.push(tushare.clone());
                    set.calendars.push(tushare.clone());
                    if set.suspensions.is_none() {
                        set.suspensions = Some(tushare as Arc<dyn SuspensionProvider>);
                    }
                }
                ProviderKind::Eastmoney => {
                    let eastmoney = Arc::new(EastmoneyProvider::new(policy.clone(), breaker)?);
                    set.bars.push(eastmoney.clone());
                    set.calendars.push(eastmoney);
                }
                ProviderKind::Yahoo => {
                    set.bars.push(Arc::new(YahooProvider::new(policy.clone(), breaker)?));
                }
            }
        }
        Ok(set)
    }

    pub fn names(&self) -> Vec<String> {
        self.bars.iter().map(|p| p.name().to_string()).collect()
    }
}
