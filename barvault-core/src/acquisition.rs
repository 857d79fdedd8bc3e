//! Ordered failover across daily-bar providers.
//!
//! Providers are tried in priority order until one returns rows. Every
//! failure along the way is kept, so a caller sees either the data together
//! with the failures that preceded it, or the whole failure chain.

use crate::domain::{dedupe_by_date, drop_defective, AdjustMode, DailyBar, Instrument};
use crate::provider::{DailyBarProvider, ProviderError};
use chrono::NaiveDate;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// One provider failure in a failover chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: ProviderError,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.provider, self.error.kind(), self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AcquisitionError {
    #[error("all providers failed for {instrument}: {}", render_chain(.failures))]
    Exhausted {
        instrument: String,
        failures: Vec<ProviderFailure>,
    },
}

impl AcquisitionError {
    pub fn failures(&self) -> &[ProviderFailure] {
        match self {
            AcquisitionError::Exhausted { failures, .. } => failures,
        }
    }
}

fn render_chain(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no providers configured".into();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Rows from the first provider that produced any.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub bars: Vec<DailyBar>,
    pub provider: String,
    pub duplicates_dropped: usize,
    /// Rows refused for a missing or inconsistent price.
    pub invalid_dropped: usize,
    /// Providers that failed before this one succeeded.
    pub failures: Vec<ProviderFailure>,
}

/// Where a first full-history fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingDate {
    /// Reported upstream.
    Known(NaiveDate),
    /// Nobody knew; the configured history origin.
    Origin(NaiveDate),
}

impl ListingDate {
    pub fn date(self) -> NaiveDate {
        match self {
            ListingDate::Known(d) | ListingDate::Origin(d) => d,
        }
    }
}

pub struct Orchestrator {
    providers: Vec<Arc<dyn DailyBarProvider>>,
    history_origin: NaiveDate,
}

impl Orchestrator {
    pub fn new(providers: Vec<Arc<dyn DailyBarProvider>>, history_origin: NaiveDate) -> Self {
        Self {
            providers,
            history_origin,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn fetch_range(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
        adj: AdjustMode,
    ) -> Result<Acquired, AcquisitionError> {
        let mut failures = Vec::new();

        for provider in &self.providers {
            let name = provider.name().to_string();
            if !provider.is_available() {
                debug!(provider = %name, "circuit open, skipping");
                failures.push(ProviderFailure {
                    provider: name,
                    error: ProviderError::RateLimited { retry_after_secs: 0 },
                });
                continue;
            }

            let mut bars = match provider.fetch_range(instrument, start, end, adj) {
                Ok(bars) => bars,
                Err(e @ ProviderError::MalformedResult(_)) => {
                    error!(%instrument, provider = %name, error = %e, "malformed provider response, failing over");
                    failures.push(ProviderFailure { provider: name, error: e });
                    continue;
                }
                Err(e) => {
                    warn!(%instrument, provider = %name, kind = e.kind(), error = %e, "provider failed, failing over");
                    failures.push(ProviderFailure { provider: name, error: e });
                    continue;
                }
            };

            bars.sort_by_key(|b| b.date);
            bars.retain(|b| start <= b.date && b.date <= end);
            if bars.is_empty() {
                warn!(%instrument, provider = %name, "no rows in requested window, failing over");
                failures.push(ProviderFailure {
                    provider: name,
                    error: ProviderError::EmptyResult,
                });
                continue;
            }

            let (invalid_dropped, defect) = drop_defective(&mut bars);
            if bars.is_empty() {
                error!(%instrument, provider = %name, invalid_dropped, ?defect, "every row unusable, failing over");
                failures.push(ProviderFailure {
                    provider: name,
                    error: ProviderError::MalformedResult(format!("all {invalid_dropped} rows unusable")),
                });
                continue;
            }
            if invalid_dropped > 0 {
                warn!(%instrument, provider = %name, invalid_dropped, ?defect, "dropped unusable rows from provider result");
            }

            let duplicates_dropped = dedupe_by_date(&mut bars);
            if duplicates_dropped > 0 {
                warn!(%instrument, provider = %name, duplicates_dropped, "dropped duplicate dates from provider result");
            }

            info!(%instrument, provider = %name, rows = bars.len(), %start, %end, "fetched bars");
            return Ok(Acquired {
                bars,
                provider: name,
                duplicates_dropped,
                invalid_dropped,
                failures,
            });
        }

        Err(AcquisitionError::Exhausted {
            instrument: instrument.to_string(),
            failures,
        })
    }

    /// First listing date any provider knows, else the configured origin.
    pub fn listing_date(&self, instrument: &Instrument) -> ListingDate {
        for provider in self.providers.iter().filter(|p| p.is_available()) {
            match provider.listing_date(instrument) {
                Ok(Some(date)) => return ListingDate::Known(date),
                Ok(None) => {}
                Err(e) => {
                    debug!(%instrument, provider = provider.name(), error = %e, "listing date lookup failed");
                }
            }
        }
        ListingDate::Origin(self.history_origin)
    }
}
