//! Shared HTTP retry policy for the concrete providers.
//!
//! Every request carries a bounded timeout and a bounded number of retries
//! with exponential backoff plus jitter. Status handling:
//! - 401/403: entitlement denied, breaker tripped, no retry
//! - 429: rate limited, counted against the breaker, retried
//! - 5xx, connect errors, timeouts: retried, then reported as `Network`
//! - other 4xx: not retried, reported as `MalformedResult`

use super::circuit_breaker::CircuitBreaker;
use super::ProviderError;
use crate::config::ProviderSettings;
use rand::Rng;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Debug, Clone)]
pub struct HttpPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for HttpPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl HttpPolicy {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self {
            timeout: settings.timeout(),
            max_retries: settings.max_retries,
            base_delay: settings.backoff(),
        }
    }

    pub fn client(&self) -> Result<Client, ProviderError> {
        Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    /// plus up to half of `base` of random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
        let jitter_cap = self.base_delay.as_millis() as u64 / 2;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        exp + Duration::from_millis(jitter)
    }

    /// Send the request built by `build`, retrying per the policy.
    pub fn send(
        &self,
        provider: &str,
        breaker: &CircuitBreaker,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, ProviderError> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                std::thread::sleep(self.backoff(attempt));
            }

            if !breaker.is_allowed() {
                return Err(ProviderError::RateLimited {
                    retry_after_secs: breaker.remaining_cooldown().as_secs(),
                });
            }

            match build().send() {
                Ok(resp) => {
                    let status = resp.status();
                    match classify(status) {
                        StatusClass::Success => {
                            breaker.record_success();
                            return Ok(resp);
                        }
                        StatusClass::Denied => {
                            breaker.trip();
                            warn!(
                                provider,
                                %status,
                                "entitlement denied; try a different provider or upgrade entitlement"
                            );
                            return Err(ProviderError::QuotaExhausted(format!(
                                "HTTP {status} from {provider}"
                            )));
                        }
                        StatusClass::RateLimited => {
                            breaker.record_failure();
                            let retry_after = resp
                                .headers()
                                .get("retry-after")
                                .and_then(|v| v.to_str().ok())
                                .and_then(|v| v.parse::<u64>().ok())
                                .unwrap_or(60);
                            debug!(provider, attempt, "rate limited");
                            last_error = Some(ProviderError::RateLimited {
                                retry_after_secs: retry_after,
                            });
                        }
                        StatusClass::Retryable => {
                            breaker.record_failure();
                            debug!(provider, attempt, %status, "server error");
                            last_error = Some(ProviderError::Network(format!(
                                "HTTP {status} from {provider}"
                            )));
                        }
                        StatusClass::Rejected => {
                            return Err(ProviderError::MalformedResult(format!(
                                "HTTP {status} from {provider}"
                            )));
                        }
                    }
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    debug!(provider, attempt, error = %e, "transport error");
                    last_error = Some(ProviderError::Network(e.to_string()));
                }
                Err(e) => return Err(ProviderError::Network(e.to_string())),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::Network("max retries exceeded".into())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    Denied,
    RateLimited,
    Retryable,
    Rejected,
}

fn classify(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        StatusClass::Denied
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        StatusClass::Retryable
    } else {
        StatusClass::Rejected
    }
}
