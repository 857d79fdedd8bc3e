use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Mainland stock exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Exchange {
    /// Shanghai Stock Exchange (`.SH`).
    Sse,
    /// Shenzhen Stock Exchange (`.SZ`).
    Szse,
    /// Beijing Stock Exchange (`.BJ`).
    Bse,
}

impl Exchange {
    /// Exchange code as used by Tushare's `trade_cal` and the blob layout.
    pub fn code(self) -> &'static str {
        match self {
            Exchange::Sse => "SSE",
            Exchange::Szse => "SZSE",
            Exchange::Bse => "BSE",
        }
    }

    /// Instrument suffix (`SH`, `SZ`, `BJ`).
    pub fn suffix(self) -> &'static str {
        match self {
            Exchange::Sse => "SH",
            Exchange::Szse => "SZ",
            Exchange::Bse => "BJ",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Exchange {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SSE" | "SH" => Ok(Exchange::Sse),
            "SZSE" | "SZ" => Ok(Exchange::Szse),
            "BSE" | "BJSE" | "BJ" => Ok(Exchange::Bse),
            _ => Err(InstrumentError::UnknownExchange(s.to_string())),
        }
    }
}

/// A listed equity identified by `{code}.{suffix}`, e.g. `600519.SH`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Instrument {
    code: String,
    exchange: Exchange,
}

impl Instrument {
    /// Parse `600519.SH`. A bare six-digit code is mapped to its exchange by
    /// prefix: `6` Shanghai, `0`/`3` Shenzhen, `4`/`8`/`9` Beijing.
    pub fn parse(s: &str) -> Result<Self, InstrumentError> {
        let s = s.trim();
        let (code, exchange) = match s.split_once('.') {
            Some((code, suffix)) => (code, suffix.parse::<Exchange>()?),
            None => {
                let exchange = match s.chars().next() {
                    Some('6') => Exchange::Sse,
                    Some('0') | Some('3') => Exchange::Szse,
                    Some('4') | Some('8') | Some('9') => Exchange::Bse,
                    _ => return Err(InstrumentError::Malformed(s.to_string())),
                };
                (s, exchange)
            }
        };

        if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(InstrumentError::Malformed(s.to_string()));
        }

        Ok(Self {
            code: code.to_string(),
            exchange,
        })
    }

    /// Six-digit security code without suffix.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// Canonical `{code}.{suffix}` form.
    pub fn ts_code(&self) -> String {
        format!("{}.{}", self.code, self.exchange.suffix())
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.code, self.exchange.suffix())
    }
}

impl FromStr for Instrument {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Instrument {
    type Error = InstrumentError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Instrument> for String {
    fn from(i: Instrument) -> Self {
        i.ts_code()
    }
}

/// Price-adjustment convention. Part of every bar cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustMode {
    /// Raw exchange prices.
    None,
    /// Forward-adjusted: latest prices are real, history is scaled.
    Qfq,
    /// Backward-adjusted: listing-day prices are real, later prices are scaled.
    Hfq,
}

impl AdjustMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustMode::None => "none",
            AdjustMode::Qfq => "qfq",
            AdjustMode::Hfq => "hfq",
        }
    }
}

impl fmt::Display for AdjustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdjustMode {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "raw" => Ok(AdjustMode::None),
            "qfq" | "forward" => Ok(AdjustMode::Qfq),
            "hfq" | "backward" => Ok(AdjustMode::Hfq),
            other => Err(InstrumentError::UnknownAdjustMode(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("malformed instrument code '{0}' (expected e.g. 600519.SH)")]
    Malformed(String),

    #[error("unknown exchange '{0}'")]
    UnknownExchange(String),

    #[error("unknown adjustment mode '{0}' (expected none, qfq or hfq)")]
    UnknownAdjustMode(String),
}
