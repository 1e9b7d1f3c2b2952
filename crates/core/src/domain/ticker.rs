use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_TICKER_LEN: usize = 12;

/// Exchange symbol, trimmed and upper-cased on construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

impl Ticker {
    pub fn new(raw: &str) -> Result<Self, ValidationError> {
        let symbol = raw.trim().trim_start_matches('$').to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(ValidationError::new("ticker", raw, "symbol", "must be non-empty"));
        }
        if symbol.len() > MAX_TICKER_LEN {
            return Err(ValidationError::new(
                "ticker",
                raw,
                "symbol",
                format!("longer than {MAX_TICKER_LEN} characters"),
            ));
        }
        if !symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(ValidationError::new(
                "ticker",
                raw,
                "symbol",
                "contains characters other than A-Z, 0-9, '.' or '-'",
            ));
        }
        Ok(Self(symbol))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses a comma separated list, dropping blanks and duplicates while keeping order.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, ValidationError> {
        let mut out: Vec<Self> = Vec::new();
        for part in raw.split(',') {
            if part.trim().is_empty() {
                continue;
            }
            let ticker = Self::new(part)?;
            if !out.contains(&ticker) {
                out.push(ticker);
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ticker {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Ticker {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Ticker> for String {
    fn from(value: Ticker) -> Self {
        value.0
    }
}
