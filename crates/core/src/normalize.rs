use crate::domain::{NormalizedSentimentEvent, RawPriceBar, RawSocialRecord, Ticker};
use crate::error::ValidationError;
use crate::sentiment::SentimentScorer;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// How upvotes turn into an aggregation weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightScheme {
    /// Every event weighs 1.
    Uniform,
    /// `max(upvotes, 0)`.
    Linear,
    /// `1 + ln(1 + max(upvotes, 0))`.
    #[default]
    Log,
}

impl WeightScheme {
    pub fn weight(self, upvotes: i64) -> f64 {
        let up = upvotes.max(0) as f64;
        match self {
            WeightScheme::Uniform => 1.0,
            WeightScheme::Linear => up,
            WeightScheme::Log => 1.0 + up.ln_1p(),
        }
    }
}

impl fmt::Display for WeightScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WeightScheme::Uniform => "uniform",
            WeightScheme::Linear => "linear",
            WeightScheme::Log => "log",
        })
    }
}

impl FromStr for WeightScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uniform" => Ok(WeightScheme::Uniform),
            "linear" => Ok(WeightScheme::Linear),
            "log" => Ok(WeightScheme::Log),
            other => Err(format!("unknown weight scheme: {other}")),
        }
    }
}

/// Pure mapping from raw upstream records to the aligned schema. No I/O.
#[derive(Clone)]
pub struct RecordNormalizer {
    scorer: Arc<dyn SentimentScorer>,
    weights: WeightScheme,
}

impl RecordNormalizer {
    pub fn new(scorer: Arc<dyn SentimentScorer>, weights: WeightScheme) -> Self {
        Self { scorer, weights }
    }

    pub fn normalize_social(
        &self,
        raw: &RawSocialRecord,
    ) -> Result<NormalizedSentimentEvent, ValidationError> {
        let text = clean_text(&raw.text());
        if text.is_empty() {
            return Err(ValidationError::new(
                "social",
                &raw.external_id,
                "text",
                "is empty after cleaning",
            ));
        }

        let score = self.scorer.score(&text);
        if !score.is_finite() || !(-1.0..=1.0).contains(&score) {
            return Err(ValidationError::new(
                "social",
                &raw.external_id,
                "score",
                format!("{score} is outside [-1, 1]"),
            ));
        }

        Ok(NormalizedSentimentEvent {
            ticker: raw.ticker.clone(),
            timestamp: raw.created_at,
            score,
            weight: self.weights.weight(raw.upvotes),
        })
    }

    pub fn normalize_price(&self, raw: RawPriceBar) -> Result<RawPriceBar, ValidationError> {
        let key = format!("{}@{}", raw.ticker, raw.date);
        for (field, v) in [
            ("open", raw.open),
            ("high", raw.high),
            ("low", raw.low),
            ("close", raw.close),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(ValidationError::new(
                    "price",
                    &key,
                    field,
                    format!("{v} is not a finite non-negative price"),
                ));
            }
        }
        if raw.high < raw.low {
            return Err(ValidationError::new(
                "price",
                &key,
                "high",
                format!("{} is below low {}", raw.high, raw.low),
            ));
        }
        if raw.volume < 0 {
            return Err(ValidationError::new(
                "price",
                &key,
                "volume",
                format!("{} is negative", raw.volume),
            ));
        }
        Ok(raw)
    }

    /// Scores every record, logging and dropping the ones that fail validation.
    pub fn normalize_social_batch(
        &self,
        raws: &[RawSocialRecord],
    ) -> (Vec<NormalizedSentimentEvent>, usize) {
        let mut out = Vec::with_capacity(raws.len());
        let mut dropped = 0;
        for raw in raws {
            match self.normalize_social(raw) {
                Ok(ev) => out.push(ev),
                Err(err) => {
                    dropped += 1;
                    tracing::warn!(ticker = %raw.ticker, error = %err, "dropping social record");
                }
            }
        }
        (out, dropped)
    }

    pub fn normalize_price_batch(&self, raws: Vec<RawPriceBar>) -> (Vec<RawPriceBar>, usize) {
        let mut out = Vec::with_capacity(raws.len());
        let mut dropped = 0;
        for raw in raws {
            match self.normalize_price(raw) {
                Ok(bar) => out.push(bar),
                Err(err) => {
                    dropped += 1;
                    tracing::warn!(error = %err, "dropping price bar");
                }
            }
        }
        (out, dropped)
    }
}

/// Replaces non-ASCII runs with a space and collapses whitespace.
pub fn clean_text(text: &str) -> String {
    let ascii: String = text
        .chars()
        .map(|c| if c.is_ascii() { c } else { ' ' })
        .collect();
    ascii.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whole-word mention of the symbol: `$aapl` in any case, or the bare upper-case symbol.
///
/// Bare mentions must be upper case so that symbols which are also English words
/// (`ALL`, `NOW`, `KEY`) are not matched in ordinary prose.
pub fn mentions_ticker(text: &str, ticker: &Ticker) -> bool {
    let symbol = ticker.as_str();
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '$' || c == '.' || c == '-'))
        .map(|tok| tok.trim_end_matches(['.', '-']))
        .any(|tok| match tok.strip_prefix('$') {
            Some(rest) => rest.eq_ignore_ascii_case(symbol),
            None => tok == symbol,
        })
}

/// Whole-word, case-insensitive mention of a company name such as `Apple` or `Apple Inc`.
pub fn mentions_name(text: &str, name: &str) -> bool {
    fn words(s: &str) -> Vec<String> {
        s.split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_ascii_lowercase)
            .collect()
    }
    let needle = words(name);
    if needle.is_empty() {
        return false;
    }
    words(text).windows(needle.len()).any(|w| w == needle.as_slice())
}

/// The symbol or any of its configured names.
pub fn mentions_any(text: &str, ticker: &Ticker, aliases: &[String]) -> bool {
    mentions_ticker(text, ticker) || aliases.iter().any(|name| mentions_name(text, name))
}
