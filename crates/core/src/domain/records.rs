use crate::domain::ticker::Ticker;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upstream a cursor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Social,
    Market,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Social, Source::Market];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Social => "social",
            Source::Market => "market",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "social" => Ok(Source::Social),
            "market" => Ok(Source::Market),
            other => Err(format!("unknown cursor source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Submission,
    Comment,
}

impl ContentKind {
    /// Path segment used by Pushshift-compatible search APIs.
    pub fn endpoint(self) -> &'static str {
        match self {
            ContentKind::Submission => "submission",
            ContentKind::Comment => "comment",
        }
    }
}

/// One post or comment as delivered by the social source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSocialRecord {
    pub ticker: Ticker,
    /// Source-native id, the dedup key.
    pub external_id: String,
    pub kind: ContentKind,
    pub subreddit: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub body: String,
    pub upvotes: i64,
}

impl RawSocialRecord {
    pub fn text(&self) -> String {
        match self.title.as_deref() {
            Some(title) if !title.trim().is_empty() => format!("{title}\n{}", self.body),
            _ => self.body.clone(),
        }
    }
}

/// Daily OHLCV bar; `date` is the session day in the market timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPriceBar {
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSentimentEvent {
    pub ticker: Ticker,
    pub timestamp: DateTime<Utc>,
    /// In [-1, 1].
    pub score: f64,
    /// Engagement weight, >= 0.
    pub weight: f64,
}

/// Persisted unit of truth, unique per (ticker, date).
///
/// Sentiment fields are `None` when nobody posted about the ticker for that day, which is
/// different from a neutral mean of `0.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedDailyRecord {
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub price_open: Option<f64>,
    pub price_close: Option<f64>,
    pub price_volume: Option<i64>,
    pub sentiment_mean: Option<f64>,
    pub sentiment_weighted_mean: Option<f64>,
    pub sentiment_count: Option<i32>,
}

impl JoinedDailyRecord {
    pub fn key(&self) -> (Ticker, NaiveDate) {
        (self.ticker.clone(), self.date)
    }

    pub fn has_sentiment(&self) -> bool {
        self.sentiment_count.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionCursor {
    pub ticker: Ticker,
    pub source: Source,
    pub last_success_timestamp: DateTime<Utc>,
}
