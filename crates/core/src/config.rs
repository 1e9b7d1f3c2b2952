use crate::domain::Ticker;
use crate::fetch::{RateLimit, RetryPolicy};
use crate::ingest::{parse_ticker_lists, SocialOptions, SubredditMap};
use crate::normalize::WeightScheme;
use crate::time::market_calendar::{parse_holidays, MarketCalendar, DEFAULT_MARKET_TZ};
use anyhow::Context;
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SOCIAL_BASE_URL: &str = "https://api.pullpush.io/reddit/search";
const DEFAULT_MARKET_BASE_URL: &str = "https://query1.finance.yahoo.com";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_USER_AGENT: &str = "sentibar/0.1";

const DEFAULT_TICKERS: &str = "AAPL,TSLA,NVDA";
const DEFAULT_SUBREDDITS: &str = "wallstreetbets,stocks";
const DEFAULT_LOOKBACK_DAYS: i64 = 30;
const DEFAULT_WORKER_CONCURRENCY: usize = 4;
const DEFAULT_CLOSE_CUTOFF_HOUR: u32 = 17;
const DEFAULT_UPSERT_BATCH: usize = 200;

/// Endpoints and credentials.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub sentry_dsn: Option<String>,
    pub social_base_url: String,
    pub social_api_token: Option<String>,
    pub market_base_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());
        Self {
            database_url: non_empty("DATABASE_URL"),
            sentry_dsn: non_empty("SENTRY_DSN"),
            social_base_url: non_empty("SOCIAL_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SOCIAL_BASE_URL.to_string()),
            social_api_token: non_empty("SOCIAL_API_TOKEN"),
            market_base_url: non_empty("MARKET_BASE_URL")
                .unwrap_or_else(|| DEFAULT_MARKET_BASE_URL.to_string()),
            http_timeout_secs: parse_or(&lookup, "HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
            user_agent: non_empty("HTTP_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        }
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is required")
    }
}

/// Tuning knobs of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub tickers: Vec<Ticker>,
    pub subreddits: SubredditMap,
    pub social: SocialOptions,
    pub filter_media: bool,
    pub lookback_days: i64,
    pub retry: RetryPolicy,
    pub social_rate: RateLimit,
    pub market_rate: RateLimit,
    pub concurrency: usize,
    pub deadline: Option<Duration>,
    pub weights: WeightScheme,
    pub market_tz: Tz,
    pub close_cutoff_hour: u32,
    pub holidays: Vec<NaiveDate>,
    pub upsert_batch: usize,
}

impl Default for PipelineConfig {
    /// Documented defaults with an empty ticker list.
    fn default() -> Self {
        Self {
            tickers: Vec::new(),
            subreddits: SubredditMap::default(),
            social: SocialOptions::default(),
            filter_media: true,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            retry: RetryPolicy::default(),
            social_rate: RateLimit::per_minute(60),
            market_rate: RateLimit::per_minute(120),
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            deadline: None,
            weights: WeightScheme::default(),
            market_tz: DEFAULT_MARKET_TZ,
            close_cutoff_hour: DEFAULT_CLOSE_CUTOFF_HOUR,
            holidays: Vec::new(),
            upsert_batch: DEFAULT_UPSERT_BATCH,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable values fall back to their defaults with a warning. Ticker symbols, the
    /// subreddit and alias maps and the market zone are the exception: a typo there would
    /// silently change what runs.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let tickers_raw = lookup("TICKERS")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TICKERS.to_string());
        let tickers = Ticker::parse_list(&tickers_raw).context("invalid TICKERS")?;

        let overrides = match lookup("TICKER_SUBREDDITS") {
            Some(raw) => SubredditMap::parse_overrides(&raw)
                .map_err(anyhow::Error::msg)
                .context("invalid TICKER_SUBREDDITS")?,
            None => Default::default(),
        };
        let default_subs = lookup("DEFAULT_SUBREDDITS")
            .unwrap_or_else(|| DEFAULT_SUBREDDITS.to_string())
            .split(',')
            .map(|s| s.trim().trim_start_matches("r/").to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let aliases = match lookup("TICKER_ALIASES") {
            Some(raw) => parse_ticker_lists(&raw)
                .map_err(anyhow::Error::msg)
                .context("invalid TICKER_ALIASES")?,
            None => Default::default(),
        };

        let market_tz = match lookup("MARKET_TZ").filter(|s| !s.trim().is_empty()) {
            Some(raw) => raw
                .trim()
                .parse::<Tz>()
                .map_err(|e| anyhow::anyhow!("invalid MARKET_TZ {raw:?}: {e}"))?,
            None => DEFAULT_MARKET_TZ,
        };

        let d = Self::default();
        let social_defaults = d.social.clone();
        let social = SocialOptions {
            include_comments: parse_or(
                &lookup,
                "SOCIAL_INCLUDE_COMMENTS",
                social_defaults.include_comments,
            ),
            require_mention: parse_or(
                &lookup,
                "SOCIAL_REQUIRE_MENTION",
                social_defaults.require_mention,
            ),
            page_size: parse_or(&lookup, "SOCIAL_PAGE_SIZE", social_defaults.page_size),
            max_pages: parse_or(&lookup, "SOCIAL_MAX_PAGES", social_defaults.max_pages),
            aliases,
        };

        let retry_defaults = d.retry.clone();
        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts),
            base: Duration::from_millis(parse_or(
                &lookup,
                "BACKOFF_BASE_MS",
                retry_defaults.base.as_millis() as u64,
            )),
            multiplier: parse_or(&lookup, "BACKOFF_MULTIPLIER", retry_defaults.multiplier),
            max_backoff: Duration::from_millis(parse_or(
                &lookup,
                "BACKOFF_MAX_MS",
                retry_defaults.max_backoff.as_millis() as u64,
            )),
            jitter: parse_or(&lookup, "BACKOFF_JITTER", retry_defaults.jitter),
        };

        Ok(Self {
            tickers,
            subreddits: SubredditMap {
                overrides,
                default: default_subs,
            },
            social,
            filter_media: parse_or(&lookup, "SOCIAL_FILTER_MEDIA", d.filter_media),
            lookback_days: parse_or(&lookup, "LOOKBACK_DAYS", d.lookback_days),
            retry,
            social_rate: parse_or(&lookup, "SOCIAL_RATE_LIMIT", d.social_rate),
            market_rate: parse_or(&lookup, "MARKET_RATE_LIMIT", d.market_rate),
            concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", d.concurrency),
            deadline: lookup("RUN_DEADLINE_SECS")
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
            weights: parse_or(&lookup, "WEIGHT_SCHEME", d.weights),
            market_tz,
            close_cutoff_hour: parse_or(&lookup, "MARKET_CLOSE_CUTOFF_HOUR", d.close_cutoff_hour),
            holidays: lookup("MARKET_HOLIDAYS")
                .map(|raw| parse_holidays(&raw))
                .unwrap_or_default(),
            upsert_batch: parse_or(&lookup, "UPSERT_BATCH", d.upsert_batch),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.tickers.is_empty(), "TICKERS must name at least one ticker");
        anyhow::ensure!(self.concurrency >= 1, "WORKER_CONCURRENCY must be >= 1");
        anyhow::ensure!(self.retry.max_attempts >= 1, "RETRY_MAX_ATTEMPTS must be >= 1");
        anyhow::ensure!(
            self.retry.multiplier >= 1.0,
            "BACKOFF_MULTIPLIER must be >= 1.0 (got {})",
            self.retry.multiplier
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.retry.jitter),
            "BACKOFF_JITTER must be in [0, 1) (got {})",
            self.retry.jitter
        );
        anyhow::ensure!(self.social_rate.is_valid(), "SOCIAL_RATE_LIMIT must be positive");
        anyhow::ensure!(self.market_rate.is_valid(), "MARKET_RATE_LIMIT must be positive");
        anyhow::ensure!(self.social.page_size >= 1, "SOCIAL_PAGE_SIZE must be >= 1");
        anyhow::ensure!(self.social.max_pages >= 1, "SOCIAL_MAX_PAGES must be >= 1");
        anyhow::ensure!(self.lookback_days >= 1, "LOOKBACK_DAYS must be >= 1");
        anyhow::ensure!(self.upsert_batch >= 1, "UPSERT_BATCH must be >= 1");
        self.calendar().map(|_| ())
    }

    pub fn calendar(&self) -> anyhow::Result<MarketCalendar> {
        MarketCalendar::new(self.market_tz, self.close_cutoff_hour, &self.holidays)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(key).filter(|s| !s.trim().is_empty()) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(key, value = %raw, error = %err, "ignoring invalid config value; using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_documented_values() {
        let cfg = PipelineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(
            cfg.tickers,
            Ticker::parse_list("AAPL,TSLA,NVDA").unwrap()
        );
        assert_eq!(cfg.subreddits.default, vec!["wallstreetbets", "stocks"]);
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.social_rate, RateLimit::per_minute(60));
        assert_eq!(cfg.market_rate, RateLimit::per_minute(120));
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.weights, WeightScheme::Log);
        assert_eq!(cfg.deadline, None);
        assert_eq!(cfg.market_tz, chrono_tz::America::New_York);
        assert!(cfg.social.include_comments && cfg.social.require_mention && cfg.filter_media);
        cfg.validate().unwrap();
    }

    #[test]
    fn reads_overrides() {
        let cfg = PipelineConfig::from_lookup(lookup_from(&[
            ("TICKERS", "msft, $aapl,MSFT"),
            ("TICKER_SUBREDDITS", "AAPL=apple+stocks"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("BACKOFF_JITTER", "0.1"),
            ("SOCIAL_RATE_LIMIT", "30/60"),
            ("WORKER_CONCURRENCY", "8"),
            ("RUN_DEADLINE_SECS", "900"),
            ("WEIGHT_SCHEME", "linear"),
            ("MARKET_HOLIDAYS", "2024-01-15"),
            ("SOCIAL_INCLUDE_COMMENTS", "false"),
        ]))
        .unwrap();

        assert_eq!(cfg.tickers, Ticker::parse_list("MSFT,AAPL").unwrap());
        let aapl = Ticker::new("AAPL").unwrap();
        assert_eq!(cfg.subreddits.resolve(&aapl), ["apple", "stocks"]);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.jitter, 0.1);
        assert_eq!(cfg.social_rate, RateLimit::new(30, Duration::from_secs(60)));
        assert_eq!(cfg.concurrency, 8);
        assert_eq!(cfg.deadline, Some(Duration::from_secs(900)));
        assert_eq!(cfg.weights, WeightScheme::Linear);
        assert_eq!(cfg.holidays.len(), 1);
        assert!(!cfg.social.include_comments);
    }

    #[test]
    fn garbage_falls_back_but_zero_is_rejected() {
        let cfg = PipelineConfig::from_lookup(lookup_from(&[
            ("BACKOFF_BASE_MS", "soon"),
            ("MARKET_RATE_LIMIT", "0/60"),
        ]))
        .unwrap();
        assert_eq!(cfg.retry.base, Duration::from_millis(500));
        assert_eq!(cfg.market_rate, RateLimit::per_minute(120));

        let cfg = PipelineConfig::from_lookup(lookup_from(&[("WORKER_CONCURRENCY", "0")])).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_ticker_list_is_an_error() {
        assert!(PipelineConfig::from_lookup(lookup_from(&[("TICKERS", "AAPL,BRK B")])).is_err());
    }

    #[test]
    fn ticker_aliases_are_strict() {
        let cfg = PipelineConfig::from_lookup(lookup_from(&[(
            "TICKER_ALIASES",
            "AAPL=Apple+Apple Inc;TSLA=Tesla",
        )]))
        .unwrap();
        let aapl = Ticker::new("AAPL").unwrap();
        assert_eq!(cfg.social.aliases_for(&aapl), ["Apple", "Apple Inc"]);
        assert!(cfg.social.aliases_for(&Ticker::new("NVDA").unwrap()).is_empty());

        assert!(PipelineConfig::from_lookup(lookup_from(&[("TICKER_ALIASES", "Apple")])).is_err());
    }

    #[test]
    fn market_zone_is_strict() {
        let cfg = PipelineConfig::from_lookup(lookup_from(&[("MARKET_TZ", "Europe/London")])).unwrap();
        assert_eq!(cfg.market_tz, chrono_tz::Europe::London);
        assert_eq!(cfg.calendar().unwrap().tz(), chrono_tz::Europe::London);

        assert!(PipelineConfig::from_lookup(lookup_from(&[("MARKET_TZ", "Mars/Base")])).is_err());
    }

    #[test]
    fn settings_defaults() {
        let s = Settings::from_lookup(lookup_from(&[("DATABASE_URL", "  ")]));
        assert!(s.require_database_url().is_err());
        assert_eq!(s.market_base_url, DEFAULT_MARKET_BASE_URL);
        assert_eq!(s.http_timeout_secs, 30);
    }
}
