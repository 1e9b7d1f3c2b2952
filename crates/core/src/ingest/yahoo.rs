use crate::config::Settings;
use crate::domain::{RawPriceBar, Ticker};
use crate::error::FetchError;
use crate::fetch::http::send_json;
use crate::ingest::market::MarketSource;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;

const SOURCE_NAME: &str = "market";

/// Yahoo Finance v8 chart endpoint, daily interval.
#[derive(Debug, Clone)]
pub struct YahooChartSource {
    http: reqwest::Client,
    base_url: String,
}

impl YahooChartSource {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .user_agent(settings.user_agent.as_str())
            .build()
            .context("failed to build market source http client")?;

        Ok(Self {
            http,
            base_url: settings.market_base_url.clone(),
        })
    }

    fn url(&self, ticker: &Ticker) -> String {
        format!(
            "{}/v8/finance/chart/{}",
            self.base_url.trim_end_matches('/'),
            ticker.as_str()
        )
    }
}

#[async_trait::async_trait]
impl MarketSource for YahooChartSource {
    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn fetch_bars(
        &self,
        ticker: &Ticker,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawPriceBar>, FetchError> {
        // Pad by a day on both sides: the range is interpreted in UTC, bars in exchange time.
        let period1 = start
            .and_hms_opt(0, 0, 0)
            .map(|t| Utc.from_utc_datetime(&t) - ChronoDuration::days(1))
            .map(|t| t.timestamp())
            .unwrap_or_default();
        let period2 = end
            .and_hms_opt(0, 0, 0)
            .map(|t| Utc.from_utc_datetime(&t) + ChronoDuration::days(2))
            .map(|t| t.timestamp())
            .unwrap_or_default();

        let req = self.http.get(self.url(ticker)).query(&[
            ("period1", period1.to_string()),
            ("period2", period2.to_string()),
            ("interval", "1d".to_string()),
            ("events", "history".to_string()),
        ]);

        let resp: ChartResponse = match send_json(SOURCE_NAME, req).await {
            Ok(resp) => resp,
            Err(FetchError::Permanent { detail, .. }) if detail.contains("404") => {
                return Err(FetchError::permanent(
                    SOURCE_NAME,
                    format!("unknown symbol {ticker}"),
                ));
            }
            Err(err) => return Err(err),
        };

        bars_from_chart(resp, ticker)
    }
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<i64>>,
}

fn bars_from_chart(resp: ChartResponse, ticker: &Ticker) -> Result<Vec<RawPriceBar>, FetchError> {
    if let Some(err) = resp.chart.error {
        return Err(FetchError::permanent(
            SOURCE_NAME,
            format!(
                "{ticker}: {} {}",
                err.code.unwrap_or_default(),
                err.description.unwrap_or_default()
            ),
        ));
    }

    let Some(result) = resp.chart.result.and_then(|r| r.into_iter().next()) else {
        return Err(FetchError::permanent(
            SOURCE_NAME,
            format!("unknown symbol {ticker}"),
        ));
    };

    // No sessions in range.
    let Some(timestamps) = result.timestamp else {
        return Ok(Vec::new());
    };

    let offset = FixedOffset::east_opt(result.meta.gmtoffset.unwrap_or(0))
        .unwrap_or_else(|| Utc.fix());
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, ts) in timestamps.into_iter().enumerate() {
        let fields = (
            quote.open.get(i).copied().flatten(),
            quote.high.get(i).copied().flatten(),
            quote.low.get(i).copied().flatten(),
            quote.close.get(i).copied().flatten(),
        );
        // Halted or not-yet-settled sessions come back as nulls.
        let (Some(open), Some(high), Some(low), Some(close)) = fields else {
            continue;
        };
        let Some(at) = offset.timestamp_opt(ts, 0).single() else {
            continue;
        };
        bars.push(RawPriceBar {
            ticker: ticker.clone(),
            date: at.date_naive(),
            open,
            high,
            low,
            close,
            volume: quote.volume.get(i).copied().flatten().unwrap_or(0),
        });
    }
    Ok(bars)
}
