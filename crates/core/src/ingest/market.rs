use crate::domain::{RawPriceBar, Ticker};
use crate::error::FetchError;
use crate::fetch::RateLimitedFetcher;
use chrono::NaiveDate;
use std::sync::Arc;

/// A single daily-bar request against a market data upstream.
#[async_trait::async_trait]
pub trait MarketSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Bars for trading days in `[start, end]`. An unknown symbol is `Permanent`.
    async fn fetch_bars(
        &self,
        ticker: &Ticker,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawPriceBar>, FetchError>;
}

pub struct MarketDataIngester {
    source: Arc<dyn MarketSource>,
    fetcher: RateLimitedFetcher,
}

impl MarketDataIngester {
    pub fn new(source: Arc<dyn MarketSource>, fetcher: RateLimitedFetcher) -> Self {
        Self { source, fetcher }
    }

    /// Daily bars in `[start, end]`, ascending by date with at most one bar per date.
    ///
    /// Non-trading days simply have no bar. An inverted range yields nothing without a call.
    pub async fn fetch_range(
        &self,
        ticker: &Ticker,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawPriceBar>, FetchError> {
        if start > end {
            return Ok(Vec::new());
        }

        let source: &dyn MarketSource = self.source.as_ref();
        let mut bars = self
            .fetcher
            .fetch("daily bars", move || source.fetch_bars(ticker, start, end))
            .await?;

        let received = bars.len();
        bars.retain(|b| b.date >= start && b.date <= end && b.ticker == *ticker);
        bars.sort_by_key(|b| b.date);
        // Upstreams occasionally repeat the live session; keep the last copy of a date.
        bars.reverse();
        bars.dedup_by_key(|b| b.date);
        bars.reverse();

        tracing::debug!(
            ticker = %ticker,
            %start,
            %end,
            received,
            kept = bars.len(),
            "daily bars"
        );
        Ok(bars)
    }
}
