use crate::domain::{ContentKind, RawSocialRecord, Ticker};
use crate::error::FetchError;
use crate::fetch::RateLimitedFetcher;
use crate::normalize::{clean_text, mentions_any};
use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One page request against a paginated social search API.
#[derive(Debug, Clone)]
pub struct PageQuery<'a> {
    pub ticker: &'a Ticker,
    pub subreddit: &'a str,
    pub kind: ContentKind,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// Source-native continuation token, `None` for the first page.
    pub page_token: Option<&'a str>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SocialPage {
    pub items: Vec<RawSocialRecord>,
    /// `None` when this was the last page.
    pub next_token: Option<String>,
}

/// A single call to the social upstream. Retrying and throttling are the caller's job.
///
/// Pages run oldest first, so a lane that stops early has still covered its window up to the
/// newest item it returned.
#[async_trait::async_trait]
pub trait SocialSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<SocialPage, FetchError>;
}

/// Which subreddits are searched for a ticker.
#[derive(Debug, Clone, Default)]
pub struct SubredditMap {
    pub overrides: HashMap<Ticker, Vec<String>>,
    pub default: Vec<String>,
}

impl SubredditMap {
    pub fn resolve(&self, ticker: &Ticker) -> &[String] {
        self.overrides
            .get(ticker)
            .map(Vec::as_slice)
            .unwrap_or(self.default.as_slice())
    }

    /// Parses `AAPL=apple+stocks;TSLA=teslainvestorsclub`.
    pub fn parse_overrides(raw: &str) -> Result<HashMap<Ticker, Vec<String>>, String> {
        let mut out = parse_ticker_lists(raw)?;
        for subs in out.values_mut() {
            for sub in subs.iter_mut() {
                *sub = sub.trim_start_matches("r/").to_string();
            }
            subs.retain(|s| !s.is_empty());
        }
        Ok(out)
    }
}

/// Parses `TICKER=a+b;TICKER=c` into per-ticker lists.
pub fn parse_ticker_lists(raw: &str) -> Result<HashMap<Ticker, Vec<String>>, String> {
    let mut out = HashMap::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (ticker, items) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected TICKER=a+b, got {entry:?}"))?;
        let ticker = Ticker::new(ticker).map_err(|e| e.to_string())?;
        let items: Vec<String> = items
            .split('+')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        out.insert(ticker, items);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct SocialOptions {
    pub include_comments: bool,
    pub require_mention: bool,
    pub page_size: u32,
    /// Hard cap per (subreddit, kind) lane and call.
    pub max_pages: u32,
    /// Company names that count as a mention of the ticker.
    pub aliases: HashMap<Ticker, Vec<String>>,
}

impl SocialOptions {
    pub fn aliases_for(&self, ticker: &Ticker) -> &[String] {
        self.aliases.get(ticker).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Default for SocialOptions {
    fn default() -> Self {
        Self {
            include_comments: true,
            require_mention: true,
            page_size: 100,
            max_pages: 50,
            aliases: HashMap::new(),
        }
    }
}

pub struct SocialContentIngester {
    source: Arc<dyn SocialSource>,
    fetcher: RateLimitedFetcher,
    subreddits: SubredditMap,
    options: SocialOptions,
}

impl SocialContentIngester {
    pub fn new(
        source: Arc<dyn SocialSource>,
        fetcher: RateLimitedFetcher,
        subreddits: SubredditMap,
        options: SocialOptions,
    ) -> Self {
        Self {
            source,
            fetcher,
            subreddits,
            options,
        }
    }

    /// Lazy, page-at-a-time sequence of the ticker's records in `[since, until]`.
    ///
    /// Fails with `Permanent` if no subreddit is configured for the ticker. Upstream errors
    /// surface from [`SocialPager::next_page`].
    pub fn fetch_window(
        &self,
        ticker: &Ticker,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<SocialPager<'_>, FetchError> {
        let subs = self.subreddits.resolve(ticker);
        if subs.is_empty() {
            return Err(FetchError::permanent(
                self.source.source_name(),
                format!("no subreddit configured for {ticker}"),
            ));
        }

        let mut kinds = vec![ContentKind::Submission];
        if self.options.include_comments {
            kinds.push(ContentKind::Comment);
        }

        let lanes = subs
            .iter()
            .flat_map(|sub| {
                kinds.iter().map(move |kind| Lane {
                    subreddit: sub.clone(),
                    kind: *kind,
                    token: None,
                    pages: 0,
                    newest: None,
                    done: false,
                    truncated: false,
                })
            })
            .collect();

        Ok(SocialPager {
            ingester: self,
            ticker: ticker.clone(),
            since,
            until,
            lanes,
            current: 0,
            seen: HashSet::new(),
            yielded: 0,
        })
    }
}

#[derive(Debug)]
struct Lane {
    subreddit: String,
    kind: ContentKind,
    token: Option<String>,
    pages: u32,
    newest: Option<DateTime<Utc>>,
    done: bool,
    // Stopped with pages left upstream.
    truncated: bool,
}

/// In-flight pagination state of one `fetch_window` call.
///
/// A failed page leaves the lane's token untouched, so calling `next_page` again resumes from
/// the last page that was consumed. Items already yielded are never yielded again.
pub struct SocialPager<'a> {
    ingester: &'a SocialContentIngester,
    ticker: Ticker,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    lanes: Vec<Lane>,
    current: usize,
    seen: HashSet<String>,
    yielded: usize,
}

impl<'a> SocialPager<'a> {
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Set when a lane stopped before its last page: the window is only complete up to this
    /// instant. Items after it may be missing.
    pub fn truncated_at(&self) -> Option<DateTime<Utc>> {
        self.lanes
            .iter()
            .filter(|lane| lane.truncated)
            .map(|lane| lane.newest.unwrap_or(self.since))
            .min()
    }

    /// Next non-empty batch of unseen records, or `None` once every lane is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawSocialRecord>>, FetchError> {
        let ing = self.ingester;
        loop {
            let Some(lane) = self.lanes.get(self.current) else {
                return Ok(None);
            };
            if lane.done {
                self.current += 1;
                continue;
            }

            let token = lane.token.clone();
            let subreddit = lane.subreddit.clone();
            let query = PageQuery {
                ticker: &self.ticker,
                subreddit: &subreddit,
                kind: lane.kind,
                since: self.since,
                until: self.until,
                page_token: token.as_deref(),
                page_size: ing.options.page_size,
            };

            let source: &dyn SocialSource = ing.source.as_ref();
            let query_ref = &query;
            let page = ing
                .fetcher
                .fetch("social page", move || source.fetch_page(query_ref))
                .await?;

            let received = page.items.len();
            let mut newest = None;
            let mut fresh = Vec::with_capacity(received);
            for item in page.items {
                if item.created_at < self.since || item.created_at > self.until {
                    continue;
                }
                newest = newest.max(Some(item.created_at));
                if ing.options.require_mention
                    && !mentions_any(
                        &clean_text(&item.text()),
                        &self.ticker,
                        ing.options.aliases_for(&self.ticker),
                    )
                {
                    continue;
                }
                if self.seen.insert(item.external_id.clone()) {
                    fresh.push(item);
                }
            }

            let lane = &mut self.lanes[self.current];
            lane.pages += 1;
            lane.newest = lane.newest.max(newest);
            let more = received > 0 && page.next_token.is_some();
            // More than a page of items inside one token step: the token cannot move past them.
            let stalled = more && page.next_token == lane.token;
            let capped = more && lane.pages >= ing.options.max_pages;
            lane.done = !more || stalled || capped;
            if stalled || capped {
                lane.truncated = true;
                tracing::warn!(
                    ticker = %self.ticker,
                    subreddit = %lane.subreddit,
                    kind = ?lane.kind,
                    pages = lane.pages,
                    stalled,
                    covered_until = ?lane.newest,
                    "social lane stopped early; window truncated"
                );
            }
            lane.token = page.next_token;

            tracing::debug!(
                ticker = %self.ticker,
                subreddit = %lane.subreddit,
                kind = ?lane.kind,
                page = lane.pages,
                received,
                fresh = fresh.len(),
                "social page"
            );

            if !fresh.is_empty() {
                self.yielded += fresh.len();
                return Ok(Some(fresh));
            }
        }
    }

    /// Drains every page. Check [`SocialPager::truncated_at`] afterwards.
    pub async fn collect_all(&mut self) -> Result<Vec<RawSocialRecord>, FetchError> {
        let mut out = Vec::new();
        while let Some(batch) = self.next_page().await? {
            out.extend(batch);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<RawSocialRecord>, FetchError>> + 'a {
        futures::stream::try_unfold(self, |mut pager| async move {
            let batch = pager.next_page().await?;
            Ok::<_, FetchError>(batch.map(|batch| (batch, pager)))
        })
    }
}
