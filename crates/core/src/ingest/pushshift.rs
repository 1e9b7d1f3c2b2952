use crate::config::Settings;
use crate::domain::{ContentKind, RawSocialRecord, Ticker};
use crate::error::FetchError;
use crate::fetch::http::send_json;
use crate::ingest::social::{PageQuery, SocialPage, SocialSource};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use std::time::Duration;

const SOURCE_NAME: &str = "social";
const DELETED_AUTHOR: &str = "[deleted]";

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp"];
const IMAGE_HOSTS: &[&str] = &["imgur.com", "i.redd.it", "i.imgur.com", "ibb.co", "v.redd.it"];

/// Pushshift-compatible search API (`/submission/` and `/comment/`).
///
/// Pages are oldest first; the continuation token is the `created_utc` of the newest item on
/// the page and is sent back as `after` (minus one second so items sharing that second are
/// not skipped; the pager dedups the overlap).
#[derive(Debug, Clone)]
pub struct PushshiftSource {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    filter_media: bool,
}

impl PushshiftSource {
    pub fn from_settings(settings: &Settings, filter_media: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .user_agent(settings.user_agent.as_str())
            .build()
            .context("failed to build social source http client")?;

        Ok(Self {
            http,
            base_url: settings.social_base_url.clone(),
            api_token: settings.social_api_token.clone(),
            filter_media,
        })
    }

    fn url(&self, kind: ContentKind) -> String {
        format!("{}/{}/", self.base_url.trim_end_matches('/'), kind.endpoint())
    }

    fn headers(&self) -> Result<HeaderMap, FetchError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.api_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| FetchError::permanent(SOURCE_NAME, format!("bad api token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl SocialSource for PushshiftSource {
    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<SocialPage, FetchError> {
        let after = match query.page_token {
            Some(tok) => tok
                .parse::<i64>()
                .map_err(|e| FetchError::permanent(SOURCE_NAME, format!("bad page token {tok:?}: {e}")))?
                .saturating_sub(1),
            None => query.since.timestamp() - 1,
        };

        let params = [
            ("subreddit", query.subreddit.to_string()),
            ("q", query.ticker.to_string()),
            ("after", after.to_string()),
            ("before", (query.until.timestamp() + 1).to_string()),
            ("size", query.page_size.to_string()),
            ("sort", "asc".to_string()),
            ("sort_type", "created_utc".to_string()),
        ];

        let req = self
            .http
            .get(self.url(query.kind))
            .headers(self.headers()?)
            .query(&params);
        let resp: PushshiftResponse = send_json(SOURCE_NAME, req).await?;

        Ok(page_from_response(
            resp,
            query.ticker,
            query.subreddit,
            query.kind,
            query.page_size,
            self.filter_media,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PushshiftResponse {
    #[serde(default)]
    data: Vec<PushshiftItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct PushshiftItem {
    id: String,
    #[serde(default)]
    author: Option<String>,
    created_utc: f64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    selftext: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    score: Option<i64>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    is_video: bool,
    #[serde(default)]
    is_gallery: bool,
}

fn page_from_response(
    resp: PushshiftResponse,
    ticker: &Ticker,
    subreddit: &str,
    kind: ContentKind,
    page_size: u32,
    filter_media: bool,
) -> SocialPage {
    let full_page = resp.data.len() >= page_size as usize;
    let newest = resp
        .data
        .iter()
        .map(|item| item.created_utc.floor() as i64)
        .max();

    let items = resp
        .data
        .into_iter()
        .filter(|item| !(filter_media && kind == ContentKind::Submission && is_media_post(item)))
        .filter_map(|item| into_record(item, ticker, subreddit, kind))
        .collect();

    SocialPage {
        items,
        next_token: if full_page {
            newest.map(|ts| ts.to_string())
        } else {
            None
        },
    }
}

fn into_record(
    item: PushshiftItem,
    ticker: &Ticker,
    subreddit: &str,
    kind: ContentKind,
) -> Option<RawSocialRecord> {
    let created_at: DateTime<Utc> = Utc.timestamp_opt(item.created_utc.floor() as i64, 0).single()?;
    let prefix = match kind {
        ContentKind::Submission => "t3",
        ContentKind::Comment => "t1",
    };
    let body = match kind {
        ContentKind::Submission => item.selftext,
        ContentKind::Comment => item.body,
    }
    .filter(|b| !is_removed(b))
    .unwrap_or_default();

    Some(RawSocialRecord {
        ticker: ticker.clone(),
        external_id: format!("{prefix}_{}", item.id),
        kind,
        subreddit: subreddit.to_string(),
        author_id: item
            .author
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| DELETED_AUTHOR.to_string()),
        created_at,
        title: item.title,
        body,
        upvotes: item.score.unwrap_or(0),
    })
}

fn is_removed(text: &str) -> bool {
    matches!(text.trim(), "[removed]" | "[deleted]")
}

fn is_media_post(item: &PushshiftItem) -> bool {
    if item.is_video || item.is_gallery {
        return true;
    }
    let Some(url) = item.url.as_deref() else {
        return false;
    };
    let url = url.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| url.ends_with(ext))
        || IMAGE_HOSTS.iter().any(|host| url.contains(host))
}
