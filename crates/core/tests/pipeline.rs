use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sentibar_core::config::PipelineConfig;
use sentibar_core::domain::{ContentKind, RawPriceBar, RawSocialRecord, Source, Ticker};
use sentibar_core::error::FetchError;
use sentibar_core::fetch::RateLimit;
use sentibar_core::ingest::{MarketSource, PageQuery, SocialPage, SocialSource, SubredditMap};
use sentibar_core::pipeline::{PipelineOrchestrator, RunStatus, TickerState};
use sentibar_core::storage::{IncrementalStore, MemoryStore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct FakeSocial {
    posts: HashMap<Ticker, Vec<RawSocialRecord>>,
    calls: Mutex<Vec<Instant>>,
}

#[async_trait::async_trait]
impl SocialSource for FakeSocial {
    fn source_name(&self) -> &'static str {
        "social"
    }

    /// Oldest first, `page_size` per page; the token is the offset of the next page.
    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<SocialPage, FetchError> {
        self.calls.lock().unwrap().push(Instant::now());
        let mut matching: Vec<RawSocialRecord> = self
            .posts
            .get(query.ticker)
            .map(|posts| {
                posts
                    .iter()
                    .filter(|p| p.created_at >= query.since && p.created_at <= query.until)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by_key(|p| p.created_at);

        let offset: usize = query.page_token.map_or(0, |t| t.parse().unwrap());
        let end = (offset + query.page_size as usize).min(matching.len());
        let items = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        Ok(SocialPage {
            items,
            next_token: (end < matching.len()).then(|| end.to_string()),
        })
    }
}

#[derive(Default)]
struct FakeMarket {
    bars: HashMap<Ticker, Vec<RawPriceBar>>,
    unknown: HashSet<Ticker>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl MarketSource for FakeMarket {
    fn source_name(&self) -> &'static str {
        "market"
    }

    async fn fetch_bars(
        &self,
        ticker: &Ticker,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawPriceBar>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unknown.contains(ticker) {
            return Err(FetchError::permanent("market", format!("unknown symbol {ticker}")));
        }
        Ok(self
            .bars
            .get(ticker)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.date >= start && b.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn t(sym: &str) -> Ticker {
    Ticker::new(sym).unwrap()
}

fn d(m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, day).unwrap()
}

fn utc(day: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, h, 0, 0).unwrap()
}

fn post(ticker: &Ticker, id: &str, at: DateTime<Utc>, body: &str, upvotes: i64) -> RawSocialRecord {
    RawSocialRecord {
        ticker: ticker.clone(),
        external_id: id.to_string(),
        kind: ContentKind::Submission,
        subreddit: "stocks".to_string(),
        author_id: "someone".to_string(),
        created_at: at,
        title: None,
        body: format!("{ticker} {body}"),
        upvotes,
    }
}

fn bar(ticker: &Ticker, date: NaiveDate, open: f64, close: f64, volume: i64) -> RawPriceBar {
    RawPriceBar {
        ticker: ticker.clone(),
        date,
        open,
        high: open.max(close) + 1.0,
        low: open.min(close) - 1.0,
        close,
        volume,
    }
}

fn config(tickers: &[Ticker]) -> PipelineConfig {
    let mut cfg = PipelineConfig {
        tickers: tickers.to_vec(),
        subreddits: SubredditMap {
            default: vec!["stocks".to_string()],
            ..SubredditMap::default()
        },
        lookback_days: 14,
        ..PipelineConfig::default()
    };
    cfg.social.include_comments = false;
    cfg.retry.jitter = 0.0;
    cfg
}

fn keyword_scorer(text: &str) -> f64 {
    if text.contains("bullish") {
        0.8
    } else if text.contains("bearish") {
        -0.4
    } else {
        0.0
    }
}

fn orchestrator(
    cfg: &PipelineConfig,
    social: Arc<FakeSocial>,
    market: Arc<FakeMarket>,
    store: Arc<MemoryStore>,
) -> Arc<PipelineOrchestrator> {
    Arc::new(
        PipelineOrchestrator::from_config(cfg, social, market, Arc::new(keyword_scorer), store)
            .unwrap(),
    )
}

// 2024-01-09 00:00 UTC is 19:00 on Monday 2024-01-08 in New York: Monday's session is closed.
fn monday_evening() -> DateTime<Utc> {
    utc(9, 0)
}

#[tokio::test(start_paused = true)]
async fn weekend_chatter_lands_on_monday() {
    let aapl = t("AAPL");
    let social = Arc::new(FakeSocial {
        posts: HashMap::from([(
            aapl.clone(),
            vec![
                post(&aapl, "s1", utc(6, 10), "bullish", 10),
                post(&aapl, "s2", utc(7, 9), "bearish", 10),
            ],
        )]),
        ..FakeSocial::default()
    });
    let market = Arc::new(FakeMarket {
        bars: HashMap::from([(aapl.clone(), vec![bar(&aapl, d(1, 8), 100.0, 102.0, 1000)])]),
        ..FakeMarket::default()
    });
    let store = Arc::new(MemoryStore::new());
    let cfg = config(&[aapl.clone()]);

    let summary = orchestrator(&cfg, social, market, store.clone())
        .run_at(&cfg.tickers, monday_evening())
        .await;

    assert_eq!(summary.status(), RunStatus::Success);
    let rows = store.rows_for(&aapl).await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.date, d(1, 8));
    assert_eq!(row.price_open, Some(100.0));
    assert_eq!(row.price_close, Some(102.0));
    assert_eq!(row.price_volume, Some(1000));
    assert_eq!(row.sentiment_count, Some(2));
    assert!((row.sentiment_mean.unwrap() - 0.2).abs() < 1e-9);
    // Equal upvotes, so the weighted mean matches.
    assert!((row.sentiment_weighted_mean.unwrap() - 0.2).abs() < 1e-9);

    let day_end = Utc.with_ymd_and_hms(2024, 1, 9, 4, 59, 59).unwrap();
    for source in Source::ALL {
        assert_eq!(store.get_cursor(&aapl, source).await.unwrap(), Some(day_end));
    }
}

#[tokio::test(start_paused = true)]
async fn bars_without_chatter_still_get_rows() {
    let aapl = t("AAPL");
    let market = Arc::new(FakeMarket {
        bars: HashMap::from([(
            aapl.clone(),
            vec![
                bar(&aapl, d(1, 4), 10.0, 11.0, 5),
                bar(&aapl, d(1, 5), 11.0, 12.0, 6),
                bar(&aapl, d(1, 8), 12.0, 13.0, 7),
            ],
        )]),
        ..FakeMarket::default()
    });
    let store = Arc::new(MemoryStore::new());
    let cfg = config(&[aapl.clone()]);

    let summary = orchestrator(&cfg, Arc::new(FakeSocial::default()), market, store.clone())
        .run_at(&cfg.tickers, monday_evening())
        .await;

    assert_eq!(summary.outcome(&aapl).unwrap().rows_written, 3);
    let rows = store.rows_for(&aapl).await;
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.sentiment_count.is_none() && r.sentiment_mean.is_none()));
}

#[tokio::test(start_paused = true)]
async fn one_failing_ticker_does_not_block_the_rest() {
    let (a, b, c) = (t("AAA"), t("BBB"), t("CCC"));
    let mut bars = HashMap::new();
    for tk in [&a, &b, &c] {
        bars.insert(tk.clone(), vec![bar(tk, d(1, 8), 1.0, 2.0, 10)]);
    }
    let market = Arc::new(FakeMarket {
        bars,
        unknown: HashSet::from([b.clone()]),
        ..FakeMarket::default()
    });
    let store = Arc::new(MemoryStore::new());
    let cfg = config(&[a.clone(), b.clone(), c.clone()]);

    let summary = orchestrator(&cfg, Arc::new(FakeSocial::default()), market.clone(), store.clone())
        .run_at(&cfg.tickers, monday_evening())
        .await;

    assert_eq!(summary.status(), RunStatus::Partial);
    assert_eq!(summary.outcomes.len(), 3);
    assert_eq!(summary.outcome(&a).unwrap().final_state, TickerState::Done);
    assert_eq!(summary.outcome(&c).unwrap().final_state, TickerState::Done);

    let failed = summary.outcome(&b).unwrap();
    assert_eq!(failed.final_state, TickerState::Failed);
    assert_eq!(failed.failed_in, Some(TickerState::FetchingMarket));
    assert!(failed.error.as_deref().unwrap().contains("unknown symbol"));

    assert_eq!(store.rows_for(&a).await.len(), 1);
    assert_eq!(store.rows_for(&c).await.len(), 1);
    assert!(store.rows_for(&b).await.is_empty());
    assert_eq!(store.get_cursor(&b, Source::Market).await.unwrap(), None);
    // Permanent errors are not retried.
    assert_eq!(market.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_persist_keeps_pre_run_cursor() {
    let aapl = t("AAPL");
    let market = Arc::new(FakeMarket {
        bars: HashMap::from([(
            aapl.clone(),
            vec![
                bar(&aapl, d(1, 8), 100.0, 102.0, 1000),
                bar(&aapl, d(1, 9), 102.0, 101.0, 900),
            ],
        )]),
        ..FakeMarket::default()
    });
    let store = Arc::new(MemoryStore::new());
    let cfg = config(&[aapl.clone()]);
    let orch = orchestrator(&cfg, Arc::new(FakeSocial::default()), market, store.clone());

    orch.run_at(&cfg.tickers, monday_evening()).await;
    let before = store.get_cursor(&aapl, Source::Market).await.unwrap();
    assert!(before.is_some());

    store.fail_upserts_for(aapl.clone()).await;
    // Tuesday evening: the 2024-01-09 bar is now due.
    let tuesday_evening = utc(10, 0);
    let summary = orch.run_at(&cfg.tickers, tuesday_evening).await;
    let outcome = summary.outcome(&aapl).unwrap();
    assert_eq!(outcome.final_state, TickerState::Failed);
    for source in Source::ALL {
        assert_eq!(store.get_cursor(&aapl, source).await.unwrap(), before);
    }
    assert!(store.row(&aapl, d(1, 9)).await.is_none());

    // The same window is picked up again once storage recovers.
    store.clear_failures().await;
    let summary = orch.run_at(&cfg.tickers, tuesday_evening).await;
    assert_eq!(summary.outcome(&aapl).unwrap().rows_written, 1);
    assert!(store.row(&aapl, d(1, 9)).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn reruns_are_incremental_and_idempotent() {
    let aapl = t("AAPL");
    let market = Arc::new(FakeMarket {
        bars: HashMap::from([(aapl.clone(), vec![bar(&aapl, d(1, 8), 100.0, 102.0, 1000)])]),
        ..FakeMarket::default()
    });
    let social = Arc::new(FakeSocial {
        posts: HashMap::from([(aapl.clone(), vec![post(&aapl, "s1", utc(6, 10), "bullish", 3)])]),
        ..FakeSocial::default()
    });
    let store = Arc::new(MemoryStore::new());
    let cfg = config(&[aapl.clone()]);
    let orch = orchestrator(&cfg, social, market.clone(), store.clone());

    let first = orch.run_at(&cfg.tickers, monday_evening()).await;
    assert_eq!(first.outcome(&aapl).unwrap().rows_written, 1);
    let snapshot = store.rows().await;

    // Same clock: the window is empty and nothing is fetched.
    let second = orch.run_at(&cfg.tickers, monday_evening()).await;
    assert_eq!(second.outcome(&aapl).unwrap().final_state, TickerState::Done);
    assert_eq!(second.outcome(&aapl).unwrap().rows_written, 0);
    assert_eq!(market.calls.load(Ordering::SeqCst), 1);

    // Re-applying the stored rows changes nothing.
    assert_eq!(store.upsert(&snapshot).await.unwrap(), 0);
    assert_eq!(store.rows().await, snapshot);
}

#[tokio::test(start_paused = true)]
async fn deadline_fails_in_flight_and_skips_the_rest() {
    let (a, b) = (t("AAA"), t("BBB"));
    let mut bars = HashMap::new();
    for tk in [&a, &b] {
        bars.insert(tk.clone(), vec![bar(tk, d(1, 8), 1.0, 2.0, 10)]);
    }
    let market = Arc::new(FakeMarket {
        bars,
        delay: Some(Duration::from_secs(10)),
        ..FakeMarket::default()
    });
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config(&[a.clone(), b.clone()]);
    cfg.concurrency = 1;
    cfg.deadline = Some(Duration::from_secs(5));

    let summary = orchestrator(&cfg, Arc::new(FakeSocial::default()), market, store.clone())
        .run_at(&cfg.tickers, monday_evening())
        .await;

    let states: Vec<TickerState> = summary.outcomes.iter().map(|o| o.final_state).collect();
    assert_eq!(states, vec![TickerState::Failed, TickerState::Skipped]);
    assert!(summary.outcomes[0].error.as_deref().unwrap().contains("deadline"));
    assert_eq!(summary.outcomes[0].failed_in, Some(TickerState::FetchingSocial));
    assert_eq!(summary.status(), RunStatus::Failed);
    assert!(store.rows().await.is_empty());
    assert_eq!(store.get_cursor(&a, Source::Market).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn social_calls_respect_the_shared_ceiling() {
    let tickers: Vec<Ticker> = ["AAA", "BBB", "CCC", "DDD", "EEE", "FFF"].into_iter().map(t).collect();
    let social = Arc::new(FakeSocial::default());
    let mut cfg = config(&tickers);
    cfg.concurrency = tickers.len();
    cfg.social_rate = RateLimit::new(2, Duration::from_secs(10));

    orchestrator(&cfg, social.clone(), Arc::new(FakeMarket::default()), Arc::new(MemoryStore::new()))
        .run_at(&cfg.tickers, monday_evening())
        .await;

    let mut stamps = social.calls.lock().unwrap().clone();
    stamps.sort();
    assert_eq!(stamps.len(), tickers.len());
    for pair in stamps.windows(3) {
        assert!(pair[2] - pair[0] >= Duration::from_secs(10), "{:?}", pair[2] - pair[0]);
    }
}

#[tokio::test(start_paused = true)]
async fn page_cap_holds_back_unfetched_sessions() {
    let aapl = t("AAPL");
    let social = Arc::new(FakeSocial {
        posts: HashMap::from([(
            aapl.clone(),
            vec![
                post(&aapl, "wed", utc(3, 15), "bullish", 1),
                post(&aapl, "thu", utc(4, 15), "bearish", 1),
                post(&aapl, "mon", utc(8, 15), "bullish", 1),
            ],
        )]),
        ..FakeSocial::default()
    });
    let market = Arc::new(FakeMarket {
        bars: HashMap::from([(
            aapl.clone(),
            vec![
                bar(&aapl, d(1, 3), 1.0, 2.0, 10),
                bar(&aapl, d(1, 4), 2.0, 3.0, 10),
                bar(&aapl, d(1, 5), 3.0, 4.0, 10),
                bar(&aapl, d(1, 8), 4.0, 5.0, 10),
            ],
        )]),
        ..FakeMarket::default()
    });
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config(&[aapl.clone()]);
    cfg.social.page_size = 1;
    cfg.social.max_pages = 2;
    let orch = orchestrator(&cfg, social, market, store.clone());

    // Two pages reach Thursday; the Monday post is never fetched.
    let first = orch.run_at(&cfg.tickers, monday_evening()).await;
    let outcome = first.outcome(&aapl).unwrap();
    assert_eq!(outcome.final_state, TickerState::Done);
    assert_eq!(outcome.truncated_at, Some(utc(4, 15)));
    assert_eq!(outcome.rows_written, 1);
    assert_eq!(store.row(&aapl, d(1, 3)).await.unwrap().sentiment_count, Some(1));
    assert!(store.row(&aapl, d(1, 4)).await.is_none());
    let wednesday_end = Utc.with_ymd_and_hms(2024, 1, 4, 4, 59, 59).unwrap();
    for source in Source::ALL {
        assert_eq!(store.get_cursor(&aapl, source).await.unwrap(), Some(wednesday_end));
    }

    // The next run resumes at Thursday and completes the window.
    let second = orch.run_at(&cfg.tickers, monday_evening()).await;
    let outcome = second.outcome(&aapl).unwrap();
    assert_eq!(outcome.truncated_at, None);
    assert_eq!(outcome.rows_written, 3);
    assert_eq!(store.row(&aapl, d(1, 4)).await.unwrap().sentiment_count, Some(1));
    assert_eq!(store.row(&aapl, d(1, 5)).await.unwrap().sentiment_count, None);
    assert_eq!(store.row(&aapl, d(1, 8)).await.unwrap().sentiment_count, Some(1));
    let monday_end = Utc.with_ymd_and_hms(2024, 1, 9, 4, 59, 59).unwrap();
    for source in Source::ALL {
        assert_eq!(store.get_cursor(&aapl, source).await.unwrap(), Some(monday_end));
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_interrupts_social_pagination() {
    let aapl = t("AAPL");
    let social = Arc::new(FakeSocial {
        posts: HashMap::from([(
            aapl.clone(),
            vec![
                post(&aapl, "a", utc(3, 15), "bullish", 1),
                post(&aapl, "b", utc(4, 15), "bullish", 1),
                post(&aapl, "c", utc(5, 15), "bullish", 1),
            ],
        )]),
        ..FakeSocial::default()
    });
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config(&[aapl.clone()]);
    cfg.social.page_size = 1;
    cfg.social_rate = RateLimit::new(1, Duration::from_secs(60));
    cfg.deadline = Some(Duration::from_secs(1));

    let started = Instant::now();
    let summary = orchestrator(&cfg, social.clone(), Arc::new(FakeMarket::default()), store.clone())
        .run_at(&cfg.tickers, monday_evening())
        .await;

    // The second page would wait a full minute for the throttle.
    assert!(started.elapsed() < Duration::from_secs(60), "{:?}", started.elapsed());
    assert_eq!(social.calls.lock().unwrap().len(), 1);
    let outcome = summary.outcome(&aapl).unwrap();
    assert_eq!(outcome.final_state, TickerState::Failed);
    assert_eq!(outcome.failed_in, Some(TickerState::FetchingSocial));
    assert!(outcome.error.as_deref().unwrap().contains("deadline"));
    assert!(store.rows().await.is_empty());
    assert_eq!(store.get_cursor(&aapl, Source::Social).await.unwrap(), None);
}
