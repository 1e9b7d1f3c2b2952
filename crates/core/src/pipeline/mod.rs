pub mod state;
pub mod summary;

use crate::align::TemporalAligner;
use crate::config::PipelineConfig;
use crate::domain::{Source, Ticker};
use crate::error::{FetchError, PipelineError, StorageError};
use crate::fetch::{RateLimitedFetcher, Throttle};
use crate::ingest::{MarketDataIngester, MarketSource, SocialContentIngester, SocialSource};
use crate::normalize::RecordNormalizer;
use crate::sentiment::SentimentScorer;
use crate::storage::IncrementalStore;
use crate::time::MarketCalendar;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

pub use state::TickerState;
pub use summary::{RunStatus, RunSummary, TickerOutcome};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub concurrency: usize,
    pub lookback_days: i64,
    pub deadline: Option<Duration>,
}

impl RunOptions {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            concurrency: cfg.concurrency,
            lookback_days: cfg.lookback_days,
            deadline: cfg.deadline,
        }
    }
}

/// Inclusive UTC bounds of one incremental fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

pub struct PipelineOrchestrator {
    social: SocialContentIngester,
    market: MarketDataIngester,
    normalizer: RecordNormalizer,
    aligner: TemporalAligner,
    calendar: MarketCalendar,
    store: Arc<dyn IncrementalStore>,
    options: RunOptions,
}

impl PipelineOrchestrator {
    pub fn new(
        social: SocialContentIngester,
        market: MarketDataIngester,
        normalizer: RecordNormalizer,
        calendar: MarketCalendar,
        store: Arc<dyn IncrementalStore>,
        options: RunOptions,
    ) -> Self {
        Self {
            social,
            market,
            normalizer,
            aligner: TemporalAligner::new(calendar.tz()),
            calendar,
            store,
            options,
        }
    }

    /// Wires one throttle per source, shared by every ticker task.
    pub fn from_config(
        cfg: &PipelineConfig,
        social_source: Arc<dyn SocialSource>,
        market_source: Arc<dyn MarketSource>,
        scorer: Arc<dyn SentimentScorer>,
        store: Arc<dyn IncrementalStore>,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;

        let social_throttle = Arc::new(Throttle::new(social_source.source_name(), cfg.social_rate));
        let market_throttle = Arc::new(Throttle::new(market_source.source_name(), cfg.market_rate));

        let social = SocialContentIngester::new(
            social_source,
            RateLimitedFetcher::new(social_throttle, cfg.retry.clone()),
            cfg.subreddits.clone(),
            cfg.social.clone(),
        );
        let market = MarketDataIngester::new(
            market_source,
            RateLimitedFetcher::new(market_throttle, cfg.retry.clone()),
        );

        Ok(Self::new(
            social,
            market,
            RecordNormalizer::new(scorer, cfg.weights),
            cfg.calendar()?,
            store,
            RunOptions::from_config(cfg),
        ))
    }

    /// Next window for `ticker`: one second after the older cursor up to the end of the last
    /// closed session. Without both cursors the window reaches back `lookback_days`.
    pub async fn resolve_window(
        &self,
        ticker: &Ticker,
        now: DateTime<Utc>,
    ) -> Result<Window, StorageError> {
        let end_date = self.calendar.last_closed_session(now);
        let end = self.calendar.day_end_utc(end_date);

        let social = self.store.get_cursor(ticker, Source::Social).await?;
        let market = self.store.get_cursor(ticker, Source::Market).await?;
        let start = match (social, market) {
            (Some(s), Some(m)) => s.min(m) + ChronoDuration::seconds(1),
            _ => self
                .calendar
                .day_start_utc(end_date - ChronoDuration::days(self.options.lookback_days)),
        };

        Ok(Window { start, end })
    }

    pub async fn run(self: &Arc<Self>, tickers: &[Ticker]) -> RunSummary {
        self.run_at(tickers, Utc::now()).await
    }

    /// Runs every ticker on the bounded worker pool and reports each one's outcome.
    ///
    /// `now` fixes the last closed session for the whole run. A ticker's failure is recorded
    /// in its outcome and never stops the others.
    pub async fn run_at(self: &Arc<Self>, tickers: &[Ticker], now: DateTime<Utc>) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = self.options.deadline.map(|d| Instant::now() + d);
        let permits = Arc::new(Semaphore::new(self.options.concurrency.max(1)));

        tracing::info!(
            %run_id,
            tickers = tickers.len(),
            concurrency = self.options.concurrency,
            deadline = ?self.options.deadline,
            "pipeline run starting"
        );

        let mut tasks = JoinSet::new();
        for (idx, ticker) in tickers.iter().cloned().enumerate() {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (idx, TickerOutcome::skipped(ticker));
                };
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    tracing::warn!(ticker = %ticker, "run deadline passed; skipping ticker");
                    return (idx, TickerOutcome::skipped(ticker));
                }
                let span = tracing::info_span!("ticker", ticker = %ticker);
                let outcome = this
                    .process_ticker(ticker, now, deadline)
                    .instrument(span)
                    .await;
                (idx, outcome)
            });
        }

        let mut slots: Vec<Option<TickerOutcome>> = vec![None; tickers.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => {
                    debug_assert!(outcome.final_state.is_terminal());
                    slots[idx] = Some(outcome);
                }
                Err(err) => tracing::error!(error = %err, "ticker task aborted"),
            }
        }

        let outcomes: Vec<TickerOutcome> = slots
            .into_iter()
            .zip(tickers)
            .map(|(slot, ticker)| {
                slot.unwrap_or_else(|| TickerOutcome {
                    final_state: TickerState::Failed,
                    error: Some("ticker task aborted".to_string()),
                    ..TickerOutcome::new(ticker.clone())
                })
            })
            .collect();

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        tracing::info!(
            %run_id,
            status = summary.status().as_str(),
            rows_written = summary.rows_written(),
            failed = summary.failed().count(),
            "pipeline run finished"
        );
        summary
    }

    async fn process_ticker(
        &self,
        ticker: Ticker,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> TickerOutcome {
        let mut run = TickerRun::new(ticker);
        if let Err(err) = self.drive(&mut run, now, deadline).await {
            run.fail(err);
        }
        run.outcome
    }

    async fn drive(
        &self,
        run: &mut TickerRun,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<(), PipelineError> {
        let ticker = run.outcome.ticker.clone();

        run.enter(TickerState::FetchingSocial);
        let window = self.resolve_window(&ticker, now).await?;
        if window.is_empty() {
            tracing::info!(start = %window.start, end = %window.end, "window empty; nothing to do");
            run.enter(TickerState::Done);
            return Ok(());
        }
        let social = async {
            let mut pager = self.social.fetch_window(&ticker, window.start, window.end)?;
            let records = pager.collect_all().await?;
            Ok::<_, FetchError>((records, pager.truncated_at()))
        };
        let market = self.market.fetch_range(
            &ticker,
            self.calendar.local_date(window.start),
            self.calendar.local_date(window.end),
        );

        // No data dependency between the two; alignment waits for both. The deadline drops
        // whichever fetch is still waiting on the network, a throttle slot or a backoff.
        let both = async { tokio::join!(social, market) };
        let (social, market) = match deadline {
            Some(d) => tokio::time::timeout_at(d, both)
                .await
                .map_err(|_| PipelineError::DeadlineExceeded { stage: "fetch" })?,
            None => both.await,
        };
        let (raw_social, truncated_at) = social?;
        run.enter(TickerState::FetchingMarket);
        let raw_bars = market?;
        check_deadline(deadline, "fetch")?;

        run.enter(TickerState::Aligning);
        let (events, dropped_events) = self.normalizer.normalize_social_batch(&raw_social);
        let (bars, dropped_bars) = self.normalizer.normalize_price_batch(raw_bars);
        let mut aligned = self.aligner.align(&events, &bars);

        // Social coverage ends inside the local day of `cut`. Only sessions before that day
        // have every event; the rest wait for the next run.
        if let Some(cut) = truncated_at {
            let cut_date = self.calendar.local_date(cut);
            let before = aligned.records.len();
            aligned.records.retain(|r| r.date < cut_date);
            tracing::warn!(
                %cut,
                %cut_date,
                held_back = before - aligned.records.len(),
                "social fetch truncated; persisting complete sessions only"
            );
            run.outcome.truncated_at = Some(cut);
        }

        run.outcome.events = events.len();
        run.outcome.dropped_events = dropped_events;
        run.outcome.bars = bars.len();
        run.outcome.dropped_bars = dropped_bars;
        run.outcome.unattached_events = aligned.unattached.len();
        check_deadline(deadline, "align")?;

        run.enter(TickerState::Persisting);
        run.outcome.rows_written = self.store.upsert(&aligned.records).await?;

        // Cursors stop at the end of the last persisted bar's day, so events after it (the
        // unattached ones) are fetched again next run.
        if let Some(last) = aligned.records.last() {
            let ts = self.calendar.day_end_utc(last.date);
            for source in Source::ALL {
                self.store.advance_cursor(&ticker, source, ts).await?;
            }
        }

        run.enter(TickerState::Done);
        tracing::info!(
            start = %window.start,
            end = %window.end,
            events = run.outcome.events,
            bars = run.outcome.bars,
            rows_written = run.outcome.rows_written,
            unattached = run.outcome.unattached_events,
            "ticker done"
        );
        Ok(())
    }
}

fn check_deadline(deadline: Option<Instant>, stage: &'static str) -> Result<(), PipelineError> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(PipelineError::DeadlineExceeded { stage }),
        _ => Ok(()),
    }
}

struct TickerRun {
    outcome: TickerOutcome,
}

impl TickerRun {
    fn new(ticker: Ticker) -> Self {
        Self {
            outcome: TickerOutcome::new(ticker),
        }
    }

    fn enter(&mut self, next: TickerState) {
        let prev = self.outcome.final_state;
        debug_assert!(prev.can_transition_to(next), "illegal transition {prev} -> {next}");
        tracing::debug!(from = %prev, to = %next, "ticker state");
        self.outcome.final_state = next;
    }

    fn fail(&mut self, err: PipelineError) {
        tracing::warn!(state = %self.outcome.final_state, error = %err, "ticker failed");
        self.outcome.failed_in = Some(self.outcome.final_state);
        self.enter(TickerState::Failed);
        self.outcome.error = Some(err.to_string());
    }
}
