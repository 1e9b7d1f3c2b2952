use anyhow::Context;
use clap::Parser;
use sentibar_core::config::{PipelineConfig, Settings};
use sentibar_core::domain::Ticker;
use sentibar_core::ingest::{PushshiftSource, YahooChartSource};
use sentibar_core::pipeline::{PipelineOrchestrator, RunSummary};
use sentibar_core::sentiment::LexiconScorer;
use sentibar_core::storage::lock::RunLock;
use sentibar_core::storage::{IncrementalStore, MemoryStore, PgStore};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sentibar_worker")]
struct Args {
    /// Comma separated tickers. Overrides TICKERS.
    #[arg(long)]
    tickers: Option<String>,

    /// Fetch, align and report, but keep results in memory instead of Postgres.
    #[arg(long)]
    dry_run: bool,

    /// First-run lookback in days. Overrides LOOKBACK_DAYS.
    #[arg(long)]
    lookback_days: Option<i64>,

    /// Whole-run deadline in seconds. Overrides RUN_DEADLINE_SECS.
    #[arg(long)]
    deadline_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env();
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    let cfg = load_config(&args)?;

    let social_source = Arc::new(PushshiftSource::from_settings(&settings, cfg.filter_media)?);
    let market_source = Arc::new(YahooChartSource::from_settings(&settings)?);
    let scorer = Arc::new(LexiconScorer::new());

    if args.dry_run {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(PipelineOrchestrator::from_config(
            &cfg,
            social_source,
            market_source,
            scorer,
            store.clone(),
        )?);
        let summary = orchestrator.run(&cfg.tickers).await;
        report(&summary);
        tracing::info!(
            dry_run = true,
            rows_in_memory = store.rows().await.len(),
            summary = %summary.to_json(),
            "dry run finished"
        );
        return Ok(());
    }

    let db_url = settings.require_database_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections((cfg.concurrency as u32).saturating_add(2))
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    sentibar_core::storage::migrate(&pool).await?;

    let Some(lock) = RunLock::try_acquire(&pool).await? else {
        tracing::warn!("run lock not acquired; another run in progress");
        return Ok(());
    };

    let store = Arc::new(PgStore::new(pool.clone(), cfg.upsert_batch));
    let orchestrator = Arc::new(PipelineOrchestrator::from_config(
        &cfg,
        social_source,
        market_source,
        scorer,
        store.clone(),
    )?);

    let summary = orchestrator.run(&cfg.tickers).await;
    report(&summary);

    if let Err(err) = store.record_run(&summary).await {
        let err = anyhow::Error::new(err).context("failed to record ingestion run");
        sentry_anyhow::capture_anyhow(&err);
        tracing::error!(run_id = %summary.run_id, error = %format!("{err:#}"), "run record not stored");
    }

    if let Err(err) = lock.release().await {
        tracing::warn!(error = %err, "run lock release failed; it ends with the connection");
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let mut cfg = PipelineConfig::from_env()?;
    if let Some(raw) = args.tickers.as_deref() {
        cfg.tickers = Ticker::parse_list(raw).context("invalid --tickers")?;
    }
    if let Some(days) = args.lookback_days {
        cfg.lookback_days = days;
    }
    if let Some(secs) = args.deadline_secs {
        cfg.deadline = Some(Duration::from_secs(secs));
    }
    cfg.validate()?;
    Ok(cfg)
}

fn report(summary: &RunSummary) {
    for outcome in summary.failed() {
        tracing::error!(
            ticker = %outcome.ticker,
            state = %outcome.final_state,
            error = outcome.error.as_deref().unwrap_or(""),
            "ticker did not complete"
        );
    }
    tracing::info!(
        run_id = %summary.run_id,
        status = summary.status().as_str(),
        tickers = summary.outcomes.len(),
        rows_written = summary.rows_written(),
        "run summary"
    );
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
