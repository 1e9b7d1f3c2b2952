pub mod lock;
pub mod memory;
pub mod postgres;

use crate::domain::{JoinedDailyRecord, Source, Ticker};
use crate::error::StorageError;
use crate::pipeline::summary::RunSummary;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Sole writer of joined rows and ingestion cursors.
#[async_trait::async_trait]
pub trait IncrementalStore: Send + Sync {
    /// Merges `records` into storage in one atomic batch and returns how many rows changed.
    ///
    /// Price fields never go from a value to null. The sentiment group is replaced as a unit
    /// when the incoming row carries sentiment. Rows that merge to their stored value are not
    /// written and not counted.
    async fn upsert(&self, records: &[JoinedDailyRecord]) -> Result<u64, StorageError>;

    async fn get_cursor(
        &self,
        ticker: &Ticker,
        source: Source,
    ) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Moves the cursor forward to `ts`. A `ts` older than the stored value is ignored.
    async fn advance_cursor(
        &self,
        ticker: &Ticker,
        source: Source,
        ts: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StorageError>;
}

/// Merge of an incoming row over the stored one. `None` means the stored row is unchanged.
pub fn merge_row(
    existing: Option<&JoinedDailyRecord>,
    incoming: &JoinedDailyRecord,
) -> Option<JoinedDailyRecord> {
    let Some(old) = existing else {
        return Some(incoming.clone());
    };

    let mut merged = JoinedDailyRecord {
        ticker: old.ticker.clone(),
        date: old.date,
        price_open: incoming.price_open.or(old.price_open),
        price_close: incoming.price_close.or(old.price_close),
        price_volume: incoming.price_volume.or(old.price_volume),
        sentiment_mean: old.sentiment_mean,
        sentiment_weighted_mean: old.sentiment_weighted_mean,
        sentiment_count: old.sentiment_count,
    };
    if incoming.sentiment_count.is_some() {
        merged.sentiment_mean = incoming.sentiment_mean;
        merged.sentiment_weighted_mean = incoming.sentiment_weighted_mean;
        merged.sentiment_count = incoming.sentiment_count;
    }

    (merged != *old).then_some(merged)
}

/// Collapses repeated keys within one batch, folding later rows over earlier ones.
///
/// Postgres refuses to touch the same row twice in one `INSERT .. ON CONFLICT`.
pub fn dedup_batch(records: &[JoinedDailyRecord]) -> Vec<JoinedDailyRecord> {
    let mut order: Vec<(Ticker, NaiveDate)> = Vec::with_capacity(records.len());
    let mut by_key: HashMap<(Ticker, NaiveDate), JoinedDailyRecord> =
        HashMap::with_capacity(records.len());
    for rec in records {
        let key = rec.key();
        match by_key.get(&key) {
            Some(prev) => {
                if let Some(merged) = merge_row(Some(prev), rec) {
                    by_key.insert(key, merged);
                }
            }
            None => {
                order.push(key.clone());
                by_key.insert(key, rec.clone());
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}
