use crate::domain::{JoinedDailyRecord, Source, Ticker};
use crate::error::StorageError;
use crate::pipeline::summary::RunSummary;
use crate::storage::{dedup_batch, IncrementalStore};
use chrono::{DateTime, Utc};

// Price fields: new ?? old. Sentiment: replaced as a group when the new row has a count.
// The WHERE clause skips rows that would merge to their current value, so they are not counted.
const MERGE_CLAUSE: &str = " ON CONFLICT (ticker, date) DO UPDATE SET \
    price_open = COALESCE(EXCLUDED.price_open, joined_daily.price_open), \
    price_close = COALESCE(EXCLUDED.price_close, joined_daily.price_close), \
    price_volume = COALESCE(EXCLUDED.price_volume, joined_daily.price_volume), \
    sentiment_mean = CASE WHEN EXCLUDED.sentiment_count IS NULL \
        THEN joined_daily.sentiment_mean ELSE EXCLUDED.sentiment_mean END, \
    sentiment_weighted_mean = CASE WHEN EXCLUDED.sentiment_count IS NULL \
        THEN joined_daily.sentiment_weighted_mean ELSE EXCLUDED.sentiment_weighted_mean END, \
    sentiment_count = COALESCE(EXCLUDED.sentiment_count, joined_daily.sentiment_count), \
    updated_at = now() \
  WHERE (COALESCE(EXCLUDED.price_open, joined_daily.price_open), \
         COALESCE(EXCLUDED.price_close, joined_daily.price_close), \
         COALESCE(EXCLUDED.price_volume, joined_daily.price_volume)) \
        IS DISTINCT FROM \
        (joined_daily.price_open, joined_daily.price_close, joined_daily.price_volume) \
     OR (EXCLUDED.sentiment_count IS NOT NULL AND \
         (EXCLUDED.sentiment_mean, EXCLUDED.sentiment_weighted_mean, EXCLUDED.sentiment_count) \
         IS DISTINCT FROM \
         (joined_daily.sentiment_mean, joined_daily.sentiment_weighted_mean, joined_daily.sentiment_count))";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: sqlx::PgPool,
    batch_size: usize,
}

impl PgStore {
    pub fn new(pool: sqlx::PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl IncrementalStore for PgStore {
    async fn upsert(&self, records: &[JoinedDailyRecord]) -> Result<u64, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let rows = dedup_batch(records);

        // One transaction for the whole call; chunks only bound the statement size.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StorageError::db("begin upsert transaction"))?;

        let mut affected: u64 = 0;
        for (batch_idx, chunk) in rows.chunks(self.batch_size).enumerate() {
            let t0 = std::time::Instant::now();
            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO joined_daily (ticker, date, price_open, price_close, price_volume, \
                 sentiment_mean, sentiment_weighted_mean, sentiment_count) ",
            );
            qb.push_values(chunk, |mut b, rec| {
                b.push_bind(rec.ticker.as_str().to_string())
                    .push_bind(rec.date)
                    .push_bind(rec.price_open)
                    .push_bind(rec.price_close)
                    .push_bind(rec.price_volume)
                    .push_bind(rec.sentiment_mean)
                    .push_bind(rec.sentiment_weighted_mean)
                    .push_bind(rec.sentiment_count);
            });
            qb.push(MERGE_CLAUSE);

            let res = qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::db("batch upsert joined_daily"))?;
            affected += res.rows_affected();

            tracing::debug!(
                batch_idx,
                batch_size = chunk.len(),
                rows_affected = res.rows_affected(),
                elapsed_ms = t0.elapsed().as_millis(),
                "joined_daily batch upsert"
            );
        }

        tx.commit()
            .await
            .map_err(StorageError::db("commit upsert transaction"))?;
        Ok(affected)
    }

    async fn get_cursor(
        &self,
        ticker: &Ticker,
        source: Source,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT last_success_timestamp FROM ingestion_cursor WHERE ticker = $1 AND source = $2",
        )
        .persistent(false)
        .bind(ticker.as_str())
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::db("select ingestion_cursor"))?;
        Ok(row.map(|r| r.0))
    }

    async fn advance_cursor(
        &self,
        ticker: &Ticker,
        source: Source,
        ts: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO ingestion_cursor (ticker, source, last_success_timestamp) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (ticker, source) DO UPDATE \
               SET last_success_timestamp = GREATEST(ingestion_cursor.last_success_timestamp, EXCLUDED.last_success_timestamp), \
                   updated_at = now()",
        )
        .persistent(false)
        .bind(ticker.as_str())
        .bind(source.as_str())
        .bind(ts)
        .execute(&self.pool)
        .await
        .map_err(StorageError::db("upsert ingestion_cursor"))?;
        Ok(())
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO ingestion_runs (id, started_at, finished_at, status, summary) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .persistent(false)
        .bind(summary.run_id)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.status().as_str())
        .bind(summary.to_json())
        .execute(&self.pool)
        .await
        .map_err(StorageError::db("insert ingestion_runs"))?;
        Ok(())
    }
}
