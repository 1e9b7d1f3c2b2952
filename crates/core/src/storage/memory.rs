use crate::domain::{IngestionCursor, JoinedDailyRecord, Source, Ticker};
use crate::error::StorageError;
use crate::pipeline::summary::RunSummary;
use crate::storage::{dedup_batch, merge_row, IncrementalStore};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Tables {
    rows: BTreeMap<(Ticker, NaiveDate), JoinedDailyRecord>,
    cursors: HashMap<(Ticker, Source), DateTime<Utc>>,
    runs: Vec<RunSummary>,
}

/// In-process store with the same merge semantics as Postgres. Used for dry runs and tests.
///
/// A batch is merged into a copy of the table and swapped in only when every row succeeded,
/// so a failing upsert leaves nothing visible.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_upserts: AtomicU32,
    failing_tickers: Mutex<HashSet<Ticker>>,
    upsert_calls: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` upserts fail with a storage fault.
    pub fn fail_next_upserts(&self, n: u32) {
        self.fail_upserts.store(n, Ordering::SeqCst);
    }

    /// Every upsert touching `ticker` fails until cleared.
    pub async fn fail_upserts_for(&self, ticker: Ticker) {
        self.failing_tickers.lock().await.insert(ticker);
    }

    pub async fn clear_failures(&self) {
        self.fail_upserts.store(0, Ordering::SeqCst);
        self.failing_tickers.lock().await.clear();
    }

    pub fn upsert_calls(&self) -> u32 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub async fn rows(&self) -> Vec<JoinedDailyRecord> {
        self.tables.lock().await.rows.values().cloned().collect()
    }

    pub async fn rows_for(&self, ticker: &Ticker) -> Vec<JoinedDailyRecord> {
        self.tables
            .lock()
            .await
            .rows
            .values()
            .filter(|r| &r.ticker == ticker)
            .cloned()
            .collect()
    }

    pub async fn row(&self, ticker: &Ticker, date: NaiveDate) -> Option<JoinedDailyRecord> {
        self.tables
            .lock()
            .await
            .rows
            .get(&(ticker.clone(), date))
            .cloned()
    }

    pub async fn cursors(&self) -> Vec<IngestionCursor> {
        let mut out: Vec<IngestionCursor> = self
            .tables
            .lock()
            .await
            .cursors
            .iter()
            .map(|((ticker, source), ts)| IngestionCursor {
                ticker: ticker.clone(),
                source: *source,
                last_success_timestamp: *ts,
            })
            .collect();
        out.sort_by(|a, b| (&a.ticker, a.source).cmp(&(&b.ticker, b.source)));
        out
    }

    pub async fn runs(&self) -> Vec<RunSummary> {
        self.tables.lock().await.runs.clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_upserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl IncrementalStore for MemoryStore {
    async fn upsert(&self, records: &[JoinedDailyRecord]) -> Result<u64, StorageError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if records.is_empty() {
            return Ok(0);
        }

        let batch = dedup_batch(records);
        let mut tables = self.tables.lock().await;
        let mut staged = tables.rows.clone();
        let mut written = 0u64;
        let failing = self.failing_tickers.lock().await.clone();
        let injected = self.take_injected_failure();

        for (i, rec) in batch.iter().enumerate() {
            // Fail half-way through so a leaked partial write would be visible.
            if (injected && i == batch.len() / 2) || failing.contains(&rec.ticker) {
                return Err(StorageError::Fault {
                    op: "upsert joined_daily",
                    detail: format!("injected failure at {} {}", rec.ticker, rec.date),
                });
            }
            let key = rec.key();
            if let Some(merged) = merge_row(staged.get(&key), rec) {
                staged.insert(key, merged);
                written += 1;
            }
        }

        tables.rows = staged;
        Ok(written)
    }

    async fn get_cursor(
        &self,
        ticker: &Ticker,
        source: Source,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self
            .tables
            .lock()
            .await
            .cursors
            .get(&(ticker.clone(), source))
            .copied())
    }

    async fn advance_cursor(
        &self,
        ticker: &Ticker,
        source: Source,
        ts: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        let slot = tables.cursors.entry((ticker.clone(), source)).or_insert(ts);
        if ts > *slot {
            *slot = ts;
        }
        Ok(())
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StorageError> {
        self.tables.lock().await.runs.push(summary.clone());
        Ok(())
    }
}
