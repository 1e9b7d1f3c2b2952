use anyhow::Context;

// Advisory locks are scoped to the Postgres session, so the lock is held on one pooled
// connection for the whole run and released (or dropped with the connection) at the end.
const RUN_LOCK_KEY: i64 = 0x5345_4E54_4942; // "SENTIB"

/// Session-scoped guard against two worker runs writing the same cursors at once.
pub struct RunLock {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

impl RunLock {
    /// `None` when another run holds the lock.
    pub async fn try_acquire(pool: &sqlx::PgPool) -> anyhow::Result<Option<Self>> {
        let mut conn = pool
            .acquire()
            .await
            .context("failed to acquire connection for run lock")?;
        let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .persistent(false)
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("failed to acquire advisory lock (key={RUN_LOCK_KEY})"))?;
        Ok(acquired.0.then_some(Self { conn }))
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(RUN_LOCK_KEY)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("failed to release advisory lock (key={RUN_LOCK_KEY})"))?;
        Ok(())
    }
}
