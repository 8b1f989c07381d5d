use diesel::sql_types::{BigInt, Bool};
use diesel::QueryableByName;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{TicketError, TicketResult};

pub type DbPool = Pool<AsyncPgConnection>;

pub const MAX_CONFLICT_RETRIES: u32 = 3;

/// Advisory lock keys, one per periodic job.
pub const PROMOTER_LOCK: i64 = 0x7265_7365_7276_6501;
pub const RECONCILER_LOCK: i64 = 0x7265_636f_6e63_6902;
pub const MERCHANT_POLLER_LOCK: i64 = 0x6d65_7263_6861_6e03;

pub async fn build_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().build(config).await?;
    Ok(pool)
}

/// Re-runs `op` when the database reports a serialization failure, backing off
/// with jitter between attempts.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> TicketResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TicketResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(TicketError::TransactionConflict) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                let delay = backoff(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "transaction conflict, retrying");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let base = 25u64 << attempt.min(6);
    let jitter = rand::thread_rng().gen_range(0..=base);
    Duration::from_millis(base + jitter)
}

#[derive(QueryableByName)]
struct LockResult {
    #[diesel(sql_type = Bool)]
    locked: bool,
}

/// Session-level advisory lock so a periodic job never overlaps with a copy of
/// itself in another process. Must be released on the same connection.
pub async fn try_job_lock(conn: &mut AsyncPgConnection, key: i64) -> TicketResult<bool> {
    let result = diesel::sql_query("SELECT pg_try_advisory_lock($1) AS locked")
        .bind::<BigInt, _>(key)
        .get_result::<LockResult>(conn)
        .await?;
    Ok(result.locked)
}

pub async fn release_job_lock(conn: &mut AsyncPgConnection, key: i64) -> TicketResult<()> {
    diesel::sql_query("SELECT pg_advisory_unlock($1) AS locked")
        .bind::<BigInt, _>(key)
        .get_result::<LockResult>(conn)
        .await?;
    Ok(())
}
