//! Retry helper for SQLite lock contention.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 8;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 1000;

/// SQLITE_BUSY (5) / SQLITE_LOCKED (6), or a driver message saying the same.
fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    if let sqlx::Error::Database(db_err) = sqlx_err {
        let code = db_err.code().map(Cow::into_owned);
        if matches!(code.as_deref(), Some("5") | Some("6")) {
            return true;
        }
    }

    let msg = sqlx_err.to_string().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Run `op`, retrying with jittered exponential backoff while SQLite reports busy.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(err) if is_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let backoff = BUSY_BASE_DELAY_MS
                    .saturating_mul(1u64 << attempt)
                    .min(BUSY_MAX_DELAY_MS);
                let jitter = random::<u64>() % (backoff / 4 + 1);
                let delay = Duration::from_millis((backoff + jitter).min(BUSY_MAX_DELAY_MS));

                attempt += 1;
                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name, delay, attempt, BUSY_MAX_RETRIES
                );
                sleep(delay).await;
            }
            result => return result,
        }
    }
}
