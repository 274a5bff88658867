//! Bounded retry for optimistic-concurrency conflicts.
//!
//! Every single-record ledger mutation is a versioned compare-and-swap: read
//! the record, compute new amounts, `UPDATE ... WHERE id = ? AND version = ?`.
//! A zero-row update means another request won the race; the operation is
//! re-run from the fresh read. Retries are capped at a small fixed count,
//! after which `LedgerError::Conflict` surfaces to the caller.

use crate::error::{LedgerError, Result};
use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 5;

fn conflict_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(50),
        max_elapsed_time: Some(Duration::from_secs(2)),
        ..Default::default()
    }
}

/// Run a compare-and-swap operation until it commits.
///
/// `op` returns `Ok(Some(value))` when its versioned update matched a row,
/// `Ok(None)` when it matched zero rows (lost the race; retried), and `Err`
/// for validation or storage failures (never retried — validation failures
/// must stay zero-side-effect, not be re-applied against fresher state they
/// might now pass on).
pub async fn with_conflict_retry<T, F, Fut>(record: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let attempts = AtomicU32::new(0);

    retry(conflict_backoff(), || {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let op = &op;
        async move {
            match op().await {
                Ok(Some(value)) => Ok(value),
                Ok(None) if attempt < MAX_ATTEMPTS => {
                    tracing::debug!(record, attempt, "version conflict, retrying");
                    Err(backoff::Error::transient(LedgerError::Conflict(
                        record.to_string(),
                    )))
                }
                Ok(None) => Err(backoff::Error::permanent(LedgerError::Conflict(
                    record.to_string(),
                ))),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}
