use crate::domain::Amount;
use thiserror::Error;

/// Error taxonomy for ledger operations.
///
/// Validation failures (`InvalidAmount`, `InvalidDecimals`, `DivisionByZero`)
/// and plan-phase `InsufficientFunds` are raised before any storage mutation.
/// `PartialFailure` is returned by best-effort multi-record operations where
/// some records succeeded; completed mutations are never rolled back.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid decimals: {0} (must be 0..=30)")]
    InvalidDecimals(u32),

    #[error("division by zero")]
    DivisionByZero,

    #[error("insufficient funds: short {shortfall} smallest units")]
    InsufficientFunds { shortfall: Amount },

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("conflicting concurrent update on {0}, retries exhausted")]
    Conflict(String),

    #[error("{0}")]
    PartialFailure(PartialFailure),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Outcome of a best-effort multi-record operation where some records failed.
///
/// Carries enough detail (which records failed, for how much, and what was
/// successfully processed) for manual or automated reconciliation.
#[derive(Debug)]
pub struct PartialFailure {
    /// Short label of the operation that partially failed ("unlock",
    /// "lock commit", "treasury deduct", ...).
    pub operation: String,
    /// Total amount successfully processed before/around the failures.
    pub processed: Amount,
    /// Per-record failures.
    pub failures: Vec<RecordFailure>,
}

/// A single failed record inside a [`PartialFailure`].
#[derive(Debug)]
pub struct RecordFailure {
    pub record: String,
    pub amount: Amount,
    pub reason: String,
}

impl std::fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "partial failure during {}: {} record(s) failed, {} smallest units processed",
            self.operation,
            self.failures.len(),
            self.processed
        )?;
        for failure in &self.failures {
            write!(
                f,
                "; {} ({} units): {}",
                failure.record, failure.amount, failure.reason
            )?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
