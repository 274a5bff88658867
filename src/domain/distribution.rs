//! Lock distributions: the record of which funding records fulfilled a lock.
//!
//! A [`LockOutcome`] is returned by the locker and must be stored verbatim by
//! the caller (embedded on its order or withdrawal record) so the exact same
//! distributions can be replayed for unlock or settlement later. Both types
//! serialize to plain JSON for that purpose.

use crate::domain::amount::Amount;
use crate::domain::primitives::{AllocationId, BalanceId};
use serde::{Deserialize, Serialize};

/// The funding record a distribution draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source_type", content = "source_id", rename_all = "snake_case")]
pub enum FundingSource {
    Allocation(AllocationId),
    Balance(BalanceId),
}

impl std::fmt::Display for FundingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FundingSource::Allocation(id) => write!(f, "allocation {}", id),
            FundingSource::Balance(id) => write!(f, "balance {}", id),
        }
    }
}

/// One slice of a lock: `amount` smallest units locked on `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDistribution {
    #[serde(flatten)]
    pub source: FundingSource,
    pub amount: Amount,
}

impl LockDistribution {
    pub fn allocation(id: AllocationId, amount: Amount) -> Self {
        LockDistribution {
            source: FundingSource::Allocation(id),
            amount,
        }
    }

    pub fn balance(id: BalanceId, amount: Amount) -> Self {
        LockDistribution {
            source: FundingSource::Balance(id),
            amount,
        }
    }
}

/// Result of a successful multi-source lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOutcome {
    pub total_locked: Amount,
    pub allocations: Vec<LockDistribution>,
    pub balances: Vec<LockDistribution>,
}

impl LockOutcome {
    /// True when the lock was funded by allocations alone. Settlement uses
    /// this to decide the single-balance PnL fallback path.
    pub fn is_allocation_only(&self) -> bool {
        self.balances.is_empty() && !self.allocations.is_empty()
    }
}
