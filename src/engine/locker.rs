//! Multi-source locking: fund a requested amount from allocations and
//! balances with an all-or-nothing guarantee.
//!
//! The lock runs in two phases. The plan phase walks funding candidates in
//! priority order and allocates greedily without touching anything; only
//! once the full amount is covered does the commit phase lock each planned
//! record (each `lock_exact` re-reads the record immediately before its
//! compare-and-swap, shrinking the window between plan and commit). A plan
//! that cannot be covered fails `InsufficientFunds` with zero side effects.

use crate::domain::{
    AccountRef, AllocationId, Amount, AssetSymbol, BalanceId, LockDistribution, LockOutcome,
    Network,
};
use crate::error::{LedgerError, PartialFailure, RecordFailure, Result};
use crate::store::{AllocationLedger, BalanceLedger};
use std::sync::Arc;
use tracing::{debug, error};

/// Which funding class is consumed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockPriority {
    /// Promotional allocations before real balances (the default: spend
    /// expiring money first).
    #[default]
    AllocationsFirst,
    /// Real balances before allocations (e.g. withdrawals, which must not
    /// consume promotional funds).
    BalancesFirst,
}

/// Caller-tunable lock behavior.
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Prefer balance records on this network when several can fund.
    pub preferred_network: Option<Network>,
    pub priority: LockPriority,
}

enum Planned {
    Allocation(AllocationId, Amount),
    Balance(BalanceId, Amount),
}

/// Locks a requested amount across multiple funding records.
pub struct MultiSourceLocker {
    allocations: Arc<dyn AllocationLedger>,
    balances: Arc<dyn BalanceLedger>,
}

impl MultiSourceLocker {
    pub fn new(allocations: Arc<dyn AllocationLedger>, balances: Arc<dyn BalanceLedger>) -> Self {
        MultiSourceLocker {
            allocations,
            balances,
        }
    }

    /// Lock `amount` of `asset` for `account`.
    ///
    /// Returns the distributions that funded the lock; callers must store
    /// them verbatim and replay them at unlock/settle time.
    ///
    /// # Errors
    /// `InsufficientFunds` (zero side effects) when the combined candidates
    /// cannot cover the amount; `PartialFailure` when a commit-phase lock
    /// fails after earlier records were already locked — committed locks are
    /// left in place for operator reconciliation, never rolled back blind.
    pub async fn lock(
        &self,
        account: &AccountRef,
        asset: &AssetSymbol,
        amount: Amount,
        options: &LockOptions,
    ) -> Result<LockOutcome> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "lock amount must be positive, got {}",
                amount
            )));
        }

        let plan = self.plan(account, asset, amount, options).await?;
        self.commit(account, asset, plan).await
    }

    async fn plan(
        &self,
        account: &AccountRef,
        asset: &AssetSymbol,
        amount: Amount,
        options: &LockOptions,
    ) -> Result<Vec<Planned>> {
        let mut remaining = amount;
        let mut plan = Vec::new();

        let classes = match options.priority {
            LockPriority::AllocationsFirst => [SourceClass::Allocations, SourceClass::Balances],
            LockPriority::BalancesFirst => [SourceClass::Balances, SourceClass::Allocations],
        };

        for class in classes {
            if remaining.is_zero() {
                break;
            }
            match class {
                SourceClass::Allocations => {
                    let candidates = self
                        .allocations
                        .funding_candidates(&account.user_id, &account.trading_account_id, asset)
                        .await?;
                    for candidate in candidates {
                        if remaining.is_zero() {
                            break;
                        }
                        let take = candidate.available.min(remaining);
                        remaining = remaining.checked_sub(take)?;
                        plan.push(Planned::Allocation(candidate.id, take));
                    }
                }
                SourceClass::Balances => {
                    let candidates = self
                        .balances
                        .funding_candidates(
                            &account.wallet_id,
                            asset,
                            options.preferred_network.as_ref(),
                        )
                        .await?;
                    for candidate in candidates {
                        if remaining.is_zero() {
                            break;
                        }
                        let take = candidate.available.min(remaining);
                        remaining = remaining.checked_sub(take)?;
                        plan.push(Planned::Balance(candidate.id, take));
                    }
                }
            }
        }

        if remaining.is_positive() {
            debug!(
                user = %account.user_id,
                asset = %asset,
                requested = %amount,
                shortfall = %remaining,
                "lock plan cannot be covered"
            );
            return Err(LedgerError::InsufficientFunds {
                shortfall: remaining,
            });
        }

        Ok(plan)
    }

    async fn commit(
        &self,
        account: &AccountRef,
        asset: &AssetSymbol,
        plan: Vec<Planned>,
    ) -> Result<LockOutcome> {
        let mut outcome = LockOutcome {
            total_locked: Amount::ZERO,
            allocations: Vec::new(),
            balances: Vec::new(),
        };

        for planned in plan {
            match planned {
                Planned::Allocation(id, take) => {
                    if let Err(e) = self.allocations.lock_exact(&id, take).await {
                        return Err(commit_failure(
                            account,
                            asset,
                            &outcome,
                            format!("allocation {}", id),
                            take,
                            e,
                        ));
                    }
                    outcome.total_locked = outcome.total_locked.checked_add(take)?;
                    outcome.allocations.push(LockDistribution::allocation(id, take));
                }
                Planned::Balance(id, take) => {
                    if let Err(e) = self.balances.lock_exact(&id, take).await {
                        return Err(commit_failure(
                            account,
                            asset,
                            &outcome,
                            format!("balance {}", id),
                            take,
                            e,
                        ));
                    }
                    outcome.total_locked = outcome.total_locked.checked_add(take)?;
                    outcome.balances.push(LockDistribution::balance(id, take));
                }
            }
        }

        Ok(outcome)
    }
}

/// A record changed between plan and commit (the documented TOCTOU window).
/// Earlier locks stay in place; the caller and an operator get the full
/// breakdown.
fn commit_failure(
    account: &AccountRef,
    asset: &AssetSymbol,
    outcome: &LockOutcome,
    record: String,
    amount: Amount,
    cause: LedgerError,
) -> LedgerError {
    let partial = PartialFailure {
        operation: "lock commit".to_string(),
        processed: outcome.total_locked,
        failures: vec![RecordFailure {
            record,
            amount,
            reason: cause.to_string(),
        }],
    };
    error!(
        user = %account.user_id,
        asset = %asset,
        "CRITICAL: {}",
        partial
    );
    LedgerError::PartialFailure(partial)
}

enum SourceClass {
    Allocations,
    Balances,
}
