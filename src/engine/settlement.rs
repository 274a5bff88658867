//! Settlement: release lock distributions and apply profit/loss.
//!
//! Unlock is best-effort: every distribution is attempted, failures are
//! aggregated, and funds already released stay released. PnL is distributed
//! proportionally to the balance records that funded the position; each
//! share rounds down, so up to N-1 smallest units can evaporate across N
//! distributions — an accepted, documented rounding policy (the remainder
//! is never reconciled).

use crate::domain::{
    AccountRef, Amount, AssetSymbol, FundingSource, LockDistribution, Network,
};
use crate::error::{LedgerError, PartialFailure, RecordFailure, Result};
use crate::store::{AllocationLedger, BalanceLedger};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Totals returned by [`SettlementEngine::settle_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementSummary {
    pub total_unlocked: Amount,
    pub total_pnl_applied: Amount,
}

/// Applies settlement to previously locked distributions.
pub struct SettlementEngine {
    allocations: Arc<dyn AllocationLedger>,
    balances: Arc<dyn BalanceLedger>,
    /// Network for a fallback balance record when the wallet has none for
    /// the asset (allocation-only funding).
    default_network: Network,
}

impl SettlementEngine {
    pub fn new(
        allocations: Arc<dyn AllocationLedger>,
        balances: Arc<dyn BalanceLedger>,
        default_network: Network,
    ) -> Self {
        SettlementEngine {
            allocations,
            balances,
            default_network,
        }
    }

    /// Release every distribution, best-effort.
    ///
    /// Returns the total unlocked. If any record fails, the rest are still
    /// attempted and the aggregate surfaces as `PartialFailure` carrying the
    /// amount that did unlock.
    pub async fn unlock(
        &self,
        allocation_dists: &[LockDistribution],
        balance_dists: &[LockDistribution],
    ) -> Result<Amount> {
        let mut total_unlocked = Amount::ZERO;
        let mut failures = Vec::new();

        for dist in allocation_dists.iter().chain(balance_dists) {
            match self.unlock_one(dist).await {
                Ok(()) => total_unlocked = total_unlocked.checked_add(dist.amount)?,
                Err(e) => failures.push(RecordFailure {
                    record: dist.source.to_string(),
                    amount: dist.amount,
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            let partial = PartialFailure {
                operation: "unlock".to_string(),
                processed: total_unlocked,
                failures,
            };
            error!("CRITICAL: {}", partial);
            return Err(LedgerError::PartialFailure(partial));
        }

        Ok(total_unlocked)
    }

    async fn unlock_one(&self, dist: &LockDistribution) -> Result<()> {
        match &dist.source {
            FundingSource::Allocation(id) => {
                self.allocations.unlock_exact(id, dist.amount).await?;
            }
            FundingSource::Balance(id) => {
                self.balances.unlock_exact(id, dist.amount).await?;
            }
        }
        Ok(())
    }

    /// Distribute `amount` of PnL proportionally across the balance records
    /// that funded the original lock.
    ///
    /// Each record's share is `amount * dist.amount / original_total`,
    /// rounded down. Returns the total actually applied (≤ amount).
    pub async fn distribute_pnl(
        &self,
        balance_dists: &[LockDistribution],
        amount: Amount,
        is_profit: bool,
    ) -> Result<Amount> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidAmount(format!(
                "pnl amount must be unsigned, got {}",
                amount
            )));
        }

        let mut original_total = Amount::ZERO;
        for dist in balance_dists {
            if !matches!(dist.source, FundingSource::Balance(_)) {
                return Err(LedgerError::InvalidState(
                    "pnl can only be distributed to balance records".to_string(),
                ));
            }
            original_total = original_total.checked_add(dist.amount)?;
        }
        if !original_total.is_positive() {
            return Err(LedgerError::InvalidState(
                "cannot distribute pnl over an empty lock total".to_string(),
            ));
        }

        let mut total_applied = Amount::ZERO;
        let mut failures = Vec::new();

        for dist in balance_dists {
            let share = amount.mul_div(dist.amount, original_total)?;
            if share.is_zero() {
                continue;
            }
            let FundingSource::Balance(id) = dist.source else {
                continue;
            };
            match self.balances.settle_pnl(&id, share, is_profit).await {
                Ok(_) => total_applied = total_applied.checked_add(share)?,
                Err(e) => failures.push(RecordFailure {
                    record: dist.source.to_string(),
                    amount: share,
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            let partial = PartialFailure {
                operation: "pnl distribution".to_string(),
                processed: total_applied,
                failures,
            };
            error!("CRITICAL: {}", partial);
            return Err(LedgerError::PartialFailure(partial));
        }

        Ok(total_applied)
    }

    /// Full order close: unlock principal, then apply PnL.
    ///
    /// With balance-funded distributions the PnL spreads proportionally
    /// across them. With allocation-only funding it lands on the wallet's
    /// single best balance record for the asset (allocations never carry
    /// PnL, so they can be returned cleanly at expiry). Allocation
    /// distributions get a proportional advisory profit_during_period
    /// credit either way.
    pub async fn settle_order(
        &self,
        account: &AccountRef,
        asset: &AssetSymbol,
        balance_dists: &[LockDistribution],
        allocation_dists: &[LockDistribution],
        pnl_amount: Amount,
        is_profit: bool,
    ) -> Result<SettlementSummary> {
        let total_unlocked = self.unlock(allocation_dists, balance_dists).await?;

        if pnl_amount.is_zero() {
            return Ok(SettlementSummary {
                total_unlocked,
                total_pnl_applied: Amount::ZERO,
            });
        }

        let total_pnl_applied = if !balance_dists.is_empty() {
            self.distribute_pnl(balance_dists, pnl_amount, is_profit)
                .await?
        } else {
            self.settle_to_fallback_balance(account, asset, pnl_amount, is_profit)
                .await?
        };

        self.record_allocation_profit(
            allocation_dists,
            balance_dists,
            pnl_amount,
            is_profit,
        )
        .await;

        info!(
            user = %account.user_id,
            asset = %asset,
            unlocked = %total_unlocked,
            pnl = %total_pnl_applied,
            profit = is_profit,
            "order settled"
        );

        Ok(SettlementSummary {
            total_unlocked,
            total_pnl_applied,
        })
    }

    /// Allocation-only funding: the whole PnL lands on one real balance.
    async fn settle_to_fallback_balance(
        &self,
        account: &AccountRef,
        asset: &AssetSymbol,
        pnl_amount: Amount,
        is_profit: bool,
    ) -> Result<Amount> {
        let record = match self.balances.best_for_asset(&account.wallet_id, asset).await? {
            Some(record) => record,
            None => {
                self.balances
                    .get_or_create(&account.wallet_id, asset, &self.default_network)
                    .await?
            }
        };

        match self.balances.settle_pnl(&record.id, pnl_amount, is_profit).await {
            Ok(_) => Ok(pnl_amount),
            Err(e) => {
                // Typically a loss exceeding the fallback record's available:
                // never persisted negative, surfaced for reconciliation.
                let partial = PartialFailure {
                    operation: "fallback pnl settlement".to_string(),
                    processed: Amount::ZERO,
                    failures: vec![RecordFailure {
                        record: format!("balance {}", record.id),
                        amount: pnl_amount,
                        reason: e.to_string(),
                    }],
                };
                error!(user = %account.user_id, asset = %asset, "CRITICAL: {}", partial);
                Err(LedgerError::PartialFailure(partial))
            }
        }
    }

    /// Advisory only: how much of the PnL is attributable to each
    /// allocation's share of the original funding. Failures are logged and
    /// swallowed — the counters never gate settlement.
    async fn record_allocation_profit(
        &self,
        allocation_dists: &[LockDistribution],
        balance_dists: &[LockDistribution],
        pnl_amount: Amount,
        is_profit: bool,
    ) {
        if allocation_dists.is_empty() {
            return;
        }

        let mut funded_total = Amount::ZERO;
        for dist in allocation_dists.iter().chain(balance_dists) {
            funded_total = match funded_total.checked_add(dist.amount) {
                Ok(total) => total,
                Err(_) => return,
            };
        }
        if !funded_total.is_positive() {
            return;
        }

        for dist in allocation_dists {
            let FundingSource::Allocation(id) = dist.source else {
                continue;
            };
            let share = match pnl_amount.mul_div(dist.amount, funded_total) {
                Ok(share) if !share.is_zero() => share,
                _ => continue,
            };
            if let Err(e) = self.allocations.record_profit(&id, share, is_profit).await {
                warn!(allocation = %id, error = %e, "failed to record allocation period pnl");
            }
        }
    }
}
