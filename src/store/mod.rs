//! Persistent stores for the ledger's funding records.
//!
//! Each store owns the pool and is the only writer for its table; records
//! are never mutated by direct field assignment elsewhere, which is what
//! keeps the available/locked non-negativity invariant enforceable in one
//! place. The [`BalanceLedger`] and [`AllocationLedger`] traits are the seam
//! the engines depend on, so callers inject stores (or substitutes) instead
//! of reaching into a global registry.

pub mod allocation;
pub mod asset;
pub mod balance;
pub mod treasury;

use crate::domain::{
    AllocationId, Amount, AssetSymbol, BalanceId, Network, TradingAccountId, UserId, WalletId,
};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub use allocation::{AllocationRecord, AllocationStatus, AllocationStore, SweepReport};
pub use asset::AssetStore;
pub use balance::{BalanceRecord, BalanceStore};
pub use treasury::{TreasuryBalanceRecord, TreasuryDeduction, TreasuryStore, WithdrawalKind};

/// Balance-record operations the lock/settlement engines depend on.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    async fn funding_candidates(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
        preferred_network: Option<&Network>,
    ) -> Result<Vec<BalanceRecord>>;

    async fn fetch(&self, id: &BalanceId) -> Result<Option<BalanceRecord>>;

    async fn lock_exact(&self, id: &BalanceId, amount: Amount) -> Result<BalanceRecord>;

    async fn unlock_exact(&self, id: &BalanceId, amount: Amount) -> Result<BalanceRecord>;

    async fn settle_pnl(&self, id: &BalanceId, amount: Amount, is_profit: bool)
        -> Result<BalanceRecord>;

    async fn best_for_asset(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
    ) -> Result<Option<BalanceRecord>>;

    async fn get_or_create(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
        network: &Network,
    ) -> Result<BalanceRecord>;
}

#[async_trait]
impl BalanceLedger for BalanceStore {
    async fn funding_candidates(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
        preferred_network: Option<&Network>,
    ) -> Result<Vec<BalanceRecord>> {
        BalanceStore::funding_candidates(self, wallet, asset, preferred_network).await
    }

    async fn fetch(&self, id: &BalanceId) -> Result<Option<BalanceRecord>> {
        BalanceStore::fetch(self, id).await
    }

    async fn lock_exact(&self, id: &BalanceId, amount: Amount) -> Result<BalanceRecord> {
        BalanceStore::lock_exact(self, id, amount).await
    }

    async fn unlock_exact(&self, id: &BalanceId, amount: Amount) -> Result<BalanceRecord> {
        BalanceStore::unlock_exact(self, id, amount).await
    }

    async fn settle_pnl(
        &self,
        id: &BalanceId,
        amount: Amount,
        is_profit: bool,
    ) -> Result<BalanceRecord> {
        BalanceStore::settle_pnl(self, id, amount, is_profit).await
    }

    async fn best_for_asset(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
    ) -> Result<Option<BalanceRecord>> {
        BalanceStore::best_for_asset(self, wallet, asset).await
    }

    async fn get_or_create(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
        network: &Network,
    ) -> Result<BalanceRecord> {
        BalanceStore::get_or_create(self, wallet, asset, network).await
    }
}

/// Allocation-record operations the lock/settlement engines depend on.
#[async_trait]
pub trait AllocationLedger: Send + Sync {
    async fn funding_candidates(
        &self,
        user: &UserId,
        account: &TradingAccountId,
        asset: &AssetSymbol,
    ) -> Result<Vec<AllocationRecord>>;

    async fn fetch(&self, id: &AllocationId) -> Result<Option<AllocationRecord>>;

    async fn lock_exact(&self, id: &AllocationId, amount: Amount) -> Result<AllocationRecord>;

    async fn unlock_exact(&self, id: &AllocationId, amount: Amount) -> Result<AllocationRecord>;

    async fn record_profit(
        &self,
        id: &AllocationId,
        amount: Amount,
        is_profit: bool,
    ) -> Result<AllocationRecord>;
}

#[async_trait]
impl AllocationLedger for AllocationStore {
    async fn funding_candidates(
        &self,
        user: &UserId,
        account: &TradingAccountId,
        asset: &AssetSymbol,
    ) -> Result<Vec<AllocationRecord>> {
        AllocationStore::funding_candidates(self, user, account, asset).await
    }

    async fn fetch(&self, id: &AllocationId) -> Result<Option<AllocationRecord>> {
        AllocationStore::fetch(self, id).await
    }

    async fn lock_exact(&self, id: &AllocationId, amount: Amount) -> Result<AllocationRecord> {
        AllocationStore::lock_exact(self, id, amount).await
    }

    async fn unlock_exact(&self, id: &AllocationId, amount: Amount) -> Result<AllocationRecord> {
        AllocationStore::unlock_exact(self, id, amount).await
    }

    async fn record_profit(
        &self,
        id: &AllocationId,
        amount: Amount,
        is_profit: bool,
    ) -> Result<AllocationRecord> {
        AllocationStore::record_profit(self, id, amount, is_profit).await
    }
}

/// Parse a TEXT amount column, mapping corruption to `InvalidState` with
/// enough context to find the bad row.
pub(crate) fn parse_stored_amount(
    row: &SqliteRow,
    column: &str,
    table: &str,
    id: &str,
) -> Result<Amount> {
    let value: String = row.get(column);
    Amount::parse(&value).map_err(|_| {
        LedgerError::InvalidState(format!(
            "corrupt amount in {}.{} for id {}: {:?}",
            table, column, id, value
        ))
    })
}
