//! Per-(wallet, asset, network) balance records.
//!
//! Each record tracks available and locked smallest-unit amounts plus
//! lifetime counters. Records are created on first deposit or account
//! initialization and never deleted. Every mutation is a versioned
//! compare-and-swap retried through [`with_conflict_retry`], so available
//! and locked can never go negative and no update is ever lost.

use crate::db::with_conflict_retry;
use crate::domain::{now_ms, Amount, AssetSymbol, BalanceId, Network, WalletId};
use crate::error::{LedgerError, Result};
use crate::store::parse_stored_amount;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

/// A single balance ledger record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceRecord {
    pub id: BalanceId,
    pub wallet_id: WalletId,
    pub asset: AssetSymbol,
    pub network: Network,
    pub available: Amount,
    pub locked: Amount,
    pub total_deposited: Amount,
    pub total_allocated: Amount,
    pub total_withdrawn: Amount,
    pub realized_pnl: Amount,
    pub last_deposit_at_ms: Option<i64>,
    pub last_withdrawal_at_ms: Option<i64>,
    pub last_synced_at_ms: Option<i64>,
    pub version: i64,
}

impl BalanceRecord {
    /// Derived total; never stored.
    pub fn total(&self) -> Result<Amount> {
        self.available.checked_add(self.locked)
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let id_str: String = row.get("id");
        let id = BalanceId::parse(&id_str)
            .ok_or_else(|| LedgerError::InvalidState(format!("corrupt balance id {}", id_str)))?;
        Ok(BalanceRecord {
            id,
            wallet_id: WalletId::new(row.get::<String, _>("wallet_id")),
            asset: AssetSymbol::new(row.get::<String, _>("asset")),
            network: Network::new(row.get::<String, _>("network")),
            available: parse_stored_amount(row, "available", "balances", &id_str)?,
            locked: parse_stored_amount(row, "locked", "balances", &id_str)?,
            total_deposited: parse_stored_amount(row, "total_deposited", "balances", &id_str)?,
            total_allocated: parse_stored_amount(row, "total_allocated", "balances", &id_str)?,
            total_withdrawn: parse_stored_amount(row, "total_withdrawn", "balances", &id_str)?,
            realized_pnl: parse_stored_amount(row, "realized_pnl", "balances", &id_str)?,
            last_deposit_at_ms: row.get("last_deposit_at_ms"),
            last_withdrawal_at_ms: row.get("last_withdrawal_at_ms"),
            last_synced_at_ms: row.get("last_synced_at_ms"),
            version: row.get("version"),
        })
    }
}

enum CreditKind {
    Deposit,
    AllocationReturn,
}

/// Store for balance records.
pub struct BalanceStore {
    pool: SqlitePool,
}

impl BalanceStore {
    pub fn new(pool: SqlitePool) -> Self {
        BalanceStore { pool }
    }

    /// Fetch-or-insert a zero-initialized record for the key. Idempotent.
    pub async fn get_or_create(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
        network: &Network,
    ) -> Result<BalanceRecord> {
        sqlx::query(
            r#"
            INSERT INTO balances (id, wallet_id, asset, network)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(wallet_id, asset, network) DO NOTHING
            "#,
        )
        .bind(BalanceId::generate().to_string())
        .bind(wallet.as_str())
        .bind(asset.as_str())
        .bind(network.as_str())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM balances WHERE wallet_id = ? AND asset = ? AND network = ?")
            .bind(wallet.as_str())
            .bind(asset.as_str())
            .bind(network.as_str())
            .fetch_one(&self.pool)
            .await?;

        BalanceRecord::from_row(&row)
    }

    pub async fn fetch(&self, id: &BalanceId) -> Result<Option<BalanceRecord>> {
        let row = sqlx::query("SELECT * FROM balances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(BalanceRecord::from_row).transpose()
    }

    async fn require(&self, id: &BalanceId) -> Result<BalanceRecord> {
        self.fetch(id)
            .await?
            .ok_or_else(|| LedgerError::RecordNotFound(format!("balance {}", id)))
    }

    /// Deposit-sweep credit: available and total_deposited grow together.
    ///
    /// # Errors
    /// `InvalidAmount` unless amount > 0.
    pub async fn add_available(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
        network: &Network,
        amount: Amount,
    ) -> Result<BalanceRecord> {
        self.credit(wallet, asset, network, amount, CreditKind::Deposit)
            .await
    }

    /// Expiry-sweep credit: funds returning from an expired allocation.
    pub async fn add_from_allocation(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
        network: &Network,
        amount: Amount,
    ) -> Result<BalanceRecord> {
        self.credit(wallet, asset, network, amount, CreditKind::AllocationReturn)
            .await
    }

    async fn credit(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
        network: &Network,
        amount: Amount,
        kind: CreditKind,
    ) -> Result<BalanceRecord> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "credit must be positive, got {}",
                amount
            )));
        }

        let id = self.get_or_create(wallet, asset, network).await?.id;
        with_conflict_retry(&format!("balance {}", id), || {
            self.try_credit(&id, amount, &kind)
        })
        .await
    }

    async fn try_credit(
        &self,
        id: &BalanceId,
        amount: Amount,
        kind: &CreditKind,
    ) -> Result<Option<BalanceRecord>> {
        let record = self.require(id).await?;
        let available = record.available.checked_add(amount)?;
        let now = now_ms();

        let rows = match kind {
            CreditKind::Deposit => {
                let total_deposited = record.total_deposited.checked_add(amount)?;
                sqlx::query(
                    r#"
                    UPDATE balances
                    SET available = ?, total_deposited = ?, last_deposit_at_ms = ?,
                        last_synced_at_ms = ?, version = version + 1
                    WHERE id = ? AND version = ?
                    "#,
                )
                .bind(available.to_string())
                .bind(total_deposited.to_string())
                .bind(now)
                .bind(now)
                .bind(id.to_string())
                .bind(record.version)
                .execute(&self.pool)
                .await?
            }
            CreditKind::AllocationReturn => {
                let total_allocated = record.total_allocated.checked_add(amount)?;
                sqlx::query(
                    r#"
                    UPDATE balances
                    SET available = ?, total_allocated = ?, version = version + 1
                    WHERE id = ? AND version = ?
                    "#,
                )
                .bind(available.to_string())
                .bind(total_allocated.to_string())
                .bind(id.to_string())
                .bind(record.version)
                .execute(&self.pool)
                .await?
            }
        };

        if rows.rows_affected() == 0 {
            return Ok(None);
        }
        self.require(id).await.map(Some)
    }

    /// Move `amount` from available to locked on this specific record.
    ///
    /// # Errors
    /// `InsufficientFunds` (with shortfall) if available < amount.
    pub async fn lock_exact(&self, id: &BalanceId, amount: Amount) -> Result<BalanceRecord> {
        require_positive(amount)?;
        with_conflict_retry(&format!("balance {}", id), || self.try_lock(id, amount)).await
    }

    async fn try_lock(&self, id: &BalanceId, amount: Amount) -> Result<Option<BalanceRecord>> {
        let record = self.require(id).await?;
        if !record.available.is_greater_or_equal(amount) {
            return Err(LedgerError::InsufficientFunds {
                shortfall: amount.checked_sub(record.available)?,
            });
        }
        let available = record.available.checked_sub(amount)?;
        let locked = record.locked.checked_add(amount)?;
        self.swap_amounts(id, record.version, available, locked).await
    }

    /// Inverse of [`lock_exact`](Self::lock_exact).
    ///
    /// # Errors
    /// `InvalidState` if locked < amount (double release or bad replay).
    pub async fn unlock_exact(&self, id: &BalanceId, amount: Amount) -> Result<BalanceRecord> {
        require_positive(amount)?;
        with_conflict_retry(&format!("balance {}", id), || self.try_unlock(id, amount)).await
    }

    async fn try_unlock(&self, id: &BalanceId, amount: Amount) -> Result<Option<BalanceRecord>> {
        let record = self.require(id).await?;
        if !record.locked.is_greater_or_equal(amount) {
            return Err(LedgerError::InvalidState(format!(
                "unlock {} exceeds locked {} on balance {}",
                amount, record.locked, id
            )));
        }
        let available = record.available.checked_add(amount)?;
        let locked = record.locked.checked_sub(amount)?;
        self.swap_amounts(id, record.version, available, locked).await
    }

    /// Apply settled PnL to available and the running realized_pnl counter.
    ///
    /// A loss larger than available is refused (`InsufficientFunds`) so a
    /// negative balance never persists; callers sequence unlock-before-settle.
    pub async fn settle_pnl(
        &self,
        id: &BalanceId,
        amount: Amount,
        is_profit: bool,
    ) -> Result<BalanceRecord> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidAmount(format!(
                "pnl amount must be unsigned, got {}",
                amount
            )));
        }
        with_conflict_retry(&format!("balance {}", id), || {
            self.try_settle_pnl(id, amount, is_profit)
        })
        .await
    }

    async fn try_settle_pnl(
        &self,
        id: &BalanceId,
        amount: Amount,
        is_profit: bool,
    ) -> Result<Option<BalanceRecord>> {
        let record = self.require(id).await?;
        let (available, realized_pnl) = if is_profit {
            (
                record.available.checked_add(amount)?,
                record.realized_pnl.checked_add(amount)?,
            )
        } else {
            if !record.available.is_greater_or_equal(amount) {
                return Err(LedgerError::InsufficientFunds {
                    shortfall: amount.checked_sub(record.available)?,
                });
            }
            (
                record.available.checked_sub(amount)?,
                record.realized_pnl.checked_sub(amount)?,
            )
        };

        let rows = sqlx::query(
            r#"
            UPDATE balances
            SET available = ?, realized_pnl = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(available.to_string())
        .bind(realized_pnl.to_string())
        .bind(id.to_string())
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        if rows.rows_affected() == 0 {
            return Ok(None);
        }
        self.require(id).await.map(Some)
    }

    /// Finalize an approved withdrawal: consumes previously locked funds.
    ///
    /// # Errors
    /// `InvalidState` if locked < amount (withdrawal was not locked first).
    pub async fn deduct_for_withdrawal(
        &self,
        id: &BalanceId,
        amount: Amount,
    ) -> Result<BalanceRecord> {
        require_positive(amount)?;
        with_conflict_retry(&format!("balance {}", id), || self.try_deduct(id, amount)).await
    }

    async fn try_deduct(&self, id: &BalanceId, amount: Amount) -> Result<Option<BalanceRecord>> {
        let record = self.require(id).await?;
        if !record.locked.is_greater_or_equal(amount) {
            return Err(LedgerError::InvalidState(format!(
                "withdrawal deduct {} exceeds locked {} on balance {}",
                amount, record.locked, id
            )));
        }
        let locked = record.locked.checked_sub(amount)?;
        let total_withdrawn = record.total_withdrawn.checked_add(amount)?;

        let rows = sqlx::query(
            r#"
            UPDATE balances
            SET locked = ?, total_withdrawn = ?, last_withdrawal_at_ms = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(locked.to_string())
        .bind(total_withdrawn.to_string())
        .bind(now_ms())
        .bind(id.to_string())
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        if rows.rows_affected() == 0 {
            return Ok(None);
        }
        self.require(id).await.map(Some)
    }

    /// Records with spendable funds for (wallet, asset), available-descending,
    /// records on `preferred_network` first.
    ///
    /// Filtering and ordering happen in Rust: amounts live in TEXT columns and
    /// SQLite would compare them lexicographically.
    pub async fn funding_candidates(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
        preferred_network: Option<&Network>,
    ) -> Result<Vec<BalanceRecord>> {
        let mut candidates: Vec<BalanceRecord> = self
            .all_for_asset(wallet, asset)
            .await?
            .into_iter()
            .filter(|r| r.available.is_positive())
            .collect();

        candidates.sort_by(|a, b| b.available.cmp(&a.available));
        if let Some(network) = preferred_network {
            // Stable: keeps available-descending order within each group.
            candidates.sort_by_key(|r| r.network != *network);
        }
        Ok(candidates)
    }

    /// The record with the greatest available for (wallet, asset), if any
    /// record exists at all. Used by the settlement fallback path.
    pub async fn best_for_asset(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
    ) -> Result<Option<BalanceRecord>> {
        let mut records = self.all_for_asset(wallet, asset).await?;
        records.sort_by(|a, b| b.available.cmp(&a.available));
        Ok(records.into_iter().next())
    }

    async fn all_for_asset(
        &self,
        wallet: &WalletId,
        asset: &AssetSymbol,
    ) -> Result<Vec<BalanceRecord>> {
        let rows = sqlx::query("SELECT * FROM balances WHERE wallet_id = ? AND asset = ?")
            .bind(wallet.as_str())
            .bind(asset.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(BalanceRecord::from_row).collect()
    }

    async fn swap_amounts(
        &self,
        id: &BalanceId,
        expected_version: i64,
        available: Amount,
        locked: Amount,
    ) -> Result<Option<BalanceRecord>> {
        let rows = sqlx::query(
            r#"
            UPDATE balances
            SET available = ?, locked = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(available.to_string())
        .bind(locked.to_string())
        .bind(id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if rows.rows_affected() == 0 {
            return Ok(None);
        }
        self.require(id).await.map(Some)
    }
}

fn require_positive(amount: Amount) -> Result<()> {
    if !amount.is_positive() {
        return Err(LedgerError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}
