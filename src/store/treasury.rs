//! Treasury wallet balance records.
//!
//! Structurally a balance ledger scoped to platform treasury wallets, with
//! separate lifetime counters for sweeps-in versus the two withdrawal
//! directions. Deducts without a pinned network consume records greedily by
//! available-descending, all-or-nothing.

use crate::db::with_conflict_retry;
use crate::domain::{Amount, AssetSymbol, Network, TreasuryBalanceId, TreasuryWalletId};
use crate::error::{LedgerError, PartialFailure, RecordFailure, Result};
use crate::store::parse_stored_amount;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::error;

/// Direction of a treasury deduction, selecting the lifetime counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalKind {
    /// Paying out an approved user withdrawal.
    ToUser,
    /// Moving funds to an admin-controlled wallet.
    ToAdmin,
}

/// A single treasury balance record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreasuryBalanceRecord {
    pub id: TreasuryBalanceId,
    pub treasury_wallet_id: TreasuryWalletId,
    pub asset: AssetSymbol,
    pub network: Network,
    pub available: Amount,
    pub locked: Amount,
    pub total_swept_in: Amount,
    pub total_withdrawn_to_users: Amount,
    pub total_withdrawn_to_admin: Amount,
    pub version: i64,
}

impl TreasuryBalanceRecord {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let id_str: String = row.get("id");
        let id = TreasuryBalanceId::parse(&id_str).ok_or_else(|| {
            LedgerError::InvalidState(format!("corrupt treasury balance id {}", id_str))
        })?;
        Ok(TreasuryBalanceRecord {
            id,
            treasury_wallet_id: TreasuryWalletId::new(row.get::<String, _>("treasury_wallet_id")),
            asset: AssetSymbol::new(row.get::<String, _>("asset")),
            network: Network::new(row.get::<String, _>("network")),
            available: parse_stored_amount(row, "available", "treasury_balances", &id_str)?,
            locked: parse_stored_amount(row, "locked", "treasury_balances", &id_str)?,
            total_swept_in: parse_stored_amount(row, "total_swept_in", "treasury_balances", &id_str)?,
            total_withdrawn_to_users: parse_stored_amount(
                row,
                "total_withdrawn_to_users",
                "treasury_balances",
                &id_str,
            )?,
            total_withdrawn_to_admin: parse_stored_amount(
                row,
                "total_withdrawn_to_admin",
                "treasury_balances",
                &id_str,
            )?,
            version: row.get("version"),
        })
    }
}

/// One slice of a treasury deduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreasuryDeduction {
    pub record_id: TreasuryBalanceId,
    pub network: Network,
    pub amount: Amount,
}

/// Store for treasury balance records.
pub struct TreasuryStore {
    pool: SqlitePool,
}

impl TreasuryStore {
    pub fn new(pool: SqlitePool) -> Self {
        TreasuryStore { pool }
    }

    /// Fetch-or-insert a zero-initialized record for the key. Idempotent.
    pub async fn get_or_create(
        &self,
        treasury_wallet: &TreasuryWalletId,
        asset: &AssetSymbol,
        network: &Network,
    ) -> Result<TreasuryBalanceRecord> {
        sqlx::query(
            r#"
            INSERT INTO treasury_balances (id, treasury_wallet_id, asset, network)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(treasury_wallet_id, asset, network) DO NOTHING
            "#,
        )
        .bind(TreasuryBalanceId::generate().to_string())
        .bind(treasury_wallet.as_str())
        .bind(asset.as_str())
        .bind(network.as_str())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM treasury_balances
             WHERE treasury_wallet_id = ? AND asset = ? AND network = ?",
        )
        .bind(treasury_wallet.as_str())
        .bind(asset.as_str())
        .bind(network.as_str())
        .fetch_one(&self.pool)
        .await?;

        TreasuryBalanceRecord::from_row(&row)
    }

    pub async fn fetch(&self, id: &TreasuryBalanceId) -> Result<Option<TreasuryBalanceRecord>> {
        let row = sqlx::query("SELECT * FROM treasury_balances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(TreasuryBalanceRecord::from_row).transpose()
    }

    async fn require(&self, id: &TreasuryBalanceId) -> Result<TreasuryBalanceRecord> {
        self.fetch(id)
            .await?
            .ok_or_else(|| LedgerError::RecordNotFound(format!("treasury balance {}", id)))
    }

    /// Deposit-sweep credit from a confirmed on-chain transfer.
    ///
    /// # Errors
    /// `InvalidAmount` unless amount > 0.
    pub async fn add_swept_in(
        &self,
        treasury_wallet: &TreasuryWalletId,
        asset: &AssetSymbol,
        network: &Network,
        amount: Amount,
    ) -> Result<TreasuryBalanceRecord> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "sweep credit must be positive, got {}",
                amount
            )));
        }

        let id = self.get_or_create(treasury_wallet, asset, network).await?.id;
        with_conflict_retry(&format!("treasury balance {}", id), || async {
            let record = self.require(&id).await?;
            let available = record.available.checked_add(amount)?;
            let total_swept_in = record.total_swept_in.checked_add(amount)?;

            let rows = sqlx::query(
                r#"
                UPDATE treasury_balances
                SET available = ?, total_swept_in = ?, version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(available.to_string())
            .bind(total_swept_in.to_string())
            .bind(id.to_string())
            .bind(record.version)
            .execute(&self.pool)
            .await?;

            if rows.rows_affected() == 0 {
                return Ok(None);
            }
            self.require(&id).await.map(Some)
        })
        .await
    }

    /// Move `amount` from available to locked on this specific record.
    pub async fn lock_exact(
        &self,
        id: &TreasuryBalanceId,
        amount: Amount,
    ) -> Result<TreasuryBalanceRecord> {
        require_positive(amount)?;
        with_conflict_retry(&format!("treasury balance {}", id), || async {
            let record = self.require(id).await?;
            if !record.available.is_greater_or_equal(amount) {
                return Err(LedgerError::InsufficientFunds {
                    shortfall: amount.checked_sub(record.available)?,
                });
            }
            let available = record.available.checked_sub(amount)?;
            let locked = record.locked.checked_add(amount)?;
            self.swap_amounts(id, record.version, available, locked).await
        })
        .await
    }

    /// Inverse of [`lock_exact`](Self::lock_exact).
    pub async fn unlock_exact(
        &self,
        id: &TreasuryBalanceId,
        amount: Amount,
    ) -> Result<TreasuryBalanceRecord> {
        require_positive(amount)?;
        with_conflict_retry(&format!("treasury balance {}", id), || async {
            let record = self.require(id).await?;
            if !record.locked.is_greater_or_equal(amount) {
                return Err(LedgerError::InvalidState(format!(
                    "unlock {} exceeds locked {} on treasury balance {}",
                    amount, record.locked, id
                )));
            }
            let available = record.available.checked_add(amount)?;
            let locked = record.locked.checked_sub(amount)?;
            self.swap_amounts(id, record.version, available, locked).await
        })
        .await
    }

    /// Deduct `amount` of an asset from this treasury wallet.
    ///
    /// With `source_network` set, only that network's record is eligible.
    /// Otherwise records are consumed greedily by available-descending, same
    /// plan-then-commit discipline as multi-source locking but over a single
    /// source class: full satisfaction is verified before any record is
    /// touched, so an insufficient treasury never partially deducts.
    pub async fn deduct(
        &self,
        treasury_wallet: &TreasuryWalletId,
        asset: &AssetSymbol,
        amount: Amount,
        kind: WithdrawalKind,
        source_network: Option<&Network>,
    ) -> Result<Vec<TreasuryDeduction>> {
        require_positive(amount)?;

        // Plan.
        let mut candidates = self.available_records(treasury_wallet, asset).await?;
        if let Some(network) = source_network {
            candidates.retain(|r| r.network == *network);
        }
        candidates.sort_by(|a, b| b.available.cmp(&a.available));

        let mut remaining = amount;
        let mut plan: Vec<(TreasuryBalanceId, Network, Amount)> = Vec::new();
        for candidate in &candidates {
            if remaining.is_zero() {
                break;
            }
            let take = candidate.available.min(remaining);
            remaining = remaining.checked_sub(take)?;
            plan.push((candidate.id, candidate.network.clone(), take));
        }

        if remaining.is_positive() {
            return Err(LedgerError::InsufficientFunds {
                shortfall: remaining,
            });
        }

        // Commit.
        let mut deductions = Vec::with_capacity(plan.len());
        let mut processed = Amount::ZERO;
        let mut failures = Vec::new();
        for (id, network, take) in plan {
            match with_conflict_retry(&format!("treasury balance {}", id), || {
                self.try_deduct_record(&id, take, kind)
            })
            .await
            {
                Ok(_) => {
                    processed = processed.checked_add(take)?;
                    deductions.push(TreasuryDeduction {
                        record_id: id,
                        network,
                        amount: take,
                    });
                }
                Err(e) => failures.push(RecordFailure {
                    record: format!("treasury balance {}", id),
                    amount: take,
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            let partial = PartialFailure {
                operation: "treasury deduct".to_string(),
                processed,
                failures,
            };
            error!("CRITICAL: {}", partial);
            return Err(LedgerError::PartialFailure(partial));
        }

        Ok(deductions)
    }

    async fn try_deduct_record(
        &self,
        id: &TreasuryBalanceId,
        amount: Amount,
        kind: WithdrawalKind,
    ) -> Result<Option<TreasuryBalanceRecord>> {
        let record = self.require(id).await?;
        if !record.available.is_greater_or_equal(amount) {
            return Err(LedgerError::InsufficientFunds {
                shortfall: amount.checked_sub(record.available)?,
            });
        }
        let available = record.available.checked_sub(amount)?;
        let (column, counter) = match kind {
            WithdrawalKind::ToUser => (
                "total_withdrawn_to_users",
                record.total_withdrawn_to_users.checked_add(amount)?,
            ),
            WithdrawalKind::ToAdmin => (
                "total_withdrawn_to_admin",
                record.total_withdrawn_to_admin.checked_add(amount)?,
            ),
        };

        let rows = sqlx::query(&format!(
            "UPDATE treasury_balances
             SET available = ?, {} = ?, version = version + 1
             WHERE id = ? AND version = ?",
            column
        ))
        .bind(available.to_string())
        .bind(counter.to_string())
        .bind(id.to_string())
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        if rows.rows_affected() == 0 {
            return Ok(None);
        }
        self.require(id).await.map(Some)
    }

    async fn available_records(
        &self,
        treasury_wallet: &TreasuryWalletId,
        asset: &AssetSymbol,
    ) -> Result<Vec<TreasuryBalanceRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM treasury_balances WHERE treasury_wallet_id = ? AND asset = ?",
        )
        .bind(treasury_wallet.as_str())
        .bind(asset.as_str())
        .fetch_all(&self.pool)
        .await?;

        let records: Vec<TreasuryBalanceRecord> = rows
            .iter()
            .map(TreasuryBalanceRecord::from_row)
            .collect::<Result<_>>()?;
        Ok(records
            .into_iter()
            .filter(|r| r.available.is_positive())
            .collect())
    }

    async fn swap_amounts(
        &self,
        id: &TreasuryBalanceId,
        expected_version: i64,
        available: Amount,
        locked: Amount,
    ) -> Result<Option<TreasuryBalanceRecord>> {
        let rows = sqlx::query(
            r#"
            UPDATE treasury_balances
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
