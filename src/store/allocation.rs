//! Time-boxed promotional allocation records.
//!
//! Unlike balances, several allocation records may coexist for the same
//! (user, trading account, asset), each with its own expiry. Candidates are
//! consumed FIFO by expiry (soonest-expiring first) so the least value is
//! forfeited when allocations lapse. The periodic expiry sweep returns any
//! unlocked remainder to the owner's real balance.

use crate::db::with_conflict_retry;
use crate::domain::valuation::usd_value;
use crate::domain::{
    now_ms, AllocationId, Amount, AssetSymbol, Network, TradingAccountId, UserId, WalletId,
};
use crate::error::{LedgerError, RecordFailure, Result};
use crate::store::asset::AssetStore;
use crate::store::balance::BalanceStore;
use crate::store::parse_stored_amount;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{error, info};

/// One-directional lifecycle: active -> expired -> withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    Active,
    Expired,
    Withdrawn,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Active => "active",
            AllocationStatus::Expired => "expired",
            AllocationStatus::Withdrawn => "withdrawn",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AllocationStatus::Active),
            "expired" => Ok(AllocationStatus::Expired),
            "withdrawn" => Ok(AllocationStatus::Withdrawn),
            other => Err(LedgerError::InvalidState(format!(
                "unknown allocation status {:?}",
                other
            ))),
        }
    }
}

/// A single allocation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub id: AllocationId,
    pub user_id: UserId,
    pub trading_account_id: TradingAccountId,
    /// Destination wallet for the expiry-sweep reconciliation, captured at
    /// grant time.
    pub wallet_id: WalletId,
    pub asset: AssetSymbol,
    pub available: Amount,
    pub locked: Amount,
    pub granted: Amount,
    pub profit_during_period: Amount,
    pub status: AllocationStatus,
    pub expires_at_ms: i64,
    pub created_at_ms: i64,
    pub version: i64,
}

impl AllocationRecord {
    pub fn is_active(&self, now: i64) -> bool {
        self.status == AllocationStatus::Active && self.expires_at_ms > now
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let id_str: String = row.get("id");
        let id = AllocationId::parse(&id_str).ok_or_else(|| {
            LedgerError::InvalidState(format!("corrupt allocation id {}", id_str))
        })?;
        Ok(AllocationRecord {
            id,
            user_id: UserId::new(row.get::<String, _>("user_id")),
            trading_account_id: TradingAccountId::new(row.get::<String, _>("trading_account_id")),
            wallet_id: WalletId::new(row.get::<String, _>("wallet_id")),
            asset: AssetSymbol::new(row.get::<String, _>("asset")),
            available: parse_stored_amount(row, "available", "allocations", &id_str)?,
            locked: parse_stored_amount(row, "locked", "allocations", &id_str)?,
            granted: parse_stored_amount(row, "granted", "allocations", &id_str)?,
            profit_during_period: parse_stored_amount(
                row,
                "profit_during_period",
                "allocations",
                &id_str,
            )?,
            status: AllocationStatus::parse(&row.get::<String, _>("status"))?,
            expires_at_ms: row.get("expires_at_ms"),
            created_at_ms: row.get("created_at_ms"),
            version: row.get("version"),
        })
    }
}

/// Outcome of one expiry-sweep run.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Records flipped active -> expired this run.
    pub newly_expired: u64,
    /// Records whose remainder was returned to a real balance.
    pub reconciled: usize,
    /// Total smallest units returned across all reconciled records.
    pub returned_total: Amount,
    /// Records still holding locked funds, left for a later run.
    pub deferred_locked: usize,
    /// Per-record reconciliation failures (logged, retried next run).
    pub failures: Vec<RecordFailure>,
}

/// Store for allocation records.
pub struct AllocationStore {
    pool: SqlitePool,
}

impl AllocationStore {
    pub fn new(pool: SqlitePool) -> Self {
        AllocationStore { pool }
    }

    /// Create an allocation grant.
    ///
    /// # Errors
    /// `InvalidAmount` unless amount > 0.
    pub async fn grant(
        &self,
        user: &UserId,
        account: &TradingAccountId,
        wallet: &WalletId,
        asset: &AssetSymbol,
        amount: Amount,
        expires_at_ms: i64,
    ) -> Result<AllocationRecord> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "allocation grant must be positive, got {}",
                amount
            )));
        }

        let id = AllocationId::generate();
        sqlx::query(
            r#"
            INSERT INTO allocations
                (id, user_id, trading_account_id, wallet_id, asset,
                 available, granted, status, expires_at_ms, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(user.as_str())
        .bind(account.as_str())
        .bind(wallet.as_str())
        .bind(asset.as_str())
        .bind(amount.to_string())
        .bind(amount.to_string())
        .bind(expires_at_ms)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        self.require(&id).await
    }

    pub async fn fetch(&self, id: &AllocationId) -> Result<Option<AllocationRecord>> {
        let row = sqlx::query("SELECT * FROM allocations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(AllocationRecord::from_row).transpose()
    }

    async fn require(&self, id: &AllocationId) -> Result<AllocationRecord> {
        self.fetch(id)
            .await?
            .ok_or_else(|| LedgerError::RecordNotFound(format!("allocation {}", id)))
    }

    /// Active, unexpired allocations with spendable funds, soonest-expiring
    /// first (the FIFO consumption policy).
    pub async fn funding_candidates(
        &self,
        user: &UserId,
        account: &TradingAccountId,
        asset: &AssetSymbol,
    ) -> Result<Vec<AllocationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM allocations
            WHERE user_id = ? AND trading_account_id = ? AND asset = ?
              AND status = 'active' AND expires_at_ms > ?
            ORDER BY expires_at_ms ASC, created_at_ms ASC
            "#,
        )
        .bind(user.as_str())
        .bind(account.as_str())
        .bind(asset.as_str())
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?;

        let records: Vec<AllocationRecord> = rows
            .iter()
            .map(AllocationRecord::from_row)
            .collect::<Result<_>>()?;
        Ok(records
            .into_iter()
            .filter(|r| r.available.is_positive())
            .collect())
    }

    /// Move `amount` from available to locked on this specific record.
    ///
    /// # Errors
    /// `InvalidState` if the allocation is no longer active;
    /// `InsufficientFunds` if available < amount.
    pub async fn lock_exact(&self, id: &AllocationId, amount: Amount) -> Result<AllocationRecord> {
        require_positive(amount)?;
        with_conflict_retry(&format!("allocation {}", id), || self.try_lock(id, amount)).await
    }

    async fn try_lock(&self, id: &AllocationId, amount: Amount) -> Result<Option<AllocationRecord>> {
        let record = self.require(id).await?;
        if !record.is_active(now_ms()) {
            return Err(LedgerError::InvalidState(format!(
                "allocation {} is {} and cannot fund a lock",
                id,
                record.status.as_str()
            )));
        }
        if !record.available.is_greater_or_equal(amount) {
            return Err(LedgerError::InsufficientFunds {
                shortfall: amount.checked_sub(record.available)?,
            });
        }
        let available = record.available.checked_sub(amount)?;
        let locked = record.locked.checked_add(amount)?;
        self.swap_amounts(id, record.version, available, locked).await
    }

    /// Inverse of [`lock_exact`](Self::lock_exact). Works on expired records
    /// too: funds committed to an order must always be releasable.
    pub async fn unlock_exact(&self, id: &AllocationId, amount: Amount) -> Result<AllocationRecord> {
        require_positive(amount)?;
        with_conflict_retry(&format!("allocation {}", id), || {
            self.try_unlock(id, amount)
        })
        .await
    }

    async fn try_unlock(
        &self,
        id: &AllocationId,
        amount: Amount,
    ) -> Result<Option<AllocationRecord>> {
        let record = self.require(id).await?;
        if !record.locked.is_greater_or_equal(amount) {
            return Err(LedgerError::InvalidState(format!(
                "unlock {} exceeds locked {} on allocation {}",
                amount, record.locked, id
            )));
        }
        let available = record.available.checked_add(amount)?;
        let locked = record.locked.checked_sub(amount)?;
        self.swap_amounts(id, record.version, available, locked).await
    }

    /// Adjust the advisory profit_during_period counter. Real PnL always
    /// lands on balance records; this counter only reports how the
    /// allocation performed while it was live.
    pub async fn record_profit(
        &self,
        id: &AllocationId,
        amount: Amount,
        is_profit: bool,
    ) -> Result<AllocationRecord> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidAmount(format!(
                "pnl amount must be unsigned, got {}",
                amount
            )));
        }
        with_conflict_retry(&format!("allocation {}", id), || {
            self.try_record_profit(id, amount, is_profit)
        })
        .await
    }

    async fn try_record_profit(
        &self,
        id: &AllocationId,
        amount: Amount,
        is_profit: bool,
    ) -> Result<Option<AllocationRecord>> {
        let record = self.require(id).await?;
        let profit = if is_profit {
            record.profit_during_period.checked_add(amount)?
        } else {
            record.profit_during_period.checked_sub(amount)?
        };

        let rows = sqlx::query(
            r#"
            UPDATE allocations
            SET profit_during_period = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(profit.to_string())
        .bind(id.to_string())
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        if rows.rows_affected() == 0 {
            return Ok(None);
        }
        self.require(id).await.map(Some)
    }

    /// Periodic expiry sweep. Idempotent: a run that finds nothing eligible
    /// is a no-op.
    ///
    /// 1. Flip every lapsed active record to expired (it stops being a
    ///    funding candidate immediately).
    /// 2. Return each expired record's unlocked remainder to the owner's
    ///    real balance and complete the withdrawn transition.
    /// 3. Records still holding locked funds (an open order outlived the
    ///    allocation) are deferred; a later run finishes them once the
    ///    order settles and unlocks.
    pub async fn sweep_expired(
        &self,
        balances: &BalanceStore,
        assets: &AssetStore,
        default_network: &Network,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let flipped = sqlx::query(
            "UPDATE allocations SET status = 'expired', version = version + 1
             WHERE status = 'active' AND expires_at_ms <= ?",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        report.newly_expired = flipped.rows_affected();

        let rows = sqlx::query("SELECT * FROM allocations WHERE status = 'expired'")
            .fetch_all(&self.pool)
            .await?;

        for row in &rows {
            let record = AllocationRecord::from_row(row)?;
            match self.reconcile_expired(&record, balances, assets, default_network).await {
                Ok(Reconciled::Returned { moved, deferred }) => {
                    report.reconciled += 1;
                    report.returned_total = report.returned_total.checked_add(moved)?;
                    if deferred {
                        report.deferred_locked += 1;
                    }
                }
                Ok(Reconciled::DeferredLocked) => report.deferred_locked += 1,
                Ok(Reconciled::Nothing) => {}
                Err(e) => {
                    error!(
                        allocation = %record.id,
                        error = %e,
                        "CRITICAL: expiry reconciliation failed, will retry next sweep"
                    );
                    report.failures.push(RecordFailure {
                        record: format!("allocation {}", record.id),
                        amount: record.available,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn reconcile_expired(
        &self,
        record: &AllocationRecord,
        balances: &BalanceStore,
        assets: &AssetStore,
        default_network: &Network,
    ) -> Result<Reconciled> {
        if record.available.is_positive() {
            let moved = with_conflict_retry(&format!("allocation {}", record.id), || {
                self.try_drain_available(&record.id)
            })
            .await?;
            if moved.is_zero() {
                // A concurrent sweep drained this record first.
                return Ok(Reconciled::Nothing);
            }

            // Debited from the allocation but not yet credited: a failure
            // between these two steps leaves funds in limbo until an
            // operator reconciles, hence the CRITICAL marker upstream.
            let network = match balances.best_for_asset(&record.wallet_id, &record.asset).await? {
                Some(balance) => balance.network,
                None => default_network.clone(),
            };
            balances
                .add_from_allocation(&record.wallet_id, &record.asset, &network, moved)
                .await?;

            match assets.get(&record.asset).await {
                Ok(asset) => {
                    let usd = usd_value(moved, asset.decimals, asset.usd_price).ok();
                    info!(
                        allocation = %record.id,
                        asset = %record.asset,
                        returned = %moved,
                        usd = usd.map(|v| v.to_string()).unwrap_or_default(),
                        profit_during_period = %record.profit_during_period,
                        "expired allocation returned to balance"
                    );
                }
                Err(_) => info!(
                    allocation = %record.id,
                    asset = %record.asset,
                    returned = %moved,
                    profit_during_period = %record.profit_during_period,
                    "expired allocation returned to balance"
                ),
            }

            let deferred = record.locked.is_positive();
            if !deferred {
                self.finish_withdrawn(&record.id).await?;
            }
            return Ok(Reconciled::Returned { moved, deferred });
        }

        if record.locked.is_positive() {
            return Ok(Reconciled::DeferredLocked);
        }

        self.finish_withdrawn(&record.id).await?;
        Ok(Reconciled::Nothing)
    }

    /// Zero out available, returning the amount drained.
    async fn try_drain_available(&self, id: &AllocationId) -> Result<Option<Amount>> {
        let record = self.require(id).await?;
        if !record.available.is_positive() {
            // Another sweep got here first.
            return Ok(Some(Amount::ZERO));
        }

        let rows = sqlx::query(
            "UPDATE allocations SET available = '0', version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(id.to_string())
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        if rows.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(record.available))
    }

    async fn finish_withdrawn(&self, id: &AllocationId) -> Result<()> {
        with_conflict_retry(&format!("allocation {}", id), || async {
            let record = self.require(id).await?;
            if record.status == AllocationStatus::Withdrawn {
                return Ok(Some(()));
            }
            if record.available.is_positive() || record.locked.is_positive() {
                return Err(LedgerError::InvalidState(format!(
                    "allocation {} still holds funds",
                    id
                )));
            }
            let rows = sqlx::query(
                "UPDATE allocations SET status = 'withdrawn', version = version + 1
                 WHERE id = ? AND version = ?",
            )
            .bind(id.to_string())
            .bind(record.version)
            .execute(&self.pool)
            .await?;
            Ok((rows.rows_affected() > 0).then_some(()))
        })
        .await
    }

    async fn swap_amounts(
        &self,
        id: &AllocationId,
        expected_version: i64,
        available: Amount,
        locked: Amount,
    ) -> Result<Option<AllocationRecord>> {
        let rows = sqlx::query(
            r#"
            UPDATE allocations
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

enum Reconciled {
    Returned { moved: Amount, deferred: bool },
    DeferredLocked,
    Nothing,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::init_db;
    use tempfile::TempDir;

    async fn setup() -> (AllocationStore, BalanceStore, AssetStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("ledger.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (
            AllocationStore::new(pool.clone()),
            BalanceStore::new(pool.clone()),
            AssetStore::new(pool),
            temp_dir,
        )
    }

    fn a(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    fn owner() -> (UserId, TradingAccountId, WalletId, AssetSymbol) {
        (
            UserId::new("user-1"),
            TradingAccountId::new("acct-1"),
            WalletId::new("wallet-1"),
            AssetSymbol::new("USDT"),
        )
    }

    #[tokio::test]
    async fn test_grant_creates_active_record() {
        let (store, _b, _a, _temp) = setup().await;
        let (user, account, wallet, asset) = owner();

        let record = store
            .grant(&user, &account, &wallet, &asset, a("1000"), now_ms() + 60_000)
            .await
            .unwrap();
        assert_eq!(record.status, AllocationStatus::Active);
        assert_eq!(record.available, a("1000"));
        assert_eq!(record.granted, a("1000"));
        assert!(record.is_active(now_ms()));
    }

    #[tokio::test]
    async fn test_candidates_fifo_by_expiry() {
        let (store, _b, _a, _temp) = setup().await;
        let (user, account, wallet, asset) = owner();
        let base = now_ms();

        let late = store
            .grant(&user, &account, &wallet, &asset, a("100"), base + 300_000)
            .await
            .unwrap();
        let soon = store
            .grant(&user, &account, &wallet, &asset, a("100"), base + 100_000)
            .await
            .unwrap();
        let mid = store
            .grant(&user, &account, &wallet, &asset, a("100"), base + 200_000)
            .await
            .unwrap();

        let candidates = store.funding_candidates(&user, &account, &asset).await.unwrap();
        let ids: Vec<AllocationId> = candidates.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![soon.id, mid.id, late.id]);
    }

    #[tokio::test]
    async fn test_candidates_exclude_expired_and_depleted() {
        let (store, _b, _a, _temp) = setup().await;
        let (user, account, wallet, asset) = owner();

        // Already lapsed.
        store
            .grant(&user, &account, &wallet, &asset, a("100"), now_ms() - 1000)
            .await
            .unwrap();
        // Live but fully locked.
        let depleted = store
            .grant(&user, &account, &wallet, &asset, a("100"), now_ms() + 60_000)
            .await
            .unwrap();
        store.lock_exact(&depleted.id, a("100")).await.unwrap();

        let live = store
            .grant(&user, &account, &wallet, &asset, a("100"), now_ms() + 60_000)
            .await
            .unwrap();

        let candidates = store.funding_candidates(&user, &account, &asset).await.unwrap();
        let ids: Vec<AllocationId> = candidates.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![live.id]);
    }

    #[tokio::test]
    async fn test_lock_on_expired_allocation_fails() {
        let (store, _b, _a, _temp) = setup().await;
        let (user, account, wallet, asset) = owner();
        let record = store
            .grant(&user, &account, &wallet, &asset, a("100"), now_ms() - 1000)
            .await
            .unwrap();

        let result = store.lock_exact(&record.id, a("50")).await;
        assert!(matches!(result, Err(LedgerError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_sweep_returns_remainder_to_balance() {
        let (store, balances, assets, _temp) = setup().await;
        let (user, account, wallet, asset) = owner();
        store
            .grant(&user, &account, &wallet, &asset, a("700"), now_ms() - 1000)
            .await
            .unwrap();

        let report = store
            .sweep_expired(&balances, &assets, &Network::new("ethereum"))
            .await
            .unwrap();
        assert_eq!(report.newly_expired, 1);
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.returned_total, a("700"));
        assert!(report.failures.is_empty());

        let balance = balances
            .get_or_create(&wallet, &asset, &Network::new("ethereum"))
            .await
            .unwrap();
        assert_eq!(balance.available, a("700"));
        assert_eq!(balance.total_allocated, a("700"));

        // The record completed its lifecycle.
        let swept = store
            .fetch(&report_allocation_id(&store).await)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(swept.status, AllocationStatus::Withdrawn);
        assert!(swept.available.is_zero());
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let (store, balances, assets, _temp) = setup().await;
        let (user, account, wallet, asset) = owner();
        store
            .grant(&user, &account, &wallet, &asset, a("700"), now_ms() - 1000)
            .await
            .unwrap();

        let network = Network::new("ethereum");
        store.sweep_expired(&balances, &assets, &network).await.unwrap();
        let second = store.sweep_expired(&balances, &assets, &network).await.unwrap();
        assert_eq!(second.newly_expired, 0);
        assert_eq!(second.reconciled, 0);
        assert_eq!(second.returned_total, Amount::ZERO);

        let balance = balances.get_or_create(&wallet, &asset, &network).await.unwrap();
        assert_eq!(balance.available, a("700"));
    }

    #[tokio::test]
    async fn test_sweep_defers_locked_funds_until_unlock() {
        let (store, balances, assets, _temp) = setup().await;
        let (user, account, wallet, asset) = owner();
        let record = store
            .grant(&user, &account, &wallet, &asset, a("500"), now_ms() + 200)
            .await
            .unwrap();
        store.lock_exact(&record.id, a("200")).await.unwrap();

        // Let the allocation lapse with 200 still locked.
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;

        let network = Network::new("ethereum");
        let report = store.sweep_expired(&balances, &assets, &network).await.unwrap();
        assert_eq!(report.newly_expired, 1);
        assert_eq!(report.returned_total, a("300"));

        let mid = store.fetch(&record.id).await.unwrap().unwrap();
        assert_eq!(mid.status, AllocationStatus::Expired);
        assert_eq!(mid.locked, a("200"));

        // Order settles: the lock is released, next sweep finishes the job.
        store.unlock_exact(&record.id, a("200")).await.unwrap();
        let report = store.sweep_expired(&balances, &assets, &network).await.unwrap();
        assert_eq!(report.returned_total, a("200"));

        let done = store.fetch(&record.id).await.unwrap().unwrap();
        assert_eq!(done.status, AllocationStatus::Withdrawn);

        let balance = balances.get_or_create(&wallet, &asset, &network).await.unwrap();
        assert_eq!(balance.available, a("500"));
    }

    #[tokio::test]
    async fn test_record_profit_is_signed() {
        let (store, _b, _a, _temp) = setup().await;
        let (user, account, wallet, asset) = owner();
        let record = store
            .grant(&user, &account, &wallet, &asset, a("100"), now_ms() + 60_000)
            .await
            .unwrap();

        store.record_profit(&record.id, a("40"), true).await.unwrap();
        let after = store.record_profit(&record.id, a("70"), false).await.unwrap();
        assert_eq!(after.profit_during_period, a("-30"));
        // The counter is advisory; funds are untouched.
        assert_eq!(after.available, a("100"));
    }

    async fn report_allocation_id(store: &AllocationStore) -> AllocationId {
        let rows = sqlx::query("SELECT id FROM allocations")
            .fetch_all(&store.pool)
            .await
            .unwrap();
        AllocationId::parse(&rows[0].get::<String, _>("id")).unwrap()
    }
}
