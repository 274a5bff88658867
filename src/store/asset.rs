//! Asset definitions supplied by the price service.
//!
//! Decimals are immutable once an asset is registered; the USD price is
//! advisory and may be refreshed at any time.

use crate::domain::{now_ms, Asset, AssetSymbol, MAX_DECIMALS};
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal as UsdPrice;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::str::FromStr;

/// Store for asset definitions.
pub struct AssetStore {
    pool: SqlitePool,
}

impl AssetStore {
    pub fn new(pool: SqlitePool) -> Self {
        AssetStore { pool }
    }

    /// Register an asset or refresh its mutable fields.
    ///
    /// # Errors
    /// `InvalidDecimals` if decimals > 30; `InvalidState` when re-registering
    /// with different decimals (balances already reference the old scale).
    pub async fn upsert(&self, asset: &Asset) -> Result<Asset> {
        if asset.decimals > MAX_DECIMALS {
            return Err(LedgerError::InvalidDecimals(asset.decimals));
        }

        if let Some(existing) = self.try_get(&asset.symbol).await? {
            if existing.decimals != asset.decimals {
                return Err(LedgerError::InvalidState(format!(
                    "asset {} decimals are immutable ({} -> {})",
                    asset.symbol, existing.decimals, asset.decimals
                )));
            }
        }

        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO assets (symbol, base_asset, decimals, usd_price, is_active,
                                created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                base_asset = excluded.base_asset,
                usd_price = excluded.usd_price,
                is_active = excluded.is_active,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(asset.symbol.as_str())
        .bind(&asset.base_asset)
        .bind(asset.decimals as i64)
        .bind(asset.usd_price.to_string())
        .bind(asset.is_active)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&asset.symbol).await
    }

    /// Look up an asset definition.
    ///
    /// # Errors
    /// `RecordNotFound` if the symbol is unknown.
    pub async fn get(&self, symbol: &AssetSymbol) -> Result<Asset> {
        self.try_get(symbol)
            .await?
            .ok_or_else(|| LedgerError::RecordNotFound(format!("asset {}", symbol)))
    }

    async fn try_get(&self, symbol: &AssetSymbol) -> Result<Option<Asset>> {
        let row = sqlx::query("SELECT * FROM assets WHERE symbol = ?")
            .bind(symbol.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let price_str: String = row.get("usd_price");
        let usd_price = UsdPrice::from_str(&price_str).map_err(|e| {
            LedgerError::InvalidState(format!("corrupt usd_price for asset {}: {}", symbol, e))
        })?;

        Ok(Some(Asset {
            symbol: AssetSymbol::new(row.get::<String, _>("symbol")),
            base_asset: row.get("base_asset"),
            decimals: row.get::<i64, _>("decimals") as u32,
            usd_price,
            is_active: row.get("is_active"),
        }))
    }

    /// Refresh the advisory USD price.
    pub async fn update_price(&self, symbol: &AssetSymbol, usd_price: UsdPrice) -> Result<Asset> {
        let rows = sqlx::query(
            "UPDATE assets SET usd_price = ?, updated_at_ms = ? WHERE symbol = ?",
        )
        .bind(usd_price.to_string())
        .bind(now_ms())
        .bind(symbol.as_str())
        .execute(&self.pool)
        .await?;

        if rows.rows_affected() == 0 {
            return Err(LedgerError::RecordNotFound(format!("asset {}", symbol)));
        }
        self.get(symbol).await
    }

    /// Toggle tradability.
    pub async fn set_active(&self, symbol: &AssetSymbol, is_active: bool) -> Result<Asset> {
        let rows = sqlx::query("UPDATE assets SET is_active = ?, updated_at_ms = ? WHERE symbol = ?")
            .bind(is_active)
            .bind(now_ms())
            .bind(symbol.as_str())
            .execute(&self.pool)
            .await?;

        if rows.rows_affected() == 0 {
            return Err(LedgerError::RecordNotFound(format!("asset {}", symbol)));
        }
        self.get(symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::init_db;
    use tempfile::TempDir;

    async fn setup() -> (AssetStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("ledger.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (AssetStore::new(pool), temp_dir)
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let (store, _temp) = setup().await;
        let asset = Asset::new(AssetSymbol::new("ETH"), "ETH", 18);

        store.upsert(&asset).await.unwrap();
        let fetched = store.get(&AssetSymbol::new("ETH")).await.unwrap();
        assert_eq!(fetched.decimals, 18);
        assert!(fetched.is_active);
    }

    #[tokio::test]
    async fn test_decimals_are_immutable() {
        let (store, _temp) = setup().await;
        store
            .upsert(&Asset::new(AssetSymbol::new("BTC"), "BTC", 8))
            .await
            .unwrap();

        let result = store
            .upsert(&Asset::new(AssetSymbol::new("BTC"), "BTC", 6))
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidState(_))));

        let unchanged = store.get(&AssetSymbol::new("BTC")).await.unwrap();
        assert_eq!(unchanged.decimals, 8);
    }

    #[tokio::test]
    async fn test_decimals_out_of_range_rejected() {
        let (store, _temp) = setup().await;
        let result = store
            .upsert(&Asset::new(AssetSymbol::new("XXX"), "XXX", 31))
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidDecimals(31))));
    }

    #[tokio::test]
    async fn test_update_price_is_advisory_only() {
        let (store, _temp) = setup().await;
        store
            .upsert(&Asset::new(AssetSymbol::new("ETH"), "ETH", 18))
            .await
            .unwrap();

        let updated = store
            .update_price(&AssetSymbol::new("ETH"), UsdPrice::from_str("3124.55").unwrap())
            .await
            .unwrap();
        assert_eq!(updated.usd_price, UsdPrice::from_str("3124.55").unwrap());
        assert_eq!(updated.decimals, 18);
    }

    #[tokio::test]
    async fn test_unknown_asset_is_not_found() {
        let (store, _temp) = setup().await;
        let result = store.get(&AssetSymbol::new("NOPE")).await;
        assert!(matches!(result, Err(LedgerError::RecordNotFound(_))));

        let result = store
            .update_price(&AssetSymbol::new("NOPE"), UsdPrice::ZERO)
            .await;
        assert!(matches!(result, Err(LedgerError::RecordNotFound(_))));
    }
}
