//! Asset definitions.

use crate::domain::primitives::AssetSymbol;
use rust_decimal::Decimal as UsdPrice;
use serde::{Deserialize, Serialize};

/// A tradable asset.
///
/// `decimals` is immutable once balances reference the asset; `usd_price` is
/// advisory, used only for USD-equivalent reporting and never for ledger
/// arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: AssetSymbol,
    pub base_asset: String,
    pub decimals: u32,
    pub usd_price: UsdPrice,
    pub is_active: bool,
}

impl Asset {
    pub fn new(symbol: AssetSymbol, base_asset: impl Into<String>, decimals: u32) -> Self {
        Asset {
            symbol,
            base_asset: base_asset.into(),
            decimals,
            usd_price: UsdPrice::ZERO,
            is_active: true,
        }
    }
}
