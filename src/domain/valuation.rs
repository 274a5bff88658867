//! Advisory USD-equivalent valuation.
//!
//! Used for reporting and operator logs only; never feeds back into ledger
//! arithmetic (the advisory price has no bearing on lock/settle math).

use crate::domain::amount::Amount;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal as UsdPrice;
use std::str::FromStr;

/// USD-equivalent of `amount` smallest units at the given advisory price.
///
/// # Errors
/// `InvalidDecimals` if decimals > 30; `InvalidAmount` if the readable form
/// exceeds rust_decimal's mantissa (advisory values this large are not
/// representable and callers should log and move on).
pub fn usd_value(amount: Amount, decimals: u32, usd_price: UsdPrice) -> Result<UsdPrice> {
    let readable = amount.to_readable_unit(decimals)?;
    let quantity = UsdPrice::from_str(&readable)
        .map_err(|e| LedgerError::InvalidAmount(format!("usd valuation of {}: {}", readable, e)))?;
    quantity
        .checked_mul(usd_price)
        .ok_or_else(|| LedgerError::InvalidAmount("usd valuation overflow".to_string()))
}
