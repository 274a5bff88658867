//! Domain types for the ledger core.
//!
//! This module provides:
//! - Fixed-point smallest-unit arithmetic via the Amount type
//! - Typed identifiers for every entity the ledger references
//! - Asset definitions and advisory USD valuation
//! - Lock distribution records replayed at unlock/settle time

pub mod amount;
pub mod asset;
pub mod distribution;
pub mod primitives;
pub mod valuation;

pub use amount::{Amount, MAX_DECIMALS};
pub use asset::Asset;
pub use distribution::{FundingSource, LockDistribution, LockOutcome};
pub use primitives::{
    now_ms, AccountRef, AllocationId, AssetSymbol, BalanceId, Network, TradingAccountId,
    TreasuryBalanceId, TreasuryWalletId, UserId, WalletId,
};
