pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod store;

pub use config::Config;
pub use db::init_db;
pub use domain::{
    AccountRef, AllocationId, Amount, Asset, AssetSymbol, BalanceId, FundingSource,
    LockDistribution, LockOutcome, Network, TradingAccountId, TreasuryWalletId, UserId, WalletId,
};
pub use engine::{LockOptions, LockPriority, MultiSourceLocker, SettlementEngine};
pub use error::{LedgerError, PartialFailure};
pub use store::{
    AllocationLedger, AllocationStore, AssetStore, BalanceLedger, BalanceStore, TreasuryStore,
    WithdrawalKind,
};
