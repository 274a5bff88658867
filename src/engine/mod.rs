//! Lock and settlement engines coordinating the funding stores.

pub mod locker;
pub mod settlement;

pub use locker::{LockOptions, LockPriority, MultiSourceLocker};
pub use settlement::{SettlementEngine, SettlementSummary};
