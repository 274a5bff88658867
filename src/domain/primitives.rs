//! Domain primitives: typed identifiers, network and asset symbols.
//!
//! Entity cross-references are distinct newtypes rather than raw strings so
//! a wallet id can never be passed where an allocation id is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                $name(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                $name(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map($name)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Platform user id (owned by the auth subsystem).
    UserId
);
string_id!(
    /// User wallet id (owned by the wallet subsystem).
    WalletId
);
string_id!(
    /// Trading account id; a user may hold several.
    TradingAccountId
);
string_id!(
    /// Treasury wallet id (platform-controlled).
    TreasuryWalletId
);

uuid_id!(
    /// Id of a balance record minted by this ledger.
    BalanceId
);
uuid_id!(
    /// Id of an allocation record minted by this ledger.
    AllocationId
);
uuid_id!(
    /// Id of a treasury balance record minted by this ledger.
    TreasuryBalanceId
);

string_id!(
    /// Blockchain network a balance lives on ("ethereum", "bsc", "bitcoin").
    Network
);
string_id!(
    /// Asset ticker symbol ("BTC", "ETH", "USDT").
    AssetSymbol
);

/// Funding account reference threaded through lock/settle operations.
///
/// Bundles the identifiers the two funding stores are keyed by: allocations
/// by (user, trading account), balances by wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    pub user_id: UserId,
    pub trading_account_id: TradingAccountId,
    pub wallet_id: WalletId,
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
