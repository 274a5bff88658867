//! Treasury flow: sweep-in, pending-withdrawal locking, multi-network payout.

use tempfile::TempDir;
use tradeledger::store::TreasuryStore;
use tradeledger::{init_db, Amount, AssetSymbol, LedgerError, Network, TreasuryWalletId, WithdrawalKind};

async fn setup() -> (TreasuryStore, TempDir) {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("ledger.db").to_string_lossy().to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    (TreasuryStore::new(pool), temp)
}

fn a(s: &str) -> Amount {
    Amount::parse(s).unwrap()
}

#[tokio::test]
async fn test_sweep_in_lock_reject_then_payout() {
    let (store, _temp) = setup().await;
    let treasury = TreasuryWalletId::new("treasury-1");
    let asset = AssetSymbol::new("ETH");
    let eth = Network::new("ethereum");

    // Deposit sweeps land from two confirmations.
    store.add_swept_in(&treasury, &asset, &eth, a("700")).await.unwrap();
    let record = store.add_swept_in(&treasury, &asset, &eth, a("300")).await.unwrap();
    assert_eq!(record.total_swept_in, a("1000"));

    // A pending user withdrawal reserves funds, then gets rejected.
    store.lock_exact(&record.id, a("400")).await.unwrap();
    let released = store.unlock_exact(&record.id, a("400")).await.unwrap();
    assert_eq!(released.available, a("1000"));

    // Approval pays out; the to-users counter moves, sweeps-in does not.
    let deductions = store
        .deduct(&treasury, &asset, a("400"), WithdrawalKind::ToUser, None)
        .await
        .unwrap();
    assert_eq!(deductions.len(), 1);

    let after = store.fetch(&record.id).await.unwrap().unwrap();
    assert_eq!(after.available, a("600"));
    assert_eq!(after.total_withdrawn_to_users, a("400"));
    assert_eq!(after.total_swept_in, a("1000"));
    assert_eq!(after.total_withdrawn_to_admin, a("0"));
}

#[tokio::test]
async fn test_admin_payout_spans_networks_greedily() {
    let (store, _temp) = setup().await;
    let treasury = TreasuryWalletId::new("treasury-1");
    let asset = AssetSymbol::new("USDT");

    store
        .add_swept_in(&treasury, &asset, &Network::new("ethereum"), a("200"))
        .await
        .unwrap();
    store
        .add_swept_in(&treasury, &asset, &Network::new("bsc"), a("800"))
        .await
        .unwrap();
    store
        .add_swept_in(&treasury, &asset, &Network::new("tron"), a("500"))
        .await
        .unwrap();

    let deductions = store
        .deduct(&treasury, &asset, a("1200"), WithdrawalKind::ToAdmin, None)
        .await
        .unwrap();

    let consumed: Vec<(&str, Amount)> = deductions
        .iter()
        .map(|d| (d.network.as_str(), d.amount))
        .collect();
    assert_eq!(
        consumed,
        vec![("bsc", a("800")), ("tron", a("400"))]
    );

    // Ethereum untouched; tron partially consumed.
    let eth = store
        .get_or_create(&treasury, &asset, &Network::new("ethereum"))
        .await
        .unwrap();
    assert_eq!(eth.available, a("200"));
    let tron = store
        .get_or_create(&treasury, &asset, &Network::new("tron"))
        .await
        .unwrap();
    assert_eq!(tron.available, a("100"));
    assert_eq!(tron.total_withdrawn_to_admin, a("400"));
}

#[tokio::test]
async fn test_shortfall_leaves_every_network_untouched() {
    let (store, _temp) = setup().await;
    let treasury = TreasuryWalletId::new("treasury-1");
    let asset = AssetSymbol::new("BTC");

    store
        .add_swept_in(&treasury, &asset, &Network::new("bitcoin"), a("100000000"))
        .await
        .unwrap();

    let result = store
        .deduct(&treasury, &asset, a("150000000"), WithdrawalKind::ToUser, None)
        .await;
    match result {
        Err(LedgerError::InsufficientFunds { shortfall }) => {
            assert_eq!(shortfall, a("50000000"))
        }
        other => panic!("expected InsufficientFunds, got {:?}", other),
    }

    let record = store
        .get_or_create(&treasury, &asset, &Network::new("bitcoin"))
        .await
        .unwrap();
    assert_eq!(record.available, a("100000000"));
    assert_eq!(record.total_withdrawn_to_users, a("0"));
}
