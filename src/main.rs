use anyhow::Context;
use std::time::Duration;
use tradeledger::store::{AllocationStore, AssetStore, BalanceStore};
use tradeledger::{init_db, Config};

/// Allocation expiry sweep daemon: periodically returns lapsed promotional
/// balances to their owners' real balances.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;

    let pool = init_db(&config.database_path)
        .await
        .context("initializing ledger database")?;

    let allocations = AllocationStore::new(pool.clone());
    let balances = BalanceStore::new(pool.clone());
    let assets = AssetStore::new(pool);

    tracing::info!(
        interval_ms = config.sweep_interval_ms,
        "allocation expiry sweep daemon started"
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(config.sweep_interval_ms));
    loop {
        ticker.tick().await;
        match allocations
            .sweep_expired(&balances, &assets, &config.default_network)
            .await
        {
            Ok(report) => {
                if report.newly_expired > 0 || report.reconciled > 0 || !report.failures.is_empty()
                {
                    tracing::info!(
                        newly_expired = report.newly_expired,
                        reconciled = report.reconciled,
                        returned_total = %report.returned_total,
                        deferred_locked = report.deferred_locked,
                        failures = report.failures.len(),
                        "expiry sweep finished"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "expiry sweep failed"),
        }
    }
}
