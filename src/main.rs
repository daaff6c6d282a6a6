use inheritance_engine::transaction::PayoutService;
use inheritance_engine::wallet::tracker::TrackerEvent;
use inheritance_engine::{AddressTracker, EngineConfig, FileStore, NodeClient, Repository, WalletLocks};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    // RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineConfig::from_env();
    let network = config.bitcoin_network;
    log::info!("Starting inheritance engine on {}", network);

    let store: Arc<dyn Repository> = Arc::new(FileStore::open(&config.data_dir)?);
    let client = NodeClient::new(config.electrum.clone());
    if let Err(e) = client.connect().await {
        // Reconnected triggers the full resync once the node is back
        log::error!("Electrum node unreachable at startup: {}", e);
        client.schedule_reconnect().await;
    }
    let source = Arc::new(client.clone());

    let locks = WalletLocks::new();
    let tracker = AddressTracker::new(store.clone(), source.clone(), network, locks.clone());
    let payouts = PayoutService::new(store.clone(), source.clone(), network, locks);

    let mut tracker_events = tracker.events();
    tokio::spawn(async move {
        while let Ok(TrackerEvent::WalletsChanged) = tracker_events.recv().await {
            log::info!("Wallet balances or payouts changed");
        }
    });

    tokio::spawn(tracker.clone().run(client.events()));

    let resynced = tracker.full_resync_all().await?;
    let subscribed = tracker.subscribe_all().await?;
    log::info!("Initial resync: {} wallets, {} addresses subscribed", resynced, subscribed);

    let resync_tracker = tracker.clone();
    let resync_interval = config.resync_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(resync_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = resync_tracker.full_resync_all().await {
                log::error!("Periodic resync failed: {}", e);
            }
        }
    });

    let keepalive_client = client.clone();
    let keepalive_interval = config.keepalive_interval;
    let cache = payouts.cache().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(keepalive_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = keepalive_client.ping().await {
                log::warn!("Keepalive ping failed: {}", e);
            }
            let purged = cache.purge_expired();
            if purged > 0 {
                log::debug!("Dropped {} expired unsigned payouts", purged);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    client.shutdown().await;
    Ok(())
}
