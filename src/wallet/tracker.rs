//! Keeps persisted wallet state in step with the chain
//!
//! Full resyncs rescan every wallet; script hash notifications trigger an
//! incremental resync of one address. Both reconcile UTXO sets, persist the
//! diff under the wallet lock and switch off an active payout once its coins
//! have moved.

use bitcoin::Network;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::context::{ChainSource, Discovery, WalletContext, GAP_LIMIT};
use super::debounce::Debouncer;
use super::locks::WalletLocks;
use super::reconcile::reconcile;
use crate::derivation::{DerivationPath, ExtendedPublicKey};
use crate::electrum::NodeEvent;
use crate::error::WalletError;
use crate::storage::{AddressRecord, Repository, WalletRecord};

pub const GAP_EXTENSION_DELAY: Duration = Duration::from_secs(10);
pub const UI_REFRESH_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Balances or payout state changed; views should reload
    WalletsChanged,
}

/// Outcome of resyncing one wallet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub new_utxos: usize,
    pub spent_utxos: usize,
    pub new_addresses: usize,
    pub invalidated: bool,
}

#[derive(Clone)]
pub struct AddressTracker {
    inner: Arc<Inner>,
}

struct Inner {
    repo: Arc<dyn Repository>,
    source: Arc<dyn ChainSource>,
    network: Network,
    locks: WalletLocks,
    gap_debouncer: Debouncer<(Uuid, u32)>,
    refresh_debouncer: Debouncer<()>,
    events: broadcast::Sender<TrackerEvent>,
}

impl AddressTracker {
    pub fn new(
        repo: Arc<dyn Repository>,
        source: Arc<dyn ChainSource>,
        network: Network,
        locks: WalletLocks,
    ) -> Self {
        Self::with_delays(repo, source, network, locks, GAP_EXTENSION_DELAY, UI_REFRESH_DELAY)
    }

    pub fn with_delays(
        repo: Arc<dyn Repository>,
        source: Arc<dyn ChainSource>,
        network: Network,
        locks: WalletLocks,
        gap_delay: Duration,
        refresh_delay: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                repo,
                source,
                network,
                locks,
                gap_debouncer: Debouncer::new(gap_delay),
                refresh_debouncer: Debouncer::new(refresh_delay),
                events,
            }),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    /// Resync every wallet; a failing wallet doesn't stop the others
    pub async fn full_resync_all(&self) -> Result<usize, WalletError> {
        let wallets = self.inner.repo.wallets().await?;
        let mut failures = 0;
        for wallet in &wallets {
            match self.resync_wallet(wallet).await {
                Ok(report) => log::debug!("Resynced wallet '{}': {:?}", wallet.label, report),
                Err(e) => {
                    failures += 1;
                    log::error!("Resync of wallet '{}' failed: {}", wallet.label, e);
                }
            }
        }
        log::info!("Full resync finished: {} wallets, {} failed", wallets.len(), failures);
        Ok(wallets.len() - failures)
    }

    /// Scan, diff and persist under one hold of the wallet lock
    ///
    /// A scan taken before the lock could predate a write made by an
    /// incremental resync and read its new outputs as spent.
    pub async fn resync_wallet(&self, wallet: &WalletRecord) -> Result<ResyncReport, WalletError> {
        let key = ExtendedPublicKey::parse(&wallet.root_public_key)?;
        let guard = self.inner.locks.acquire(wallet.id).await;
        let mut context = WalletContext::new(key, Arc::clone(&self.inner.source), self.inner.network);
        context.initialize(Discovery::FullScan).await?;

        let stored = self.inner.repo.addresses(wallet.id).await?;
        let previous: HashMap<&str, &AddressRecord> =
            stored.iter().map(|r| (r.address.as_str(), r)).collect();

        let mut report = ResyncReport::default();
        let mut spend_seen = false;
        let mut tx_count_changed = false;
        let mut fresh: Vec<AddressRecord> = Vec::new();

        for derivation in context.all() {
            let address = derivation.address.to_string();
            match previous.get(address.as_str()) {
                Some(prev) => {
                    let diff = reconcile(&prev.utxos, &derivation.utxos);
                    let count_changed = prev.tx_count != derivation.tx_count;
                    if !diff.is_empty() || count_changed {
                        self.inner
                            .repo
                            .apply_utxo_diff(wallet.id, &address, &diff, derivation.tx_count)
                            .await?;
                    }
                    report.new_utxos += diff.new.len();
                    report.spent_utxos += diff.spent.len();
                    spend_seen |= diff.has_spend();
                    tx_count_changed |= count_changed;
                }
                None => {
                    report.new_utxos += derivation.utxos.len();
                    fresh.push(derivation.to_record());
                }
            }
        }

        if !fresh.is_empty() {
            self.inner.repo.insert_addresses(wallet.id, &fresh).await?;
            report.new_addresses = fresh.len();
        }

        report.invalidated = self
            .invalidate_if_moved(wallet.id, spend_seen, tx_count_changed)
            .await?;
        drop(guard);

        self.subscribe_records(&fresh).await;
        if report.new_utxos > 0 || report.spent_utxos > 0 || report.invalidated {
            self.schedule_refresh().await;
        }
        Ok(report)
    }

    /// Incremental resync of the address behind `script_hash`
    ///
    /// Duplicate notifications are harmless: an unchanged address is a no-op.
    pub async fn on_script_hash_changed(&self, script_hash: &str) -> Result<ResyncReport, WalletError> {
        let Some((wallet, record)) = self.inner.repo.owner_of_script_hash(script_hash).await? else {
            log::debug!("Notification for unknown script hash {}", script_hash);
            return Ok(ResyncReport::default());
        };

        let key = ExtendedPublicKey::parse(&wallet.root_public_key)?;
        let guard = self.inner.locks.acquire(wallet.id).await;
        let mut context = WalletContext::new(key, Arc::clone(&self.inner.source), self.inner.network);
        context
            .initialize(Discovery::Paths(vec![record.derivation_path]))
            .await?;
        let current = context
            .derivations()
            .first()
            .ok_or_else(|| WalletError::Internal(format!("No derivation for {}", record.address)))?;

        let previous = self
            .inner
            .repo
            .addresses(wallet.id)
            .await?
            .into_iter()
            .find(|r| r.address == record.address)
            .ok_or_else(|| WalletError::NotFound(format!("Address {} not found", record.address)))?;

        let diff = reconcile(&previous.utxos, &current.utxos);
        let tx_count_changed = previous.tx_count != current.tx_count;
        if diff.is_empty() && !tx_count_changed {
            return Ok(ResyncReport::default());
        }

        log::info!(
            "Address {} changed: +{} / -{} UTXOs, tx count {} -> {}",
            record.address,
            diff.new.len(),
            diff.spent.len(),
            previous.tx_count,
            current.tx_count
        );
        self.inner
            .repo
            .apply_utxo_diff(wallet.id, &record.address, &diff, current.tx_count)
            .await?;
        let invalidated = self
            .invalidate_if_moved(wallet.id, diff.has_spend(), tx_count_changed)
            .await?;
        drop(guard);

        self.schedule_gap_extension(wallet.id, record.derivation_path.change)
            .await;
        self.schedule_refresh().await;

        Ok(ResyncReport {
            new_utxos: diff.new.len(),
            spent_utxos: diff.spent.len(),
            new_addresses: 0,
            invalidated,
        })
    }

    /// Keep `GAP_LIMIT` addresses beyond the highest funded one of a chain
    ///
    /// Evaluated per purpose. New addresses continue after the highest stored
    /// index. Returns how many addresses were added.
    pub async fn extend_gap(&self, wallet_id: Uuid, change: u32) -> Result<usize, WalletError> {
        let Some(wallet) = self.inner.repo.wallet(wallet_id).await? else {
            log::debug!("Wallet {} gone before gap extension", wallet_id);
            return Ok(0);
        };
        let stored = self.inner.repo.addresses(wallet_id).await?;

        // (purpose, coin, account) -> (highest overall, highest funded)
        let mut chains: BTreeMap<(u32, u32, u32), (DerivationPath, Option<u32>)> = BTreeMap::new();
        for record in stored.iter().filter(|r| r.derivation_path.change == change) {
            let path = record.derivation_path;
            let entry = chains
                .entry((path.purpose, path.coin_type, path.account))
                .or_insert((path, None));
            if path.index > entry.0.index {
                entry.0 = path;
            }
            if record.is_funded() {
                entry.1 = Some(entry.1.map_or(path.index, |i| i.max(path.index)));
            }
        }

        let mut paths: Vec<DerivationPath> = Vec::new();
        for (highest_overall, highest_funded) in chains.values() {
            let Some(highest_funded) = highest_funded else {
                continue;
            };
            let gap = highest_overall.index - highest_funded;
            if gap < GAP_LIMIT {
                log::info!(
                    "Gap of {} on {} is below {}, adding {} addresses",
                    gap,
                    highest_overall,
                    GAP_LIMIT,
                    GAP_LIMIT - gap
                );
                paths.extend(
                    (1..=GAP_LIMIT - gap).map(|i| highest_overall.with_index(highest_overall.index + i)),
                );
            }
        }
        if paths.is_empty() {
            return Ok(0);
        }

        let key = ExtendedPublicKey::parse(&wallet.root_public_key)?;
        let mut context = WalletContext::new(key, Arc::clone(&self.inner.source), self.inner.network);
        context.initialize(Discovery::Paths(paths)).await?;
        let records: Vec<AddressRecord> = context.derivations().iter().map(|d| d.to_record()).collect();

        let guard = self.inner.locks.acquire(wallet_id).await;
        let inserted = self.inner.repo.insert_addresses(wallet_id, &records).await;
        drop(guard);

        match inserted {
            Ok(()) => {
                self.subscribe_records(&records).await;
                Ok(records.len())
            }
            Err(WalletError::RaceCondition(msg)) => {
                log::info!("Address insert race, ignoring: {}", msg);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Switch off the active payout once coins have moved
    ///
    /// Requires both a spent UTXO and a changed transaction count. Must be
    /// called with the wallet lock held.
    async fn invalidate_if_moved(
        &self,
        wallet_id: Uuid,
        spend_seen: bool,
        tx_count_changed: bool,
    ) -> Result<bool, WalletError> {
        if !spend_seen {
            return Ok(false);
        }
        if !tx_count_changed {
            log::warn!(
                "Wallet {}: UTXO replaced without a new transaction, payout left active",
                wallet_id
            );
            return Ok(false);
        }

        match self.inner.repo.deactivate_payouts(wallet_id).await {
            Ok(0) => Ok(false),
            Ok(_) => {
                log::warn!(
                    "Inheritance payout of wallet {} invalidated: coins have moved",
                    wallet_id
                );
                Ok(true)
            }
            Err(e) => {
                log::error!("Failed to invalidate payout of wallet {}: {}", wallet_id, e);
                Err(e)
            }
        }
    }

    async fn schedule_gap_extension(&self, wallet_id: Uuid, change: u32) {
        let tracker = self.clone();
        self.inner
            .gap_debouncer
            .schedule((wallet_id, change), async move {
                if let Err(e) = tracker.extend_gap(wallet_id, change).await {
                    log::error!("Gap extension for wallet {} failed: {}", wallet_id, e);
                }
            })
            .await;
    }

    async fn schedule_refresh(&self) {
        let events = self.inner.events.clone();
        self.inner
            .refresh_debouncer
            .schedule((), async move {
                let _ = events.send(TrackerEvent::WalletsChanged);
            })
            .await;
    }

    async fn subscribe_records(&self, records: &[AddressRecord]) {
        for record in records {
            if let Err(e) = self.inner.source.subscribe(&record.script_hash).await {
                log::warn!("Failed to subscribe {}: {}", record.address, e);
            }
        }
    }

    /// Subscribe every stored address; returns how many succeeded
    pub async fn subscribe_all(&self) -> Result<usize, WalletError> {
        let mut subscribed = 0;
        for wallet in self.inner.repo.wallets().await? {
            for record in self.inner.repo.addresses(wallet.id).await? {
                match self.inner.source.subscribe(&record.script_hash).await {
                    Ok(_) => subscribed += 1,
                    Err(e) => log::warn!("Failed to subscribe {}: {}", record.address, e),
                }
            }
        }
        log::info!("Subscribed {} addresses", subscribed);
        Ok(subscribed)
    }

    /// Consume node events until the channel closes
    pub async fn run(self, mut events: broadcast::Receiver<NodeEvent>) {
        loop {
            match events.recv().await {
                Ok(NodeEvent::ScriptHashChanged { script_hash, .. }) => {
                    let tracker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = tracker.on_script_hash_changed(&script_hash).await {
                            log::error!("Incremental resync of {} failed: {}", script_hash, e);
                        }
                    });
                }
                Ok(NodeEvent::Reconnected) => {
                    log::info!("Node reconnected, running full resync");
                    let tracker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = tracker.full_resync_all().await {
                            log::error!("Full resync after reconnect failed: {}", e);
                        }
                    });
                }
                Ok(NodeEvent::Connected) | Ok(NodeEvent::Disconnected) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Missed {} node events, running full resync", missed);
                    let tracker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = tracker.full_resync_all().await {
                            log::error!("Full resync failed: {}", e);
                        }
                    });
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        self.inner.gap_debouncer.cancel_all().await;
        self.inner.refresh_debouncer.cancel_all().await;
        log::info!("Address tracker stopped");
    }
}
