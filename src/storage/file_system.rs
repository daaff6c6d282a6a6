use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{AddressRecord, DistributionRecord, PayoutRecord, RecipientRecord, WalletRecord};
use super::repository::Repository;
use crate::error::{StorageError, WalletError};
use crate::wallet::reconcile::UtxoDiff;

/// JSON documents under a data directory
///
/// ```text
/// <base>/wallets.json
/// <base>/recipients.json
/// <base>/distributions.json
/// <base>/addresses/<wallet id>.json
/// <base>/payouts/<wallet id>.json
/// ```
#[derive(Clone)]
pub struct FileStore {
    base_path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    /// Create a store rooted at `base_path`, creating directories as needed
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        fs::create_dir_all(base_path.join("addresses"))?;
        fs::create_dir_all(base_path.join("payouts"))?;
        log::debug!("Opened store at {}", base_path.display());
        Ok(Self {
            base_path,
            lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_path
    }

    fn wallets_path(&self) -> PathBuf {
        self.base_path.join("wallets.json")
    }

    fn recipients_path(&self) -> PathBuf {
        self.base_path.join("recipients.json")
    }

    fn distributions_path(&self) -> PathBuf {
        self.base_path.join("distributions.json")
    }

    fn addresses_path(&self, wallet_id: Uuid) -> PathBuf {
        self.base_path.join("addresses").join(format!("{}.json", wallet_id))
    }

    fn payouts_path(&self, wallet_id: Uuid) -> PathBuf {
        self.base_path.join("payouts").join(format!("{}.json", wallet_id))
    }
}

/// Missing file reads as an empty collection
fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = fs::read_to_string(path)?;
    let value = serde_json::from_str(&contents)?;
    Ok(value)
}

/// Write to a sibling temp file, then rename over the target
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[async_trait]
impl Repository for FileStore {
    async fn insert_wallet(&self, wallet: &WalletRecord) -> Result<(), WalletError> {
        let _guard = self.lock.lock().await;
        let mut wallets: Vec<WalletRecord> = read_json(&self.wallets_path())?;

        if wallets.iter().any(|w| w.label == wallet.label) {
            return Err(WalletError::Conflict(format!(
                "Wallet label '{}' already exists",
                wallet.label
            )));
        }
        if wallets.iter().any(|w| w.root_public_key == wallet.root_public_key) {
            return Err(WalletError::Conflict(
                "Wallet with this public key already exists".to_string(),
            ));
        }

        wallets.push(wallet.clone());
        write_json(&self.wallets_path(), &wallets)?;
        Ok(())
    }

    async fn wallet(&self, id: Uuid) -> Result<Option<WalletRecord>, WalletError> {
        let _guard = self.lock.lock().await;
        let wallets: Vec<WalletRecord> = read_json(&self.wallets_path())?;
        Ok(wallets.into_iter().find(|w| w.id == id))
    }

    async fn wallet_by_label(&self, label: &str) -> Result<Option<WalletRecord>, WalletError> {
        let _guard = self.lock.lock().await;
        let wallets: Vec<WalletRecord> = read_json(&self.wallets_path())?;
        Ok(wallets.into_iter().find(|w| w.label == label))
    }

    async fn wallets(&self) -> Result<Vec<WalletRecord>, WalletError> {
        let _guard = self.lock.lock().await;
        Ok(read_json(&self.wallets_path())?)
    }

    async fn delete_wallet(&self, id: Uuid) -> Result<(), WalletError> {
        let _guard = self.lock.lock().await;
        let mut wallets: Vec<WalletRecord> = read_json(&self.wallets_path())?;
        let before = wallets.len();
        wallets.retain(|w| w.id != id);
        if wallets.len() == before {
            return Err(WalletError::NotFound(format!("Wallet {} not found", id)));
        }

        remove_if_exists(&self.addresses_path(id))?;
        remove_if_exists(&self.payouts_path(id))?;
        write_json(&self.wallets_path(), &wallets)?;
        log::info!("Wallet {} deleted", id);
        Ok(())
    }

    async fn addresses(&self, wallet_id: Uuid) -> Result<Vec<AddressRecord>, WalletError> {
        let _guard = self.lock.lock().await;
        Ok(read_json(&self.addresses_path(wallet_id))?)
    }

    async fn insert_addresses(&self, wallet_id: Uuid, records: &[AddressRecord]) -> Result<(), WalletError> {
        let _guard = self.lock.lock().await;
        let path = self.addresses_path(wallet_id);
        let mut stored: Vec<AddressRecord> = read_json(&path)?;

        for (i, record) in records.iter().enumerate() {
            let duplicate = stored
                .iter()
                .chain(&records[..i])
                .any(|r| r.address == record.address || r.derivation_path == record.derivation_path);
            if duplicate {
                return Err(WalletError::RaceCondition(format!(
                    "Address {} ({}) already stored",
                    record.address, record.derivation_path
                )));
            }
        }

        stored.extend(records.iter().cloned());
        stored.sort_by(|a, b| a.derivation_path.cmp(&b.derivation_path));
        write_json(&path, &stored)?;
        Ok(())
    }

    async fn apply_utxo_diff(
        &self,
        wallet_id: Uuid,
        address: &str,
        diff: &UtxoDiff,
        tx_count: usize,
    ) -> Result<AddressRecord, WalletError> {
        let _guard = self.lock.lock().await;
        let path = self.addresses_path(wallet_id);
        let mut stored: Vec<AddressRecord> = read_json(&path)?;

        let record = stored
            .iter_mut()
            .find(|r| r.address == address)
            .ok_or_else(|| WalletError::NotFound(format!("Address {} not found", address)))?;
        diff.apply(&mut record.utxos);
        record.tx_count = tx_count;
        record.used = record.used || tx_count > 0;
        record.refresh_balances();
        let updated = record.clone();

        write_json(&path, &stored)?;
        Ok(updated)
    }

    async fn owner_of_script_hash(
        &self,
        script_hash: &str,
    ) -> Result<Option<(WalletRecord, AddressRecord)>, WalletError> {
        let _guard = self.lock.lock().await;
        let wallets: Vec<WalletRecord> = read_json(&self.wallets_path())?;
        for wallet in wallets {
            let addresses: Vec<AddressRecord> = read_json(&self.addresses_path(wallet.id))?;
            if let Some(record) = addresses.into_iter().find(|a| a.script_hash == script_hash) {
                return Ok(Some((wallet, record)));
            }
        }
        Ok(None)
    }

    async fn active_payout(&self, wallet_id: Uuid) -> Result<Option<PayoutRecord>, WalletError> {
        let _guard = self.lock.lock().await;
        let payouts: Vec<PayoutRecord> = read_json(&self.payouts_path(wallet_id))?;
        Ok(payouts.into_iter().find(|p| p.active))
    }

    async fn payouts(&self, wallet_id: Uuid) -> Result<Vec<PayoutRecord>, WalletError> {
        let _guard = self.lock.lock().await;
        Ok(read_json(&self.payouts_path(wallet_id))?)
    }

    async fn replace_active_payout(&self, payout: &PayoutRecord) -> Result<(), WalletError> {
        let _guard = self.lock.lock().await;
        let path = self.payouts_path(payout.wallet_id);
        let mut payouts: Vec<PayoutRecord> = read_json(&path)?;

        for existing in payouts.iter_mut().filter(|p| p.active) {
            existing.active = false;
        }
        let mut stored = payout.clone();
        stored.active = true;
        payouts.push(stored);

        write_json(&path, &payouts)?;
        Ok(())
    }

    async fn deactivate_payouts(&self, wallet_id: Uuid) -> Result<usize, WalletError> {
        let _guard = self.lock.lock().await;
        let path = self.payouts_path(wallet_id);
        let mut payouts: Vec<PayoutRecord> = read_json(&path)?;

        let mut changed = 0;
        for payout in payouts.iter_mut().filter(|p| p.active) {
            payout.active = false;
            changed += 1;
        }
        if changed > 0 {
            write_json(&path, &payouts)?;
        }
        Ok(changed)
    }

    async fn insert_recipient(&self, recipient: &RecipientRecord) -> Result<(), WalletError> {
        let _guard = self.lock.lock().await;
        let mut recipients: Vec<RecipientRecord> = read_json(&self.recipients_path())?;
        if recipients.iter().any(|r| r.label == recipient.label) {
            return Err(WalletError::Conflict(format!(
                "Recipient label '{}' already exists",
                recipient.label
            )));
        }
        recipients.push(recipient.clone());
        write_json(&self.recipients_path(), &recipients)?;
        Ok(())
    }

    async fn recipients(&self) -> Result<Vec<RecipientRecord>, WalletError> {
        let _guard = self.lock.lock().await;
        Ok(read_json(&self.recipients_path())?)
    }

    async fn insert_distribution(&self, distribution: &DistributionRecord) -> Result<(), WalletError> {
        let _guard = self.lock.lock().await;
        let mut distributions: Vec<DistributionRecord> = read_json(&self.distributions_path())?;
        if distributions.iter().any(|d| d.label == distribution.label) {
            return Err(WalletError::Conflict(format!(
                "Distribution label '{}' already exists",
                distribution.label
            )));
        }
        distributions.push(distribution.clone());
        write_json(&self.distributions_path(), &distributions)?;
        Ok(())
    }

    async fn distribution_by_label(&self, label: &str) -> Result<Option<DistributionRecord>, WalletError> {
        let _guard = self.lock.lock().await;
        let distributions: Vec<DistributionRecord> = read_json(&self.distributions_path())?;
        Ok(distributions.into_iter().find(|d| d.label == label))
    }

    async fn distributions(&self) -> Result<Vec<DistributionRecord>, WalletError> {
        let _guard = self.lock.lock().await;
        Ok(read_json(&self.distributions_path())?)
    }
}
