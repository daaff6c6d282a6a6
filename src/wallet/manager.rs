/// Wallet lifecycle operations
///
/// Handles watch-only import, deletion and listing, plus the recipients and
/// distributions payouts are built from.
use bitcoin::{Address, Network};
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use super::context::{ChainSource, Discovery, WalletContext};
use super::locks::WalletLocks;
use crate::derivation::ExtendedPublicKey;
use crate::error::WalletError;
use crate::storage::{
    AddressRecord, DistributionRecord, PayoutRecord, RecipientRecord, Repository, Share, WalletRecord,
};

pub const MAX_LABEL_LEN: usize = 32;
/// Accepted range for the sum of distribution percentages
pub const MIN_TOTAL_PERCENTAGE: f64 = 99.7;
pub const MAX_TOTAL_PERCENTAGE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutSummary {
    pub id: Uuid,
    pub total_amount_sat: u64,
    pub locktime: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletSummary {
    pub id: Uuid,
    pub label: String,
    pub root_public_key: String,
    pub confirmed_balance: u64,
    pub unconfirmed_balance: u64,
    pub address_count: usize,
    pub active_payout: Option<PayoutSummary>,
}

impl WalletSummary {
    fn build(wallet: WalletRecord, addresses: &[AddressRecord], active: Option<PayoutRecord>) -> Self {
        Self {
            id: wallet.id,
            label: wallet.label,
            root_public_key: wallet.root_public_key,
            confirmed_balance: addresses.iter().map(|a| a.confirmed_balance).sum(),
            unconfirmed_balance: addresses.iter().map(|a| a.unconfirmed_balance).sum(),
            address_count: addresses.len(),
            active_payout: active.map(|p| PayoutSummary {
                id: p.id,
                total_amount_sat: p.total_amount_sat,
                locktime: p.locktime,
            }),
        }
    }
}

pub struct WalletManager {
    repo: Arc<dyn Repository>,
    source: Arc<dyn ChainSource>,
    network: Network,
    locks: WalletLocks,
}

impl WalletManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        source: Arc<dyn ChainSource>,
        network: Network,
        locks: WalletLocks,
    ) -> Self {
        Self {
            repo,
            source,
            network,
            locks,
        }
    }

    /// Import an account public key and run the initial full scan
    pub async fn import_public_key(&self, label: &str, public_key: &str) -> Result<WalletSummary, WalletError> {
        let mut errors = Vec::new();
        if let Err(msg) = check_label(label) {
            errors.push(format!("Wallet {}", msg));
        }
        let key = match ExtendedPublicKey::parse(public_key) {
            Ok(key) => match key.require_network(self.network) {
                Ok(()) => Some(key),
                Err(_) => {
                    errors.push("Root public key is invalid for this network".to_string());
                    None
                }
            },
            Err(_) => {
                errors.push("Root public key is invalid".to_string());
                None
            }
        };
        let key = match key {
            Some(key) if errors.is_empty() => key,
            _ => return Err(WalletError::Validation(errors)),
        };

        if self.repo.wallet_by_label(label).await?.is_some() {
            return Err(WalletError::Conflict(format!("Wallet label '{}' already exists", label)));
        }
        if self
            .repo
            .wallets()
            .await?
            .iter()
            .any(|w| w.root_public_key == key.as_str())
        {
            return Err(WalletError::Conflict(
                "Wallet with this public key already exists".to_string(),
            ));
        }

        log::info!("Importing wallet '{}', scanning addresses", label);
        let mut context = WalletContext::new(key.clone(), Arc::clone(&self.source), self.network);
        context.initialize(Discovery::FullScan).await?;
        let records: Vec<AddressRecord> = context.all().into_iter().map(|d| d.to_record()).collect();

        let wallet = WalletRecord {
            id: Uuid::new_v4(),
            label: label.to_string(),
            root_public_key: key.as_str().to_string(),
            created_at: Utc::now(),
        };

        {
            let _guard = self.locks.acquire(wallet.id).await;
            self.repo.insert_wallet(&wallet).await?;
            if let Err(e) = self.repo.insert_addresses(wallet.id, &records).await {
                self.repo.delete_wallet(wallet.id).await.ok();
                return Err(e);
            }
        }

        for record in &records {
            if let Err(e) = self.source.subscribe(&record.script_hash).await {
                log::warn!("Failed to subscribe {}: {}", record.address, e);
            }
        }

        log::info!(
            "Wallet '{}' imported: {} addresses, {} sat",
            label,
            records.len(),
            context.total_balance()
        );
        Ok(WalletSummary::build(wallet, &records, None))
    }

    /// Delete a wallet with its addresses, UTXOs and payouts
    pub async fn delete_wallet(&self, label: &str) -> Result<(), WalletError> {
        let wallet = self.wallet_by_label(label).await?;
        log::warn!("Deleting wallet: {}", label);
        {
            let _guard = self.locks.acquire(wallet.id).await;
            self.repo.delete_wallet(wallet.id).await?;
        }
        self.locks.forget(wallet.id).await;
        Ok(())
    }

    pub async fn list_wallets(&self) -> Result<Vec<WalletSummary>, WalletError> {
        let mut summaries = Vec::new();
        for wallet in self.repo.wallets().await? {
            let addresses = self.repo.addresses(wallet.id).await?;
            let active = self.repo.active_payout(wallet.id).await?;
            summaries.push(WalletSummary::build(wallet, &addresses, active));
        }
        Ok(summaries)
    }

    pub async fn wallet_by_label(&self, label: &str) -> Result<WalletRecord, WalletError> {
        self.repo
            .wallet_by_label(label)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Wallet '{}' not found", label)))
    }

    pub async fn add_recipient(&self, label: &str, address: &str) -> Result<RecipientRecord, WalletError> {
        let mut errors = Vec::new();
        if let Err(msg) = check_label(label) {
            errors.push(format!("Recipient {}", msg));
        }
        if parse_address(address, self.network).is_err() {
            errors.push("Recipient address is invalid".to_string());
        }
        if !errors.is_empty() {
            return Err(WalletError::Validation(errors));
        }

        let recipient = RecipientRecord {
            id: Uuid::new_v4(),
            label: label.to_string(),
            address: address.trim().to_string(),
        };
        self.repo.insert_recipient(&recipient).await?;
        Ok(recipient)
    }

    pub async fn list_recipients(&self) -> Result<Vec<RecipientRecord>, WalletError> {
        self.repo.recipients().await
    }

    /// Create a distribution from `(recipient label, percentage)` pairs
    pub async fn add_distribution(
        &self,
        label: &str,
        shares: &[(String, f64)],
    ) -> Result<DistributionRecord, WalletError> {
        let mut errors = Vec::new();
        if let Err(msg) = check_label(label) {
            errors.push(format!("Distribution {}", msg));
        }
        if shares.is_empty() {
            errors.push("Distribution is invalid: no recipients".to_string());
        }
        if shares
            .iter()
            .any(|(_, pct)| !pct.is_finite() || *pct <= 0.0 || *pct > 100.0)
        {
            errors.push("Distribution is invalid: percentage out of range".to_string());
        }
        let total: f64 = shares.iter().map(|(_, pct)| pct).sum();
        if !(MIN_TOTAL_PERCENTAGE..=MAX_TOTAL_PERCENTAGE).contains(&total) {
            errors.push(format!(
                "Distribution is invalid: percentages sum to {}",
                total
            ));
        }
        if !errors.is_empty() {
            return Err(WalletError::Validation(errors));
        }

        let recipients = self.repo.recipients().await?;
        let mut resolved = Vec::with_capacity(shares.len());
        for (recipient_label, percentage) in shares {
            let recipient = recipients
                .iter()
                .find(|r| &r.label == recipient_label)
                .ok_or_else(|| WalletError::NotFound(format!("Recipient '{}' not found", recipient_label)))?;
            resolved.push(Share {
                recipient_label: recipient.label.clone(),
                address: recipient.address.clone(),
                percentage: *percentage,
            });
        }

        let distribution = DistributionRecord {
            id: Uuid::new_v4(),
            label: label.to_string(),
            shares: resolved,
        };
        self.repo.insert_distribution(&distribution).await?;
        Ok(distribution)
    }

    pub async fn list_distributions(&self) -> Result<Vec<DistributionRecord>, WalletError> {
        self.repo.distributions().await
    }
}

fn check_label(label: &str) -> Result<(), String> {
    let len = label.trim().chars().count();
    if len == 0 || len > MAX_LABEL_LEN {
        return Err("label is invalid".to_string());
    }
    Ok(())
}

/// Parse an address and check it belongs to `network`
pub fn parse_address(address: &str, network: Network) -> Result<Address, WalletError> {
    Address::from_str(address.trim())
        .map_err(|e| WalletError::invalid(format!("Address is invalid: {}", e)))?
        .require_network(network)
        .map_err(|e| WalletError::invalid(format!("Address is invalid: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::{DerivationPath, ScriptDeriver};
    use crate::storage::FileStore;
    use crate::test_support::FakeChain;
    use tempfile::TempDir;

    fn regtest_address(key: &ExtendedPublicKey, index: u32) -> String {
        let path = DerivationPath::new(84, 1, 0, 0, index).unwrap();
        ScriptDeriver::new(Network::Regtest)
            .derive_path(key, &path)
            .unwrap()
            .address
            .to_string()
    }

    fn setup() -> (TempDir, Arc<FakeChain>, WalletManager, ExtendedPublicKey) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let chain = FakeChain::new();
        let manager = WalletManager::new(store, chain.clone(), Network::Regtest, WalletLocks::new());
        let xpub = crate::derivation::xpub::tests::account_xpub(84, Network::Regtest);
        let vpub = crate::derivation::xpub::tests::with_version(&xpub, [0x04, 0x5f, 0x1c, 0xf6]);
        let key = ExtendedPublicKey::parse(&vpub).unwrap();
        (dir, chain, manager, key)
    }

    #[tokio::test]
    async fn test_import_scans_and_subscribes() {
        let (_dir, chain, manager, key) = setup();
        let path = DerivationPath::new(84, 1, 0, 0, 0).unwrap();
        let script = ScriptDeriver::new(Network::Regtest)
            .derive_path(&key, &path)
            .unwrap()
            .script_pubkey;
        chain.fund(&script, 12_345);

        let summary = manager.import_public_key("savings", key.as_str()).await.unwrap();
        assert_eq!(summary.confirmed_balance, 12_345);
        // receive index 0 plus 20 lookahead, change chain 20 lookahead
        assert_eq!(summary.address_count, 41);
        assert_eq!(chain.subscribed().len(), 41);

        let listed = manager.list_wallets().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].label, "savings");
        assert_eq!(listed[0].address_count, 41);
        assert!(listed[0].active_payout.is_none());
    }

    #[tokio::test]
    async fn test_import_rejects_bad_input_and_duplicates() {
        let (_dir, _chain, manager, key) = setup();

        let bad = manager.import_public_key("", "garbage").await;
        match bad {
            Err(WalletError::Validation(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {:?}", other),
        }

        let mainnet = crate::derivation::xpub::tests::account_xpub(84, Network::Bitcoin);
        assert!(matches!(
            manager.import_public_key("main", &mainnet.to_string()).await,
            Err(WalletError::Validation(_))
        ));

        manager.import_public_key("savings", key.as_str()).await.unwrap();
        assert!(matches!(
            manager.import_public_key("savings", key.as_str()).await,
            Err(WalletError::Conflict(_))
        ));
        assert!(matches!(
            manager.import_public_key("other", key.as_str()).await,
            Err(WalletError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_wallet() {
        let (_dir, _chain, manager, key) = setup();
        manager.import_public_key("savings", key.as_str()).await.unwrap();
        manager.delete_wallet("savings").await.unwrap();
        assert!(manager.list_wallets().await.unwrap().is_empty());
        assert!(matches!(
            manager.delete_wallet("savings").await,
            Err(WalletError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_distribution_validation() {
        let (_dir, _chain, manager, key) = setup();
        let (addr_a, addr_b) = (regtest_address(&key, 100), regtest_address(&key, 101));
        manager.add_recipient("alice", &addr_a).await.unwrap();
        manager.add_recipient("bob", &addr_b).await.unwrap();
        assert!(matches!(
            manager.add_recipient("alice", &addr_b).await,
            Err(WalletError::Conflict(_))
        ));
        assert!(matches!(
            manager.add_recipient("carol", "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").await,
            Err(WalletError::Validation(_))
        ));

        let short = vec![("alice".to_string(), 50.0), ("bob".to_string(), 49.0)];
        assert!(matches!(
            manager.add_distribution("split", &short).await,
            Err(WalletError::Validation(_))
        ));

        let unknown = vec![("alice".to_string(), 50.0), ("dave".to_string(), 50.0)];
        assert!(matches!(
            manager.add_distribution("split", &unknown).await,
            Err(WalletError::NotFound(_))
        ));

        let thirds = vec![("alice".to_string(), 33.3), ("bob".to_string(), 66.6)];
        let dist = manager.add_distribution("thirds", &thirds).await.unwrap();
        assert_eq!(dist.shares[1].address, addr_b);
        assert_eq!(manager.list_distributions().await.unwrap().len(), 1);
    }
}
