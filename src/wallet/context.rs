//! Gap-limited address discovery for one wallet
//!
//! A `WalletContext` explores the address space of an account key. It can
//! fetch an explicit list of paths, rehydrate persisted addresses without
//! touching the network, or run a full gap-limited scan.

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::key::CompressedPublicKey;
use bitcoin::{Address, Script, ScriptBuf, Transaction};
use futures::future::try_join_all;
use std::sync::Arc;

use crate::derivation::{DerivationPath, ExtendedPublicKey, ScriptDeriver, ScriptPurpose};
use crate::electrum::{HistoryEntry, UnspentEntry};
use crate::error::WalletError;
use crate::storage::models::{AddressRecord, Utxo};

/// Consecutive unused addresses that end a chain
pub const GAP_LIMIT: u32 = 20;
/// Maximum addresses fetched concurrently
pub const BATCH_SIZE: u32 = 20;

/// Narrow view of the indexing node used by discovery
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn get_history(&self, script: &Script) -> Result<Vec<HistoryEntry>, WalletError>;

    async fn list_unspent(&self, script: &Script) -> Result<Vec<UnspentEntry>, WalletError>;

    /// Raw transaction hex
    async fn get_raw_transaction(&self, txid: &str) -> Result<String, WalletError>;

    /// Returns the current status hash
    async fn subscribe(&self, script_hash: &str) -> Result<Option<String>, WalletError>;
}

/// One derived address and its on-chain state
#[derive(Debug, Clone, PartialEq)]
pub struct Derivation {
    pub address: Address,
    pub path: DerivationPath,
    pub script_pubkey: ScriptBuf,
    pub public_key: CompressedPublicKey,
    pub utxos: Vec<Utxo>,
    pub used: bool,
    pub tx_count: usize,
}

impl Derivation {
    pub fn script_hash(&self) -> String {
        crate::derivation::script_hash(&self.script_pubkey)
    }

    pub fn balance(&self) -> u64 {
        self.utxos.iter().map(|u| u.value).sum()
    }

    pub fn is_funded(&self) -> bool {
        !self.utxos.is_empty()
    }

    pub fn to_record(&self) -> AddressRecord {
        let mut record = AddressRecord {
            address: self.address.to_string(),
            derivation_path: self.path,
            script_hash: self.script_hash(),
            public_key_hex: self.public_key.to_string(),
            confirmed_balance: 0,
            unconfirmed_balance: 0,
            tx_count: self.tx_count,
            used: self.used,
            utxos: self.utxos.clone(),
        };
        record.refresh_balances();
        record
    }
}

/// How a context is populated
#[derive(Debug, Clone)]
pub enum Discovery {
    /// Derive and fetch exactly these paths
    Paths(Vec<DerivationPath>),
    /// Rebuild from persisted records, no network calls
    Known(Vec<AddressRecord>),
    /// Gap-limited scan of every allowed purpose
    FullScan,
}

pub struct WalletContext {
    key: ExtendedPublicKey,
    deriver: ScriptDeriver,
    source: Arc<dyn ChainSource>,
    coin_type: u32,
    derivations: Vec<Derivation>,
    lookahead: Vec<Derivation>,
}

impl WalletContext {
    pub fn new(key: ExtendedPublicKey, source: Arc<dyn ChainSource>, network: bitcoin::Network) -> Self {
        Self {
            key,
            deriver: ScriptDeriver::new(network),
            source,
            coin_type: crate::config::coin_type(network),
            derivations: Vec::new(),
            lookahead: Vec::new(),
        }
    }

    pub fn key(&self) -> &ExtendedPublicKey {
        &self.key
    }

    pub async fn initialize(&mut self, discovery: Discovery) -> Result<(), WalletError> {
        match discovery {
            Discovery::Paths(paths) => {
                let fetched = try_join_all(paths.iter().map(|path| self.fetch(*path))).await?;
                self.derivations.extend(fetched);
            }
            Discovery::Known(records) => {
                for record in records {
                    let derived = self.deriver.derive_path(&self.key, &record.derivation_path)?;
                    if derived.address.to_string() != record.address {
                        return Err(WalletError::Internal(format!(
                            "Stored address {} does not match path {}",
                            record.address, record.derivation_path
                        )));
                    }
                    self.derivations.push(Derivation {
                        address: derived.address,
                        path: record.derivation_path,
                        script_pubkey: derived.script_pubkey,
                        public_key: derived.public_key,
                        utxos: record.utxos,
                        used: record.used,
                        tx_count: record.tx_count,
                    });
                }
            }
            Discovery::FullScan => {
                let purposes = self.key.purposes().to_vec();
                for purpose in purposes {
                    self.scan_purpose(purpose).await?;
                }
            }
        }
        self.derivations.sort_by(|a, b| a.path.cmp(&b.path));
        self.lookahead.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(())
    }

    /// Receive chain then change chain
    async fn scan_purpose(&mut self, purpose: ScriptPurpose) -> Result<(), WalletError> {
        for change in [0u32, 1] {
            let base = DerivationPath::new(purpose.number(), self.coin_type, 0, change, 0)?;
            let mut chain: Vec<Derivation> = Vec::new();
            let mut gap = 0u32;
            let mut next = 0u32;

            'chain: loop {
                let size = BATCH_SIZE.min(GAP_LIMIT - gap);
                let paths: Vec<DerivationPath> = (next..next + size).map(|i| base.with_index(i)).collect();
                let batch = try_join_all(paths.iter().map(|path| self.fetch(*path))).await?;

                for derivation in batch {
                    if change == 0 && derivation.path.index == 0 && !derivation.used {
                        log::debug!("{}: first receive address unused, skipping purpose", purpose);
                        return Ok(());
                    }
                    if derivation.used {
                        gap = 0;
                    } else {
                        gap += 1;
                    }
                    chain.push(derivation);
                    if gap >= GAP_LIMIT {
                        break 'chain;
                    }
                }
                next += size;
            }

            let split = chain.len() - gap as usize;
            let lookahead = chain.split_off(split);
            log::debug!(
                "{} change={}: {} derivations, {} lookahead",
                purpose,
                change,
                chain.len(),
                lookahead.len()
            );
            self.derivations.extend(chain);
            self.lookahead.extend(lookahead);
        }
        Ok(())
    }

    async fn fetch(&self, path: DerivationPath) -> Result<Derivation, WalletError> {
        let derived = self.deriver.derive_path(&self.key, &path)?;
        let script = derived.script_pubkey.as_script();

        let history = self.source.get_history(script).await?;
        let (utxos, used) = if history.is_empty() {
            (Vec::new(), false)
        } else {
            let unspent = self.source.list_unspent(script).await?;
            let utxos = try_join_all(unspent.iter().map(|entry| self.resolve_utxo(entry))).await?;
            (utxos, true)
        };

        Ok(Derivation {
            address: derived.address,
            path,
            script_pubkey: derived.script_pubkey,
            public_key: derived.public_key,
            utxos,
            used,
            tx_count: history.len(),
        })
    }

    /// One raw transaction fetch per output to recover its script
    async fn resolve_utxo(&self, entry: &UnspentEntry) -> Result<Utxo, WalletError> {
        let raw_tx_hex = self.source.get_raw_transaction(&entry.tx_hash).await?;
        let tx: Transaction = deserialize_hex(&raw_tx_hex)
            .map_err(|e| WalletError::Bitcoin(format!("Invalid transaction {}: {}", entry.tx_hash, e)))?;
        let output = tx.output.get(entry.tx_pos as usize).ok_or_else(|| {
            WalletError::Bitcoin(format!(
                "Transaction {} has no output {}",
                entry.tx_hash, entry.tx_pos
            ))
        })?;

        Ok(Utxo {
            tx_hash: entry.tx_hash.clone(),
            output_index: entry.tx_pos,
            value: entry.value,
            block_height: entry.height,
            script_pubkey: hex::encode(output.script_pubkey.as_bytes()),
            raw_tx_hex,
        })
    }

    /// Addresses up to the highest used index of each chain
    pub fn derivations(&self) -> &[Derivation] {
        &self.derivations
    }

    /// Trailing unused addresses that closed each chain
    pub fn lookahead(&self) -> &[Derivation] {
        &self.lookahead
    }

    /// Everything probed, in path order
    pub fn all(&self) -> Vec<&Derivation> {
        let mut all: Vec<&Derivation> = self.derivations.iter().chain(self.lookahead.iter()).collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    pub fn total_balance(&self) -> u64 {
        self.derivations.iter().map(|d| d.balance()).sum()
    }

    pub fn funded_derivations(&self) -> Vec<&Derivation> {
        self.derivations.iter().filter(|d| d.is_funded()).collect()
    }

    pub fn into_parts(self) -> (Vec<Derivation>, Vec<Derivation>) {
        (self.derivations, self.lookahead)
    }
}
