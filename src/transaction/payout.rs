/// Inheritance payout lifecycle
///
/// generate → external signing → submit_signed. Submitting supersedes the
/// wallet's previous active payout.
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Address, Network};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::builder::{PayoutRecipient, TransactionBuilder};
use super::cache::UnsignedTxCache;
use super::validator::{parse_psbt, parse_signed, validate_signed};
use crate::derivation::ExtendedPublicKey;
use crate::error::WalletError;
use crate::storage::{DistributionRecord, PayoutRecord, Repository, WalletRecord};
use crate::wallet::context::ChainSource;
use crate::wallet::locks::WalletLocks;
use crate::wallet::manager::{parse_address, MAX_LABEL_LEN, MAX_TOTAL_PERCENTAGE, MIN_TOTAL_PERCENTAGE};

#[derive(Debug, Clone)]
pub struct GeneratedPayout {
    pub psbt_hex: String,
    pub total_input: u64,
    pub unconfirmed_inputs: bool,
    pub fee: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutOutput {
    /// None when the address no longer belongs to a known recipient
    pub recipient: Option<String>,
    pub address: String,
    pub value: u64,
}

#[derive(Debug, Clone)]
pub struct PayoutInfo {
    pub payout_id: Uuid,
    pub outputs: Vec<PayoutOutput>,
    pub locktime: DateTime<Utc>,
    pub total_input: u64,
    pub total_output: u64,
    pub fee: u64,
    pub vsize: usize,
    pub raw_signed: String,
}

pub struct PayoutService {
    repo: Arc<dyn Repository>,
    builder: TransactionBuilder,
    cache: UnsignedTxCache,
    locks: WalletLocks,
    network: Network,
}

impl PayoutService {
    pub fn new(
        repo: Arc<dyn Repository>,
        source: Arc<dyn ChainSource>,
        network: Network,
        locks: WalletLocks,
    ) -> Self {
        Self {
            repo,
            builder: TransactionBuilder::new(network, source),
            cache: UnsignedTxCache::default(),
            locks,
            network,
        }
    }

    pub fn cache(&self) -> &UnsignedTxCache {
        &self.cache
    }

    /// Build an unsigned payout of the whole wallet and park it for signing
    pub async fn generate(
        &self,
        wallet_label: &str,
        distribution_label: &str,
        valid_from: DateTime<Utc>,
        fee_rate: f64,
    ) -> Result<GeneratedPayout, WalletError> {
        let mut errors = label_errors(wallet_label, distribution_label);
        if valid_from <= Utc::now() {
            errors.push("Validity date is invalid".to_string());
        }
        if !fee_rate.is_finite() || fee_rate <= 0.0 {
            errors.push("Transaction fee is invalid".to_string());
        }
        if !errors.is_empty() {
            return Err(WalletError::Validation(errors));
        }

        let wallet = self.wallet(wallet_label).await?;
        let distribution = self.distribution(distribution_label).await?;
        let total = distribution.total_percentage();
        if !(MIN_TOTAL_PERCENTAGE..=MAX_TOTAL_PERCENTAGE).contains(&total) {
            return Err(WalletError::invalid(format!(
                "Distribution percentages sum to {}",
                total
            )));
        }

        let recipients = distribution
            .shares
            .iter()
            .map(|share| {
                Ok(PayoutRecipient {
                    address: parse_address(&share.address, self.network)?,
                    percentage: share.percentage,
                })
            })
            .collect::<Result<Vec<_>, WalletError>>()?;

        let key = ExtendedPublicKey::parse(&wallet.root_public_key)?;
        let unsigned = self.builder.build(&key, &recipients, valid_from, fee_rate).await?;
        let psbt_hex = unsigned.psbt_hex();
        self.cache.insert(&wallet.root_public_key, psbt_hex.clone());

        log::info!(
            "Generated payout for '{}' via '{}': {} sat, unconfirmed inputs: {}",
            wallet_label,
            distribution_label,
            unsigned.total_input,
            unsigned.unconfirmed_inputs
        );
        Ok(GeneratedPayout {
            psbt_hex,
            total_input: unsigned.total_input,
            unconfirmed_inputs: unsigned.unconfirmed_inputs,
            fee: unsigned.fee,
        })
    }

    /// Validate a signed payout and make it the wallet's active one
    pub async fn submit_signed(
        &self,
        wallet_label: &str,
        distribution_label: &str,
        signed_hex: &str,
    ) -> Result<PayoutRecord, WalletError> {
        let errors = label_errors(wallet_label, distribution_label);
        if !errors.is_empty() {
            return Err(WalletError::Validation(errors));
        }
        let wallet = self.wallet(wallet_label).await?;
        let distribution = self.distribution(distribution_label).await?;
        let signed = parse_signed(signed_hex)?;
        let raw_signed = serialize_hex(&signed);

        let _guard = self.locks.acquire(wallet.id).await;

        if let Some(active) = self.repo.active_payout(wallet.id).await? {
            if active.raw_signed == raw_signed {
                return Err(WalletError::Conflict(
                    "Transaction is already the active payout".to_string(),
                ));
            }
        }

        let psbt_hex = self.cache.get(&wallet.root_public_key).ok_or_else(|| {
            WalletError::NotFound(format!("No unsigned payout pending for '{}'", wallet_label))
        })?;
        let psbt = parse_psbt(&psbt_hex)?;
        let validated = validate_signed(&signed, &psbt)?;

        let payout = PayoutRecord {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            distribution_id: distribution.id,
            raw_signed,
            total_amount_sat: validated.total_input,
            locktime: validated.locktime,
            active: true,
            created_at: Utc::now(),
        };
        self.repo.replace_active_payout(&payout).await?;
        self.cache.take(&wallet.root_public_key);

        log::info!(
            "Payout {} active for '{}' (locktime {})",
            validated.transaction.compute_txid(),
            wallet_label,
            validated.locktime
        );
        Ok(payout)
    }

    /// Summary of the wallet's active payout
    pub async fn payout_info(&self, wallet_label: &str) -> Result<PayoutInfo, WalletError> {
        let wallet = self.wallet(wallet_label).await?;
        let payout = self
            .repo
            .active_payout(wallet.id)
            .await?
            .ok_or_else(|| WalletError::NotFound("Transaction not found".to_string()))?;
        let tx = parse_signed(&payout.raw_signed)?;
        let recipients = self.repo.recipients().await?;

        let mut outputs = Vec::with_capacity(tx.output.len());
        for out in &tx.output {
            let address = Address::from_script(&out.script_pubkey, self.network)
                .map_err(|e| WalletError::Bitcoin(format!("Unrecognised output script: {}", e)))?
                .to_string();
            let recipient = recipients
                .iter()
                .find(|r| r.address == address)
                .map(|r| r.label.clone());
            outputs.push(PayoutOutput {
                recipient,
                address,
                value: out.value.to_sat(),
            });
        }

        let total_output: u64 = outputs.iter().map(|o| o.value).sum();
        let locktime = DateTime::from_timestamp(i64::from(payout.locktime), 0)
            .ok_or_else(|| WalletError::Internal(format!("Invalid locktime {}", payout.locktime)))?;

        Ok(PayoutInfo {
            payout_id: payout.id,
            outputs,
            locktime,
            total_input: payout.total_amount_sat,
            total_output,
            fee: payout.total_amount_sat.saturating_sub(total_output),
            vsize: tx.vsize(),
            raw_signed: payout.raw_signed,
        })
    }

    async fn wallet(&self, label: &str) -> Result<WalletRecord, WalletError> {
        self.repo
            .wallet_by_label(label)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Wallet '{}' not found", label)))
    }

    async fn distribution(&self, label: &str) -> Result<DistributionRecord, WalletError> {
        self.repo
            .distribution_by_label(label)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Distribution '{}' not found", label)))
    }
}

fn label_errors(wallet_label: &str, distribution_label: &str) -> Vec<String> {
    let valid = |label: &str| (1..=MAX_LABEL_LEN).contains(&label.trim().chars().count());
    let mut errors = Vec::new();
    if !valid(wallet_label) {
        errors.push("Wallet label is invalid".to_string());
    }
    if !valid(distribution_label) {
        errors.push("Distribution label is invalid".to_string());
    }
    errors
}
