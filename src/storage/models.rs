//! Data models for engine storage

use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::derivation::DerivationPath;
use crate::error::WalletError;

/// Satoshi amounts are stored as decimal strings; numbers are accepted on read
pub mod sats {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.trim().parse().map_err(de::Error::custom),
            Raw::Number(n) => Ok(n),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletRecord {
    pub id: Uuid,
    pub label: String,
    pub root_public_key: String,
    pub created_at: DateTime<Utc>,
}

/// Unspent output held by one address
///
/// Two records are only equal when every field matches, so a confirmation
/// height change on the same outpoint reads as a removal plus an addition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Utxo {
    pub tx_hash: String,
    pub output_index: u32,
    #[serde(with = "sats")]
    pub value: u64,
    /// 0 or negative while unconfirmed
    pub block_height: i64,
    pub script_pubkey: String,
    pub raw_tx_hex: String,
}

impl Utxo {
    pub fn is_confirmed(&self) -> bool {
        self.block_height > 0
    }

    pub fn outpoint(&self) -> Result<OutPoint, WalletError> {
        let txid = Txid::from_str(&self.tx_hash)
            .map_err(|e| WalletError::Bitcoin(format!("Invalid txid {}: {}", self.tx_hash, e)))?;
        Ok(OutPoint::new(txid, self.output_index))
    }
}

/// Persisted projection of a derived address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddressRecord {
    pub address: String,
    pub derivation_path: DerivationPath,
    pub script_hash: String,
    pub public_key_hex: String,
    #[serde(with = "sats")]
    pub confirmed_balance: u64,
    #[serde(with = "sats")]
    pub unconfirmed_balance: u64,
    pub tx_count: usize,
    pub used: bool,
    #[serde(default)]
    pub utxos: Vec<Utxo>,
}

impl AddressRecord {
    /// Recompute balances from the held UTXOs
    pub fn refresh_balances(&mut self) {
        self.confirmed_balance = self
            .utxos
            .iter()
            .filter(|u| u.is_confirmed())
            .map(|u| u.value)
            .sum();
        self.unconfirmed_balance = self
            .utxos
            .iter()
            .filter(|u| !u.is_confirmed())
            .map(|u| u.value)
            .sum();
    }

    pub fn is_funded(&self) -> bool {
        !self.utxos.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutRecord {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub distribution_id: Uuid,
    /// Consensus hex of the signed transaction
    pub raw_signed: String,
    #[serde(with = "sats")]
    pub total_amount_sat: u64,
    /// Unix seconds
    pub locktime: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientRecord {
    pub id: Uuid,
    pub label: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Share {
    pub recipient_label: String,
    pub address: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionRecord {
    pub id: Uuid,
    pub label: String,
    pub shares: Vec<Share>,
}

impl DistributionRecord {
    pub fn total_percentage(&self) -> f64 {
        self.shares.iter().map(|s| s.percentage).sum()
    }
}
