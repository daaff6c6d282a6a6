//! Extended public key handling
//!
//! Wallets are imported from account-level extended public keys. SLIP-132
//! prefixes (`ypub`, `zpub`, ...) tell us which script types the owner uses;
//! the payload is normalised to plain BIP32 `xpub`/`tpub` before decoding.

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{Secp256k1, Verification};
use bitcoin::NetworkKind;
use std::fmt;
use std::str::FromStr;

use super::script::ScriptPurpose;
use crate::error::WalletError;

const XPUB_VERSION: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const TPUB_VERSION: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];

/// Known version prefixes: (bytes, mainnet, purposes)
const VERSIONS: &[([u8; 4], bool, &[ScriptPurpose])] = &[
    ([0x04, 0x88, 0xb2, 0x1e], true, ScriptPurpose::ALL), // xpub
    ([0x04, 0x9d, 0x7c, 0xb2], true, &[ScriptPurpose::NestedSegwit, ScriptPurpose::NativeSegwit]), // ypub
    ([0x04, 0xb2, 0x47, 0x46], true, &[ScriptPurpose::NativeSegwit]), // zpub
    ([0x04, 0x35, 0x87, 0xcf], false, ScriptPurpose::ALL), // tpub
    ([0x04, 0x4a, 0x52, 0x62], false, &[ScriptPurpose::NestedSegwit, ScriptPurpose::NativeSegwit]), // upub
    ([0x04, 0x5f, 0x1c, 0xf6], false, &[ScriptPurpose::NativeSegwit]), // vpub
];

/// Immutable account node; identifies a wallet
#[derive(Clone, PartialEq, Eq)]
pub struct ExtendedPublicKey {
    /// The string the user imported, kept verbatim
    original: String,
    xpub: Xpub,
    purposes: Vec<ScriptPurpose>,
}

impl ExtendedPublicKey {
    pub fn parse(encoded: &str) -> Result<Self, WalletError> {
        let encoded = encoded.trim();
        let mut data = bitcoin::base58::decode_check(encoded)
            .map_err(|e| WalletError::invalid(format!("Root public key is invalid: {}", e)))?;
        if data.len() != 78 {
            return Err(WalletError::invalid(format!(
                "Root public key is invalid: expected 78 bytes, got {}",
                data.len()
            )));
        }

        let (mainnet, purposes) = VERSIONS
            .iter()
            .find(|(version, _, _)| data[..4] == version[..])
            .map(|(_, mainnet, purposes)| (*mainnet, purposes.to_vec()))
            .ok_or_else(|| {
                WalletError::invalid(format!(
                    "Root public key is invalid: unknown version {}",
                    hex::encode(&data[..4])
                ))
            })?;

        let normalised = if mainnet { XPUB_VERSION } else { TPUB_VERSION };
        data[..4].copy_from_slice(&normalised);

        let xpub = Xpub::decode(&data)
            .map_err(|e| WalletError::invalid(format!("Root public key is invalid: {}", e)))?;

        Ok(Self {
            original: encoded.to_string(),
            xpub,
            purposes,
        })
    }

    /// Script purposes this key is scanned for, in scan order
    pub fn purposes(&self) -> &[ScriptPurpose] {
        &self.purposes
    }

    pub fn network_kind(&self) -> NetworkKind {
        self.xpub.network
    }

    /// Reject keys whose version belongs to a different network
    pub fn require_network(&self, network: bitcoin::Network) -> Result<(), WalletError> {
        if NetworkKind::from(network) != self.xpub.network {
            return Err(WalletError::invalid(format!(
                "Root public key does not belong to {}",
                network
            )));
        }
        Ok(())
    }

    /// Non-hardened child key at `change/index`
    pub fn derive_child<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        change: u32,
        index: u32,
    ) -> Result<CompressedPublicKey, WalletError> {
        let change_child = ChildNumber::from_normal_idx(change)
            .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
        let index_child = ChildNumber::from_normal_idx(index)
            .map_err(|e| WalletError::Bitcoin(e.to_string()))?;

        let derived = self
            .xpub
            .derive_pub(secp, &[change_child, index_child])
            .map_err(|e| WalletError::Bitcoin(e.to_string()))?;

        Ok(derived.to_pub())
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }
}

impl FromStr for ExtendedPublicKey {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl fmt::Debug for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPublicKey")
            .field("key", &self.original)
            .field("purposes", &self.purposes)
            .finish()
    }
}
