use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Address, Network, Script, ScriptBuf};
use sha2::{Digest, Sha256};
use std::fmt;

use super::path::DerivationPath;
use super::xpub::ExtendedPublicKey;
use crate::error::WalletError;

/// Script type selected by the first path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScriptPurpose {
    /// BIP44 P2PKH
    Legacy,
    /// BIP49 P2SH(P2WPKH)
    NestedSegwit,
    /// BIP84 P2WPKH
    NativeSegwit,
}

impl ScriptPurpose {
    pub const ALL: &'static [ScriptPurpose] = &[
        ScriptPurpose::Legacy,
        ScriptPurpose::NestedSegwit,
        ScriptPurpose::NativeSegwit,
    ];

    pub fn number(&self) -> u32 {
        match self {
            ScriptPurpose::Legacy => 44,
            ScriptPurpose::NestedSegwit => 49,
            ScriptPurpose::NativeSegwit => 84,
        }
    }
}

impl TryFrom<u32> for ScriptPurpose {
    type Error = WalletError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            44 => Ok(ScriptPurpose::Legacy),
            49 => Ok(ScriptPurpose::NestedSegwit),
            84 => Ok(ScriptPurpose::NativeSegwit),
            other => Err(WalletError::UnsupportedDerivation(format!(
                "purpose {} is not supported",
                other
            ))),
        }
    }
}

impl fmt::Display for ScriptPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Address and scripts for one derived key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedScript {
    pub address: Address,
    pub script_pubkey: ScriptBuf,
    /// Only set for P2SH-wrapped segwit
    pub redeem_script: Option<ScriptBuf>,
    pub public_key: CompressedPublicKey,
}

impl DerivedScript {
    /// Electrum script hash of the output script
    pub fn script_hash(&self) -> String {
        script_hash(&self.script_pubkey)
    }
}

/// Turns account keys into addresses for a fixed network
pub struct ScriptDeriver {
    secp: Secp256k1<VerifyOnly>,
    network: Network,
}

impl ScriptDeriver {
    pub fn new(network: Network) -> Self {
        Self {
            secp: Secp256k1::verification_only(),
            network,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Build the address for an already derived child key
    pub fn derive(
        &self,
        public_key: &CompressedPublicKey,
        purpose: ScriptPurpose,
    ) -> DerivedScript {
        match purpose {
            ScriptPurpose::Legacy => {
                let address = Address::p2pkh(public_key.pubkey_hash(), self.network);
                DerivedScript {
                    script_pubkey: address.script_pubkey(),
                    address,
                    redeem_script: None,
                    public_key: *public_key,
                }
            }
            ScriptPurpose::NestedSegwit => {
                let redeem = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());
                let address = Address::p2shwpkh(public_key, self.network);
                DerivedScript {
                    script_pubkey: address.script_pubkey(),
                    address,
                    redeem_script: Some(redeem),
                    public_key: *public_key,
                }
            }
            ScriptPurpose::NativeSegwit => {
                let address = Address::p2wpkh(public_key, self.network);
                DerivedScript {
                    script_pubkey: address.script_pubkey(),
                    address,
                    redeem_script: None,
                    public_key: *public_key,
                }
            }
        }
    }

    /// Derive the child at `path` and build its address
    ///
    /// Fails with `UnsupportedDerivation` when the path's purpose is unknown
    /// or not allowed by the key's version prefix.
    pub fn derive_path(
        &self,
        key: &ExtendedPublicKey,
        path: &DerivationPath,
    ) -> Result<DerivedScript, WalletError> {
        let purpose = ScriptPurpose::try_from(path.purpose)?;
        if !key.purposes().contains(&purpose) {
            return Err(WalletError::UnsupportedDerivation(format!(
                "purpose {} is not allowed for this key",
                purpose
            )));
        }
        let child = key.derive_child(&self.secp, path.change, path.index)?;
        Ok(self.derive(&child, purpose))
    }
}

/// Reversed-byte hex SHA-256 of an output script, as Electrum addresses it
pub fn script_hash(script: &Script) -> String {
    let mut digest = Sha256::digest(script.as_bytes()).to_vec();
    digest.reverse();
    hex::encode(digest)
}
