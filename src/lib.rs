//! Inheritance wallet engine
//!
//! Watch-only backend for a Bitcoin inheritance wallet. It imports account
//! public keys, keeps each wallet's addresses and UTXOs in sync with an
//! Electrum node, and builds time-locked payout transactions that split the
//! whole wallet between recipients once a validity date passes.
//!
//! # Architecture
//!
//! - **Derivation**: extended public keys, derivation paths and script types
//! - **Electrum**: JSON-RPC client with reconnect and subscription replay
//! - **Wallet**: gap-limited discovery, UTXO reconciliation, live tracking
//! - **Transaction**: payout building, signed-payout validation, activation
//! - **Storage**: repository contract and its JSON file implementation

pub mod config;
pub mod derivation;
pub mod electrum;
pub mod error;
pub mod storage;
pub mod transaction;
pub mod wallet;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use derivation::{DerivationPath, ExtendedPublicKey, ScriptDeriver, ScriptPurpose};
pub use electrum::{NodeClient, NodeEvent};
pub use error::{StorageError, WalletError};
pub use storage::{FileStore, Repository};
pub use transaction::PayoutService;
pub use wallet::{AddressTracker, WalletContext, WalletLocks, WalletManager};

pub type Result<T> = std::result::Result<T, WalletError>;
