//! Storage and persistence layer
//!
//! - Repository contract consumed by the engine
//! - JSON file implementation
//! - Data models

mod file_system;
pub mod models;
mod repository;

pub use file_system::FileStore;
pub use models::{AddressRecord, DistributionRecord, PayoutRecord, RecipientRecord, Share, Utxo, WalletRecord};
pub use repository::Repository;
