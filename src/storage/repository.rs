use async_trait::async_trait;
use uuid::Uuid;

use super::models::{AddressRecord, DistributionRecord, PayoutRecord, RecipientRecord, WalletRecord};
use crate::error::WalletError;
use crate::wallet::reconcile::UtxoDiff;

/// Narrow persistence contract used by the engine
///
/// Each method returns exactly the projection its caller needs; the storage
/// technology behind it stays opaque.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Fails with `Conflict` when the label or root key is taken
    async fn insert_wallet(&self, wallet: &WalletRecord) -> Result<(), WalletError>;

    async fn wallet(&self, id: Uuid) -> Result<Option<WalletRecord>, WalletError>;

    async fn wallet_by_label(&self, label: &str) -> Result<Option<WalletRecord>, WalletError>;

    async fn wallets(&self) -> Result<Vec<WalletRecord>, WalletError>;

    /// Removes the wallet with its addresses, UTXOs and payouts
    async fn delete_wallet(&self, id: Uuid) -> Result<(), WalletError>;

    async fn addresses(&self, wallet_id: Uuid) -> Result<Vec<AddressRecord>, WalletError>;

    /// All-or-nothing; a path or address that already exists yields `RaceCondition`
    async fn insert_addresses(&self, wallet_id: Uuid, records: &[AddressRecord]) -> Result<(), WalletError>;

    /// Drop `diff.spent`, add `diff.new` and store the new tx count in one write
    async fn apply_utxo_diff(
        &self,
        wallet_id: Uuid,
        address: &str,
        diff: &UtxoDiff,
        tx_count: usize,
    ) -> Result<AddressRecord, WalletError>;

    async fn owner_of_script_hash(
        &self,
        script_hash: &str,
    ) -> Result<Option<(WalletRecord, AddressRecord)>, WalletError>;

    async fn active_payout(&self, wallet_id: Uuid) -> Result<Option<PayoutRecord>, WalletError>;

    async fn payouts(&self, wallet_id: Uuid) -> Result<Vec<PayoutRecord>, WalletError>;

    /// Deactivate the current active payout and store `payout` as active, atomically
    async fn replace_active_payout(&self, payout: &PayoutRecord) -> Result<(), WalletError>;

    /// Returns how many payouts were switched off
    async fn deactivate_payouts(&self, wallet_id: Uuid) -> Result<usize, WalletError>;

    async fn insert_recipient(&self, recipient: &RecipientRecord) -> Result<(), WalletError>;

    async fn recipients(&self) -> Result<Vec<RecipientRecord>, WalletError>;

    async fn insert_distribution(&self, distribution: &DistributionRecord) -> Result<(), WalletError>;

    async fn distribution_by_label(&self, label: &str) -> Result<Option<DistributionRecord>, WalletError>;

    async fn distributions(&self) -> Result<Vec<DistributionRecord>, WalletError>;
}
