use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per wallet
///
/// Every persisted-state write for a wallet happens while holding its
/// guard, whether it comes from a resync or from payout submission.
#[derive(Clone, Default)]
pub struct WalletLocks {
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl WalletLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, wallet_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(wallet_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a deleted wallet
    pub async fn forget(&self, wallet_id: Uuid) {
        self.locks.lock().await.remove(&wallet_id);
    }
}
