/// Wallet core
///
/// - `context.rs` - Gap-limited address discovery
/// - `reconcile.rs` - UTXO set diffing
/// - `tracker.rs` - Live address tracking and payout invalidation
/// - `manager.rs` - Wallet, recipient and distribution lifecycle
/// - `debounce.rs` / `locks.rs` - Scheduling and per-wallet serialization

pub mod context;
pub mod debounce;
pub mod locks;
pub mod manager;
pub mod reconcile;
pub mod tracker;

pub use context::{ChainSource, Derivation, Discovery, WalletContext, GAP_LIMIT};
pub use locks::WalletLocks;
pub use manager::{PayoutSummary, WalletManager, WalletSummary};
pub use reconcile::{reconcile, UtxoDiff};
pub use tracker::{AddressTracker, ResyncReport, TrackerEvent};
