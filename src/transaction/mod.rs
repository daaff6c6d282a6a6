//! Inheritance payout transactions
//!
//! - `builder.rs` - Unsigned payout construction
//! - `validator.rs` - Signed vs unsigned comparison
//! - `cache.rs` - Unsigned payouts awaiting signature
//! - `payout.rs` - Generate / submit / inspect

pub mod builder;
pub mod cache;
pub mod payout;
pub mod validator;

pub use builder::{allocate_outputs, estimate_vsize, PayoutRecipient, TransactionBuilder, UnsignedPayout};
pub use cache::UnsignedTxCache;
pub use payout::{GeneratedPayout, PayoutInfo, PayoutOutput, PayoutService};
pub use validator::{validate_signed, ValidatedPayout};
