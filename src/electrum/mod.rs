pub mod client;
pub mod protocol;
pub mod transport;

pub use client::{ConnectionState, NodeClient, NodeEvent};
pub use protocol::{HistoryEntry, UnspentEntry};
