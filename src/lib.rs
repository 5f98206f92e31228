//! Bitcoin peer-to-peer networking core for a lightweight (SPV) client.
//!
//! This crate owns outbound connection pooling, wire-protocol handshake and
//! message dispatch, download-peer election and header/filtered-block sync,
//! Bloom filter recomputation, and transaction broadcast/confidence
//! tracking. It does not validate scripts, store blocks persistently, render
//! a UI, or implement a Tor transport; those are consumed through the
//! [`connector::Connector`] and [`blockchain::BlockChain`] collaborator
//! traits.

pub mod address_book;
pub mod backoff;
pub mod bech32;
pub mod block;
pub mod blockchain;
pub mod broadcast;
pub mod clock;
pub mod confidence;
pub mod config;
pub mod connector;
pub mod constants;
pub mod error;
pub mod filter_merger;
pub mod merkle;
pub mod meta_addr;
pub mod peer;
pub mod peer_group;
pub mod protocol;
pub mod serialization;
pub mod transaction;

pub use address_book::AddressBook;
pub use blockchain::BlockChain;
pub use broadcast::{BroadcastRequest, TransactionBroadcast};
pub use confidence::ConfidenceTable;
pub use config::Config;
pub use connector::{Connector, TcpConnector};
pub use constants::Network;
pub use error::{BroadcastError, PeerCloseReason, ValidationError, WireError};
pub use filter_merger::{FilterMerger, FilterProvider};
pub use peer_group::{DownloadListener, FilterMode, PeerGroup};
