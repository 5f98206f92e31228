//! Protocol constants: network magics, default ports, and wire caps.

use crate::protocol::external::types::ProtocolVersion;

/// The protocol version this crate speaks by default.
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion(70015);

/// The minimum protocol version accepted from a peer during handshake.
pub const MIN_PEER_VERSION: ProtocolVersion = ProtocolVersion(31800);

/// Peers at or above this version are preferred as download peers, since
/// they are old enough to support Bloom filtering (BIP37, protocol 70001)
/// with margin.
pub const FILTER_CAPABLE_VERSION: ProtocolVersion = ProtocolVersion(70001);

/// Protocol version at which ping nonces were introduced (BIP31).
pub const BIP31_VERSION: ProtocolVersion = ProtocolVersion(60001);

/// Protocol version at which peer address timestamps are included, except
/// inside a version handshake (see `MetaAddr` wire layout).
pub const CADDR_TIME_VERSION: ProtocolVersion = ProtocolVersion(31402);

/// Maximum size of a message frame's payload, per spec: 32 MiB.
pub const MAX_MESSAGE_LEN: usize = 32 * 1024 * 1024;

/// Maximum number of items in an `inv`, `getdata`, or `notfound` message.
pub const MAX_INV_ITEMS: usize = 50_000;

/// Maximum number of addresses in an `addr` message.
pub const MAX_ADDR_ITEMS: usize = 1_024;

/// Maximum number of hashes in a block locator (`getblocks`/`getheaders`).
pub const MAX_LOCATOR_HASHES: usize = 500;

/// Maximum number of headers returned by a single `headers` message.
pub const MAX_HEADERS_PER_MESSAGE: usize = 2_000;

/// Maximum number of filtered blocks the download pipeline keeps in flight.
pub const MAX_BLOCKS_IN_FLIGHT: usize = 1_024;

/// Maximum Bloom filter size in bytes (BIP37).
pub const MAX_FILTER_BYTES: usize = 36_000;

/// Maximum number of hash functions in a Bloom filter (BIP37).
pub const MAX_FILTER_HASH_FUNCS: u32 = 50;

/// Default target false-positive rate for the merged wallet Bloom filter.
pub const DEFAULT_FILTER_FP_RATE: f64 = 0.0005;

/// If the observed false-positive rate exceeds `target * MAX_FP_RATE_INCREASE`,
/// `PeerGroup` forces a filter resend.
pub const MAX_FP_RATE_INCREASE: f64 = 2.0;

/// How often `PeerGroup`'s manager task sweeps the confidence table for
/// unpinned, unreferenced records.
pub const CONFIDENCE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Network magic bytes and default port for a Bitcoin-family network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkParams {
    /// The 4-byte magic prefixed to every message envelope.
    pub magic: [u8; 4],
    /// The default TCP port peers on this network listen on.
    pub default_port: u16,
}

/// A selectable Bitcoin-family network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Network {
    /// The production Bitcoin network.
    Mainnet,
    /// The public test network (testnet3).
    Testnet,
    /// A local regression-test network.
    Regtest,
}

impl Network {
    /// The wire parameters (magic, default port) for this network.
    pub const fn params(self) -> NetworkParams {
        match self {
            Network::Mainnet => NetworkParams {
                magic: [0xF9, 0xBE, 0xB4, 0xD9],
                default_port: 8333,
            },
            Network::Testnet => NetworkParams {
                magic: [0x0B, 0x11, 0x09, 0x07],
                default_port: 18333,
            },
            Network::Regtest => NetworkParams {
                magic: [0xFA, 0xBF, 0xB5, 0xDA],
                default_port: 18444,
            },
        }
    }
}
