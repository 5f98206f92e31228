//! Definitions of network messages.

use std::{fmt, sync::Arc};

use super::inv::InventoryHash;
use super::types::{Filter, Nonce, Tweak};
use crate::{block, meta_addr::MetaAddr, transaction::Transaction};

mod version;
pub use version::Version;

mod get_blocks;
pub use get_blocks::GetBlocks;

mod get_headers;
pub use get_headers::GetHeaders;

mod merkle_block;
pub use merkle_block::MerkleBlock;

mod send_compact;
pub use send_compact::SendCompact;

use super::Command;

/// A Bitcoin network message.
///
/// Bitcoin identifies messages by a 12-byte ASCII command string; we
/// consider this a serialization detail and use the enum discriminant
/// instead. The translation between the two happens only during
/// serialization and deserialization, giving us a single, clearly-defined
/// validation boundary for network messages.
///
/// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation)
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// A `version` message.
    ///
    /// Note that although this is called `version` in Bitcoin, its role is
    /// really analogous to a `ClientHello` message in TLS, used to begin a
    /// handshake, and is distinct from a simple version number.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#version)
    Version(Version),

    /// A `verack` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#verack)
    Verack,

    /// A `ping` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#ping)
    Ping(Nonce),

    /// A `pong` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#pong)
    Pong(Nonce),

    /// A `reject` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#reject)
    Reject {
        /// The command of the message rejected.
        message: String,
        /// Code relating to the rejection reason.
        ccode: RejectReason,
        /// Human-readable version of the rejection reason.
        reason: String,
        /// The hash of the rejected tx or block, if applicable.
        data: Option<[u8; 32]>,
    },

    /// A `getaddr` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#getaddr)
    GetAddr,

    /// An `addr` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#addr)
    Addr(Vec<MetaAddr>),

    /// A `getblocks` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#getblocks)
    GetBlocks(GetBlocks),

    /// An `inv` message.
    ///
    /// Allows a node to advertise its knowledge of one or more objects. It
    /// can be received unsolicited, or in reply to `getblocks`.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#inv)
    Inv(Vec<InventoryHash>),

    /// A `getheaders` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#getheaders)
    GetHeaders(GetHeaders),

    /// A `headers` message.
    ///
    /// Returns block headers in response to a `getheaders` message. Each
    /// header is accompanied by a transaction count.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#headers)
    Headers(Vec<block::CountedHeader>),

    /// A `getdata` message.
    ///
    /// Used in response to `inv`, to retrieve the content of a specific
    /// object, usually after filtering out already-known elements.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#getdata)
    GetData(Vec<InventoryHash>),

    /// A `block` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#block)
    Block(Arc<block::Block>),

    /// A `tx` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#tx)
    Tx(Arc<Transaction>),

    /// A `notfound` message.
    ///
    /// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#notfound)
    NotFound(Vec<InventoryHash>),

    /// A `mempool` message, defined in [BIP35].
    ///
    /// [BIP35]: https://github.com/bitcoin/bips/blob/master/bip-0035.mediawiki
    Mempool,

    /// A `filterload` message, defined in [BIP37].
    ///
    /// [BIP37]: https://github.com/bitcoin/bips/blob/master/bip-0037.mediawiki
    FilterLoad {
        /// The filter's bit field. Maximum size 36,000 bytes.
        filter: Filter,
        /// The number of hash functions used. Maximum 50.
        hash_functions_count: u32,
        /// A value mixed into the seed of each hash function.
        tweak: Tweak,
        /// Flags controlling how matched items update the filter.
        flags: u8,
    },

    /// A `filteradd` message, defined in [BIP37].
    ///
    /// [BIP37]: https://github.com/bitcoin/bips/blob/master/bip-0037.mediawiki
    FilterAdd {
        /// The element to add to the loaded filter. At most 520 bytes.
        data: Vec<u8>,
    },

    /// A `filterclear` message, defined in [BIP37].
    FilterClear,

    /// A `merkleblock` message: a reply to `getdata` requesting
    /// `MSG_FILTERED_BLOCK`. Any matching transactions follow separately as
    /// `tx` messages.
    ///
    /// [Bitcoin reference](https://developer.bitcoin.org/reference/p2p_networking.html#merkleblock)
    MerkleBlock(MerkleBlock),

    /// A `sendcmpct` message, defined in [BIP152].
    ///
    /// [BIP152]: https://github.com/bitcoin/bips/blob/master/bip-0152.mediawiki
    SendCompact(SendCompact),

    /// A `feefilter` message, defined in [BIP133].
    ///
    /// [BIP133]: https://github.com/bitcoin/bips/blob/master/bip-0133.mediawiki
    FeeFilter(u64),

    /// A `sendheaders` message: tells the receiving peer to announce new
    /// blocks via `headers` rather than `inv`.
    SendHeaders,

    /// An `alert` message. Deprecated and insecure; the payload is dropped
    /// and the message is logged, never acted upon.
    Alert,

    /// A message whose command we don't recognize. Logged, not dropped
    /// silently, so operators can see what a peer is sending.
    Unknown(String, Vec<u8>),
}

/// Reject reason ccodes.
///
/// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#reject)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum RejectReason {
    Malformed = 0x01,
    Invalid = 0x10,
    Obsolete = 0x11,
    Duplicate = 0x12,
    Nonstandard = 0x40,
    Dust = 0x41,
    InsufficientFee = 0x42,
    Checkpoint = 0x43,
    Other = 0x50,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Message::Version { .. } => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Reject { .. } => "reject",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::GetBlocks { .. } => "getblocks",
            Message::Inv(_) => "inv",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::NotFound(_) => "notfound",
            Message::Mempool => "mempool",
            Message::FilterLoad { .. } => "filterload",
            Message::FilterAdd { .. } => "filteradd",
            Message::FilterClear => "filterclear",
            Message::MerkleBlock(_) => "merkleblock",
            Message::SendCompact(_) => "sendcmpct",
            Message::FeeFilter(_) => "feefilter",
            Message::SendHeaders => "sendheaders",
            Message::Alert => "alert",
            Message::Unknown(command, _) => command,
        })
    }
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Addr { .. } => Command::Addr,
            Message::Block { .. } => Command::Block,
            Message::FeeFilter { .. } => Command::FeeFilter,
            Message::FilterAdd { .. } => Command::FilterAdd,
            Message::FilterClear {} => Command::FilterClear,
            Message::FilterLoad { .. } => Command::FilterLoad,
            Message::GetAddr {} => Command::GetAddr,
            Message::GetBlocks { .. } => Command::GetBlocks,
            Message::GetData { .. } => Command::GetData,
            Message::GetHeaders { .. } => Command::GetHeaders,
            Message::Headers { .. } => Command::Headers,
            Message::Inv { .. } => Command::Inv,
            Message::Mempool {} => Command::MemPool,
            Message::MerkleBlock { .. } => Command::MerkleBlock,
            Message::NotFound { .. } => Command::NotFound,
            Message::Ping { .. } => Command::Ping,
            Message::Pong { .. } => Command::Pong,
            Message::Reject { .. } => Command::Reject,
            Message::SendCompact { .. } => Command::SendCmpct,
            Message::SendHeaders {} => Command::SendHeaders,
            Message::Tx { .. } => Command::Tx,
            Message::Verack {} => Command::Verack,
            Message::Version { .. } => Command::Version,
            Message::Alert => Command::Alert,
            Message::Unknown(..) => {
                unreachable!("an Unknown message is never re-encoded with its own command")
            }
        }
    }
}
