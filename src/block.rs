//! Block headers and the handful of block-level types the networking core
//! needs to speak the wire protocol.
//!
//! Full block bodies, transaction validation, and chain-state bookkeeping are
//! someone else's problem; this module only carries what's needed to frame
//! `headers`/`merkleblock`/`getheaders` messages and hand the result to a
//! [`crate::blockchain::BlockChain`] collaborator.

use std::{fmt, io, str::FromStr};

use chrono::{DateTime, Utc};

use crate::serialization::{sha256d, BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A block height, counted from the genesis block at height zero.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Height(pub u32);

impl BitcoinSerialize for Height {
    fn bitcoin_serialize<W: io::Write>(&self, target: W) -> Result<(), io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Height {
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Height(u32::bitcoin_deserialize(reader)?))
    }
}

/// A double-SHA256 hash identifying a block (of its header) or a transaction.
///
/// Stored in natural byte order; Bitcoin's wire format and its conventional
/// hex display both use the reverse ("big-endian") order, so `Display` and
/// `FromStr` flip the bytes.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn from_bytes_exact(bytes: [u8; 32]) -> Hash {
        Hash(bytes)
    }

    /// The all-zero hash, used as a "none" stop-hash sentinel in `getblocks`
    /// and `getheaders`.
    pub fn zero() -> Hash {
        Hash([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.debug_tuple("block::Hash")
            .field(&hex::encode(reversed))
            .finish()
    }
}

impl FromStr for Hash {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes[..])
            .map_err(|_| SerializationError::Parse("invalid hex in block hash"))?;
        bytes.reverse();
        Ok(Hash(bytes))
    }
}

impl BitcoinSerialize for Hash {
    fn bitcoin_serialize<W: io::Write>(&self, target: W) -> Result<(), io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Hash {
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Hash(<[u8; 32]>::bitcoin_deserialize(reader)?))
    }
}

impl<'a> From<&'a Header> for Hash {
    fn from(header: &'a Header) -> Self {
        let mut writer = sha256d::Writer::default();
        header
            .bitcoin_serialize(&mut writer)
            .expect("Writer is infallible");
        Hash(writer.finish())
    }
}

/// An 80-byte Bitcoin block header.
///
/// Validity (PoW target, chain linkage) is a [`crate::blockchain::BlockChain`]
/// collaborator's job, not this type's; `Header` only knows how to
/// (de)serialize itself and compute its own hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub version: i32,
    pub previous_block_hash: Hash,
    pub merkle_root: Hash,
    pub time: DateTime<Utc>,
    /// Encoded PoW target, in Bitcoin's compact `nBits` form.
    pub bits: u32,
    pub nonce: u32,
}

impl Header {
    /// Serialized header length, in bytes.
    pub const fn len() -> usize {
        80
    }

    pub fn hash(&self) -> Hash {
        Hash::from(self)
    }
}

impl BitcoinSerialize for Header {
    fn bitcoin_serialize<W: io::Write>(&self, mut target: W) -> Result<(), io::Error> {
        self.version.bitcoin_serialize(&mut target)?;
        self.previous_block_hash.bitcoin_serialize(&mut target)?;
        self.merkle_root.bitcoin_serialize(&mut target)?;
        self.time.bitcoin_serialize(&mut target)?;
        self.bits.bitcoin_serialize(&mut target)?;
        self.nonce.bitcoin_serialize(&mut target)
    }
}

impl BitcoinDeserialize for Header {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Header {
            version: i32::bitcoin_deserialize(&mut reader)?,
            previous_block_hash: Hash::bitcoin_deserialize(&mut reader)?,
            merkle_root: Hash::bitcoin_deserialize(&mut reader)?,
            time: <DateTime<Utc>>::bitcoin_deserialize(&mut reader)?,
            bits: u32::bitcoin_deserialize(&mut reader)?,
            nonce: u32::bitcoin_deserialize(&mut reader)?,
        })
    }
}

/// A header bundled with the transaction count Bitcoin's `headers` message
/// sends alongside it (the count is always zero on the wire, but we keep it
/// explicit rather than discarding it).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CountedHeader {
    pub header: Header,
    pub transaction_count: u64,
}

impl BitcoinSerialize for CountedHeader {
    fn bitcoin_serialize<W: io::Write>(&self, mut target: W) -> Result<(), io::Error> {
        self.header.bitcoin_serialize(&mut target)?;
        crate::serialization::CompactInt::from(self.transaction_count as usize)
            .bitcoin_serialize(&mut target)
    }
}

impl BitcoinDeserialize for CountedHeader {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let header = Header::bitcoin_deserialize(&mut reader)?;
        let transaction_count =
            crate::serialization::CompactInt::bitcoin_deserialize(&mut reader)?.value();
        Ok(CountedHeader {
            header,
            transaction_count,
        })
    }
}

/// A full block: header plus the raw bytes of its transaction list.
///
/// Transaction parsing and validation are out of scope here; full `block`
/// messages are rarely requested by an SPV client (which prefers
/// `merkleblock`), so the transaction payload is carried opaquely.
#[derive(Clone, Eq, PartialEq)]
pub struct Block {
    pub header: Header,
    raw_transactions: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Block")
            .field("hash", &self.hash())
            .field("body_len", &self.raw_transactions.len())
            .finish()
    }
}

impl BitcoinSerialize for Block {
    fn bitcoin_serialize<W: io::Write>(&self, mut target: W) -> Result<(), io::Error> {
        self.header.bitcoin_serialize(&mut target)?;
        target.write_all(&self.raw_transactions)
    }
}

impl BitcoinDeserialize for Block {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let header = Header::bitcoin_deserialize(&mut reader)?;
        let mut raw_transactions = Vec::new();
        io::Read::read_to_end(&mut reader, &mut raw_transactions)?;
        Ok(Block {
            header,
            raw_transactions,
        })
    }
}

/// An ordered list of block hashes used in `getblocks`/`getheaders`, with
/// exponentially increasing gaps near the tip and a fixed set of recent
/// ancestors.
///
/// The remote peer walks its own best chain looking for the first hash it
/// recognizes, then replies starting from there.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BlockLocator {
    hashes: Vec<Hash>,
}

impl BlockLocator {
    /// Build a locator from `tip` downward using `ancestor`, a closure that
    /// returns the hash `steps_back` blocks behind a given hash (or `None`
    /// once it runs off the start of the chain).
    pub fn build(tip: Hash, mut ancestor: impl FnMut(Hash, u32) -> Option<Hash>) -> BlockLocator {
        let mut hashes = Vec::new();
        let mut step = 1u32;
        let mut current = tip;
        hashes.push(current);
        loop {
            if hashes.len() >= 10 {
                step = step.saturating_mul(2);
            }
            match ancestor(current, step) {
                Some(hash) => {
                    current = hash;
                    hashes.push(current);
                }
                None => break,
            }
            if hashes.len() >= crate::constants::MAX_LOCATOR_HASHES {
                break;
            }
        }
        BlockLocator { hashes }
    }

    pub fn hashes(&self) -> &[Hash] {
        &self.hashes
    }

    pub fn into_hashes(self) -> Vec<Hash> {
        self.hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_display_is_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xAB;
        bytes[31] = 0xCD;
        let hash = Hash(bytes);
        let text = hash.to_string();
        assert!(text.starts_with("cd"));
        assert!(text.ends_with("ab"));
    }

    #[test]
    fn hash_round_trips_through_display() {
        let hash = Hash([7u8; 32]);
        let parsed: Hash = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn locator_caps_at_max_entries() {
        let locator = BlockLocator::build(Hash([0u8; 32]), |_, _| Some(Hash([1u8; 32])));
        assert_eq!(locator.hashes().len(), crate::constants::MAX_LOCATOR_HASHES);
    }
}
