use crate::merkle::PartialMerkleTree;
use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, CompactInt, SerializationError};
use crate::{block, transaction};

/// A reply to a `getdata` requesting `MSG_FILTERED_BLOCK`: a block header
/// plus a BIP37 proof of which transactions matched the requesting peer's
/// Bloom filter. Matching transactions themselves follow as separate `tx`
/// messages, not as part of this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    pub block_header: block::Header,
    pub transaction_count: u32,
    pub hashes: Vec<transaction::Hash>,
    pub flags: Vec<u8>,
}

impl MerkleBlock {
    /// The partial Merkle tree carried by this message, for root
    /// reconstruction and match extraction.
    pub fn partial_merkle_tree(&self) -> PartialMerkleTree {
        PartialMerkleTree::new(
            self.transaction_count,
            self.hashes.clone(),
            self.flags.clone(),
        )
    }

    fn serialized_size(&self) -> usize {
        block::Header::len()
            + 4
            + CompactInt::size(self.hashes.len())
            + (self.hashes.len() * 32)
            + CompactInt::size(self.flags.len())
            + self.flags.len()
    }
}

impl BitcoinSerialize for MerkleBlock {
    fn bitcoin_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        self.block_header.bitcoin_serialize(&mut target)?;
        self.transaction_count.bitcoin_serialize(&mut target)?;
        self.hashes.bitcoin_serialize(&mut target)?;
        self.flags.bitcoin_serialize(&mut target)
    }
}

impl BitcoinDeserialize for MerkleBlock {
    fn bitcoin_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(MerkleBlock {
            block_header: block::Header::bitcoin_deserialize(&mut reader)?,
            transaction_count: u32::bitcoin_deserialize(&mut reader)?,
            hashes: Vec::bitcoin_deserialize(&mut reader)?,
            flags: Vec::bitcoin_deserialize(&mut reader)?,
        })
    }
}

#[test]
fn serial_size() {
    use chrono::{TimeZone, Utc};

    let block_header = block::Header {
        version: 1,
        previous_block_hash: block::Hash([0u8; 32]),
        merkle_root: block::Hash([1u8; 32]),
        time: Utc.timestamp(1_231_006_505, 0),
        bits: 0x1d00ffff,
        nonce: 2083236893,
    };

    let msg = MerkleBlock {
        block_header,
        transaction_count: 3,
        hashes: vec![
            transaction::Hash([0u8; 32]),
            transaction::Hash([1u8; 32]),
            transaction::Hash([3u8; 32]),
        ],
        flags: vec![232u8, 11],
    };
    let serial = msg
        .bitcoin_serialize_to_vec()
        .expect("Serializing into vec shouldn't fail");
    assert_eq!(serial.len(), msg.serialized_size());
}
