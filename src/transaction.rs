//! Transactions, as seen by the networking core.
//!
//! Transaction validation, scripting, and the UTXO model live outside this
//! crate's scope. A `Transaction` here is an opaque, already-serialized blob:
//! we need to relay it, hash it, and attribute it to a filtered block's
//! matched set, but never to interpret its contents.

use std::{fmt, io};

use crate::serialization::{sha256d, BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A transaction hash (TXID), in the same natural/display byte-order
/// convention as [`crate::block::Hash`].
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn from_bytes_exact(bytes: [u8; 32]) -> Hash {
        Hash(bytes)
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
        f.debug_tuple("transaction::Hash")
            .field(&hex::encode(reversed))
            .finish()
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

/// An opaque, fully-serialized transaction.
///
/// The message envelope already bounds the payload length, so a `tx` message
/// body is just read to EOF rather than length-prefixed again.
#[derive(Clone, Eq, PartialEq)]
pub struct Transaction {
    raw: Vec<u8>,
}

impl Transaction {
    pub fn from_raw(raw: Vec<u8>) -> Transaction {
        Transaction { raw }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn hash(&self) -> Hash {
        Hash(sha256d::double_sha256(&self.raw))
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("hash", &self.hash())
            .field("len", &self.raw.len())
            .finish()
    }
}

impl BitcoinSerialize for Transaction {
    fn bitcoin_serialize<W: io::Write>(&self, mut target: W) -> Result<(), io::Error> {
        target.write_all(&self.raw)
    }
}

impl BitcoinDeserialize for Transaction {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        Ok(Transaction { raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_double_sha256_of_raw_bytes() {
        let tx = Transaction::from_raw(vec![1, 2, 3, 4]);
        assert_eq!(tx.hash().0, sha256d::double_sha256(&[1, 2, 3, 4]));
    }
}
