//! Newtype wrappers for primitive wire-format values.

use std::{fmt, io};

use bitflags::bitflags;
use rand::Rng;

use crate::constants::Network;
use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// The network protocol version a peer speaks, e.g. `70015`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u32);

impl BitcoinSerialize for ProtocolVersion {
    fn bitcoin_serialize<W: io::Write>(&self, target: W) -> Result<(), io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for ProtocolVersion {
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(ProtocolVersion(u32::bitcoin_deserialize(reader)?))
    }
}

bitflags! {
    /// Services a peer advertises in its `version` message, as a bitfield.
    #[derive(Default)]
    pub struct PeerServices: u64 {
        /// Full node, able to serve complete blocks.
        const NODE_NETWORK = 1 << 0;
        /// Deprecated BIP64 getutxo support.
        const NODE_GETUTXO = 1 << 1;
        /// BIP111 Bloom-filter support; required for `filterload`/`filteradd`.
        const NODE_BLOOM = 1 << 2;
        /// BIP144 segregated witness support.
        const NODE_WITNESS = 1 << 3;
        /// BIP159 pruned-node service, with at least the last 288 blocks.
        const NODE_NETWORK_LIMITED = 1 << 10;
    }
}

impl PeerServices {
    /// Whether this set advertises the service a filter-capable download
    /// peer needs.
    pub fn supports_filters(&self) -> bool {
        self.contains(PeerServices::NODE_BLOOM)
    }
}

impl BitcoinSerialize for PeerServices {
    fn bitcoin_serialize<W: io::Write>(&self, target: W) -> Result<(), io::Error> {
        self.bits().bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for PeerServices {
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        // Unrecognized bits are preserved rather than rejected: `from_bits_truncate`
        // would silently drop bits a newer peer sets that we don't know about yet.
        Ok(PeerServices::from_bits_truncate(u64::bitcoin_deserialize(
            reader,
        )?))
    }
}

/// A nonce distinguishing `ping`/`pong` pairs and detecting self-connections
/// in the `version` handshake.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Nonce(pub u64);

impl Nonce {
    pub fn random() -> Nonce {
        Nonce(rand::thread_rng().gen())
    }
}

impl BitcoinSerialize for Nonce {
    fn bitcoin_serialize<W: io::Write>(&self, target: W) -> Result<(), io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Nonce {
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Nonce(u64::bitcoin_deserialize(reader)?))
    }
}

/// The raw bit field of a BIP37 Bloom filter, as carried in `filterload`.
#[derive(Clone, Eq, PartialEq)]
pub struct Filter(pub Vec<u8>);

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.0.len()).finish()
    }
}

/// A BIP37 filter tweak, mixed into each of the filter's hash functions.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Tweak(pub u32);

/// A network magic value, identifying which Bitcoin network a message
/// belongs to. Appears as the first four bytes of every message header.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Magic(pub [u8; 4]);

impl fmt::Debug for Magic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Magic").field(&hex::encode(self.0)).finish()
    }
}

impl From<Network> for Magic {
    fn from(network: Network) -> Self {
        Magic(network.params().magic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_service_bits_are_preserved_across_round_trip() {
        let raw: u64 = PeerServices::NODE_NETWORK.bits() | (1 << 40);
        let bytes = raw.bitcoin_serialize_to_vec().unwrap();
        let services: PeerServices =
            crate::serialization::BitcoinDeserializeInto::bitcoin_deserialize_into(
                bytes.as_slice(),
            )
            .unwrap();
        assert_eq!(services.bits(), raw);
    }

    #[test]
    fn magic_matches_network_params() {
        assert_eq!(Magic::from(Network::Mainnet).0, [0xF9, 0xBE, 0xB4, 0xD9]);
    }
}
