use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A `sendcmpct` message, asking the receiver to announce new blocks via
/// BIP152 compact blocks in the future rather than the networking core
/// implements compact-block relay itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCompact {
    pub announce: bool,
    pub version: u64,
}

impl SendCompact {
    pub const fn serialized_size(&self) -> usize {
        9
    }
}

impl BitcoinSerialize for SendCompact {
    fn bitcoin_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        self.announce.bitcoin_serialize(&mut target)?;
        self.version.bitcoin_serialize(&mut target)
    }
}

impl BitcoinDeserialize for SendCompact {
    fn bitcoin_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(SendCompact {
            announce: bool::bitcoin_deserialize(&mut reader)?,
            version: u64::bitcoin_deserialize(&mut reader)?,
        })
    }
}

#[test]
fn serial_size() {
    let msg = SendCompact {
        announce: true,
        version: 32381,
    };
    let serial = msg
        .bitcoin_serialize_to_vec()
        .expect("Serializing into vec shouldn't fail");
    assert_eq!(serial.len(), msg.serialized_size());
}
