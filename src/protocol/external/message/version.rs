use std::io;
use std::net::SocketAddr;

use chrono::{TimeZone, Utc};

use super::super::types::{Nonce, PeerServices, ProtocolVersion};
use crate::block;
use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A `version` message.
///
/// Note that although this is called `version` in Bitcoin, its role is really
/// analogous to a `ClientHello` message in TLS, used to begin a handshake, and
/// is distinct from a simple version number.
///
/// [Bitcoin reference](https://en.bitcoin.it/wiki/Protocol_documentation#version)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Version {
    /// The network version number supported by the sender.
    pub version: ProtocolVersion,

    /// The network services advertised by the sender.
    pub services: PeerServices,

    /// The time when the version message was sent.
    pub timestamp: chrono::DateTime<Utc>,

    /// The network address of the node receiving this message, and its
    /// advertised network services.
    pub address_recv: (PeerServices, SocketAddr),

    /// The network address of the node sending this message, and its
    /// advertised network services.
    pub address_from: (PeerServices, SocketAddr),

    /// Node random nonce, randomly generated every time a version
    /// packet is sent. This nonce is used to detect connections
    /// to self.
    pub nonce: Nonce,

    /// The user agent advertised by the sender.
    pub user_agent: String,

    /// The last block received by the emitting node.
    pub best_block: block::Height,

    /// Whether the remote peer should announce relayed
    /// transactions or not, see [BIP 0037](https://github.com/bitcoin/bips/blob/master/bip-0037.mediawiki)
    pub relay: bool,
}

impl Version {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: ProtocolVersion,
        their_ip: SocketAddr,
        their_services: PeerServices,
        our_services: PeerServices,
        our_ip: SocketAddr,
        nonce: Nonce,
        user_agent: String,
        best_block: block::Height,
        relay: bool,
    ) -> Version {
        // Truncate the timestamp to the nearest 5 minutes, to stay within
        // the range where bitcoin core will ignore our clock skew.
        let now = Utc::now().timestamp();
        let timestamp = Utc.timestamp(now - now.rem_euclid(5 * 60), 0);
        Version {
            version,
            services: our_services,
            timestamp,
            address_recv: (their_services, their_ip),
            address_from: (our_services, our_ip),
            nonce,
            user_agent,
            best_block,
            relay,
        }
    }
}

impl BitcoinSerialize for Version {
    fn bitcoin_serialize<W: io::Write>(&self, mut target: W) -> Result<(), io::Error> {
        self.version.bitcoin_serialize(&mut target)?;
        self.services.bitcoin_serialize(&mut target)?;
        self.timestamp.bitcoin_serialize(&mut target)?;
        self.address_recv.bitcoin_serialize(&mut target)?;
        self.address_from.bitcoin_serialize(&mut target)?;
        self.nonce.bitcoin_serialize(&mut target)?;
        self.user_agent.bitcoin_serialize(&mut target)?;
        self.best_block.bitcoin_serialize(&mut target)?;
        self.relay.bitcoin_serialize(&mut target)
    }
}

impl BitcoinDeserialize for Version {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Version {
            version: ProtocolVersion::bitcoin_deserialize(&mut reader)?,
            services: PeerServices::bitcoin_deserialize(&mut reader)?,
            timestamp: <chrono::DateTime<Utc>>::bitcoin_deserialize(&mut reader)?,
            address_recv: <(PeerServices, SocketAddr)>::bitcoin_deserialize(&mut reader)?,
            address_from: <(PeerServices, SocketAddr)>::bitcoin_deserialize(&mut reader)?,
            nonce: Nonce::bitcoin_deserialize(&mut reader)?,
            user_agent: String::bitcoin_deserialize(&mut reader)?,
            best_block: block::Height::bitcoin_deserialize(&mut reader)?,
            relay: bool::bitcoin_deserialize(&mut reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn round_trips_through_wire_bytes() {
        let services = PeerServices::NODE_NETWORK;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 6)), 8333);
        let version = Version::new(
            ProtocolVersion(70015),
            addr,
            services,
            services,
            addr,
            Nonce(0x9082_4908_8927_9238),
            "/test:0.1/".to_owned(),
            block::Height(540_000),
            true,
        );
        let bytes = version.bitcoin_serialize_to_vec().unwrap();
        let parsed = Version::bitcoin_deserialize(bytes.as_slice()).unwrap();
        assert_eq!(version, parsed);
    }
}
