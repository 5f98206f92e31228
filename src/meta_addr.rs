//! Peer addresses, as exchanged in `addr` messages and tracked by the
//! [`crate::address_book::AddressBook`].

use std::{io, net::SocketAddr};

use chrono::{DateTime, TimeZone, Utc};

use crate::protocol::external::types::PeerServices;
use crate::serialization::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// What we know about a peer address beyond its raw socket endpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PeerAddrState {
    /// Never successfully connected, but a candidate.
    NeverAttempted,
    /// Currently connected on a live [`crate::peer::Peer`].
    Connected,
    /// We tried and failed, or disconnected; awaiting backoff expiry.
    Failed,
}

/// A peer address with its advertised services and optional last-seen time.
///
/// The timestamp is only present when the address came from an `addr`
/// message exchanged under protocol ≥ 31402 outside of the version
/// handshake; addresses we discover some other way (e.g. DNS seeds) have no
/// meaningful last-seen time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MetaAddr {
    pub addr: SocketAddr,
    pub services: PeerServices,
    pub last_seen: Option<DateTime<Utc>>,
    pub state: PeerAddrState,
}

impl MetaAddr {
    pub fn new(addr: SocketAddr, services: PeerServices) -> MetaAddr {
        MetaAddr {
            addr,
            services,
            last_seen: None,
            state: PeerAddrState::NeverAttempted,
        }
    }

    pub fn new_gossiped(addr: SocketAddr, services: PeerServices, last_seen: DateTime<Utc>) -> MetaAddr {
        MetaAddr {
            addr,
            services,
            last_seen: Some(last_seen),
            state: PeerAddrState::NeverAttempted,
        }
    }

    /// The (ip, port) identity used for address-book de-duplication.
    pub fn key(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.addr, SocketAddr::V6(_)) && self.addr.ip().to_canonical().is_ipv6()
    }
}

/// Writes a `MetaAddr` with its 4-byte timestamp prefix, as used outside the
/// version handshake (protocol ≥ 31402).
impl BitcoinSerialize for MetaAddr {
    fn bitcoin_serialize<W: io::Write>(&self, mut target: W) -> Result<(), io::Error> {
        let timestamp = self
            .last_seen
            .unwrap_or_else(|| Utc.timestamp(0, 0));
        timestamp.bitcoin_serialize(&mut target)?;
        self.services.bitcoin_serialize(&mut target)?;
        self.addr.bitcoin_serialize(&mut target)
    }
}

impl BitcoinDeserialize for MetaAddr {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let timestamp = <DateTime<Utc>>::bitcoin_deserialize(&mut reader)?;
        let services = PeerServices::bitcoin_deserialize(&mut reader)?;
        let addr = SocketAddr::bitcoin_deserialize(&mut reader)?;
        Ok(MetaAddr {
            addr,
            services,
            last_seen: Some(timestamp),
            state: PeerAddrState::NeverAttempted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn round_trips_through_wire_bytes() {
        let addr = MetaAddr::new_gossiped(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 6)), 8333),
            PeerServices::NODE_NETWORK,
            Utc.timestamp(1_600_000_000, 0),
        );
        let bytes = addr.bitcoin_serialize_to_vec().unwrap();
        assert_eq!(bytes.len(), 30);
        let parsed = MetaAddr::bitcoin_deserialize(bytes.as_slice()).unwrap();
        assert_eq!(parsed.addr, addr.addr);
        assert_eq!(parsed.services, addr.services);
        assert_eq!(parsed.last_seen, addr.last_seen);
    }
}
