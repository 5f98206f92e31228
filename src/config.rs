//! Caller-supplied configuration.
//!
//! This crate never reads configuration files itself; a caller builds a
//! `Config` (from TOML, environment variables, whatever) and hands it to
//! [`crate::peer_group::PeerGroup::new`].

use std::time::Duration;

use serde::Deserialize;

use crate::constants::{self, Network};

/// Peer-group behaviour, independent of any one connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which Bitcoin-family network to speak.
    pub network: Network,

    /// Connections to open at startup.
    pub initial_connections: usize,

    /// Floor on connections `PeerGroup` will try to maintain.
    pub min_connections: usize,

    /// Ceiling on simultaneous connections.
    pub max_connections: usize,

    /// Interval between keepalive `ping`s on an idle connection.
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,

    /// Target false-positive rate for the merged wallet Bloom filter.
    pub target_filter_fp_rate: f64,

    /// Try a loopback peer before reaching out over the network; useful when
    /// a full node is known to be running locally (e.g. alongside a wallet).
    pub prefer_localhost: bool,

    /// Bound on the per-peer outbound message queue; a slow peer that can't
    /// keep up is disconnected rather than let the queue grow unbounded.
    pub peer_send_queue_depth: usize,

    /// How long to wait for a handshake to complete before giving up.
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            network: Network::Mainnet,
            initial_connections: 8,
            min_connections: 1,
            max_connections: 12,
            ping_interval: Duration::from_secs(120),
            target_filter_fp_rate: constants::DEFAULT_FILTER_FP_RATE,
            prefer_localhost: true,
            peer_send_queue_depth: 64,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// `max_connections` is pinned to 1 once a localhost peer is found and
    /// `prefer_localhost` is set: a single well-connected local full node
    /// makes an outbound mesh redundant.
    pub fn effective_max_connections(&self, localhost_peer_found: bool) -> usize {
        if self.prefer_localhost && localhost_peer_found {
            1
        } else {
            self.max_connections
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.min_connections <= config.max_connections);
        assert!(config.peer_send_queue_depth > 0);
    }

    #[test]
    fn localhost_preference_pins_max_connections_to_one() {
        let config = Config::default();
        assert_eq!(config.effective_max_connections(true), 1);
        assert_eq!(
            config.effective_max_connections(false),
            config.max_connections
        );
    }
}
