//! A priority queue of candidate peer addresses with per-address backoff.

use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::backoff::ExponentialBackoff;
use crate::meta_addr::{MetaAddr, PeerAddrState};

/// Process-wide flag: once any IPv6 address fails with "no route to host",
/// every subsequent IPv6 candidate is skipped for the life of the group.
static IPV6_DISABLED: AtomicBool = AtomicBool::new(false);

/// Disable IPv6 candidates for the remainder of the process.
pub fn disable_ipv6() {
    IPV6_DISABLED.store(true, Ordering::SeqCst);
}

/// Whether IPv6 candidates are currently disabled.
pub fn ipv6_disabled() -> bool {
    IPV6_DISABLED.load(Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn reset_ipv6_disabled_for_tests() {
    IPV6_DISABLED.store(false, Ordering::SeqCst);
}

struct Entry {
    addr: MetaAddr,
    backoff: ExponentialBackoff,
}

/// Ordered (by next-eligible-retry, earliest first) so the book can be used
/// as a min-heap of retry candidates.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.backoff.next_retry() == other.backoff.next_retry()
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest retry sorts first.
        other.backoff.next_retry().cmp(&self.backoff.next_retry())
    }
}

/// A set of candidate [`MetaAddr`]s, deduplicated by `(ip, port)`, each with
/// its own [`ExponentialBackoff`] schedule, plus a group-wide backoff for
/// systemic failures (DNS unreachable, etc).
pub struct AddressBook {
    entries: BinaryHeap<Entry>,
    connected: std::collections::HashSet<SocketAddr>,
    group_backoff: ExponentialBackoff,
}

impl AddressBook {
    pub fn new(now: DateTime<Utc>) -> AddressBook {
        AddressBook {
            entries: BinaryHeap::new(),
            connected: std::collections::HashSet::new(),
            group_backoff: ExponentialBackoff::group(now),
        }
    }

    /// Insert a candidate address. A no-op if the address is currently
    /// connected, or already present in the book.
    pub fn insert(&mut self, addr: MetaAddr, now: DateTime<Utc>) {
        if self.connected.contains(&addr.key()) {
            return;
        }
        if self.entries.iter().any(|e| e.addr.key() == addr.key()) {
            return;
        }
        self.entries.push(Entry {
            addr,
            backoff: ExponentialBackoff::new(now),
        });
    }

    /// Pop the next address eligible for a connection attempt, skipping
    /// addresses not yet past their retry instant or (when disabled) IPv6
    /// addresses. Marks the address as connected.
    pub fn next_candidate(&mut self, now: DateTime<Utc>) -> Option<MetaAddr> {
        if !self.group_backoff.is_eligible(now) {
            return None;
        }

        let mut deferred = Vec::new();
        let mut chosen = None;
        while let Some(entry) = self.entries.pop() {
            if !entry.backoff.is_eligible(now) {
                deferred.push(entry);
                break;
            }
            if ipv6_disabled() && entry.addr.is_ipv6() {
                deferred.push(entry);
                continue;
            }
            chosen = Some(entry.addr);
            break;
        }
        for entry in deferred {
            self.entries.push(entry);
        }

        if let Some(addr) = chosen {
            self.connected.insert(addr.key());
        }
        chosen
    }

    /// Record that a connection attempt to `key` succeeded or failed. The
    /// address must have previously been returned by [`Self::next_candidate`].
    pub fn record_outcome(&mut self, key: SocketAddr, success: bool, now: DateTime<Utc>) {
        if success {
            self.group_backoff.record_success(now);
        } else {
            self.group_backoff.record_failure(now);
        }
        self.connected.remove(&key);
    }

    /// Re-insert `addr` on disconnect, with its backoff updated according to
    /// `success` (a graceful close counts as success; do not penalize it).
    pub fn reinsert_on_disconnect(
        &mut self,
        mut addr: MetaAddr,
        success: bool,
        now: DateTime<Utc>,
    ) {
        self.connected.remove(&addr.key());
        addr.state = PeerAddrState::Failed;
        let mut backoff = ExponentialBackoff::new(now);
        if success {
            backoff.record_success(now);
        } else {
            backoff.record_failure(now);
        }
        self.entries.push(Entry { addr, backoff });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Export all known addresses (connected or not) for caller-side
    /// persistence. This crate does not own storage; it only hands back a
    /// snapshot.
    pub fn export(&self) -> Vec<MetaAddr> {
        self.entries.iter().map(|e| e.addr).collect()
    }

    /// Seed the book with previously-persisted addresses.
    pub fn seed(&mut self, addrs: impl IntoIterator<Item = MetaAddr>, now: DateTime<Utc>) {
        for addr in addrs {
            self.insert(addr, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::external::types::PeerServices;
    use chrono::TimeZone;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp(1_600_000_000, 0)
    }

    #[test]
    fn deduplicates_by_address_and_port() {
        let now = epoch();
        let mut book = AddressBook::new(now);
        let addr = MetaAddr::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 6)), 8333),
            PeerServices::NODE_NETWORK,
        );
        book.insert(addr, now);
        book.insert(addr, now);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn never_reinserts_a_connected_address() {
        let now = epoch();
        let mut book = AddressBook::new(now);
        let addr = MetaAddr::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 6)), 8333),
            PeerServices::NODE_NETWORK,
        );
        book.insert(addr, now);
        let candidate = book.next_candidate(now).unwrap();
        assert_eq!(candidate.key(), addr.key());
        book.insert(addr, now);
        assert_eq!(book.len(), 0);
    }

    #[test]
    fn ipv6_disabled_flag_skips_ipv6_candidates() {
        reset_ipv6_disabled_for_tests();
        let now = epoch();
        let mut book = AddressBook::new(now);
        let v4 = MetaAddr::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 6)), 8333),
            PeerServices::NODE_NETWORK,
        );
        let v6 = MetaAddr::new(
            SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)), 8333),
            PeerServices::NODE_NETWORK,
        );
        book.insert(v6, now);
        disable_ipv6();
        book.insert(v4, now);
        let candidate = book.next_candidate(now).unwrap();
        assert_eq!(candidate.key(), v4.key());
        reset_ipv6_disabled_for_tests();
    }
}
