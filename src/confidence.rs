//! Process-wide transaction confidence tracking.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::block;
use crate::protocol::external::message::RejectReason;
use crate::transaction;

/// How a transaction reached us, mirroring Bitcoin Core's `knowntype`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BroadcastSource {
    Unknown,
    Network,
    /// Created and broadcast by this process.
    SelfBroadcast,
}

/// The confidence classification of a tracked transaction.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TxConfidenceType {
    Unknown,
    Pending,
    InConflict,
    Building,
    Dead,
}

/// Why a confidence-change event fired, for listener filtering.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChangeReason {
    Type,
    Depth,
    SeenPeers,
    Rejected,
}

/// What PeerGroup knows about a transaction's propagation and chain status.
#[derive(Debug, Clone)]
pub struct ConfidenceRecord {
    pub hash: transaction::Hash,
    pub confidence_type: TxConfidenceType,
    /// Depth in the best chain; zero unless `Building`.
    pub depth: u32,
    pub announced_by: HashSet<SocketAddr>,
    /// Distinct peers that sent a `reject` for this transaction, and the
    /// reason given by the first one to do so.
    pub rejected_by: HashSet<SocketAddr>,
    pub first_reject_reason: Option<RejectReason>,
    pub last_broadcast: Option<DateTime<Utc>>,
    pub source: BroadcastSource,
    /// Set only for `Dead`: the transaction that overrode this one.
    pub overriding_hash: Option<transaction::Hash>,
    /// Set only for `Building`: the height at which it first appeared.
    pub appeared_at_height: Option<block::Height>,
    /// How many external observers currently pin this record against
    /// eviction; guarded the same way the rest of the record is.
    pin_count: Arc<AtomicUsize>,
}

impl ConfidenceRecord {
    fn new(hash: transaction::Hash, source: BroadcastSource, now: DateTime<Utc>) -> ConfidenceRecord {
        ConfidenceRecord {
            hash,
            confidence_type: TxConfidenceType::Unknown,
            depth: 0,
            announced_by: HashSet::new(),
            rejected_by: HashSet::new(),
            first_reject_reason: None,
            last_broadcast: if matches!(source, BroadcastSource::SelfBroadcast) {
                Some(now)
            } else {
                None
            },
            source,
            overriding_hash: None,
            appeared_at_height: None,
            pin_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn num_broadcast_peers(&self) -> usize {
        self.announced_by.len()
    }

    pub fn num_reject_peers(&self) -> usize {
        self.rejected_by.len()
    }

    /// Pin this record against eviction for the lifetime of the returned
    /// guard (e.g. held by a confidence-change subscription).
    pub fn pin(&self) -> ConfidencePin {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
        ConfidencePin {
            pin_count: self.pin_count.clone(),
        }
    }

    fn is_evictable(&self) -> bool {
        self.pin_count.load(Ordering::SeqCst) == 0
    }
}

/// An observer's hold on a [`ConfidenceRecord`]; dropping it releases the pin.
pub struct ConfidencePin {
    pin_count: Arc<AtomicUsize>,
}

impl Drop for ConfidencePin {
    fn drop(&mut self) {
        self.pin_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A process-wide, sharded map from transaction hash to confidence record.
///
/// Records are `Arc`-held; with no external pin and no other outstanding
/// `Arc` (i.e. a broadcast isn't also holding it), a periodic sweep evicts
/// them, standing in for a weak-reference GC in the source design.
#[derive(Default)]
pub struct ConfidenceTable {
    records: DashMap<transaction::Hash, Arc<ConfidenceRecord>>,
}

impl ConfidenceTable {
    pub fn new() -> ConfidenceTable {
        ConfidenceTable {
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get or create the record for `hash`.
    pub fn entry(
        &self,
        hash: transaction::Hash,
        source: BroadcastSource,
        now: DateTime<Utc>,
    ) -> Arc<ConfidenceRecord> {
        self.records
            .entry(hash)
            .or_insert_with(|| Arc::new(ConfidenceRecord::new(hash, source, now)))
            .clone()
    }

    pub fn get(&self, hash: &transaction::Hash) -> Option<Arc<ConfidenceRecord>> {
        self.records.get(hash).map(|r| r.clone())
    }

    /// Record that `peer` announced `hash`, idempotently. Returns the
    /// reason(s) a listener should be notified for, if anything changed.
    pub fn mark_broadcast_by(
        &self,
        hash: transaction::Hash,
        peer: SocketAddr,
        now: DateTime<Utc>,
    ) -> Vec<ChangeReason> {
        let record = self.entry(hash, BroadcastSource::Network, now);
        let mut reasons = Vec::new();

        let mut updated = (*record).clone();
        if updated.announced_by.insert(peer) {
            reasons.push(ChangeReason::SeenPeers);
        }
        if matches!(updated.confidence_type, TxConfidenceType::Unknown) {
            updated.confidence_type = TxConfidenceType::Pending;
            updated.depth = 0;
            reasons.push(ChangeReason::Type);
        }

        if !reasons.is_empty() {
            self.records.insert(hash, Arc::new(updated));
        }
        reasons
    }

    /// Record that `peer` sent a `reject` for `hash`, idempotently per peer.
    /// Used by a running broadcast to decide whether the reject threshold
    /// for that transaction has tripped.
    pub fn mark_rejected(
        &self,
        hash: transaction::Hash,
        peer: SocketAddr,
        reason: RejectReason,
        now: DateTime<Utc>,
    ) -> Vec<ChangeReason> {
        let record = self.entry(hash, BroadcastSource::Network, now);
        let mut updated = (*record).clone();
        let mut reasons = Vec::new();
        if updated.rejected_by.insert(peer) {
            if updated.first_reject_reason.is_none() {
                updated.first_reject_reason = Some(reason);
            }
            reasons.push(ChangeReason::Rejected);
            self.records.insert(hash, Arc::new(updated));
        }
        reasons
    }

    /// Transition a record to `Building` at `height`, with `depth ≥ 1`.
    pub fn mark_building(&self, hash: transaction::Hash, height: block::Height, depth: u32) {
        if let Some(record) = self.records.get(&hash) {
            let mut updated = (**record).clone();
            updated.confidence_type = TxConfidenceType::Building;
            updated.depth = depth.max(1);
            updated.appeared_at_height = Some(height);
            drop(record);
            self.records.insert(hash, Arc::new(updated));
        }
    }

    /// Transition a record to `Dead`, recording the overriding transaction.
    pub fn mark_dead(&self, hash: transaction::Hash, overriding_hash: transaction::Hash) {
        if let Some(record) = self.records.get(&hash) {
            let mut updated = (**record).clone();
            updated.confidence_type = TxConfidenceType::Dead;
            updated.overriding_hash = Some(overriding_hash);
            drop(record);
            self.records.insert(hash, Arc::new(updated));
        }
    }

    /// Remove every record that is both unpinned and not referenced
    /// elsewhere (e.g. by a live `TransactionBroadcast`).
    pub fn sweep(&self) {
        self.records
            .retain(|_, record| !(record.is_evictable() && Arc::strong_count(record) == 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp(1_600_000_000, 0)
    }

    fn hash(byte: u8) -> transaction::Hash {
        transaction::Hash([byte; 32])
    }

    #[test]
    fn broadcast_peer_count_matches_distinct_announcers() {
        let table = ConfidenceTable::new();
        let tx = hash(1);
        let now = epoch();
        table.mark_broadcast_by(tx, "127.0.0.1:1".parse().unwrap(), now);
        table.mark_broadcast_by(tx, "127.0.0.1:2".parse().unwrap(), now);
        table.mark_broadcast_by(tx, "127.0.0.1:1".parse().unwrap(), now);
        assert_eq!(table.get(&tx).unwrap().num_broadcast_peers(), 2);
    }

    #[test]
    fn unknown_becomes_pending_on_first_announce() {
        let table = ConfidenceTable::new();
        let tx = hash(2);
        let now = epoch();
        table.mark_broadcast_by(tx, "127.0.0.1:1".parse().unwrap(), now);
        assert!(matches!(
            table.get(&tx).unwrap().confidence_type,
            TxConfidenceType::Pending
        ));
    }

    #[test]
    fn sweep_keeps_pinned_records() {
        let table = ConfidenceTable::new();
        let tx = hash(3);
        let now = epoch();
        let record = table.entry(tx, BroadcastSource::SelfBroadcast, now);
        let _pin = record.pin();
        drop(record);
        table.sweep();
        assert!(table.get(&tx).is_some());
    }

    #[test]
    fn reject_count_matches_distinct_rejecting_peers_and_keeps_first_reason() {
        let table = ConfidenceTable::new();
        let tx = hash(5);
        let now = epoch();
        table.mark_rejected(tx, "127.0.0.1:1".parse().unwrap(), RejectReason::InsufficientFee, now);
        table.mark_rejected(tx, "127.0.0.1:2".parse().unwrap(), RejectReason::Invalid, now);
        table.mark_rejected(tx, "127.0.0.1:1".parse().unwrap(), RejectReason::Invalid, now);
        let record = table.get(&tx).unwrap();
        assert_eq!(record.num_reject_peers(), 2);
        assert_eq!(record.first_reject_reason, Some(RejectReason::InsufficientFee));
    }

    #[test]
    fn sweep_evicts_unpinned_unreferenced_records() {
        let table = ConfidenceTable::new();
        let tx = hash(4);
        let now = epoch();
        table.entry(tx, BroadcastSource::SelfBroadcast, now);
        table.sweep();
        assert!(table.get(&tx).is_none());
    }
}
