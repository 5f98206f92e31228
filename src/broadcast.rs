//! Single-shot transaction broadcast: fan out to a subset of connected
//! peers, then wait for enough of them to announce the transaction back (or
//! for it to appear in a mined block) before declaring success.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::confidence::{BroadcastSource, ChangeReason, ConfidenceTable};
use crate::error::BroadcastError;
use crate::protocol::external::message::RejectReason;
use crate::transaction::{Hash, Transaction};

/// Sends a transaction to one peer and, optionally, schedules that peer to
/// be dropped shortly after. Implemented by the peer-connection layer;
/// abstracted here so a broadcast can be tested without a live socket.
pub trait BroadcastTransport: Send + Sync {
    /// Enqueue `tx` for direct send to `peer`. Returns `false` if the peer
    /// is no longer connected and the send could not be queued.
    fn send_tx(&self, peer: SocketAddr, tx: Arc<Transaction>) -> bool;

    /// Schedule `peer` to be closed after `after`, used for
    /// `drop_peers_after` broadcasts (e.g. privacy-preserving one-shot
    /// sends that shouldn't linger).
    fn schedule_close(&self, peer: SocketAddr, after: Duration) {
        let _ = (peer, after);
    }
}

/// Parameters for one broadcast attempt.
pub struct BroadcastRequest {
    pub transaction: Arc<Transaction>,
    pub min_peers: usize,
    pub drop_peers_after: Option<Duration>,
    pub timeout: Duration,
}

/// A broadcast's fan-out and seen-by threshold, computed once at dispatch
/// time from the connected-peer snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub sent: usize,
    pub threshold: usize,
}

impl FanOut {
    /// `K = max(1, ceil(S/2))` peers chosen, `N = ceil((S - K)/2)` is the
    /// number of them that must announce the transaction back.
    fn compute(connected: usize) -> FanOut {
        let k = std::cmp::max(1, connected.div_ceil(2));
        let n = (connected.saturating_sub(k)).div_ceil(2);
        FanOut {
            sent: k,
            threshold: n,
        }
    }
}

/// A running broadcast's progress, in `[0.0, 1.0]`.
pub type Progress = f64;

/// One broadcast attempt for a single transaction.
pub struct TransactionBroadcast {
    confidence: Arc<ConfidenceTable>,
    progress: watch::Sender<Progress>,
}

impl TransactionBroadcast {
    pub fn new(confidence: Arc<ConfidenceTable>) -> (TransactionBroadcast, watch::Receiver<Progress>) {
        let (tx, rx) = watch::channel(0.0);
        (
            TransactionBroadcast {
                confidence,
                progress: tx,
            },
            rx,
        )
    }

    /// Run the broadcast against a snapshot of currently-connected peers,
    /// chosen by the caller (see `wait_for_peers` on the owning group).
    pub async fn run(
        &self,
        transport: &dyn BroadcastTransport,
        connected: Vec<SocketAddr>,
        request: BroadcastRequest,
    ) -> Result<(), BroadcastError> {
        if connected.len() < request.min_peers {
            warn!(
                connected = connected.len(),
                min_peers = request.min_peers,
                "fewer connected peers than required for broadcast"
            );
        }

        let hash = transaction_hash(&request.transaction);
        let fan_out = FanOut::compute(connected.len());

        let mut candidates = connected;
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        let chosen: Vec<SocketAddr> = candidates.into_iter().take(fan_out.sent).collect();

        self.confidence
            .entry(hash, BroadcastSource::SelfBroadcast, Utc::now());

        let mut sent_count = 0;
        for peer in &chosen {
            if transport.send_tx(*peer, request.transaction.clone()) {
                sent_count += 1;
                if let Some(after) = request.drop_peers_after {
                    transport.schedule_close(*peer, after);
                }
            }
        }
        debug!(sent = sent_count, threshold = fan_out.threshold, %hash, "broadcast fanned out");

        let deadline = sleep(request.timeout);
        tokio::pin!(deadline);

        loop {
            let record = self.confidence.get(&hash);
            let seen = record
                .as_ref()
                .map(|r| r.num_broadcast_peers())
                .unwrap_or(0);
            let rejected = record.as_ref().map(|r| r.num_reject_peers()).unwrap_or(0);
            let progress = if seen_or_mined(&self.confidence, &hash) {
                1.0
            } else if fan_out.threshold > 0 {
                (seen as f64 / fan_out.threshold as f64).min(1.0)
            } else {
                1.0
            };
            let _ = self.progress.send(progress);

            if seen_or_mined(&self.confidence, &hash) {
                return Ok(());
            }
            if fan_out.threshold > 0 && rejected * 2 > fan_out.threshold {
                let reason = record
                    .and_then(|r| r.first_reject_reason)
                    .unwrap_or(RejectReason::Other);
                return Err(BroadcastError::Rejected(reason));
            }

            tokio::select! {
                _ = &mut deadline => {
                    return Err(BroadcastError::Timeout { sent: sent_count, seen });
                }
                _ = sleep(Duration::from_millis(50)) => {}
            }
        }
    }
}

fn seen_or_mined(confidence: &ConfidenceTable, hash: &Hash) -> bool {
    confidence
        .get(hash)
        .map(|r| matches!(r.confidence_type, crate::confidence::TxConfidenceType::Building))
        .unwrap_or(false)
}

fn transaction_hash(tx: &Transaction) -> Hash {
    tx.hash()
}

/// Reasons a [`ChangeReason`] stream matters to a broadcast: only
/// `SeenPeers` and `Type` transitions can move progress.
pub fn relevant_to_broadcast(reason: ChangeReason) -> bool {
    matches!(reason, ChangeReason::SeenPeers | ChangeReason::Type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<SocketAddr>>,
    }

    impl BroadcastTransport for RecordingTransport {
        fn send_tx(&self, peer: SocketAddr, _tx: Arc<Transaction>) -> bool {
            self.sent.lock().unwrap().push(peer);
            true
        }
    }

    fn peers(n: usize) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| format!("127.0.0.1:{}", 10_000 + i).parse().unwrap())
            .collect()
    }

    #[test]
    fn fan_out_picks_at_least_one_peer() {
        assert_eq!(FanOut::compute(0).sent, 1);
        assert_eq!(FanOut::compute(1).sent, 1);
    }

    #[test]
    fn fan_out_scales_with_connected_count() {
        let fan_out = FanOut::compute(10);
        assert_eq!(fan_out.sent, 5);
        assert_eq!(fan_out.threshold, 3);
    }

    #[tokio::test]
    async fn times_out_when_nobody_announces_back() {
        let confidence = Arc::new(ConfidenceTable::new());
        let (broadcast, _progress) = TransactionBroadcast::new(confidence);
        let transport = RecordingTransport {
            sent: Mutex::new(Vec::new()),
        };
        let request = BroadcastRequest {
            transaction: Arc::new(Transaction::from_raw(vec![0u8; 10])),
            min_peers: 1,
            drop_peers_after: None,
            timeout: Duration::from_millis(100),
        };
        let result = broadcast.run(&transport, peers(4), request).await;
        assert!(matches!(result, Err(BroadcastError::Timeout { .. })));
    }

    #[tokio::test]
    async fn succeeds_once_threshold_peers_announce() {
        let confidence = Arc::new(ConfidenceTable::new());
        let (broadcast, _progress) = TransactionBroadcast::new(confidence.clone());
        let transport = RecordingTransport {
            sent: Mutex::new(Vec::new()),
        };
        let tx = Arc::new(Transaction::from_raw(vec![0u8; 10]));
        let hash = tx.hash();
        let request = BroadcastRequest {
            transaction: tx,
            min_peers: 1,
            drop_peers_after: None,
            timeout: Duration::from_secs(2),
        };

        let announcer = {
            let confidence = confidence.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                confidence.mark_broadcast_by(hash, peers(1)[0], Utc::now());
                confidence.mark_building(hash, crate::block::Height(100), 1);
            })
        };

        let result = broadcast.run(&transport, peers(4), request).await;
        announcer.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn enough_rejects_fail_the_broadcast_with_the_first_reason() {
        // 5 connected peers: K = 3 chosen, N = 1 must announce back (or
        // reject) before the threshold trips.
        let confidence = Arc::new(ConfidenceTable::new());
        let (broadcast, _progress) = TransactionBroadcast::new(confidence.clone());
        let transport = RecordingTransport {
            sent: Mutex::new(Vec::new()),
        };
        let tx = Arc::new(Transaction::from_raw(vec![1u8; 10]));
        let hash = tx.hash();
        let request = BroadcastRequest {
            transaction: tx,
            min_peers: 2,
            drop_peers_after: None,
            timeout: Duration::from_secs(2),
        };

        let fan_out = FanOut::compute(peers(5).len());
        assert_eq!(fan_out.sent, 3);
        assert_eq!(fan_out.threshold, 1);

        let rejecter = {
            let confidence = confidence.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                confidence.mark_rejected(
                    hash,
                    peers(1)[0],
                    RejectReason::InsufficientFee,
                    Utc::now(),
                );
            })
        };

        let result = broadcast.run(&transport, peers(5), request).await;
        rejecter.await.unwrap();
        assert!(matches!(
            result,
            Err(BroadcastError::Rejected(RejectReason::InsufficientFee))
        ));
    }
}
