//! `PeerGroup`: the orchestrator that maintains a pool of connections,
//! elects a download peer, drives header sync, and serves transaction
//! broadcasts and filter updates.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address_book::AddressBook;
use crate::block;
use crate::blockchain::BlockChain;
use crate::broadcast::{BroadcastRequest, BroadcastTransport, TransactionBroadcast};
use crate::clock::Clock;
use crate::config::Config;
use crate::confidence::ConfidenceTable;
use crate::connector::Connector;
use crate::constants;
use crate::error::BroadcastError;
use crate::filter_merger::{FilterMerger, FilterProvider};
use crate::meta_addr::MetaAddr;
use crate::peer::{HandshakeConfig, Peer, PeerEvent, PeerHandle};
use crate::protocol::external::{
    inv::InventoryHash,
    message::Message,
    types::{Nonce, ProtocolVersion},
};
use crate::transaction::Transaction;

/// Receives callbacks from the header/filtered-block download pipeline.
/// Both methods are no-ops by default so a caller only interested in one can
/// skip implementing the other.
pub trait DownloadListener: Send + Sync {
    fn on_headers(&self, _accepted: usize) {}
    fn on_filtered_block(&self, _header: block::Header, _transactions: Vec<Arc<Transaction>>) {}
}

/// What the orchestrator knows about one connected peer, refreshed as its
/// traffic arrives.
#[derive(Debug, Clone)]
struct PeerInfo {
    id: u64,
    version: ProtocolVersion,
    height: block::Height,
    rtt: Duration,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Message>,
    cancellation: CancellationToken,
}

/// A point-in-time view of one connected peer, used by the download-peer
/// election algorithm. Kept separate from [`PeerInfo`] so the election logic
/// can be tested without any networking machinery at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub id: u64,
    pub version: ProtocolVersion,
    pub height: block::Height,
    pub rtt: Duration,
}

/// Pick the download peer per the tie-break chain:
/// 1. mode chain height (ties broken toward the higher height),
/// 2. among those, prefer `version >= preferred_version`, else the highest
///    observed version,
/// 3. among those, lowest RTT, tie-broken by lowest peer id.
pub fn elect_download_peer(
    peers: &[PeerSnapshot],
    preferred_version: ProtocolVersion,
) -> Option<SocketAddr> {
    if peers.is_empty() {
        return None;
    }

    let mode_height = mode_height_with_tie_break(peers.iter().map(|p| p.height));
    let at_mode_height: Vec<&PeerSnapshot> =
        peers.iter().filter(|p| p.height == mode_height).collect();

    let filter_capable: Vec<&&PeerSnapshot> = at_mode_height
        .iter()
        .filter(|p| p.version >= preferred_version)
        .collect();

    let pool: Vec<&PeerSnapshot> = if !filter_capable.is_empty() {
        filter_capable.into_iter().copied().collect()
    } else {
        let max_version = at_mode_height.iter().map(|p| p.version).max()?;
        at_mode_height
            .into_iter()
            .filter(|p| p.version == max_version)
            .collect()
    };

    pool.into_iter()
        .min_by(|a, b| a.rtt.cmp(&b.rtt).then(a.id.cmp(&b.id)))
        .map(|p| p.addr)
}

fn mode_height_with_tie_break(heights: impl Iterator<Item = block::Height>) -> block::Height {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for height in heights {
        *counts.entry(height.0).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(height, _)| block::Height(height))
        .unwrap_or_default()
}

/// How a filter recalculation should be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    SendIfChanged,
    ForceSend,
    DontSend,
}

enum Job {
    OpenConnection,
    RecalculateFilter(FilterMode),
}

/// Coalescing flags for filter-recalculation jobs: at most one
/// `SendIfChanged` and one `ForceSend` job may be queued at a time.
#[derive(Default)]
struct FilterRecalcFlags {
    send_if_changed_queued: bool,
    force_send_queued: bool,
}

struct Inner {
    connected: HashMap<SocketAddr, PeerInfo>,
    pending: HashSet<SocketAddr>,
    address_book: AddressBook,
    target_connections: usize,
    localhost_pinned: bool,
    filter_recalc: FilterRecalcFlags,
    filtered_block_queue: VecDeque<block::Hash>,
    filtered_blocks_in_flight: usize,
}

/// Maintains a pool of peer connections and coordinates header sync,
/// transaction broadcast, and Bloom-filter maintenance across them.
pub struct PeerGroup {
    config: Config,
    connector: Arc<dyn Connector>,
    block_chain: Arc<dyn BlockChain>,
    clock: Arc<dyn Clock>,
    confidence: Arc<ConfidenceTable>,
    filter_merger: Arc<FilterMerger>,
    filter_providers: Mutex<Vec<Arc<dyn FilterProvider>>>,
    inner: Mutex<Inner>,
    job_tx: mpsc::UnboundedSender<Job>,
    job_rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    peer_ready: Notify,
    cancellation: CancellationToken,
    started: AtomicBool,
    download_started: AtomicBool,
    download_listener: Mutex<Option<Arc<dyn DownloadListener>>>,
    next_peer_id: AtomicU64,
    our_nonce: Nonce,
}

impl PeerGroup {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        block_chain: Arc<dyn BlockChain>,
        clock: Arc<dyn Clock>,
    ) -> Arc<PeerGroup> {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let now = clock.now();
        let tweak = crate::protocol::external::types::Tweak(rand::random());
        Arc::new(PeerGroup {
            filter_merger: Arc::new(FilterMerger::new(tweak, config.target_filter_fp_rate)),
            filter_providers: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                connected: HashMap::new(),
                pending: HashSet::new(),
                address_book: AddressBook::new(now),
                target_connections: config.initial_connections,
                localhost_pinned: false,
                filter_recalc: FilterRecalcFlags::default(),
                filtered_block_queue: VecDeque::new(),
                filtered_blocks_in_flight: 0,
            }),
            config,
            connector,
            block_chain,
            clock,
            confidence: Arc::new(ConfidenceTable::new()),
            job_tx,
            job_rx: Mutex::new(Some(job_rx)),
            peer_ready: Notify::new(),
            cancellation: CancellationToken::new(),
            started: AtomicBool::new(false),
            download_started: AtomicBool::new(false),
            download_listener: Mutex::new(None),
            next_peer_id: AtomicU64::new(0),
            our_nonce: Nonce::random(),
        })
    }

    pub fn confidence_table(&self) -> Arc<ConfidenceTable> {
        self.confidence.clone()
    }

    pub fn seed_addresses(&self, addrs: impl IntoIterator<Item = MetaAddr>) {
        let now = self.clock.now();
        self.inner.lock().address_book.seed(addrs, now);
    }

    pub fn register_filter_provider(&self, provider: Arc<dyn FilterProvider>) {
        self.filter_providers.lock().push(provider);
    }

    /// Begin discovery and connection maintenance. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.config.prefer_localhost {
            let localhost_connected = self.try_localhost_probe();
            if localhost_connected {
                let mut inner = self.inner.lock();
                inner.localhost_pinned = true;
                inner.target_connections = 1;
            }
        }

        let job_rx = self
            .job_rx
            .lock()
            .take()
            .expect("start called more than once");
        let group = self.clone();
        tokio::spawn(async move { group.run_manager(job_rx).await });

        let target = self.inner.lock().target_connections;
        for _ in 0..target {
            let _ = self.job_tx.send(Job::OpenConnection);
        }
    }

    /// A short, best-effort blocking probe for a full node on localhost.
    /// Errs toward "not found" rather than stalling startup.
    fn try_localhost_probe(&self) -> bool {
        let addr = SocketAddr::new(
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            self.config.network.params().default_port,
        );
        std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
    }

    /// Initiate graceful shutdown: stop discovery, close all peers, and wait
    /// (briefly) for them to report closed.
    pub async fn stop(&self) {
        self.cancellation.cancel();
        let cancellations: Vec<CancellationToken> = {
            let inner = self.inner.lock();
            inner.connected.values().map(|p| p.cancellation.clone()).collect()
        };
        for token in cancellations {
            token.cancel();
        }
        for _ in 0..100 {
            if self.inner.lock().connected.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        warn!("stop() timed out waiting for all peers to close");
    }

    /// Set the target connection count. Excess connections (oldest first)
    /// are closed; a deficit schedules new connection jobs.
    pub fn set_max_connections(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.target_connections = n;
        let current = inner.connected.len();
        if current > n {
            let mut by_age: Vec<(SocketAddr, DateTime<Utc>)> = inner
                .connected
                .iter()
                .map(|(addr, info)| (*addr, info.connected_at))
                .collect();
            by_age.sort_by_key(|(_, connected_at)| *connected_at);
            for (addr, _) in by_age.into_iter().take(current - n) {
                if let Some(info) = inner.connected.get(&addr) {
                    info.cancellation.cancel();
                }
            }
        } else {
            for _ in 0..(n - current) {
                let _ = self.job_tx.send(Job::OpenConnection);
            }
        }
    }

    /// Resolves once at least `n` connected peers speak protocol version
    /// `min_version` or higher.
    pub async fn wait_for_peers(&self, n: usize, min_version: ProtocolVersion) {
        loop {
            let satisfied = {
                let inner = self.inner.lock();
                inner
                    .connected
                    .values()
                    .filter(|p| p.version >= min_version)
                    .count()
                    >= n
            };
            if satisfied {
                return;
            }
            self.peer_ready.notified().await;
        }
    }

    /// Fan out `transaction` to a subset of connected peers and wait for
    /// enough of them to relay it back. See [`crate::broadcast`].
    pub async fn broadcast_transaction(
        &self,
        transaction: Arc<Transaction>,
        min_peers: usize,
    ) -> Result<(), BroadcastError> {
        self.wait_for_peers(min_peers, ProtocolVersion(0)).await;

        let connected: Vec<SocketAddr> = self.inner.lock().connected.keys().copied().collect();
        let transport = GroupBroadcastTransport { group: self };
        let (broadcast, _progress) = TransactionBroadcast::new(self.confidence.clone());
        broadcast
            .run(
                &transport,
                connected,
                BroadcastRequest {
                    transaction,
                    min_peers,
                    drop_peers_after: None,
                    timeout: Duration::from_secs(60),
                },
            )
            .await
    }

    /// Recompute the merged wallet filter and, depending on `mode`, send it
    /// to the download peer. `DontSend` runs inline; the other two modes go
    /// through the coalescing job queue.
    pub fn recalculate_filter(&self, mode: FilterMode) {
        match mode {
            FilterMode::DontSend => self.do_recalculate_filter(mode),
            FilterMode::SendIfChanged => {
                let mut inner = self.inner.lock();
                if !inner.filter_recalc.send_if_changed_queued {
                    inner.filter_recalc.send_if_changed_queued = true;
                    let _ = self.job_tx.send(Job::RecalculateFilter(mode));
                }
            }
            FilterMode::ForceSend => {
                let mut inner = self.inner.lock();
                if !inner.filter_recalc.force_send_queued {
                    inner.filter_recalc.force_send_queued = true;
                    let _ = self.job_tx.send(Job::RecalculateFilter(mode));
                }
            }
        }
    }

    fn do_recalculate_filter(&self, mode: FilterMode) {
        let tweak = crate::protocol::external::types::Tweak(rand::random());
        let providers = self.filter_providers.lock().clone();
        let result = self.filter_merger.recalculate(&providers, tweak);
        let should_send = match mode {
            FilterMode::DontSend => false,
            FilterMode::ForceSend => true,
            FilterMode::SendIfChanged => result.changed,
        };
        if !should_send {
            return;
        }
        let state = result.state;
        let message = Message::FilterLoad {
            filter: crate::protocol::external::types::Filter(state.filter_bytes.clone()),
            hash_functions_count: state.hash_functions_count,
            tweak: state.tweak,
            flags: 0,
        };
        let senders: Vec<mpsc::Sender<Message>> = self
            .inner
            .lock()
            .connected
            .values()
            .map(|p| p.outbound.clone())
            .collect();
        for sender in senders {
            let message = message.clone();
            tokio::spawn(async move {
                let _ = sender.send(message).await;
            });
        }
    }

    /// Report an observed false-positive rate for the currently loaded
    /// filter; forces a recalculation if it exceeds the configured ceiling.
    pub fn observe_filter_fp_rate(&self, observed: f64) {
        if self.filter_merger.observe_fp_rate(observed) {
            self.recalculate_filter(FilterMode::ForceSend);
        }
    }

    /// Begin chain-header synchronization against the elected download
    /// peer. Idempotent.
    pub fn start_block_chain_download(self: &Arc<Self>, listener: Arc<dyn DownloadListener>) {
        if self.download_started.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.download_listener.lock() = Some(listener);
        let group = self.clone();
        tokio::spawn(async move { group.run_download().await });
    }

    async fn run_download(&self) {
        loop {
            if self.cancellation.is_cancelled() {
                return;
            }
            let snapshot: Vec<PeerSnapshot> = {
                let inner = self.inner.lock();
                inner
                    .connected
                    .iter()
                    .map(|(addr, p)| PeerSnapshot {
                        addr: *addr,
                        id: p.id,
                        version: p.version,
                        height: p.height,
                        rtt: p.rtt,
                    })
                    .collect()
            };
            if snapshot.is_empty() {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
            let elected = elect_download_peer(&snapshot, constants::FILTER_CAPABLE_VERSION);
            let Some(peer_addr) = elected else {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };

            let sender = self.inner.lock().connected.get(&peer_addr).map(|p| p.outbound.clone());
            let Some(sender) = sender else {
                continue;
            };
            let locator = self.block_chain.locator();
            let message = crate::peer::build_get_headers(locator, None);
            if sender.send(message).await.is_err() {
                continue;
            }

            debug!(peer = %peer_addr, "issued getheaders to elected download peer");
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    }

    /// Extend the filtered-block download queue with `hashes` (if any) and
    /// drain it up to `MAX_BLOCKS_IN_FLIGHT`, requesting from `addr`.
    fn request_filtered_blocks(&self, addr: SocketAddr, hashes: impl IntoIterator<Item = block::Hash>) {
        let mut inner = self.inner.lock();
        inner.filtered_block_queue.extend(hashes);
        let Some(sender) = inner.connected.get(&addr).map(|p| p.outbound.clone()) else {
            return;
        };
        let mut to_send = Vec::new();
        while inner.filtered_blocks_in_flight < constants::MAX_BLOCKS_IN_FLIGHT {
            match inner.filtered_block_queue.pop_front() {
                Some(hash) => {
                    inner.filtered_blocks_in_flight += 1;
                    to_send.push(hash);
                }
                None => break,
            }
        }
        drop(inner);
        if to_send.is_empty() {
            return;
        }
        let items: Vec<InventoryHash> = to_send.into_iter().map(InventoryHash::FilteredBlock).collect();
        tokio::spawn(async move {
            let _ = sender.send(Message::GetData(items)).await;
        });
    }

    async fn run_manager(self: Arc<Self>, mut job_rx: mpsc::UnboundedReceiver<Job>) {
        let mut sweep_timer = tokio::time::interval(constants::CONFIDENCE_SWEEP_INTERVAL);
        sweep_timer.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => return,
                _ = sweep_timer.tick() => {
                    self.confidence.sweep();
                }
                job = job_rx.recv() => {
                    match job {
                        Some(Job::OpenConnection) => self.clone().try_open_one(),
                        Some(Job::RecalculateFilter(mode)) => {
                            {
                                let mut inner = self.inner.lock();
                                match mode {
                                    FilterMode::SendIfChanged => inner.filter_recalc.send_if_changed_queued = false,
                                    FilterMode::ForceSend => inner.filter_recalc.force_send_queued = false,
                                    FilterMode::DontSend => {}
                                }
                            }
                            self.do_recalculate_filter(mode);
                        }
                        None => return,
                    }
                }
            }
        }
    }

    fn try_open_one(self: Arc<Self>) {
        let (current, target, candidate) = {
            let mut inner = self.inner.lock();
            let current = inner.connected.len() + inner.pending.len();
            let target = inner.target_connections;
            if current >= target {
                (current, target, None)
            } else {
                let now = self.clock.now();
                let candidate = inner.address_book.next_candidate(now);
                if let Some(addr) = candidate.as_ref() {
                    inner.pending.insert(addr.key());
                }
                (current, target, candidate)
            }
        };
        let Some(candidate) = candidate else {
            debug!(current, target, "no eligible address-book candidate right now");
            return;
        };

        tokio::spawn(async move {
            self.connect_and_run(candidate).await;
        });
    }

    async fn connect_and_run(self: Arc<Self>, candidate: MetaAddr) {
        let addr = candidate.key();
        let connect_result = self.connector.connect(addr).await;
        let stream = match connect_result {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%addr, %error, "connection attempt failed");
                if addr.is_ipv6() {
                    // A failed IPv6 dial (typically ENETUNREACH/EHOSTUNREACH on a
                    // dual-stack host with no IPv6 route) disables IPv6 candidates
                    // for the rest of the process rather than retrying each one.
                    crate::address_book::disable_ipv6();
                }
                let now = self.clock.now();
                let mut inner = self.inner.lock();
                inner.pending.remove(&addr);
                inner.address_book.record_outcome(addr, false, now);
                inner.address_book.reinsert_on_disconnect(candidate, false, now);
                return;
            }
        };

        let peer_id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let (peer, handle) = Peer::new(
            addr,
            stream,
            HandshakeConfig {
                network: self.config.network,
                ..HandshakeConfig::default()
            },
            self.clock.clone(),
            self.confidence.clone(),
            self.config.ping_interval,
            self.config.peer_send_queue_depth,
        );

        {
            let mut inner = self.inner.lock();
            inner.pending.remove(&addr);
            inner.connected.insert(
                addr,
                PeerInfo {
                    id: peer_id,
                    version: ProtocolVersion(0),
                    height: block::Height(0),
                    rtt: Duration::ZERO,
                    connected_at: self.clock.now(),
                    outbound: handle.outbound(),
                    cancellation: handle.cancellation(),
                },
            );
        }
        self.peer_ready.notify_waiters();

        let group = self.clone();
        tokio::spawn(async move { group.pump_events(addr, handle).await });

        let our_addr = addr;
        let reason = peer.run(our_addr, self.our_nonce).await;

        let success = reason.is_success_for_backoff();
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.connected.remove(&addr);
        inner
            .address_book
            .reinsert_on_disconnect(candidate, success, now);
        drop(inner);
        let _ = self.job_tx.send(Job::OpenConnection);
    }

    async fn pump_events(&self, addr: SocketAddr, mut handle: PeerHandle) {
        while let Some(event) = handle.events.recv().await {
            match event {
                PeerEvent::Ready { version, best_height } => {
                    if let Some(info) = self.inner.lock().connected.get_mut(&addr) {
                        info.version = version;
                        info.height = best_height;
                    }
                    self.peer_ready.notify_waiters();
                }
                PeerEvent::Rtt(rtt) => {
                    if let Some(info) = self.inner.lock().connected.get_mut(&addr) {
                        info.rtt = rtt;
                    }
                }
                PeerEvent::Headers(headers) => {
                    if let Ok(accepted) = self.block_chain.validate_and_extend(&headers) {
                        if accepted > 0 {
                            if let Some(last) = headers[..accepted].last() {
                                debug!(%addr, accepted, hash = %last.header.hash(), "extended chain");
                            }
                            let hashes: Vec<block::Hash> = headers[..accepted]
                                .iter()
                                .map(|h| h.header.hash())
                                .collect();
                            self.request_filtered_blocks(addr, hashes);
                        }
                        if let Some(listener) = self.download_listener.lock().clone() {
                            listener.on_headers(accepted);
                        }
                    }
                }
                PeerEvent::FilteredBlock { header, transactions } => {
                    {
                        let mut inner = self.inner.lock();
                        inner.filtered_blocks_in_flight =
                            inner.filtered_blocks_in_flight.saturating_sub(1);
                    }
                    if let Some(listener) = self.download_listener.lock().clone() {
                        listener.on_filtered_block(header, transactions);
                    }
                    self.request_filtered_blocks(addr, std::iter::empty());
                }
                PeerEvent::Inv(items) => {
                    let unknown: Vec<InventoryHash> = items
                        .into_iter()
                        .filter(|item| match item {
                            InventoryHash::Tx(hash) => self.confidence.get(hash).is_none(),
                            _ => false,
                        })
                        .collect();
                    if !unknown.is_empty() {
                        let sender =
                            self.inner.lock().connected.get(&addr).map(|p| p.outbound.clone());
                        if let Some(sender) = sender {
                            tokio::spawn(async move {
                                let _ = sender.send(Message::GetData(unknown)).await;
                            });
                        }
                    }
                }
                PeerEvent::Reject { message, reason, data: Some(hash_bytes) } => {
                    let hash = crate::transaction::Hash(hash_bytes);
                    self.confidence.mark_rejected(hash, addr, reason, self.clock.now());
                    debug!(%addr, %message, ?reason, "peer rejected a broadcast transaction");
                }
                PeerEvent::Closed(reason) => {
                    debug!(%addr, %reason, "peer closed");
                    break;
                }
                _ => {}
            }
        }
    }
}

struct GroupBroadcastTransport<'a> {
    group: &'a PeerGroup,
}

impl BroadcastTransport for GroupBroadcastTransport<'_> {
    fn send_tx(&self, peer: SocketAddr, tx: Arc<Transaction>) -> bool {
        let sender = self.group.inner.lock().connected.get(&peer).map(|p| p.outbound.clone());
        match sender {
            Some(sender) => {
                let message = Message::Tx(tx);
                tokio::spawn(async move {
                    let _ = sender.send(message).await;
                });
                true
            }
            None => false,
        }
    }

    fn schedule_close(&self, peer: SocketAddr, after: Duration) {
        let cancellation = self.group.inner.lock().connected.get(&peer).map(|p| p.cancellation.clone());
        if let Some(cancellation) = cancellation {
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                cancellation.cancel();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(addr: u16, id: u64, version: u32, height: u32, rtt_ms: u64) -> PeerSnapshot {
        PeerSnapshot {
            addr: SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)), addr),
            id,
            version: ProtocolVersion(version),
            height: block::Height(height),
            rtt: Duration::from_millis(rtt_ms),
        }
    }

    #[test]
    fn elects_the_peer_at_mode_height_with_lowest_rtt() {
        let peers = vec![
            snapshot(1, 1, 70015, 100, 50),
            snapshot(2, 2, 70015, 100, 20),
            snapshot(3, 3, 70015, 99, 5),
        ];
        let elected = elect_download_peer(&peers, constants::FILTER_CAPABLE_VERSION).unwrap();
        assert_eq!(elected.port(), 2);
    }

    #[test]
    fn ties_at_mode_height_favor_the_higher_height() {
        let peers = vec![snapshot(1, 1, 70015, 100, 10), snapshot(2, 2, 70015, 200, 10)];
        let elected = elect_download_peer(&peers, constants::FILTER_CAPABLE_VERSION).unwrap();
        assert_eq!(elected.port(), 2);
    }

    #[test]
    fn prefers_filter_capable_peers_when_available() {
        let peers = vec![
            snapshot(1, 1, 60000, 100, 1),
            snapshot(2, 2, 70015, 100, 100),
        ];
        let elected = elect_download_peer(&peers, constants::FILTER_CAPABLE_VERSION).unwrap();
        assert_eq!(elected.port(), 2);
    }

    #[test]
    fn rtt_ties_favor_the_lower_peer_id() {
        let peers = vec![snapshot(1, 5, 70015, 100, 10), snapshot(2, 2, 70015, 100, 10)];
        let elected = elect_download_peer(&peers, constants::FILTER_CAPABLE_VERSION).unwrap();
        assert_eq!(elected.port(), 2);
    }

    struct AcceptAllBlockChain;

    impl BlockChain for AcceptAllBlockChain {
        fn locator(&self) -> block::BlockLocator {
            block::BlockLocator::build(block::Hash([0u8; 32]), |_, _| None)
        }

        fn tip_time(&self) -> DateTime<Utc> {
            Utc::now()
        }

        fn validate_and_extend(
            &self,
            headers: &[block::CountedHeader],
        ) -> Result<usize, crate::error::ValidationError> {
            Ok(headers.len())
        }
    }

    struct UnreachableConnector;

    #[async_trait::async_trait]
    impl Connector for UnreachableConnector {
        async fn connect(
            &self,
            _addr: SocketAddr,
        ) -> std::io::Result<Box<dyn crate::connector::AsyncReadWrite>> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "not used in this test"))
        }
    }

    fn peer_addr() -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)), 18444)
    }

    /// Drives a real handshake and some post-handshake traffic over an
    /// in-memory pipe and checks that `pump_events` actually applies what
    /// `Peer` reports: negotiated version and advertised height (from
    /// `Ready`), measured RTT (from `Rtt`), and a `GetData` response to an
    /// `Inv` announcing an unknown transaction.
    #[tokio::test]
    async fn pump_events_applies_ready_rtt_and_requests_unknown_inventory() {
        use crate::clock::SystemClock;
        use crate::peer::{HandshakeConfig, Peer};
        use crate::protocol::external::message::Version;
        use crate::protocol::external::types::PeerServices;
        use crate::protocol::external::Codec;
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::Framed;

        let group = PeerGroup::new(
            Config {
                prefer_localhost: false,
                ..Config::default()
            },
            Arc::new(UnreachableConnector),
            Arc::new(AcceptAllBlockChain),
            Arc::new(SystemClock) as Arc<dyn Clock>,
        );

        let addr = peer_addr();
        let (client_stream, server_stream) = tokio::io::duplex(8192);
        let (peer, handle) = Peer::new(
            addr,
            client_stream,
            HandshakeConfig {
                network: crate::constants::Network::Regtest,
                min_peer_version: ProtocolVersion(0),
                required_services: PeerServices::empty(),
                ..HandshakeConfig::default()
            },
            Arc::new(SystemClock) as Arc<dyn Clock>,
            group.confidence_table(),
            Duration::from_millis(20),
            8,
        );

        group.inner.lock().connected.insert(
            addr,
            PeerInfo {
                id: 0,
                version: ProtocolVersion(0),
                height: block::Height(0),
                rtt: Duration::ZERO,
                connected_at: Utc::now(),
                outbound: handle.outbound(),
                cancellation: handle.cancellation(),
            },
        );

        let _client_task = tokio::spawn(peer.run(addr, Nonce::random()));
        let group_for_pump = group.clone();
        let _pump_task = tokio::spawn(async move { group_for_pump.pump_events(addr, handle).await });

        let server_codec = Codec::builder()
            .for_network(crate::constants::Network::Regtest)
            .finish();
        let mut server_framed = Framed::new(server_stream, server_codec);

        let version_msg = server_framed.next().await.unwrap().unwrap();
        assert!(matches!(version_msg, Message::Version(_)));
        server_framed
            .send(Message::Version(Version::new(
                ProtocolVersion(70015),
                addr,
                PeerServices::NODE_NETWORK | PeerServices::NODE_BLOOM,
                PeerServices::empty(),
                addr,
                Nonce::random(),
                "/test/".to_owned(),
                block::Height(123_456),
                false,
            )))
            .await
            .unwrap();
        server_framed.send(Message::Verack).await.unwrap();
        let verack = server_framed.next().await.unwrap().unwrap();
        assert!(matches!(verack, Message::Verack));

        // Ping fires on an immediate first tick of a 20ms interval; reply so
        // the client observes an RTT.
        let ping = tokio::time::timeout(Duration::from_secs(1), server_framed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Ping(nonce) = ping {
            server_framed.send(Message::Pong(nonce)).await.unwrap();
        } else {
            panic!("expected a ping, got {ping:?}");
        }

        let unknown_tx = crate::transaction::Hash([7u8; 32]);
        server_framed
            .send(Message::Inv(vec![InventoryHash::Tx(unknown_tx)]))
            .await
            .unwrap();
        let get_data = tokio::time::timeout(Duration::from_secs(1), server_framed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match get_data {
            Message::GetData(items) => assert_eq!(items, vec![InventoryHash::Tx(unknown_tx)]),
            other => panic!("expected GetData, got {other:?}"),
        }

        // Give pump_events a moment to apply the Ready/Rtt updates it
        // received concurrently with the inv/getdata exchange above.
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        loop {
            let (version, height, rtt) = {
                let inner = group.inner.lock();
                let info = inner.connected.get(&addr).unwrap();
                (info.version, info.height, info.rtt)
            };
            if version == ProtocolVersion(70015) && height == block::Height(123_456) && rtt > Duration::ZERO {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("pump_events never applied Ready/Rtt updates: version={version:?} height={height:?} rtt={rtt:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// `request_filtered_blocks` must cap the number of in-flight `GetData`
    /// requests at `MAX_BLOCKS_IN_FLIGHT` and hold the rest back in the
    /// queue, releasing one more each time a `FilteredBlock` event reports a
    /// completion.
    #[tokio::test]
    async fn request_filtered_blocks_respects_the_in_flight_cap() {
        use crate::clock::SystemClock;

        let group = PeerGroup::new(
            Config {
                prefer_localhost: false,
                ..Config::default()
            },
            Arc::new(UnreachableConnector),
            Arc::new(AcceptAllBlockChain),
            Arc::new(SystemClock) as Arc<dyn Clock>,
        );

        let addr = peer_addr();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(constants::MAX_BLOCKS_IN_FLIGHT + 8);
        group.inner.lock().connected.insert(
            addr,
            PeerInfo {
                id: 0,
                version: ProtocolVersion(70015),
                height: block::Height(0),
                rtt: Duration::ZERO,
                connected_at: Utc::now(),
                outbound: outbound_tx,
                cancellation: CancellationToken::new(),
            },
        );

        let hashes: Vec<block::Hash> = (0..constants::MAX_BLOCKS_IN_FLIGHT + 5)
            .map(|i| block::Hash([i as u8; 32]))
            .collect();
        group.request_filtered_blocks(addr, hashes);

        let sent = outbound_rx.recv().await.unwrap();
        let sent_count = match sent {
            Message::GetData(items) => items.len(),
            other => panic!("expected GetData, got {other:?}"),
        };
        assert_eq!(sent_count, constants::MAX_BLOCKS_IN_FLIGHT);
        assert_eq!(group.inner.lock().filtered_blocks_in_flight, constants::MAX_BLOCKS_IN_FLIGHT);
        assert_eq!(group.inner.lock().filtered_block_queue.len(), 5);

        // A completed filtered block frees one slot, and the queue drains
        // one more hash to fill it.
        {
            let mut inner = group.inner.lock();
            inner.filtered_blocks_in_flight -= 1;
        }
        group.request_filtered_blocks(addr, std::iter::empty());
        let sent = outbound_rx.recv().await.unwrap();
        match sent {
            Message::GetData(items) => assert_eq!(items.len(), 1),
            other => panic!("expected GetData, got {other:?}"),
        }
        assert_eq!(group.inner.lock().filtered_block_queue.len(), 4);
    }
}
