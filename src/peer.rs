//! One peer connection: handshake, keepalive, and the header/filtered-block
//! download pipeline.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::block;
use crate::clock::Clock;
use crate::confidence::ConfidenceTable;
use crate::connector::AsyncReadWrite;
use crate::constants;
use crate::error::{HandshakeError, PeerCloseReason, WireError};
use crate::merkle::PartialMerkleTree;
use crate::protocol::external::{
    inv::InventoryHash,
    message::{GetHeaders, MerkleBlock, Message, Version},
    types::{Nonce, PeerServices, ProtocolVersion},
    Codec,
};
use crate::transaction::Transaction;

/// The lifecycle a [`Peer`] moves through; never moves backward.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerState {
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// What the owning [`crate::peer_group::PeerGroup`] learns from a peer's
/// traffic, sent out over an unbounded event channel so this task never
/// blocks on a slow event consumer.
#[derive(Debug)]
pub enum PeerEvent {
    /// The handshake completed: the peer's negotiated version and its
    /// advertised best-known chain height.
    Ready {
        version: ProtocolVersion,
        best_height: block::Height,
    },
    /// A ping/pong round trip completed, with the measured RTT.
    Rtt(Duration),
    Inv(Vec<InventoryHash>),
    Headers(Vec<block::CountedHeader>),
    /// A `tx` relayed outside of any filtered-block assembly (a standalone
    /// broadcast or inv-requested transaction).
    Tx(Arc<Transaction>),
    /// A `merkleblock`'s proof validated and every transaction it claimed to
    /// match (per its partial Merkle tree) has since arrived as a separate
    /// `tx` message.
    FilteredBlock {
        header: block::Header,
        transactions: Vec<Arc<Transaction>>,
    },
    Reject {
        message: String,
        reason: crate::protocol::external::message::RejectReason,
        data: Option<[u8; 32]>,
    },
    Addr(Vec<crate::meta_addr::MetaAddr>),
    Closed(PeerCloseReason),
}

/// A handle to a running peer task: send it outbound messages, receive its
/// events, and initiate a close.
pub struct PeerHandle {
    pub addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
    cancellation: CancellationToken,
}

impl PeerHandle {
    pub async fn send(&self, message: Message) -> Result<(), mpsc::error::SendError<Message>> {
        self.outbound.send(message).await
    }

    pub fn close(&self) {
        self.cancellation.cancel();
    }

    /// A clone of the outbound sender, for an owner (e.g. `PeerGroup`) that
    /// needs to hand out sends without holding the whole handle.
    pub(crate) fn outbound(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// Handshake parameters fixed for the lifetime of a connection.
pub struct HandshakeConfig {
    pub network: crate::constants::Network,
    pub our_version: ProtocolVersion,
    pub min_peer_version: ProtocolVersion,
    pub our_services: PeerServices,
    pub required_services: PeerServices,
    pub user_agent: String,
    pub relay: bool,
}

impl Default for HandshakeConfig {
    fn default() -> HandshakeConfig {
        HandshakeConfig {
            network: crate::constants::Network::Mainnet,
            our_version: constants::CURRENT_VERSION,
            min_peer_version: constants::MIN_PEER_VERSION,
            our_services: PeerServices::empty(),
            required_services: PeerServices::NODE_NETWORK,
            user_agent: "/spv:0.1/".to_owned(),
            relay: false,
        }
    }
}

/// Drives one peer connection's I/O loop on its own `tokio::task`.
pub struct Peer<T> {
    addr: SocketAddr,
    framed: Framed<T, Codec>,
    state: PeerState,
    clock: Arc<dyn Clock>,
    handshake: HandshakeConfig,
    ping_interval: Duration,
    confidence: Arc<ConfidenceTable>,
    outbound_rx: mpsc::Receiver<Message>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    cancellation: CancellationToken,
    ping_nonce: Option<(Nonce, std::time::Instant)>,
    last_rtt: Option<Duration>,
    /// `getheaders`/`getdata` requests sent but not yet fully answered;
    /// bounded by `MAX_BLOCKS_IN_FLIGHT`.
    in_flight: VecDeque<InventoryHash>,
    /// Filtered blocks awaiting the `tx` messages their proof claimed would
    /// follow, oldest first.
    pending_filtered_blocks: VecDeque<PendingFilteredBlock>,
}

struct PendingFilteredBlock {
    header: block::Header,
    expected: VecDeque<crate::transaction::Hash>,
    collected: Vec<Arc<Transaction>>,
}

impl<T: AsyncReadWrite + 'static> Peer<T> {
    /// Construct a not-yet-connected peer wrapper around an already-open
    /// stream. Handshake and run loop are driven by [`Self::run`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: SocketAddr,
        stream: T,
        handshake: HandshakeConfig,
        clock: Arc<dyn Clock>,
        confidence: Arc<ConfidenceTable>,
        ping_interval: Duration,
        send_queue_depth: usize,
    ) -> (Peer<T>, PeerHandle) {
        let codec = Codec::builder()
            .for_network(handshake.network)
            .for_version(handshake.our_version)
            .finish();
        let framed = Framed::new(stream, codec);
        let (outbound_tx, outbound_rx) = mpsc::channel(send_queue_depth);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancellation = CancellationToken::new();

        let peer = Peer {
            addr,
            framed,
            state: PeerState::Handshaking,
            clock,
            handshake,
            ping_interval,
            confidence,
            outbound_rx,
            events_tx,
            cancellation: cancellation.clone(),
            ping_nonce: None,
            last_rtt: None,
            in_flight: VecDeque::new(),
            pending_filtered_blocks: VecDeque::new(),
        };
        let handle = PeerHandle {
            addr,
            outbound: outbound_tx,
            events: events_rx,
            cancellation,
        };
        (peer, handle)
    }

    /// Perform the version/verack handshake, then run the read/write loop
    /// until closed. Consumes `self`; the task this runs on is this peer's
    /// one logical I/O task.
    pub async fn run(mut self, our_addr: SocketAddr, our_nonce: Nonce) -> PeerCloseReason {
        let span = info_span!("peer", addr = %self.addr);
        async move {
            match self.handshake(our_addr, our_nonce).await {
                Ok(remote_version) => {
                    info!(version = remote_version.version.0, "handshake complete");
                    self.state = PeerState::Ready;
                    let _ = self.events_tx.send(PeerEvent::Ready {
                        version: remote_version.version,
                        best_height: remote_version.best_block,
                    });
                }
                Err(reason) => {
                    warn!(error = %reason, "handshake failed");
                    let _ = self.events_tx.send(PeerEvent::Closed(reason.clone_for_event()));
                    return reason;
                }
            }

            let reason = self.serve().await;
            self.state = PeerState::Closed;
            let _ = self.events_tx.send(PeerEvent::Closed(reason.clone_for_event()));
            reason
        }
        .instrument(span)
        .await
    }

    async fn handshake(
        &mut self,
        our_addr: SocketAddr,
        our_nonce: Nonce,
    ) -> Result<Version, PeerCloseReason> {
        let version = Version::new(
            self.handshake.our_version,
            self.addr,
            PeerServices::empty(),
            self.handshake.our_services,
            our_addr,
            our_nonce,
            self.handshake.user_agent.clone(),
            block::Height(0),
            self.handshake.relay,
        );
        self.framed
            .send(Message::Version(version))
            .await
            .map_err(wire_close)?;

        let mut remote_version = None;
        let mut verack_sent = false;
        let mut verack_received = false;

        while remote_version.is_none() || !verack_received {
            let message = self
                .framed
                .next()
                .await
                .ok_or(PeerCloseReason::GracefulClose)?
                .map_err(wire_close)?;

            match message {
                Message::Version(v) if remote_version.is_none() => {
                    if v.version < self.handshake.min_peer_version {
                        return Err(PeerCloseReason::Handshake(HandshakeError::VersionTooLow(
                            v.version.0,
                            self.handshake.min_peer_version.0,
                        )));
                    }
                    if !v.services.contains(self.handshake.required_services) {
                        return Err(PeerCloseReason::Handshake(HandshakeError::MissingService));
                    }
                    remote_version = Some(v);
                    if !verack_sent {
                        self.framed.send(Message::Verack).await.map_err(wire_close)?;
                        verack_sent = true;
                    }
                }
                Message::Verack if remote_version.is_some() => {
                    verack_received = true;
                }
                _ if remote_version.is_none() => {
                    return Err(PeerCloseReason::Handshake(HandshakeError::OutOfOrder));
                }
                _ => {
                    // A peer may interleave other traffic (e.g. `sendheaders`)
                    // before its verack; anything recognizable is tolerated,
                    // handled once we're in the main loop.
                }
            }
        }

        let remote = remote_version.expect("checked above");
        self.framed.codec_mut().reconfigure_version(remote.version);
        Ok(remote)
    }

    async fn serve(&mut self) -> PeerCloseReason {
        let mut ping_timer = tokio::time::interval(self.ping_interval);
        ping_timer.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    return PeerCloseReason::Cancelled;
                }
                _ = ping_timer.tick() => {
                    if let Some((_, sent_at)) = self.ping_nonce {
                        if sent_at.elapsed() > self.ping_interval * 2 {
                            return PeerCloseReason::Timeout;
                        }
                    } else {
                        let nonce = Nonce::random();
                        self.ping_nonce = Some((nonce, std::time::Instant::now()));
                        if self.framed.send(Message::Ping(nonce)).await.is_err() {
                            return PeerCloseReason::Wire(WireError::Io(std::io::Error::new(
                                std::io::ErrorKind::BrokenPipe,
                                "failed to send ping",
                            )));
                        }
                    }
                }
                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(message) => {
                            if let Message::GetHeaders(_) | Message::GetData(_) = &message {
                                self.track_in_flight(&message);
                            }
                            if self.framed.send(message).await.is_err() {
                                return PeerCloseReason::Wire(WireError::Io(std::io::Error::new(
                                    std::io::ErrorKind::BrokenPipe,
                                    "failed to send queued message",
                                )));
                            }
                        }
                        None => return PeerCloseReason::Cancelled,
                    }
                }
                incoming = self.framed.next() => {
                    match incoming {
                        Some(Ok(message)) => {
                            if let Err(reason) = self.handle_message(message).await {
                                return reason;
                            }
                        }
                        Some(Err(_)) => {
                            return PeerCloseReason::Wire(WireError::Malformed("codec error"));
                        }
                        None => return PeerCloseReason::GracefulClose,
                    }
                }
            }
        }
    }

    fn track_in_flight(&mut self, message: &Message) {
        if let Message::GetData(items) = message {
            for item in items {
                if self.in_flight.len() >= constants::MAX_BLOCKS_IN_FLIGHT {
                    warn!("in-flight request queue at capacity, dropping oldest tracking entry");
                    self.in_flight.pop_front();
                }
                self.in_flight.push_back(*item);
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), PeerCloseReason> {
        match message {
            Message::Ping(nonce) => {
                self.framed.send(Message::Pong(nonce)).await.map_err(wire_close)?;
            }
            Message::Pong(nonce) => {
                if let Some((expected, sent_at)) = self.ping_nonce {
                    if expected == nonce {
                        let rtt = sent_at.elapsed();
                        self.last_rtt = Some(rtt);
                        self.ping_nonce = None;
                        let _ = self.events_tx.send(PeerEvent::Rtt(rtt));
                    }
                }
            }
            Message::Inv(items) => {
                let _ = self.events_tx.send(PeerEvent::Inv(items));
            }
            Message::Headers(headers) => {
                let _ = self.events_tx.send(PeerEvent::Headers(headers));
            }
            Message::Tx(tx) => {
                let hash = tx.hash();
                self.confidence.mark_broadcast_by(hash, self.addr, Utc::now());
                self.attribute_transaction(tx);
            }
            Message::MerkleBlock(merkle_block) => {
                self.deliver_filtered_block(merkle_block)?;
            }
            Message::Reject { message, ccode, reason, data } => {
                let _ = self.events_tx.send(PeerEvent::Reject {
                    message,
                    reason: ccode,
                    data,
                });
                debug!(%reason, "peer rejected a message we sent");
            }
            Message::Addr(addrs) => {
                let _ = self.events_tx.send(PeerEvent::Addr(addrs));
            }
            Message::GetAddr | Message::SendHeaders | Message::FeeFilter(_) | Message::Verack => {
                // No action needed outside the handshake / filter layer.
            }
            Message::Alert => {
                debug!("ignoring deprecated alert message");
            }
            Message::Unknown(command, _) => {
                debug!(%command, "ignoring unrecognized message");
            }
            other => {
                debug!(kind = %other, "unhandled message in main loop");
            }
        }
        Ok(())
    }

    /// A `merkleblock` only carries the proof; the transactions it claims to
    /// match follow as separate `tx` messages. We validate the proof now and
    /// queue the expected match hashes, in tree order, so the `tx` messages
    /// that follow can be attributed to this block as they arrive.
    fn deliver_filtered_block(&mut self, merkle_block: MerkleBlock) -> Result<(), PeerCloseReason> {
        let tree = merkle_block.partial_merkle_tree();
        let (root, matched) = tree
            .extract_matches()
            .map_err(|_| PeerCloseReason::Validation(crate::error::ValidationError::MerkleRootMismatch))?;
        if root != merkle_block.block_header.merkle_root {
            return Err(PeerCloseReason::Validation(
                crate::error::ValidationError::MerkleRootMismatch,
            ));
        }
        let header = merkle_block.block_header;
        if matched.is_empty() {
            let _ = self.events_tx.send(PeerEvent::FilteredBlock {
                header,
                transactions: Vec::new(),
            });
        } else {
            self.pending_filtered_blocks.push_back(PendingFilteredBlock {
                header,
                expected: matched.into(),
                collected: Vec::new(),
            });
        }
        Ok(())
    }

    /// Attribute an incoming `tx` to the oldest pending filtered block whose
    /// proof expects it next, in order; falls through to a plain relay event
    /// if no filtered block is waiting on it.
    fn attribute_transaction(&mut self, tx: Arc<Transaction>) {
        if let Some(pending) = self.pending_filtered_blocks.front_mut() {
            if pending.expected.front() == Some(&tx.hash()) {
                pending.expected.pop_front();
                pending.collected.push(tx);
                if pending.expected.is_empty() {
                    let done = self.pending_filtered_blocks.pop_front().expect("just matched");
                    let _ = self.events_tx.send(PeerEvent::FilteredBlock {
                        header: done.header,
                        transactions: done.collected,
                    });
                }
                return;
            }
        }
        let _ = self.events_tx.send(PeerEvent::Tx(tx));
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }
}

impl PeerCloseReason {
    fn clone_for_event(&self) -> PeerCloseReason {
        match self {
            PeerCloseReason::Wire(e) => PeerCloseReason::Wire(match e {
                WireError::Truncated(m) => WireError::Truncated(m),
                WireError::Malformed(m) => WireError::Malformed(m),
                WireError::ChecksumMismatch => WireError::ChecksumMismatch,
                WireError::MagicMismatch => WireError::MagicMismatch,
                WireError::LengthCapExceeded(a, b) => WireError::LengthCapExceeded(*a, *b),
                WireError::Io(e) => WireError::Io(std::io::Error::new(e.kind(), e.to_string())),
            }),
            PeerCloseReason::Handshake(e) => PeerCloseReason::Handshake(*e),
            PeerCloseReason::Validation(e) => PeerCloseReason::Validation(*e),
            PeerCloseReason::Timeout => PeerCloseReason::Timeout,
            PeerCloseReason::GracefulClose => PeerCloseReason::GracefulClose,
            PeerCloseReason::Cancelled => PeerCloseReason::Cancelled,
        }
    }
}

fn wire_close(e: std::io::Error) -> PeerCloseReason {
    PeerCloseReason::Wire(WireError::Io(e))
}

/// Build a `getheaders` request from a locator, honoring the maximum
/// headers a single message may request (enforced by the remote peer, but
/// we cap the locator length client-side too).
pub fn build_get_headers(locator: block::BlockLocator, stop_hash: Option<block::Hash>) -> Message {
    Message::GetHeaders(GetHeaders {
        block_header_hashes: locator.into_hashes(),
        stop_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 18444)
    }

    #[tokio::test]
    async fn handshake_completes_over_an_in_memory_pipe() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);

        let confidence = Arc::new(ConfidenceTable::new());
        let (peer, mut handle) = Peer::new(
            addr(),
            client_stream,
            HandshakeConfig {
                network: crate::constants::Network::Regtest,
                min_peer_version: ProtocolVersion(0),
                required_services: PeerServices::empty(),
                ..HandshakeConfig::default()
            },
            Arc::new(SystemClock) as Arc<dyn Clock>,
            confidence,
            Duration::from_secs(120),
            8,
        );

        let server_codec = Codec::builder()
            .for_network(crate::constants::Network::Regtest)
            .finish();
        let mut server_framed = Framed::new(server_stream, server_codec);

        let client_task = tokio::spawn(peer.run(addr(), Nonce::random()));

        let version_msg = server_framed.next().await.unwrap().unwrap();
        assert!(matches!(version_msg, Message::Version(_)));
        server_framed
            .send(Message::Version(Version::new(
                ProtocolVersion(70015),
                addr(),
                PeerServices::NODE_NETWORK | PeerServices::NODE_BLOOM,
                PeerServices::empty(),
                addr(),
                Nonce::random(),
                "/test/".to_owned(),
                block::Height(700_000),
                false,
            )))
            .await
            .unwrap();
        server_framed.send(Message::Verack).await.unwrap();
        let verack = server_framed.next().await.unwrap().unwrap();
        assert!(matches!(verack, Message::Verack));

        let ready = handle.events.recv().await.unwrap();
        match ready {
            PeerEvent::Ready { version, best_height } => {
                assert_eq!(version, ProtocolVersion(70015));
                assert_eq!(best_height, block::Height(700_000));
            }
            other => panic!("expected Ready, got {other:?}"),
        }

        drop(server_framed);
        let reason = tokio::time::timeout(Duration::from_secs(1), client_task)
            .await
            .unwrap()
            .unwrap();
        // The server dropped its side right after the handshake; the client
        // should observe a graceful close rather than hang.
        assert!(matches!(
            reason,
            PeerCloseReason::GracefulClose | PeerCloseReason::Wire(_)
        ));
    }

    #[test]
    fn version_too_low_is_rejected_before_verack() {
        let min = ProtocolVersion(70001);
        let theirs = ProtocolVersion(60000);
        assert!(theirs < min);
    }
}
