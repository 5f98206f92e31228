//! Crate-wide error taxonomy.
//!
//! Each variant family mirrors one row of the error-handling design: a
//! [`WireError`] or [`ValidationError`] closes the offending peer and
//! penalizes its address; a [`BroadcastError`] only ever reaches the
//! caller through a broadcast's future.

use std::io;
use thiserror::Error;

use crate::protocol::external::message::RejectReason;

/// A malformed or out-of-range wire primitive.
#[derive(Error, Debug)]
pub enum WireError {
    /// Fewer bytes were available than the frame declared.
    #[error("truncated frame: {0}")]
    Truncated(&'static str),

    /// A VarInt or length field declared a size that cannot fit in the
    /// enclosing message, or exceeds a documented cap.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// The payload's computed checksum did not match the header.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The network magic did not match the configured network.
    #[error("magic mismatch")]
    MagicMismatch,

    /// The declared payload length exceeded the configured cap.
    #[error("payload length {0} exceeds cap {1}")]
    LengthCapExceeded(usize, usize),

    /// Underlying I/O failure while framing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A version/verack handshake did not satisfy our requirements.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    /// The remote protocol version was below our configured floor.
    #[error("peer protocol version {0} below minimum {1}")]
    VersionTooLow(u32, u32),

    /// The remote peer cannot serve a service bit we require.
    #[error("peer is missing a required service bit")]
    MissingService,

    /// The remote peer's handshake arrived out of order or twice.
    #[error("handshake message out of order")]
    OutOfOrder,
}

/// A header or filtered block failed a structural check.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// A block header's hash did not satisfy its own declared target.
    #[error("proof of work target not met")]
    ProofOfWorkInvalid,

    /// A header did not extend a known previous header.
    #[error("header does not link to a known parent")]
    BrokenLinkage,

    /// The partial Merkle tree's reconstructed root did not match the header.
    #[error("merkle root mismatch")]
    MerkleRootMismatch,
}

/// Why a peer connection was closed, used to drive [`crate::address_book::AddressBook`]
/// backoff bookkeeping.
#[derive(Error, Debug)]
pub enum PeerCloseReason {
    /// A wire-level protocol violation.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// A handshake precondition was not met.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// A validation invariant was violated.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// No traffic arrived within the expected interval.
    #[error("peer timed out")]
    Timeout,

    /// The remote end closed the connection without protocol violation.
    #[error("peer closed the connection")]
    GracefulClose,

    /// The peer group is shutting down.
    #[error("cancelled")]
    Cancelled,
}

impl PeerCloseReason {
    /// Whether `AddressBook` should treat this as a successful disconnect
    /// (reset backoff) rather than a failure (penalize).
    pub fn is_success_for_backoff(&self) -> bool {
        matches!(self, PeerCloseReason::GracefulClose)
    }
}

/// The outcome of a [`crate::broadcast::TransactionBroadcast`] attempt.
#[derive(Error, Debug, Clone)]
pub enum BroadcastError {
    /// More than half of the peers we were waiting on rejected the transaction.
    #[error("rejected: {0:?}")]
    Rejected(RejectReason),

    /// The broadcast timed out before reaching the seen-by threshold.
    #[error("timed out after sending to {sent} peers, seen by {seen}")]
    Timeout {
        /// Number of peers the transaction was sent to.
        sent: usize,
        /// Number of peers that had announced the transaction back at timeout.
        seen: usize,
    },

    /// The owning `PeerGroup` was stopped before the broadcast completed.
    #[error("cancelled")]
    Cancelled,
}
