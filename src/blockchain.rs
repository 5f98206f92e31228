//! The narrow collaborator interface this crate needs from a persistent
//! block store, which it does not itself own or implement.

use chrono::{DateTime, Utc};

use crate::block::{self, BlockLocator};
use crate::error::ValidationError;

/// What a download pipeline needs from wherever headers ultimately live.
///
/// Full header validation (proof-of-work target checks against a difficulty
/// schedule, checkpoint enforcement, reorg handling) happens inside the
/// implementor; this crate only needs enough to drive `getheaders` requests
/// and to know how many headers a batch actually extended the chain by.
pub trait BlockChain: Send + Sync {
    /// A locator describing the caller's current best chain, from its tip
    /// downward, for use in a `getheaders`/`getblocks` request.
    fn locator(&self) -> BlockLocator;

    /// The timestamp of the current chain tip, used to decide whether a
    /// rescan needs to start earlier than the tip (e.g. after loading a new
    /// wallet filter with an older `earliest_key_time`).
    fn tip_time(&self) -> DateTime<Utc>;

    /// Validate and extend the chain with `headers`, in order. Returns the
    /// number of headers actually accepted (which may be fewer than
    /// `headers.len()` if a reorg point was found partway through).
    fn validate_and_extend(&self, headers: &[block::CountedHeader]) -> Result<usize, ValidationError>;
}
