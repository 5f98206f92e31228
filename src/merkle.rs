//! BIP37 partial Merkle trees.
//!
//! A `merkleblock` message carries a compact proof that a subset of a
//! block's transactions match a filter, without shipping the whole block.
//! [`PartialMerkleTree::extract_matches`] walks that proof and reconstructs
//! both the Merkle root (so the caller can check it against the block
//! header) and the list of matched transaction hashes.

use thiserror::Error;

use crate::{serialization::sha256d, transaction};

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum MerkleError {
    #[error("partial merkle tree has no transactions")]
    Empty,
    #[error("ran out of hashes while traversing the tree")]
    NotEnoughHashes,
    #[error("ran out of flag bits while traversing the tree")]
    NotEnoughFlags,
    #[error("not all flag bits were consumed")]
    UnusedFlags,
    #[error("not all hashes were consumed")]
    UnusedHashes,
    #[error("found a duplicated internal node hash (CVE-2012-2459 style)")]
    DuplicateHash,
}

/// A BIP37 partial Merkle tree: the inputs to a `merkleblock` message's proof
/// (minus the header, which lives alongside it in [`super::protocol::external::message::MerkleBlock`]).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartialMerkleTree {
    total_transactions: u32,
    hashes: Vec<transaction::Hash>,
    flags: Vec<u8>,
}

impl PartialMerkleTree {
    pub fn new(
        total_transactions: u32,
        hashes: Vec<transaction::Hash>,
        flags: Vec<u8>,
    ) -> PartialMerkleTree {
        PartialMerkleTree {
            total_transactions,
            hashes,
            flags,
        }
    }

    /// Reconstruct the Merkle root and the matched transaction hashes.
    ///
    /// Matches are returned in tree (left-to-right, i.e. original block)
    /// order.
    pub fn extract_matches(
        &self,
    ) -> Result<(crate::block::Hash, Vec<transaction::Hash>), MerkleError> {
        if self.total_transactions == 0 {
            return Err(MerkleError::Empty);
        }

        let height = tree_height(self.total_transactions);
        let mut bits_used = 0usize;
        let mut hashes_used = 0usize;
        let mut matches = Vec::new();

        let root = traverse(
            height,
            0,
            self.total_transactions,
            &self.hashes,
            &self.flags,
            &mut bits_used,
            &mut hashes_used,
            &mut matches,
        )?;

        // BIP37 requires every flag bit and every hash to be consumed;
        // leftovers indicate a malformed or oversized proof.
        if hashes_used != self.hashes.len() {
            return Err(MerkleError::UnusedHashes);
        }
        let bits_provided = self.flags.len() * 8;
        if (bits_used..bits_provided).any(|bit| get_bit(&self.flags, bit)) {
            return Err(MerkleError::UnusedFlags);
        }

        Ok((crate::block::Hash(root), matches))
    }
}

fn tree_height(total_transactions: u32) -> u32 {
    let mut height = 0;
    let mut width = total_transactions;
    while width > 1 {
        width = (width + 1) / 2;
        height += 1;
    }
    height
}

fn tree_width(height: u32, total_transactions: u32) -> u32 {
    (total_transactions + (1 << height) - 1) >> height
}

fn get_bit(flags: &[u8], index: usize) -> bool {
    (flags[index / 8] >> (index % 8)) & 1 != 0
}

#[allow(clippy::too_many_arguments)]
fn traverse(
    height: u32,
    pos: u32,
    total_transactions: u32,
    hashes: &[transaction::Hash],
    flags: &[u8],
    bits_used: &mut usize,
    hashes_used: &mut usize,
    matches: &mut Vec<transaction::Hash>,
) -> Result<[u8; 32], MerkleError> {
    if *bits_used >= flags.len() * 8 {
        return Err(MerkleError::NotEnoughFlags);
    }
    let parent_of_match = get_bit(flags, *bits_used);
    *bits_used += 1;

    if height == 0 || !parent_of_match {
        if *hashes_used >= hashes.len() {
            return Err(MerkleError::NotEnoughHashes);
        }
        let hash = hashes[*hashes_used];
        *hashes_used += 1;
        if height == 0 && parent_of_match {
            matches.push(hash);
        }
        return Ok(hash.0);
    }

    let left = traverse(
        height - 1,
        pos * 2,
        total_transactions,
        hashes,
        flags,
        bits_used,
        hashes_used,
        matches,
    )?;
    let right = if pos * 2 + 1 < tree_width(height - 1, total_transactions) {
        traverse(
            height - 1,
            pos * 2 + 1,
            total_transactions,
            hashes,
            flags,
            bits_used,
            hashes_used,
            matches,
        )?
    } else {
        left
    };
    if left == right && pos * 2 + 1 < tree_width(height - 1, total_transactions) {
        return Err(MerkleError::DuplicateHash);
    }

    let mut concat = Vec::with_capacity(64);
    concat.extend_from_slice(&left);
    concat.extend_from_slice(&right);
    Ok(sha256d::double_sha256(&concat))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8) -> transaction::Hash {
        transaction::Hash([byte; 32])
    }

    #[test]
    fn single_transaction_matches_itself() {
        let tree = PartialMerkleTree::new(1, vec![leaf(1)], vec![0b0000_0001]);
        let (root, matches) = tree.extract_matches().unwrap();
        assert_eq!(root.0, leaf(1).0);
        assert_eq!(matches, vec![leaf(1)]);
    }

    #[test]
    fn two_transactions_no_match_reconstructs_root_only() {
        // Root over two leaves, neither of which matched: a single flag bit
        // (0, not a match at the root) and the precomputed root hash.
        let mut concat = Vec::new();
        concat.extend_from_slice(&leaf(1).0);
        concat.extend_from_slice(&leaf(2).0);
        let expected_root = sha256d::double_sha256(&concat);

        let tree = PartialMerkleTree::new(2, vec![transaction::Hash(expected_root)], vec![0b0]);
        let (root, matches) = tree.extract_matches().unwrap();
        assert_eq!(root.0, expected_root);
        assert!(matches.is_empty());
    }

    #[test]
    fn rejects_unused_hashes() {
        let tree = PartialMerkleTree::new(1, vec![leaf(1), leaf(2)], vec![0b0000_0001]);
        assert_eq!(tree.extract_matches(), Err(MerkleError::UnusedHashes));
    }
}
