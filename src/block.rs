//! Block: the unit of agreement.

use crate::digest::Digest;
use crate::transaction::Transaction;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A block proposed at `epoch`, extending `previous_hash`.
///
/// `hash` is computed over `(length, epoch, previous_hash, sorted(tx_ids))` and
/// MUST be stable across re-serialization — it is never recomputed from a
/// decoded block, only checked against the encoded `hash` field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub epoch: u64,
    pub previous_hash: Digest,
    pub transactions: IndexMap<u64, Transaction>,
    pub length: u64,
    pub hash: Digest,
}

impl Block {
    /// Builds a block and computes its digest. `length` is the caller's
    /// responsibility (normally `parent.length + 1`); this constructor does
    /// not look up a parent so it can also build genesis (`length = 0`).
    pub fn new(
        epoch: u64,
        previous_hash: Digest,
        transactions: IndexMap<u64, Transaction>,
        length: u64,
    ) -> Self {
        let hash = Self::compute_hash(length, epoch, previous_hash, &transactions);
        Block {
            epoch,
            previous_hash,
            transactions,
            length,
            hash,
        }
    }

    pub fn genesis() -> Self {
        Block::new(0, Digest::ZERO, IndexMap::new(), 0)
    }

    pub fn is_genesis(&self) -> bool {
        self.epoch == 0 && self.previous_hash == Digest::ZERO
    }

    /// Canonical digest: `(length, epoch, previous_hash, sorted(tx_ids))`.
    /// Transaction bodies are deliberately excluded from the committed
    /// digest fields beyond their ids.
    fn compute_hash(
        length: u64,
        epoch: u64,
        previous_hash: Digest,
        transactions: &IndexMap<u64, Transaction>,
    ) -> Digest {
        let mut tx_ids: Vec<u64> = transactions.keys().copied().collect();
        tx_ids.sort_unstable();

        let mut buf = Vec::new();
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&epoch.to_le_bytes());
        buf.extend_from_slice(previous_hash.as_bytes());
        for id in tx_ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        Digest::of(&buf)
    }

    /// Re-derives the digest from this block's own fields; used to validate
    /// that a decoded block's `hash` field matches its content.
    pub fn recomputed_hash(&self) -> Digest {
        Self::compute_hash(self.length, self.epoch, self.previous_hash, &self.transactions)
    }

    pub fn is_self_consistent(&self) -> bool {
        self.hash == self.recomputed_hash()
    }
}

/// A vote carries only the block header, never the transaction bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: Digest,
    pub epoch: u64,
    pub previous_hash: Digest,
    pub length: u64,
}

impl From<&Block> for BlockHeader {
    fn from(b: &Block) -> Self {
        BlockHeader {
            hash: b.hash,
            epoch: b.epoch,
            previous_hash: b.previous_hash,
            length: b.length,
        }
    }
}
