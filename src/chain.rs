//! Chain Store: the source of truth for all known blocks, plus the
//! notarization/finalization overlay.
//!
//! Blocks form a DAG of parent-hash pointers into a flat arena keyed by
//! digest — there are no owning
//! references between blocks, so no block ever needs to outlive another.

use crate::block::Block;
use crate::digest::Digest;
use crate::error::{EngineError, EngineResult};
use std::collections::{HashMap, HashSet};

pub struct ChainStore {
    genesis: Digest,
    blocks: HashMap<Digest, Block>,
    notarized: HashSet<Digest>,
    finalized: HashSet<Digest>,
    /// Highest finalized block by chain length; `None` until genesis is
    /// marked finalized on construction... genesis is finalized immediately,
    /// so this is always `Some` in practice.
    finalized_tip: Digest,
    block_by_epoch: HashMap<u64, HashSet<Digest>>,
}

impl ChainStore {
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let hash = genesis.hash;
        let mut blocks = HashMap::new();
        blocks.insert(hash, genesis);

        let mut notarized = HashSet::new();
        notarized.insert(hash);
        let mut finalized = HashSet::new();
        finalized.insert(hash);

        let mut block_by_epoch = HashMap::new();
        block_by_epoch.insert(0, HashSet::from([hash]));

        ChainStore {
            genesis: hash,
            blocks,
            notarized,
            finalized,
            finalized_tip: hash,
            block_by_epoch,
        }
    }

    pub fn genesis_hash(&self) -> Digest {
        self.genesis
    }

    pub fn contains(&self, digest: Digest) -> bool {
        self.blocks.contains_key(&digest)
    }

    pub fn get(&self, digest: &Digest) -> Option<&Block> {
        self.blocks.get(digest)
    }

    pub fn is_notarized(&self, digest: &Digest) -> bool {
        self.notarized.contains(digest)
    }

    pub fn is_finalized(&self, digest: &Digest) -> bool {
        self.finalized.contains(digest)
    }

    /// Idempotent insert. Genesis is inserted only by `new`; any later block
    /// must reference a known parent and extend its length by exactly one.
    pub fn insert(&mut self, block: Block) -> EngineResult<()> {
        if self.blocks.contains_key(&block.hash) {
            return Ok(());
        }
        if block.is_genesis() {
            // A second genesis-shaped block would collide on hash with the
            // real genesis already inserted in `new`, so this path is
            // unreachable in practice; guard it anyway for safety.
            return Err(EngineError::InvalidParent);
        }

        let parent = self
            .blocks
            .get(&block.previous_hash)
            .ok_or(EngineError::InvalidParent)?;
        if block.length != parent.length + 1 {
            return Err(EngineError::BadLength);
        }

        self.block_by_epoch
            .entry(block.epoch)
            .or_default()
            .insert(block.hash);
        self.blocks.insert(block.hash, block);
        Ok(())
    }

    /// Marks a block notarized. Idempotent; `Unknown` if the digest was
    /// never inserted.
    pub fn notarize(&mut self, digest: Digest) -> EngineResult<()> {
        if !self.blocks.contains_key(&digest) {
            return Err(EngineError::Unknown(digest.to_hex()));
        }
        self.notarized.insert(digest);
        Ok(())
    }

    pub fn blocks_at_epoch(&self, epoch: u64) -> Vec<&Block> {
        self.block_by_epoch
            .get(&epoch)
            .into_iter()
            .flatten()
            .filter_map(|h| self.blocks.get(h))
            .collect()
    }

    /// Among notarized blocks of maximal length, the lexicographically
    /// smallest digest — the deterministic tie-break rule.
    pub fn longest_notarized_tip(&self) -> Digest {
        self.notarized
            .iter()
            .filter_map(|h| self.blocks.get(h).map(|b| (b.length, *h)))
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(_, h)| h)
            .unwrap_or(self.genesis)
    }

    /// Genesis-to-block path via `previous_hash`. `Orphan` if genesis is
    /// never reached (should not happen for any block accepted by `insert`).
    pub fn chain_to(&self, digest: Digest) -> EngineResult<Vec<Digest>> {
        let mut path = Vec::new();
        let mut current = digest;
        loop {
            path.push(current);
            if current == self.genesis {
                break;
            }
            let block = self.blocks.get(&current).ok_or(EngineError::Orphan)?;
            current = block.previous_hash;
            if !self.blocks.contains_key(&current) && current != self.genesis {
                return Err(EngineError::Orphan);
            }
        }
        path.reverse();
        Ok(path)
    }

    /// Longest prefix of genesis-rooted notarized blocks closed under the
    /// three-consecutive-epoch rule, genesis first.
    pub fn finalized_prefix(&self) -> Vec<Digest> {
        self.chain_to(self.finalized_tip).unwrap_or_else(|_| vec![self.genesis])
    }

    pub fn finalized_tip(&self) -> Digest {
        self.finalized_tip
    }

    /// True if `tx_id` already appears in some finalized or notarized block.
    /// Used by the mempool to reject transactions that would create a
    /// duplicate along any live chain.
    pub fn contains_tx_id(&self, tx_id: u64) -> bool {
        self.finalized
            .iter()
            .chain(self.notarized.iter())
            .filter_map(|h| self.blocks.get(h))
            .any(|b| b.transactions.contains_key(&tx_id))
    }

    /// Marks `digest` finalized without running the three-consecutive-epoch
    /// check, trusting the caller's source of truth. Used only by
    /// `persistence::load_chain`, whose records were already finalized at
    /// the moment they were written.
    pub fn mark_trusted_finalized(&mut self, digest: Digest) -> EngineResult<()> {
        if !self.blocks.contains_key(&digest) {
            return Err(EngineError::Unknown(digest.to_hex()));
        }
        self.notarized.insert(digest);
        self.finalized.insert(digest);
        let length = self.blocks[&digest].length;
        let tip_length = self.blocks.get(&self.finalized_tip).map_or(0, |b| b.length);
        if length > tip_length {
            self.finalized_tip = digest;
        }
        Ok(())
    }

    /// Attempts to finalize the earliest block of a run of three
    /// consecutively notarized epochs. `child_epoch` is the epoch of the
    /// block whose notarization triggered this attempt; `block_hash` is
    /// that block's parent. Finalization requires `block_hash` notarized at
    /// `child_epoch - 1`, its own parent notarized at `child_epoch - 2` (or
    /// genesis), and finalizes that grandparent — the earliest of the
    /// three.
    pub fn try_finalize(&mut self, block_hash: Digest, child_epoch: u64) -> Vec<Digest> {
        if child_epoch == 0 {
            return Vec::new();
        }
        let parent_epoch = child_epoch - 1;

        if !self.notarized.contains(&block_hash) {
            return Vec::new();
        }
        let parent = match self.blocks.get(&block_hash) {
            Some(b) => b,
            None => return Vec::new(),
        };
        if parent.epoch != parent_epoch {
            return Vec::new();
        }
        if block_hash == self.genesis {
            // No epoch before genesis; a three-epoch run can't end here.
            return Vec::new();
        }

        let grandparent_hash = parent.previous_hash;
        let grandparent_notarized = self.notarized.contains(&grandparent_hash);
        let grandparent_epoch_ok = self
            .blocks
            .get(&grandparent_hash)
            .is_some_and(|g| grandparent_hash == self.genesis || g.epoch + 1 == parent_epoch);
        if !grandparent_notarized || !grandparent_epoch_ok {
            return Vec::new();
        }

        self.finalize_from(grandparent_hash)
    }

    /// Finalizes `block_hash` and every ancestor not already finalized,
    /// rejecting the attempt if it would fork away from the already
    /// finalized prefix.
    fn finalize_from(&mut self, block_hash: Digest) -> Vec<Digest> {
        if self.finalized.contains(&block_hash) {
            return Vec::new();
        }
        let block = match self.blocks.get(&block_hash) {
            Some(b) => b,
            None => return Vec::new(),
        };
        let current_tip_length = self.blocks.get(&self.finalized_tip).map_or(0, |b| b.length);
        if block.length <= current_tip_length {
            // This would finalize a block at or below the current finalized
            // length that wasn't already in the finalized set — i.e. a
            // competing fork. Reject.
            tracing::warn!(
                digest = %block_hash,
                length = block.length,
                tip_length = current_tip_length,
                "refusing to finalize block on a competing fork"
            );
            return Vec::new();
        }

        let mut newly_finalized = Vec::new();
        let mut cursor = block_hash;
        loop {
            if self.finalized.contains(&cursor) {
                break;
            }
            self.finalized.insert(cursor);
            newly_finalized.push(cursor);
            if cursor == self.genesis {
                break;
            }
            cursor = match self.blocks.get(&cursor) {
                Some(b) => b.previous_hash,
                None => break,
            };
        }

        if block.length > current_tip_length {
            self.finalized_tip = block_hash;
        }
        newly_finalized
    }
}

impl Default for ChainStore {
    fn default() -> Self {
        ChainStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn child(parent: &Block, epoch: u64) -> Block {
        Block::new(epoch, parent.hash, IndexMap::new(), parent.length + 1)
    }

    #[test]
    fn insert_rejects_unknown_parent() {
        let mut chain = ChainStore::new();
        let orphan = Block::new(1, Digest::of(b"nope"), IndexMap::new(), 1);
        assert!(matches!(chain.insert(orphan), Err(EngineError::InvalidParent)));
    }

    #[test]
    fn insert_rejects_bad_length() {
        let mut chain = ChainStore::new();
        let genesis = chain.get(&chain.genesis_hash()).unwrap().clone();
        let bad = Block::new(1, genesis.hash, IndexMap::new(), 5);
        assert!(matches!(chain.insert(bad), Err(EngineError::BadLength)));
    }

    #[test]
    fn insert_is_idempotent() {
        let mut chain = ChainStore::new();
        let genesis = chain.get(&chain.genesis_hash()).unwrap().clone();
        let b = child(&genesis, 1);
        chain.insert(b.clone()).unwrap();
        chain.insert(b).unwrap();
        assert_eq!(chain.blocks_at_epoch(1).len(), 1);
    }

    #[test]
    fn three_consecutive_notarized_epochs_finalize_the_earliest() {
        let mut chain = ChainStore::new();
        let genesis = chain.get(&chain.genesis_hash()).unwrap().clone();

        let b1 = child(&genesis, 1);
        chain.insert(b1.clone()).unwrap();
        chain.notarize(b1.hash).unwrap();

        let b2 = child(&b1, 2);
        chain.insert(b2.clone()).unwrap();
        chain.notarize(b2.hash).unwrap();
        chain.try_finalize(b1.hash, 2);
        assert!(!chain.is_finalized(&b1.hash), "only two in the run so far");

        let b3 = child(&b2, 3);
        chain.insert(b3.clone()).unwrap();
        chain.notarize(b3.hash).unwrap();
        let finalized = chain.try_finalize(b2.hash, 3);

        assert!(chain.is_finalized(&b1.hash));
        assert!(!chain.is_finalized(&b2.hash), "b2 is the middle of the run, not the earliest");
        assert!(!chain.is_finalized(&b3.hash));
        assert!(finalized.contains(&b1.hash));
    }

    #[test]
    fn gap_in_epochs_never_finalizes() {
        let mut chain = ChainStore::new();
        let genesis = chain.get(&chain.genesis_hash()).unwrap().clone();

        let b1 = child(&genesis, 1);
        chain.insert(b1.clone()).unwrap();
        chain.notarize(b1.hash).unwrap();

        // epoch 2 skipped entirely; b2 proposed at epoch 3 instead.
        let b2 = child(&b1, 3);
        chain.insert(b2.clone()).unwrap();
        chain.notarize(b2.hash).unwrap();
        chain.try_finalize(b1.hash, 3);
        assert!(!chain.is_finalized(&b1.hash));
    }

    #[test]
    fn longest_notarized_tip_breaks_ties_by_smallest_digest() {
        let mut chain = ChainStore::new();
        let genesis = chain.get(&chain.genesis_hash()).unwrap().clone();

        let mut txs_a = IndexMap::new();
        txs_a.insert(1, crate::transaction::Transaction::new(1, "a", "b", 1));
        let a = Block::new(1, genesis.hash, txs_a, 1);
        let b = Block::new(1, genesis.hash, IndexMap::new(), 1);

        chain.insert(a.clone()).unwrap();
        chain.insert(b.clone()).unwrap();
        chain.notarize(a.hash).unwrap();
        chain.notarize(b.hash).unwrap();

        let expected = std::cmp::min(a.hash, b.hash);
        assert_eq!(chain.longest_notarized_tip(), expected);
    }

    #[test]
    fn finalized_prefix_starts_at_genesis() {
        let chain = ChainStore::new();
        assert_eq!(chain.finalized_prefix(), vec![chain.genesis_hash()]);
    }
}
