//! Persistence: `chain_<node_id>.json`, a JSON array of block
//! records written after every newly finalized block. Simple file-backed
//! storage rather than `bach-storage`'s `sled` — the wire format is already
//! JSON for self-description, so keeping a single codec for both wire and
//! disk is the simpler and more consistent choice (see DESIGN.md).

use crate::block::Block;
use crate::chain::ChainStore;
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One row of the persisted chain file. Deliberately narrower than `Block`
/// at rest — `length` is reconstructed from file position on load rather
/// than stored redundantly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub epoch: u64,
    pub previous_hash: crate::digest::Digest,
    pub transactions: indexmap::IndexMap<u64, crate::transaction::Transaction>,
    pub hash: crate::digest::Digest,
}

impl From<&Block> for BlockRecord {
    fn from(b: &Block) -> Self {
        BlockRecord {
            epoch: b.epoch,
            previous_hash: b.previous_hash,
            transactions: b.transactions.clone(),
            hash: b.hash,
        }
    }
}

impl BlockRecord {
    /// Rebuilds the full `Block`, re-deriving `length` is not possible from
    /// the record alone, so the caller supplies it from chain position —
    /// see `load_chain`, which reconstructs length by walking the file in
    /// order (genesis is always record 0 with `length = 0`).
    fn into_block(self, length: u64) -> Block {
        Block::new(self.epoch, self.previous_hash, self.transactions, length)
    }
}

pub fn chain_file_path(data_dir: &Path, node_id: usize) -> PathBuf {
    data_dir.join(format!("chain_{node_id}.json"))
}

/// Persisted blocks are, by construction, finalized or notarized at the
/// moment they are written, so a successful load marks every
/// record finalized and notarized in the freshly built `ChainStore`,
/// skipping the genesis record (the store already creates its own).
pub fn load_chain(path: &Path) -> EngineResult<ChainStore> {
    let mut chain = ChainStore::new();
    if !path.exists() {
        return Ok(chain);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Persistence(format!("reading {path:?}: {e}")))?;
    let records: Vec<BlockRecord> = serde_json::from_str(&content)
        .map_err(|e| EngineError::Persistence(format!("decoding {path:?}: {e}")))?;

    let mut length = 0u64;
    for record in records {
        if record.epoch == 0 {
            continue; // genesis, already present in a fresh ChainStore.
        }
        length += 1;
        let block = record.into_block(length);
        chain.insert(block.clone()).map_err(|e| {
            EngineError::Persistence(format!("{path:?} has an inconsistent chain: {e}"))
        })?;
        chain
            .mark_trusted_finalized(block.hash)
            .expect("just inserted");
    }
    Ok(chain)
}

/// Overwrites the chain file with the current finalized prefix.
pub fn save_chain(path: &Path, chain: &ChainStore) -> EngineResult<()> {
    let records: Vec<BlockRecord> = chain
        .finalized_prefix()
        .iter()
        .filter_map(|h| chain.get(h))
        .map(BlockRecord::from)
        .collect();
    let content = serde_json::to_string_pretty(&records)
        .map_err(|e| EngineError::Persistence(format!("encoding chain: {e}")))?;
    std::fs::write(path, content)
        .map_err(|e| EngineError::Persistence(format!("writing {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn round_trips_a_finalized_prefix() {
        let mut chain = ChainStore::new();
        let genesis = chain.get(&chain.genesis_hash()).unwrap().clone();

        let b1 = Block::new(1, genesis.hash, IndexMap::new(), 1);
        chain.insert(b1.clone()).unwrap();
        chain.notarize(b1.hash).unwrap();

        let b2 = Block::new(2, b1.hash, IndexMap::new(), 2);
        chain.insert(b2.clone()).unwrap();
        chain.notarize(b2.hash).unwrap();
        chain.try_finalize(b1.hash, 2);

        let b3 = Block::new(3, b2.hash, IndexMap::new(), 3);
        chain.insert(b3.clone()).unwrap();
        chain.notarize(b3.hash).unwrap();
        chain.try_finalize(b2.hash, 3);

        assert!(chain.is_finalized(&b1.hash));

        let dir = tempfile::tempdir().unwrap();
        let path = chain_file_path(dir.path(), 0);
        save_chain(&path, &chain).unwrap();

        let loaded = load_chain(&path).unwrap();
        assert!(loaded.is_finalized(&b1.hash));
        assert_eq!(loaded.finalized_tip(), chain.finalized_tip());
    }

    #[test]
    fn missing_file_loads_as_genesis_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = chain_file_path(dir.path(), 7);
        let chain = load_chain(&path).unwrap();
        assert_eq!(chain.finalized_prefix(), vec![chain.genesis_hash()]);
    }
}
