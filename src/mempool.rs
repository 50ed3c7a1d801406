//! Mempool: pending-transaction buffer partitioned by target epoch.

use crate::chain::ChainStore;
use crate::transaction::Transaction;
use std::collections::{HashMap, VecDeque};

pub struct Mempool {
    buckets: HashMap<u64, VecDeque<Transaction>>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool {
            buckets: HashMap::new(),
        }
    }

    /// Rejects (returns `false`) if `tx.tx_id` already appears in a known
    /// finalized or notarized block. Otherwise queues it for `epoch`.
    pub fn add(&mut self, tx: Transaction, epoch: u64, chain: &ChainStore) -> bool {
        if chain.contains_tx_id(tx.tx_id) {
            return false;
        }
        if self
            .buckets
            .values()
            .flatten()
            .any(|queued| queued.tx_id == tx.tx_id)
        {
            return false;
        }
        self.buckets.entry(epoch).or_default().push_back(tx);
        true
    }

    /// Drains and returns every transaction bucketed for `epoch`, in
    /// insertion order.
    pub fn drain(&mut self, epoch: u64) -> Vec<Transaction> {
        self.buckets
            .remove(&epoch)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, epoch: u64) -> usize {
        self.buckets.get(&epoch).map_or(0, |q| q.len())
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Mempool::new()
    }
}
