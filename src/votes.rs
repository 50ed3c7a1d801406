//! Vote Tracker: per-block tally of distinct voter identities.

use crate::digest::Digest;
use std::collections::{HashMap, HashSet};

pub struct VoteTracker {
    quorum: usize,
    votes: HashMap<Digest, HashSet<usize>>,
}

impl VoteTracker {
    /// `quorum` is the caller-computed `floor(n/2) + 1`.
    pub fn new(quorum: usize) -> Self {
        VoteTracker {
            quorum,
            votes: HashMap::new(),
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Idempotent per `(digest, voter_id)`. Returns `(new_vote, newly_notarized)`;
    /// `newly_notarized` fires exactly once, the call where the tally first
    /// reaches quorum.
    pub fn record(&mut self, digest: Digest, voter_id: usize) -> (bool, bool) {
        let entry = self.votes.entry(digest).or_default();
        let before = entry.len();
        let new_vote = entry.insert(voter_id);
        let after = entry.len();
        let newly_notarized = new_vote && before < self.quorum && after >= self.quorum;
        (new_vote, newly_notarized)
    }

    pub fn tally(&self, digest: &Digest) -> u32 {
        self.votes.get(digest).map_or(0, |v| v.len() as u32)
    }

    pub fn has_voted(&self, digest: &Digest, voter_id: usize) -> bool {
        self.votes.get(digest).is_some_and(|v| v.contains(&voter_id))
    }
}
