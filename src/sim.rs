//! Deterministic in-process network simulator: multi-participant runs need
//! reproducible delivery order that real socket I/O can't give. Same
//! `new`/`run_simple`/`run_reorder` shape as a round-based in-memory
//! network harness, with a fixed-seed `StdRng` for reproducible shuffling
//! and a pairwise prefix-consistency check across finalized chains.

use crate::consensus::ConsensusEngine;
use crate::digest::Digest;
use crate::message::{Envelope, Message};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{HashSet, VecDeque};

pub struct SimNetwork {
    pub engines: Vec<ConsensusEngine>,
    n: usize,
    queues: Vec<VecDeque<Envelope>>,
    offline: HashSet<usize>,
    rng: StdRng,
}

impl SimNetwork {
    /// `n` honest participants, a shared leader seed, and no confusion window.
    pub fn new(n: usize) -> Self {
        Self::with_confusion(n, None, None)
    }

    pub fn with_confusion(n: usize, confusion_start: Option<u64>, confusion_duration: Option<u64>) -> Self {
        let engines = (0..n)
            .map(|id| ConsensusEngine::new(id, n, "sim-seed", confusion_start, confusion_duration))
            .collect();
        SimNetwork {
            engines,
            n,
            queues: (0..n).map(|_| VecDeque::new()).collect(),
            offline: HashSet::new(),
            rng: StdRng::from_seed([7u8; 32]),
        }
    }

    fn enqueue(&mut self, from: usize, out: crate::consensus::EngineOutput) {
        for message in out.broadcast {
            let envelope = Envelope::new(message, from);
            for j in 0..self.n {
                if j != from && !self.offline.contains(&j) {
                    self.queues[j].push_back(envelope.clone());
                }
            }
        }
        for (peer, message) in out.replies {
            if !self.offline.contains(&peer) {
                self.queues[peer].push_back(Envelope::new(message, from));
            }
        }
    }

    fn deliver(&mut self, to: usize, envelope: Envelope) {
        if self.offline.contains(&to) {
            return;
        }
        let out = self.engines[to].on_envelope(&envelope);
        self.enqueue(to, out);
    }

    /// Marks a participant crashed: queued-for-it messages are dropped and
    /// future broadcasts never reach it, modeling "fail stop" rather than mere delay.
    pub fn crash(&mut self, id: usize) {
        self.offline.insert(id);
        self.queues[id].clear();
    }

    /// Brings a crashed participant back and has it kick off the recovery
    /// protocol, rather than silently replaying
    /// whatever it missed.
    pub fn rejoin(&mut self, id: usize) {
        self.offline.remove(&id);
        let last_epoch = self.engines[id]
            .chain
            .get(&self.engines[id].chain.finalized_tip())
            .map_or(0, |b| b.epoch);
        let out = crate::consensus::EngineOutput {
            broadcast: vec![Message::QueryMissingBlocks { last_epoch }],
            ..Default::default()
        };
        self.enqueue(id, out);
    }

    fn begin_epoch_all(&mut self, e: u64) {
        for i in 0..self.n {
            if self.offline.contains(&i) {
                continue;
            }
            let out = self.engines[i].begin_epoch(e);
            self.enqueue(i, out);
        }
    }

    fn drain_in_order(&mut self) {
        let mut next: Vec<VecDeque<Envelope>> = (0..self.n).map(|_| VecDeque::new()).collect();
        std::mem::swap(&mut self.queues, &mut next);
        let mut pending = next;
        for i in 0..self.n {
            while let Some(envelope) = pending[i].pop_front() {
                self.deliver(i, envelope);
            }
        }
    }

    fn drain_shuffled(&mut self) {
        let mut flat: Vec<(usize, Envelope)> = Vec::new();
        for (i, q) in self.queues.iter_mut().enumerate() {
            while let Some(envelope) = q.pop_front() {
                flat.push((i, envelope));
            }
        }
        flat.shuffle(&mut self.rng);
        for (i, envelope) in flat {
            self.deliver(i, envelope);
        }
    }

    fn drain_partial(&mut self, fraction: f64) {
        let mut delivered = Vec::new();
        for (i, q) in self.queues.iter_mut().enumerate() {
            let mut remaining = VecDeque::new();
            while let Some(envelope) = q.pop_front() {
                if self.rng.gen::<f64>() < fraction {
                    delivered.push((i, envelope));
                } else {
                    remaining.push_back(envelope);
                }
            }
            *q = remaining;
        }
        delivered.shuffle(&mut self.rng);
        for (i, envelope) in delivered {
            self.deliver(i, envelope);
        }
    }

    /// Perfectly synchronous delivery, three rounds per epoch (propose,
    /// vote, notarization echo) — enough for a message chain to settle.
    pub fn run_simple(&mut self, epochs: std::ops::RangeInclusive<u64>) {
        for e in epochs {
            self.begin_epoch_all(e);
            for _ in 0..3 {
                self.drain_in_order();
            }
        }
    }

    /// Same three rounds, but delivery order within each round is shuffled.
    pub fn run_reorder(&mut self, epochs: std::ops::RangeInclusive<u64>) {
        for e in epochs {
            self.begin_epoch_all(e);
            for _ in 0..3 {
                self.drain_shuffled();
            }
        }
    }

    /// `fraction` of queued messages are delivered each round (shuffled);
    /// the rest stay queued for a later round. Models the asynchronous
    /// confusion window's unreliable delivery.
    pub fn run_partial(&mut self, epochs: std::ops::RangeInclusive<u64>, fraction: f64) {
        for e in epochs {
            self.begin_epoch_all(e);
            for _ in 0..3 {
                self.drain_partial(fraction);
            }
        }
    }

    /// Flushes any still-queued messages without starting a new epoch —
    /// useful after `run_partial` to let delayed messages finally land.
    pub fn settle(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.drain_in_order();
        }
    }

    /// Consistency check (teacher's `TestNetwork::consistency`): the
    /// finalized prefix of every honest, non-crashed participant must be
    /// pairwise prefix-related.
    pub fn finalized_chains_are_consistent(&self) -> bool {
        let chains: Vec<Vec<Digest>> = self
            .engines
            .iter()
            .map(|e| e.chain.finalized_prefix())
            .collect();
        for a in &chains {
            for b in &chains {
                if !is_prefix(a, b) && !is_prefix(b, a) {
                    return false;
                }
            }
        }
        true
    }
}

fn is_prefix(prefix: &[Digest], whole: &[Digest]) -> bool {
    whole.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_finalizes_and_agrees() {
        let mut net = SimNetwork::new(3);
        net.run_simple(1..=5);
        assert!(net.finalized_chains_are_consistent());
        for engine in &net.engines {
            assert!(engine.chain.finalized_prefix().len() >= 3, "at least genesis + 2 finalized");
        }
    }

    #[test]
    fn one_crashed_participant_does_not_block_the_others() {
        let mut net = SimNetwork::new(4);
        net.crash(3);
        net.run_simple(1..=6);
        assert!(net.finalized_chains_are_consistent());
        assert!(net.engines[0].chain.finalized_prefix().len() >= 3);
    }

    #[test]
    fn rejoin_recovers_the_missed_prefix() {
        let mut net = SimNetwork::new(4);
        net.crash(3);
        net.run_simple(1..=6);
        net.rejoin(3);
        net.settle(3);
        assert_eq!(
            net.engines[3].chain.finalized_tip(),
            net.engines[0].chain.finalized_tip(),
            "rejoined node should catch up to the others' finalized tip"
        );
    }

    #[test]
    fn reordered_delivery_still_converges() {
        let mut net = SimNetwork::new(5);
        net.run_reorder(1..=6);
        assert!(net.finalized_chains_are_consistent());
    }
}
