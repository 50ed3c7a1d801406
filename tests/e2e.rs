//! End-to-end scenarios over the in-process simulator. Requires
//! the `sim` feature: `cargo test --features sim --test e2e`.

use streamlet::block::Block;
use streamlet::consensus::ConsensusEngine;
use streamlet::message::{Envelope, Message};
use streamlet::sim::SimNetwork;
use streamlet::transaction::Transaction;

/// Scenario 1: N=3, no confusion, five epochs. Everyone should agree on a
/// growing finalized prefix.
#[test]
fn happy_path_three_nodes_five_epochs() {
    let mut net = SimNetwork::new(3);
    net.run_simple(1..=5);

    assert!(net.finalized_chains_are_consistent());
    let tips: Vec<_> = net.engines.iter().map(|e| e.chain.finalized_tip()).collect();
    assert!(tips.windows(2).all(|w| w[0] == w[1]), "all tips should match in the synchronous happy path");
    assert!(net.engines[0].chain.finalized_prefix().len() >= 3);
}

/// Scenario 2: one crashed participant must not block the remaining quorum
/// from finalizing.
#[test]
fn one_crashed_participant_does_not_block_consensus() {
    let mut net = SimNetwork::new(4);
    net.crash(3);
    net.run_simple(1..=6);

    assert!(net.finalized_chains_are_consistent());
    for i in 0..3 {
        assert!(net.engines[i].chain.finalized_prefix().len() >= 3, "node {i} should still progress");
    }
}

/// Scenario 3: a confusion window with adversarial round-robin leader
/// selection, followed by the resolution step re-broadcasting buffered
/// proposals so the network still converges.
#[test]
fn confusion_window_resolves_and_still_converges() {
    let mut net = SimNetwork::with_confusion(4, Some(2), Some(3));
    net.run_partial(1..=4, 0.5);
    // Resolution step lands at epoch 5 (confusion_start + confusion_duration).
    net.run_simple(5..=8);
    net.settle(5);

    assert!(net.finalized_chains_are_consistent());
}

/// Scenario 4: a crashed participant rejoins and recovers the missed
/// prefix via QUERY_MISSING_BLOCKS / RESPONSE_MISSING_BLOCKS.
#[test]
fn rejoin_recovers_missed_prefix_via_recovery_protocol() {
    let mut net = SimNetwork::new(4);
    net.crash(3);
    net.run_simple(1..=6);

    let caught_up_tip = net.engines[0].chain.finalized_tip();
    assert_ne!(net.engines[3].chain.finalized_tip(), caught_up_tip);

    net.rejoin(3);
    net.settle(4);

    assert_eq!(
        net.engines[3].chain.finalized_tip(),
        caught_up_tip,
        "rejoined participant should converge to the same finalized tip"
    );
    assert!(net.finalized_chains_are_consistent());
}

/// Scenario 5: a duplicate transaction gossiped twice at the same epoch
/// must appear in at most one notarized block.
#[test]
fn duplicate_transaction_injection_is_deduplicated() {
    let mut net = SimNetwork::new(3);
    let tx = Transaction::new(42, "alice", "bob", 10);

    for id in 0..3 {
        net.engines[id].submit_transaction(tx.clone());
        // A second, later echo of the very same tx_id must be rejected.
        assert!(!net.engines[id].submit_transaction(tx.clone()));
    }

    net.run_simple(1..=5);
    assert!(net.finalized_chains_are_consistent());

    let occurrences: usize = net.engines[0]
        .chain
        .finalized_prefix()
        .iter()
        .filter_map(|h| net.engines[0].chain.get(h))
        .filter(|b| b.transactions.contains_key(&42))
        .count();
    assert!(occurrences <= 1, "tx_id 42 must appear in at most one finalized block");
}

/// Scenario 6: two competing proposals for the same epoch (equivocation)
/// under confusion. At most one can reach quorum; if neither does, the
/// finalization sequence simply has a gap at that epoch.
#[test]
fn equivocating_proposal_wins_at_most_one_slot() {
    let mut engine_a = ConsensusEngine::new(0, 3, "seed", Some(1), Some(2));
    let mut engine_b = ConsensusEngine::new(1, 3, "seed", Some(1), Some(2));
    let mut engine_c = ConsensusEngine::new(2, 3, "seed", Some(1), Some(2));

    let genesis = engine_a.chain.genesis_hash();
    let block_x = Block::new(4, genesis, Default::default(), 1);
    let mut txs_y = indexmap::IndexMap::new();
    txs_y.insert(7, Transaction::new(7, "x", "y", 1));
    let block_y = Block::new(4, genesis, txs_y, 1);
    assert_ne!(block_x.hash, block_y.hash);

    for engine in [&mut engine_a, &mut engine_b, &mut engine_c] {
        engine.on_envelope(&Envelope::new(Message::Propose(block_x.clone()), 10));
        engine.on_envelope(&Envelope::new(Message::Propose(block_y.clone()), 11));
    }

    for engine in [&engine_a, &engine_b, &engine_c] {
        let notarized_x = engine.chain.is_notarized(&block_x.hash);
        let notarized_y = engine.chain.is_notarized(&block_y.hash);
        assert!(!(notarized_x && notarized_y), "only one of two equivocating proposals may notarize");
    }
}

/// N=1: the single participant is always its own leader and finalizes
/// every epoch once three have elapsed.
#[test]
fn single_node_network_always_finalizes() {
    let mut net = SimNetwork::new(1);
    net.run_simple(1..=4);
    assert!(net.engines[0].chain.finalized_prefix().len() >= 3);
}

/// An even N still computes a strict-majority quorum and converges.
#[test]
fn even_participant_count_still_converges() {
    let mut net = SimNetwork::new(6);
    net.run_simple(1..=6);
    assert!(net.finalized_chains_are_consistent());
}

/// With zero epochs elapsed, only genesis is ever finalized.
#[test]
fn no_epochs_elapsed_leaves_only_genesis_finalized() {
    let net = SimNetwork::new(3);
    for engine in &net.engines {
        assert_eq!(engine.chain.finalized_prefix().len(), 1);
        assert_eq!(engine.chain.finalized_tip(), engine.chain.genesis_hash());
    }
}

/// A confusion window spanning the entire run must still preserve safety:
/// whatever each node finalizes, it must not conflict with any other.
#[test]
fn confusion_spanning_entire_run_preserves_safety() {
    let mut net = SimNetwork::with_confusion(5, Some(1), Some(10));
    net.run_reorder(1..=10);
    assert!(net.finalized_chains_are_consistent());
}

/// Wire round-trip: decoding an encoded envelope reproduces the same
/// logical message, independent of relay hop count.
#[test]
fn wire_envelope_round_trip_is_hop_count_independent() {
    let block = Block::genesis();
    let inner = Envelope::new(Message::Propose(block.clone()), 2);
    let relayed = Envelope::new(Message::Echo(Box::new(inner.clone())), 5);

    let encoded = serde_json::to_vec(&relayed).unwrap();
    let decoded: Envelope = serde_json::from_slice(&encoded).unwrap();

    match decoded.message {
        Message::Echo(boxed) => match boxed.message {
            Message::Propose(b) => assert_eq!(b.hash, block.hash),
            _ => panic!("expected a nested Propose"),
        },
        _ => panic!("expected an Echo wrapper"),
    }
}
