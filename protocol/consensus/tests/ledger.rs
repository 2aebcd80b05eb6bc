mod common;

use common::{context, params, ScriptedNetwork};
use consensus::{build_engine, ConsensusError, Ledger, LedgerError, NoopConsensusNetwork};
use runtime::{Block, BlockMetrics, CommitObserver, ConsensusKind, ConsensusParams};
use serde_json::json;
use state::ReputationTable;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    hashes: Mutex<Vec<String>>,
}

impl CommitObserver for Recorder {
    fn on_commit(&self, block: &Block, _metrics: &BlockMetrics) {
        self.hashes.lock().unwrap().push(block.hash.clone());
    }
}

fn pow_ledger(node: &str, reputation: &ReputationTable) -> Ledger {
    let engine = build_engine(
        ConsensusKind::ProofOfWork,
        context(node, reputation, Arc::new(NoopConsensusNetwork), params(1)),
    )
    .unwrap();
    Ledger::new(engine)
}

#[tokio::test]
async fn add_block_commits_and_notifies() {
    let reputation = ReputationTable::uniform(["node_5000"], 50.0);
    let recorder = Arc::new(Recorder::default());
    let ledger = pow_ledger("node_5000", &reputation).with_observer(recorder.clone());

    let committed = ledger
        .add_block("alice", json!({"amount": 5}), json!(17))
        .await
        .unwrap();
    assert_eq!(ledger.height(), 1);
    assert_eq!(ledger.tip().block, committed.block);
    assert_eq!(committed.proposer, "node_5000");
    assert_eq!(*recorder.hashes.lock().unwrap(), vec![committed.block.hash.clone()]);

    let metrics = ledger.metrics();
    assert_eq!(metrics.difficulty, vec![1]);
    assert_eq!(metrics.transactions_per_block, vec![1]);
}

#[tokio::test]
async fn queued_transactions_ride_along() {
    let reputation = ReputationTable::uniform(["node_5000"], 50.0);
    let ledger = pow_ledger("node_5000", &reputation);
    ledger.enqueue_transaction(json!({"queued": 1}));
    assert_eq!(ledger.enqueue_transaction(json!({"queued": 2})), 2);

    let committed = ledger
        .add_block("alice", json!({"direct": true}), json!(null))
        .await
        .unwrap();
    assert_eq!(
        committed.block.transaction,
        json!([{"queued": 1}, {"queued": 2}, {"direct": true}])
    );
    assert_eq!(ledger.pending_len(), 0);
    assert_eq!(ledger.metrics().transactions_per_block, vec![3]);
}

#[tokio::test]
async fn losing_a_round_keeps_the_queue() {
    let params = ConsensusParams {
        authorities: vec!["node_a".into(), "node_b".into()],
        ..ConsensusParams::default()
    };
    let reputation = ReputationTable::new();
    let engine = build_engine(
        ConsensusKind::ProofOfAuthority,
        context("node_a", &reputation, Arc::new(NoopConsensusNetwork), params),
    )
    .unwrap();
    let ledger = Ledger::new(engine);
    ledger.enqueue_transaction(json!("held"));

    let err = ledger.add_block("alice", json!("tx"), json!(null)).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotSelected { winner: Some(ref w) } if w == "node_b"));
    assert_eq!(ledger.pending_len(), 1);
    assert_eq!(ledger.height(), 0);
}

#[tokio::test]
async fn abandoned_round_puts_the_queue_back() {
    let reputation = ReputationTable::uniform(["node_5000"], 50.0);
    let engine = build_engine(
        ConsensusKind::ProofOfWork,
        context("node_5000", &reputation, Arc::new(NoopConsensusNetwork), params(64)),
    )
    .unwrap();
    let ledger = Arc::new(Ledger::new(engine));
    ledger.enqueue_transaction(json!({"memo": "queued"}));

    let round = tokio::spawn({
        let ledger = ledger.clone();
        async move { ledger.add_block("alice", json!("tx"), json!(null)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ledger.pending_len(), 0, "the round holds the queue while mining");
    round.abort();
    assert!(round.await.unwrap_err().is_cancelled());

    assert_eq!(ledger.pending_len(), 1);
    assert_eq!(ledger.enqueue_transaction(json!({"memo": "later"})), 2);
    assert_eq!(ledger.height(), 0);
}

#[tokio::test]
async fn blocks_from_peers_extend_the_chain() {
    let miner_scores = ReputationTable::uniform(["node_5000", "node_5001"], 50.0);
    let miner = pow_ledger("node_5000", &miner_scores);
    let committed = miner.add_block("alice", json!("tx"), json!(null)).await.unwrap();

    let follower_scores = ReputationTable::uniform(["node_5000", "node_5001"], 50.0);
    let follower = pow_ledger("node_5001", &follower_scores);
    assert!(follower.approve(committed.block.fields()));
    follower
        .receive_block(committed.block.clone(), &committed.proposer)
        .unwrap();
    assert_eq!(follower.blocks(), miner.blocks());
    assert_eq!(follower_scores.score("node_5000"), Some(60.0));

    // Replaying the same block no longer links to the tail.
    let err = follower
        .receive_block(committed.block, &committed.proposer)
        .unwrap_err();
    assert!(matches!(err, ConsensusError::BrokenLink { .. }));
    assert_eq!(follower.height(), 1);
}

#[tokio::test]
async fn failed_vote_leaves_chain_untouched() {
    let reputation = ReputationTable::uniform(["node_a", "node_b", "node_c"], 50.0);
    let network = ScriptedNetwork::with_votes(&[("node_b", false), ("node_c", false)]);
    let params = ConsensusParams {
        difficulty: 1,
        cluster_count: 3,
        vote_timeout_ms: 500,
        ..ConsensusParams::default()
    };
    let engine = build_engine(
        ConsensusKind::Hierarchical,
        context("node_a", &reputation, network.clone(), params),
    )
    .unwrap();
    let ledger = Ledger::new(engine);

    let err = ledger.add_block("alice", json!("tx"), json!(null)).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Rejected(ConsensusError::InsufficientVotes { yes: 0, required: 2 })
    ));
    assert_eq!(ledger.height(), 0);
    assert!(network.broadcasts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn hierarchical_round_rewards_and_decays() {
    let reputation = ReputationTable::uniform(["node_a", "node_b", "node_c"], 50.0);
    let network = ScriptedNetwork::with_votes(&[("node_b", true), ("node_c", true)]);
    let params = ConsensusParams {
        difficulty: 1,
        cluster_count: 3,
        vote_timeout_ms: 500,
        ..ConsensusParams::default()
    };
    let engine = build_engine(
        ConsensusKind::Hierarchical,
        context("node_a", &reputation, network, params),
    )
    .unwrap();
    let ledger = Ledger::new(engine);

    ledger.add_block("alice", json!("tx"), json!(null)).await.unwrap();
    assert_eq!(ledger.height(), 1);
    assert!((reputation.score("node_a").unwrap() - 59.4).abs() < 1e-9);
    assert!((reputation.score("node_b").unwrap() - 49.5).abs() < 1e-9);
}
