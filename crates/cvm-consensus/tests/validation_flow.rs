// cvm-consensus/tests/validation_flow.rs

//! End-to-end validation flows: honest consensus and fraudulent score.

use cvm_consensus::{
    FraudRecorder, HatConsensus, TransactionState, ValidationVote, ValidatorStats,
};
use cvm_crypto::{Address, Hash256, KeyPair, Timestamp, COIN};
use cvm_hat::AddressMetrics;
use cvm_store::{keys, KvStore};
use cvm_trust::{BondedVote, TrustGraph, WalletClusterer, BOND_PER_POINT, MIN_BOND};
use std::sync::Arc;
use tempfile::TempDir;

const NOW: Timestamp = 1_700_000_000;
const HEIGHT: u64 = 100;

struct Harness {
    store: Arc<KvStore>,
    engine: HatConsensus,
    recorder: FraudRecorder,
    graph: TrustGraph,
    clusterer: WalletClusterer,
    sender: Address,
    wot_validators: Vec<KeyPair>,
    non_wot_validators: Vec<KeyPair>,
    _temp: TempDir,
}

/// Ten validators, six with a direct trust edge to the sender
fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(KvStore::open_at(temp.path()).unwrap());
    let engine = HatConsensus::new(store.clone());
    let recorder = FraudRecorder::new(store.clone());
    let graph = TrustGraph::new(store.clone());
    let clusterer = WalletClusterer::new();

    let sender = Address::new([200u8; 20]);

    // Modest on-chain history keeps the honest score in the mid range so
    // an inflated claim stays inside [0, 100]
    let mut sender_metrics = AddressMetrics::default();
    for i in 0..10 {
        sender_metrics.behavior.record_trade(i < 5, COIN, i % 5 != 0);
    }
    sender_metrics.stake.amount = 20 * COIN;
    sender_metrics.stake.stake_start = NOW - 60 * 86_400;
    sender_metrics.stake.min_lock_duration = 30 * 86_400;
    sender_metrics.temporal.first_seen = NOW - 220 * 86_400;
    for d in (0..40u64).rev() {
        sender_metrics.temporal.record_activity(NOW - d * 86_400);
    }
    sender_metrics.save(&store, &sender).unwrap();

    let mut wot_validators = Vec::new();
    let mut non_wot_validators = Vec::new();

    for i in 0..10 {
        let keypair = KeyPair::generate();
        let address = keypair.address();

        let mut stats = ValidatorStats::new(address);
        stats.validator_reputation = 80;
        stats.last_activity = NOW;
        store.put(&keys::validator_stats_key(&address), &stats).unwrap();

        let mut metrics = AddressMetrics::default();
        metrics.stake.amount = 5 * COIN;
        metrics.save(&store, &address).unwrap();

        if i < 6 {
            // Identical edge weights, so every WoT validator sees the same
            // single path and computes the same WoT component
            graph
                .apply_bonded_vote(&BondedVote {
                    voter: address,
                    target: sender,
                    value: 50,
                    bond: MIN_BOND.max(50 * BOND_PER_POINT),
                    timestamp: NOW - 86_400,
                    tx: Hash256::new([50 + i as u8; 32]),
                })
                .unwrap();
            wot_validators.push(keypair);
        } else {
            non_wot_validators.push(keypair);
        }
    }

    Harness {
        store,
        engine,
        recorder,
        graph,
        clusterer,
        sender,
        wot_validators,
        non_wot_validators,
        _temp: temp,
    }
}

#[test]
fn honest_consensus_validates_transaction() {
    let h = harness();
    let tx = Hash256::new([1u8; 32]);

    // Honest sender reports the score a WoT viewer would compute
    let self_reported = h
        .engine
        .hat()
        .calculate(&h.graph, &h.clusterer, &h.sender, &h.wot_validators[0].address(), NOW)
        .unwrap();

    let (request, _validators) = h
        .engine
        .initiate_validation(tx, h.sender, self_reported, &Hash256::new([9u8; 32]), HEIGHT, NOW, None)
        .unwrap();

    for keypair in h.wot_validators.iter().chain(&h.non_wot_validators) {
        let response = h
            .engine
            .build_response(&h.graph, &h.clusterer, &request, keypair, NOW + 2)
            .unwrap();
        assert_eq!(response.vote, ValidationVote::Accept);
        h.engine.process_response(&response, NOW + 2).unwrap();
    }

    let outcome = h.engine.finalize_session(&tx, NOW + 5).unwrap();
    assert!(outcome.consensus_reached);
    assert!(outcome.approved);
    assert_eq!(outcome.accept_votes, 10);
    assert_eq!(h.engine.transaction_state(&tx).unwrap(), TransactionState::Validated);

    // Every participant judged accurate, no fraud, no dispute
    for keypair in h.wot_validators.iter().chain(&h.non_wot_validators) {
        let stats = h.engine.validator_stats(&keypair.address()).unwrap();
        assert_eq!(stats.total_validations, 1);
        assert_eq!(stats.accurate_validations, 1);
    }
    assert!(h.recorder.get_record(&tx).unwrap().is_none());
    assert!(h.engine.dispute(&tx).unwrap().is_none());
}

#[test]
fn fraudulent_score_is_rejected_and_recorded() {
    let h = harness();
    let tx = Hash256::new([2u8; 32]);

    // Sender inflates the behavior component far beyond tolerance
    let honest = h
        .engine
        .hat()
        .calculate(&h.graph, &h.clusterer, &h.sender, &h.wot_validators[0].address(), NOW)
        .unwrap();
    let mut claimed = honest.clone();
    claimed.behavior = (honest.behavior + 0.30).min(1.0);
    claimed.final_score = (honest.final_score + 30).min(100);

    let (request, _validators) = h
        .engine
        .initiate_validation(tx, h.sender, claimed.clone(), &Hash256::new([9u8; 32]), HEIGHT, NOW, None)
        .unwrap();

    for keypair in h.wot_validators.iter().chain(&h.non_wot_validators) {
        let response = h
            .engine
            .build_response(&h.graph, &h.clusterer, &request, keypair, NOW + 2)
            .unwrap();
        // Behavior mismatch fails verification for WoT and non-WoT alike
        assert_eq!(response.vote, ValidationVote::Reject);
        h.engine.process_response(&response, NOW + 2).unwrap();
    }

    let outcome = h.engine.finalize_session(&tx, NOW + 5).unwrap();
    assert!(outcome.consensus_reached);
    assert!(!outcome.approved);
    assert_eq!(outcome.reject_votes, 10);
    assert_eq!(h.engine.transaction_state(&tx).unwrap(), TransactionState::Rejected);

    // DAO confirms the rejection; fraud is recorded against the sender
    let record = h
        .recorder
        .record_fraud(h.engine.hat(), &h.clusterer, &h.sender, &tx, &claimed, &honest, HEIGHT, NOW + 10)
        .unwrap()
        .expect("delta of 30 must be recorded");

    assert_eq!(record.score_difference, 30);
    assert_eq!(record.reputation_penalty, 15);
    assert_eq!(record.bond_slashed, 20 * COIN / 20);

    // The record round-trips through the next block's envelope
    let envelope = record.to_envelope();
    let extracted = FraudRecorder::extract_from_block(&[envelope]).unwrap();
    assert_eq!(extracted[0], record);

    // And the sender's behavior metrics absorbed the fraud
    let metrics = AddressMetrics::load(&h.store, &h.sender).unwrap();
    assert_eq!(metrics.behavior.fraud_count, 1);
}

#[test]
fn disputed_session_resolves_through_dao() {
    let h = harness();
    let tx = Hash256::new([3u8; 32]);

    let honest = h
        .engine
        .hat()
        .calculate(&h.graph, &h.clusterer, &h.sender, &h.wot_validators[0].address(), NOW)
        .unwrap();
    let mut claimed = honest.clone();
    claimed.behavior = (honest.behavior + 0.30).min(1.0);
    claimed.final_score = (honest.final_score + 40).min(100);

    let (request, _validators) = h
        .engine
        .initiate_validation(tx, h.sender, claimed, &Hash256::new([9u8; 32]), HEIGHT, NOW, None)
        .unwrap();

    // Split responses: half accept blindly, half verify and reject
    for (i, keypair) in h.wot_validators.iter().chain(&h.non_wot_validators).enumerate() {
        let mut response = h
            .engine
            .build_response(&h.graph, &h.clusterer, &request, keypair, NOW + 2)
            .unwrap();
        if i % 2 == 0 {
            response.vote = ValidationVote::Accept;
            response.sign(keypair);
        }
        h.engine.process_response(&response, NOW + 2).unwrap();
    }

    let outcome = h.engine.finalize_session(&tx, NOW + 5).unwrap();
    assert!(!outcome.consensus_reached);
    assert_eq!(h.engine.transaction_state(&tx).unwrap(), TransactionState::Disputed);

    // DAO rejects the claim: state transitions and fraud lands on-chain
    let record = h
        .engine
        .process_dao_resolution(&h.clusterer, &h.recorder, &tx, false, HEIGHT + 2, NOW + 60)
        .unwrap()
        .expect("DAO rejection with a large delta records fraud");

    assert_eq!(h.engine.transaction_state(&tx).unwrap(), TransactionState::Rejected);
    assert!(record.score_difference.abs() >= 5);

    let dispute = h.engine.dispute(&tx).unwrap().unwrap();
    assert!(dispute.resolved);
    assert!(!dispute.approved);
    assert_eq!(dispute.resolution_timestamp, NOW + 60);
}
