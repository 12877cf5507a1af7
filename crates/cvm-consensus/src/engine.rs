// cvm-consensus/src/engine.rs

use crate::selection::{ValidatorSelector, ValidatorSetScreen};
use crate::session::ValidationSession;
use crate::types::{
    ComponentStatus, ConsensusOutcome, DisputeCase, TransactionState, ValidationRequest,
    ValidationResponse, ValidationVote, ValidatorStats,
};
use crate::{
    ConsensusError, ConsensusResult, BEHAVIOR_TOLERANCE, CONSENSUS_THRESHOLD, ECONOMIC_TOLERANCE,
    NON_WOT_VOTE_WEIGHT, TEMPORAL_TOLERANCE, WOT_COVERAGE_THRESHOLD, WOT_TOLERANCE,
    WOT_VOTE_WEIGHT,
};
use cvm_crypto::{Address, Hash256, KeyPair, Signature, Timestamp};
use cvm_hat::{AddressMetrics, HatV2Score, SecureHat};
use cvm_store::{keys, KvStore};
use cvm_trust::{TrustGraph, WalletClusterer};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Response-message rate limit per validator
const RESPONSE_RATE_WINDOW_SECS: u64 = 60;
const MAX_RESPONSES_PER_WINDOW: usize = 30;

/// The distributed reputation verification engine
///
/// Owns validation sessions and disputes; all mutations of one session go
/// through a single atomic batch per externally observable event.
pub struct HatConsensus {
    store: Arc<KvStore>,
    selector: ValidatorSelector,
    hat: SecureHat,
    response_log: Mutex<HashMap<Address, VecDeque<Timestamp>>>,
}

impl HatConsensus {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self {
            selector: ValidatorSelector::new(store.clone()),
            hat: SecureHat::new(store.clone()),
            response_log: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn selector(&self) -> &ValidatorSelector {
        &self.selector
    }

    pub fn hat(&self) -> &SecureHat {
        &self.hat
    }

    /// Open a validation session for a CVM-bearing transaction
    ///
    /// Selects validators deterministically and persists the session with
    /// its challenge nonce in one batch.
    #[allow(clippy::too_many_arguments)]
    pub fn initiate_validation(
        &self,
        tx_hash: Hash256,
        sender: Address,
        self_reported: HatV2Score,
        block_hash: &Hash256,
        block_height: u64,
        now: Timestamp,
        screen: Option<&dyn ValidatorSetScreen>,
    ) -> ConsensusResult<(ValidationRequest, Vec<Address>)> {
        let request = ValidationRequest {
            tx_hash,
            sender,
            self_reported,
            challenge_nonce: ValidationRequest::generate_challenge_nonce(&tx_hash, block_height, now),
            timestamp: now,
            block_height,
        };

        let validators = self
            .selector
            .select(&tx_hash, block_hash, block_height, now, screen)?;

        let session = ValidationSession::new(request.clone(), validators.clone(), now);

        let mut batch = self.store.batch();
        batch.put(&keys::validation_session_key(&tx_hash), &session)?;
        batch.commit()?;

        tracing::info!(
            tx = %tx_hash, sender = %sender,
            validators = validators.len(),
            "Validation session opened"
        );

        Ok((request, validators))
    }

    /// Validator-side: recompute the score and produce a signed response
    ///
    /// With a WoT path all four components are verified; without one the
    /// WoT component is ignored entirely. Abstains when the sender has no
    /// usable evidence at all.
    pub fn build_response(
        &self,
        graph: &TrustGraph,
        clusterer: &WalletClusterer,
        request: &ValidationRequest,
        keypair: &KeyPair,
        now: Timestamp,
    ) -> ConsensusResult<ValidationResponse> {
        let validator = keypair.address();
        let paths = graph.find_trust_paths(&validator, &request.sender, cvm_trust::WOT_MAX_DEPTH)?;
        let has_wot = !paths.is_empty();

        let calculated = if has_wot {
            self.hat
                .calculate(graph, clusterer, &request.sender, &validator, now)?
        } else {
            self.hat.calculate_non_wot(&request.sender, now)?
        };

        let metrics = AddressMetrics::load(self.hat.store(), &request.sender)?;
        let no_evidence = metrics.behavior.total_trades == 0
            && metrics.stake.amount == 0
            && metrics.temporal.first_seen == 0;

        let (vote, component_status) = if no_evidence && !has_wot {
            (ValidationVote::Abstain, ComponentStatus::default())
        } else {
            Self::compute_vote(&request.self_reported, &calculated, has_wot)
        };

        let confidence = self.vote_confidence(graph, &validator, &request.sender)?;

        let mut response = ValidationResponse {
            tx_hash: request.tx_hash,
            validator,
            calculated,
            vote,
            confidence,
            has_wot,
            trust_paths: paths,
            component_status,
            validator_pubkey: keypair.public_key().clone(),
            signature: Signature::empty(),
            challenge_nonce: request.challenge_nonce,
            timestamp: now,
        };
        response.sign(keypair);
        Ok(response)
    }

    /// Component-based verification of a self-reported score
    pub fn compute_vote(
        self_reported: &HatV2Score,
        calculated: &HatV2Score,
        has_wot: bool,
    ) -> (ValidationVote, ComponentStatus) {
        let mut status = ComponentStatus {
            behavior_difference: (self_reported.behavior - calculated.behavior).abs(),
            economic_difference: (self_reported.economic - calculated.economic).abs(),
            temporal_difference: (self_reported.temporal - calculated.temporal).abs(),
            ..Default::default()
        };
        status.behavior_verified = status.behavior_difference <= BEHAVIOR_TOLERANCE;
        status.economic_verified = status.economic_difference <= ECONOMIC_TOLERANCE;
        status.temporal_verified = status.temporal_difference <= TEMPORAL_TOLERANCE;

        let non_wot_ok = status.behavior_verified && status.economic_verified && status.temporal_verified;

        if has_wot {
            let wot_difference = (self_reported.wot - calculated.wot).abs();
            status.wot_verified = wot_difference <= WOT_TOLERANCE;

            if non_wot_ok && status.wot_verified {
                (ValidationVote::Accept, status)
            } else {
                tracing::debug!(
                    behavior = status.behavior_verified,
                    economic = status.economic_verified,
                    temporal = status.temporal_verified,
                    wot = status.wot_verified,
                    "Component mismatch (WoT validator)"
                );
                (ValidationVote::Reject, status)
            }
        } else if non_wot_ok {
            (ValidationVote::Accept, status)
        } else {
            tracing::debug!(
                behavior = status.behavior_verified,
                economic = status.economic_verified,
                temporal = status.temporal_verified,
                "Component mismatch (non-WoT validator)"
            );
            (ValidationVote::Reject, status)
        }
    }

    /// Confidence a validator attaches to its vote
    ///
    /// Base 0.5, raised by average WoT path strength, scaled by the
    /// validator's own reputation.
    pub fn vote_confidence(
        &self,
        graph: &TrustGraph,
        validator: &Address,
        target: &Address,
    ) -> ConsensusResult<f64> {
        let mut confidence = 0.5;

        let paths = graph.find_trust_paths(validator, target, cvm_trust::WOT_MAX_DEPTH)?;
        if !paths.is_empty() {
            let avg = paths.iter().map(|p| p.strength).sum::<f64>() / paths.len() as f64;
            confidence = 0.5 + avg * 0.5;
        }

        let stats = self.validator_stats(validator)?;
        confidence *= stats.validator_reputation as f64 / 100.0;

        Ok(confidence.clamp(0.0, 1.0))
    }

    fn is_rate_limited(&self, validator: &Address, now: Timestamp) -> bool {
        let mut log = match self.response_log.lock() {
            Ok(log) => log,
            Err(_) => return false,
        };
        let entries = log.entry(*validator).or_default();
        while let Some(front) = entries.front() {
            if now.saturating_sub(*front) > RESPONSE_RATE_WINDOW_SECS {
                entries.pop_front();
            } else {
                break;
            }
        }
        if entries.len() >= MAX_RESPONSES_PER_WINDOW {
            return true;
        }
        entries.push_back(now);
        false
    }

    /// Accept one validator response into its session
    ///
    /// Rejection order: rate limit, signature, session, nonce, deadline,
    /// duplicate. Local errors never corrupt session state.
    pub fn process_response(&self, response: &ValidationResponse, now: Timestamp) -> ConsensusResult<()> {
        if self.is_rate_limited(&response.validator, now) {
            return Err(ConsensusError::RateLimited);
        }

        if !response.verify_signature() {
            tracing::debug!(validator = %response.validator, "Invalid response signature");
            return Err(ConsensusError::InvalidSignature);
        }

        let session_key = keys::validation_session_key(&response.tx_hash);
        let mut session: ValidationSession = self
            .store
            .get(&session_key)?
            .ok_or(ConsensusError::SessionNotFound(response.tx_hash))?;

        if response.challenge_nonce != session.request.challenge_nonce {
            return Err(ConsensusError::InvalidNonce);
        }
        if session.is_timed_out(now) {
            return Err(ConsensusError::Timeout);
        }
        if session.has_response_from(&response.validator) {
            return Err(ConsensusError::DuplicateResponse);
        }

        session.responses.push(response.clone());
        self.store.put(&session_key, &session)?;

        tracing::debug!(
            tx = %response.tx_hash, validator = %response.validator,
            responses = session.responses.len(),
            "Validation response accepted"
        );
        Ok(())
    }

    /// Aggregate responses into a consensus outcome
    ///
    /// Weighted tallies use the WoT/non-WoT vote weights multiplied by
    /// confidence. Without 30% WoT coverage among responders there is no
    /// consensus regardless of the tallies.
    pub fn determine_consensus(&self, responses: &[ValidationResponse]) -> ConsensusOutcome {
        let mut outcome = ConsensusOutcome::default();
        if responses.is_empty() {
            outcome.requires_dao_review = true;
            return outcome;
        }
        outcome.tx_hash = responses[0].tx_hash;

        for response in responses {
            match response.vote {
                ValidationVote::Accept => outcome.accept_votes += 1,
                ValidationVote::Reject => outcome.reject_votes += 1,
                ValidationVote::Abstain => outcome.abstain_votes += 1,
            }

            let weight = if response.has_wot { WOT_VOTE_WEIGHT } else { NON_WOT_VOTE_WEIGHT }
                * response.confidence;
            match response.vote {
                ValidationVote::Accept => outcome.weighted_accept += weight,
                ValidationVote::Reject => outcome.weighted_reject += weight,
                ValidationVote::Abstain => outcome.weighted_abstain += weight,
            }
        }

        let wot_count = responses.iter().filter(|r| r.has_wot).count();
        let wot_coverage = wot_count as f64 / responses.len() as f64;
        if wot_coverage < WOT_COVERAGE_THRESHOLD {
            tracing::info!(tx = %outcome.tx_hash, coverage = wot_coverage, "Insufficient WoT coverage");
            outcome.requires_dao_review = true;
            return outcome;
        }

        let total = outcome.weighted_accept + outcome.weighted_reject + outcome.weighted_abstain;
        if total == 0.0 {
            outcome.requires_dao_review = true;
            return outcome;
        }

        let accept_ratio = outcome.weighted_accept / total;
        let reject_ratio = outcome.weighted_reject / total;

        if accept_ratio >= CONSENSUS_THRESHOLD {
            outcome.consensus_reached = true;
            outcome.approved = true;
        } else if reject_ratio >= CONSENSUS_THRESHOLD {
            outcome.consensus_reached = true;
            outcome.approved = false;
        } else {
            outcome.requires_dao_review = true;
        }

        tracing::info!(
            tx = %outcome.tx_hash,
            accept = accept_ratio, reject = reject_ratio,
            consensus = outcome.consensus_reached, approved = outcome.approved,
            "Consensus determined"
        );
        outcome
    }

    /// Close a session: decide, transition state, judge responders
    ///
    /// Responders are marked accurate iff their vote matched consensus;
    /// with no consensus their records are untouched. On a timed-out
    /// session, non-responders take an accuracy decay and a timeout strike.
    /// The state transition and every stats update commit in one batch.
    pub fn finalize_session(&self, tx_hash: &Hash256, now: Timestamp) -> ConsensusResult<ConsensusOutcome> {
        let session_key = keys::validation_session_key(tx_hash);
        let mut session: ValidationSession = self
            .store
            .get(&session_key)?
            .ok_or(ConsensusError::SessionNotFound(*tx_hash))?;

        let outcome = self.determine_consensus(&session.responses);
        let timed_out = session.is_timed_out(now);

        session.completed = true;
        session.state = if outcome.consensus_reached {
            if outcome.approved {
                TransactionState::Validated
            } else {
                TransactionState::Rejected
            }
        } else {
            TransactionState::Disputed
        };

        let mut batch = self.store.batch();

        for response in &session.responses {
            let mut stats = self.validator_stats(&response.validator)?;
            stats.total_validations += 1;
            stats.last_activity = now;
            if outcome.consensus_reached {
                let matched = match response.vote {
                    ValidationVote::Accept => outcome.approved,
                    ValidationVote::Reject => !outcome.approved,
                    ValidationVote::Abstain => false,
                };
                if matched {
                    stats.accurate_validations += 1;
                } else if response.vote == ValidationVote::Abstain {
                    stats.abstentions += 1;
                } else {
                    stats.inaccurate_validations += 1;
                }
                stats.update_accuracy();
                Self::adjust_reputation(&mut stats);
            }
            batch.put(&keys::validator_stats_key(&response.validator), &stats)?;
        }

        if timed_out {
            for absent in session.non_responders() {
                let mut stats = self.validator_stats(&absent)?;
                stats.total_validations += 1; // decay without an accurate mark
                stats.timeout_count += 1;
                stats.update_accuracy();
                batch.put(&keys::validator_stats_key(&absent), &stats)?;
                tracing::debug!(validator = %absent, "Non-responder penalized");
            }
        }

        if !outcome.consensus_reached {
            let dispute = DisputeCase {
                dispute_id: *tx_hash,
                tx_hash: *tx_hash,
                sender: session.request.sender,
                self_reported: session.request.self_reported.clone(),
                responses: session.responses.clone(),
                evidence: Vec::new(),
                reason: "Validators could not reach consensus on reputation score".into(),
                resolved: false,
                approved: false,
                resolution_timestamp: 0,
            };
            batch.put(&keys::dispute_key(tx_hash), &dispute)?;
            tracing::info!(tx = %tx_hash, "Session escalated to DAO");
        }

        batch.put(&session_key, &session)?;
        batch.commit()?;

        if !outcome.consensus_reached && timed_out && session.responses.is_empty() {
            return Err(ConsensusError::Timeout);
        }

        Ok(outcome)
    }

    fn adjust_reputation(stats: &mut ValidatorStats) {
        if stats.accuracy_rate >= 0.95 {
            stats.validator_reputation = (stats.validator_reputation + 1).min(100);
        } else if stats.accuracy_rate < 0.70 {
            stats.validator_reputation = (stats.validator_reputation - 2).max(0);
        }
    }

    /// Judge a single validator after the fact (DAO corrections)
    pub fn update_validator_reputation(&self, validator: &Address, accurate: bool) -> ConsensusResult<()> {
        let mut stats = self.validator_stats(validator)?;
        stats.total_validations += 1;
        if accurate {
            stats.accurate_validations += 1;
        } else {
            stats.inaccurate_validations += 1;
        }
        stats.update_accuracy();
        Self::adjust_reputation(&mut stats);
        self.store.put(&keys::validator_stats_key(validator), &stats)?;
        Ok(())
    }

    pub fn validator_stats(&self, validator: &Address) -> ConsensusResult<ValidatorStats> {
        Ok(self
            .store
            .get(&keys::validator_stats_key(validator))?
            .unwrap_or_else(|| ValidatorStats::new(*validator)))
    }

    pub fn transaction_state(&self, tx_hash: &Hash256) -> ConsensusResult<TransactionState> {
        let session: Option<ValidationSession> = self.store.get(&keys::validation_session_key(tx_hash))?;
        Ok(session.map(|s| s.state).unwrap_or(TransactionState::PendingValidation))
    }

    pub fn dispute(&self, dispute_id: &Hash256) -> ConsensusResult<Option<DisputeCase>> {
        Ok(self.store.get(&keys::dispute_key(dispute_id))?)
    }

    /// Apply a DAO verdict to a dispute
    ///
    /// A rejection records fraud against the sender using the median of the
    /// validators' calculated final scores as the actual score.
    pub fn process_dao_resolution(
        &self,
        clusterer: &WalletClusterer,
        recorder: &crate::fraud::FraudRecorder,
        dispute_id: &Hash256,
        approved: bool,
        block_height: u64,
        now: Timestamp,
    ) -> ConsensusResult<Option<crate::fraud::FraudRecord>> {
        let dispute_key = keys::dispute_key(dispute_id);
        let mut dispute: DisputeCase = self
            .store
            .get(&dispute_key)?
            .ok_or(ConsensusError::DisputeNotFound(*dispute_id))?;

        dispute.resolved = true;
        dispute.approved = approved;
        dispute.resolution_timestamp = now;

        let session_key = keys::validation_session_key(&dispute.tx_hash);
        let session: Option<ValidationSession> = self.store.get(&session_key)?;

        let mut batch = self.store.batch();
        batch.put(&dispute_key, &dispute)?;
        if let Some(mut session) = session {
            session.state = if approved {
                TransactionState::Validated
            } else {
                TransactionState::Rejected
            };
            session.completed = true;
            batch.put(&session_key, &session)?;
        }
        batch.commit()?;

        tracing::info!(dispute = %dispute_id, approved, "DAO resolution processed");

        if approved {
            return Ok(None);
        }

        // Median of validator-calculated finals approximates the actual score
        let mut finals: Vec<i16> = dispute
            .responses
            .iter()
            .map(|r| r.calculated.final_score)
            .collect();
        if finals.is_empty() {
            return Ok(None);
        }
        finals.sort_unstable();
        let median = finals[finals.len() / 2];

        let mut actual = dispute.responses[0].calculated.clone();
        actual.final_score = median;

        let record = recorder.record_fraud(
            &self.hat,
            clusterer,
            &dispute.sender,
            &dispute.tx_hash,
            &dispute.self_reported,
            &actual,
            block_height,
            now,
        )?;
        Ok(record)
    }
}
