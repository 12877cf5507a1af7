// cvm-consensus/src/types.rs

use cvm_crypto::hash::HashWriter;
use cvm_crypto::{Address, Hash256, KeyPair, PublicKey, Signature, Timestamp};
use cvm_envelope::ByteWriter;
use cvm_hat::HatV2Score;
use cvm_trust::TrustPath;
use serde::{Deserialize, Serialize};

/// Validation state of a transaction in the mempool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Awaiting validator responses
    PendingValidation,
    /// Consensus reached, approved
    Validated,
    /// No consensus, escalated to DAO
    Disputed,
    /// Consensus reached, rejected
    Rejected,
}

/// Request sent to selected validators to verify a self-reported score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub tx_hash: Hash256,
    pub sender: Address,
    pub self_reported: HatV2Score,
    /// Binds responses to this session and prevents replay
    pub challenge_nonce: Hash256,
    pub timestamp: Timestamp,
    pub block_height: u64,
}

impl ValidationRequest {
    /// `H(tx_hash || block_height || wall_clock)`
    pub fn generate_challenge_nonce(tx_hash: &Hash256, block_height: u64, wall_clock: Timestamp) -> Hash256 {
        let mut writer = HashWriter::new();
        writer
            .write_bytes(tx_hash.as_bytes())
            .write_u64(block_height)
            .write_u64(wall_clock);
        writer.finalize()
    }
}

/// Validator's decision on a self-reported score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationVote {
    /// Score is accurate within tolerance
    Accept,
    /// Score exceeds tolerance
    Reject,
    /// Cannot verify (insufficient evidence)
    Abstain,
}

impl ValidationVote {
    pub fn to_byte(self) -> u8 {
        match self {
            ValidationVote::Accept => 0,
            ValidationVote::Reject => 1,
            ValidationVote::Abstain => 2,
        }
    }
}

/// Per-component verification outcome
///
/// Validators without a WoT path verify only the non-WoT components and
/// ignore the WoT component entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub behavior_verified: bool,
    pub economic_verified: bool,
    pub temporal_verified: bool,
    pub wot_verified: bool,

    pub behavior_difference: f64,
    pub economic_difference: f64,
    pub temporal_difference: f64,
}

/// A validator's signed response to a validation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub tx_hash: Hash256,
    pub validator: Address,
    pub calculated: HatV2Score,
    pub vote: ValidationVote,
    /// Confidence in [0, 1]; scales the vote weight
    pub confidence: f64,

    pub has_wot: bool,
    pub trust_paths: Vec<TrustPath>,
    pub component_status: ComponentStatus,

    pub validator_pubkey: PublicKey,
    pub signature: Signature,
    pub challenge_nonce: Hash256,
    pub timestamp: Timestamp,
}

fn write_score(w: &mut ByteWriter, score: &HatV2Score) {
    w.write_address(&score.address)
        .write_u16(score.final_score as u16)
        .write_u64(score.timestamp)
        .write_u64(score.behavior.to_bits())
        .write_u64(score.wot.to_bits())
        .write_u64(score.economic.to_bits())
        .write_u64(score.temporal.to_bits())
        .write_u8(score.has_wot as u8)
        .write_u32(score.wot_path_count)
        .write_u64(score.wot_path_strength.to_bits());
}

impl ValidationResponse {
    /// Canonical encoding of every field except the signature
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_hash(&self.tx_hash).write_address(&self.validator);
        write_score(&mut w, &self.calculated);
        w.write_u8(self.vote.to_byte())
            .write_u64(self.confidence.to_bits())
            .write_u8(self.has_wot as u8);

        w.write_u8(self.trust_paths.len() as u8);
        for path in &self.trust_paths {
            w.write_u8(path.hops.len() as u8);
            for hop in &path.hops {
                w.write_address(hop);
            }
            w.write_u64(path.strength.to_bits());
        }

        w.write_u8(self.component_status.behavior_verified as u8)
            .write_u8(self.component_status.economic_verified as u8)
            .write_u8(self.component_status.temporal_verified as u8)
            .write_u8(self.component_status.wot_verified as u8)
            .write_u64(self.component_status.behavior_difference.to_bits())
            .write_u64(self.component_status.economic_difference.to_bits())
            .write_u64(self.component_status.temporal_difference.to_bits());

        w.write_var_bytes(self.validator_pubkey.as_bytes())
            .write_hash(&self.challenge_nonce)
            .write_u64(self.timestamp);
        w.into_bytes()
    }

    /// Sign the canonical encoding with the validator's key
    pub fn sign(&mut self, keypair: &KeyPair) {
        self.validator_pubkey = keypair.public_key().clone();
        self.signature = keypair.sign(&self.canonical_bytes());
    }

    /// Verify the signature and the pubkey-to-address binding
    pub fn verify_signature(&self) -> bool {
        if self.signature.is_empty() {
            return false;
        }
        if self.validator_pubkey.to_address() != self.validator {
            tracing::debug!(validator = %self.validator, "Public key does not match validator address");
            return false;
        }
        self.validator_pubkey
            .verify(&self.canonical_bytes(), &self.signature)
            .unwrap_or(false)
    }
}

/// Aggregated outcome of one validation session; derived, never
/// authoritatively stored
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub tx_hash: Hash256,
    pub consensus_reached: bool,
    pub approved: bool,
    pub requires_dao_review: bool,

    pub accept_votes: u32,
    pub reject_votes: u32,
    pub abstain_votes: u32,

    pub weighted_accept: f64,
    pub weighted_reject: f64,
    pub weighted_abstain: f64,
}

/// A failed consensus escalated to the DAO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeCase {
    /// Equal to the disputed transaction hash
    pub dispute_id: Hash256,
    pub tx_hash: Hash256,
    pub sender: Address,
    pub self_reported: HatV2Score,
    pub responses: Vec<ValidationResponse>,
    pub evidence: Vec<u8>,
    pub reason: String,

    pub resolved: bool,
    pub approved: bool,
    pub resolution_timestamp: Timestamp,
}

/// Validator performance and accountability record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorStats {
    pub address: Address,
    pub total_validations: u64,
    pub accurate_validations: u64,
    pub inaccurate_validations: u64,
    pub abstentions: u64,
    pub timeout_count: u32,
    pub accuracy_rate: f64,
    /// Validator reputation in [0, 100], starts neutral
    pub validator_reputation: i16,
    pub last_activity: Timestamp,
}

impl ValidatorStats {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            total_validations: 0,
            accurate_validations: 0,
            inaccurate_validations: 0,
            abstentions: 0,
            timeout_count: 0,
            accuracy_rate: 0.0,
            validator_reputation: 50,
            last_activity: 0,
        }
    }

    pub fn update_accuracy(&mut self) {
        if self.total_validations > 0 {
            self.accuracy_rate = self.accurate_validations as f64 / self.total_validations as f64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn sample_response(keypair: &KeyPair) -> ValidationResponse {
        let mut response = ValidationResponse {
            tx_hash: Hash256::new([1; 32]),
            validator: keypair.address(),
            calculated: HatV2Score {
                address: addr(2),
                final_score: 72,
                timestamp: 1_700_000_000,
                behavior: 0.8,
                wot: 0.6,
                economic: 0.5,
                temporal: 0.7,
                has_wot: true,
                wot_path_count: 2,
                wot_path_strength: 0.4,
            },
            vote: ValidationVote::Accept,
            confidence: 0.9,
            has_wot: true,
            trust_paths: vec![TrustPath { hops: vec![addr(9), addr(2)], strength: 0.4 }],
            component_status: ComponentStatus::default(),
            validator_pubkey: keypair.public_key().clone(),
            signature: Signature::empty(),
            challenge_nonce: Hash256::new([7; 32]),
            timestamp: 1_700_000_010,
        };
        response.sign(keypair);
        response
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let response = sample_response(&keypair);
        assert!(response.verify_signature());
    }

    #[test]
    fn test_flipping_any_field_breaks_signature() {
        let keypair = KeyPair::generate();

        let mut r = sample_response(&keypair);
        r.vote = ValidationVote::Reject;
        assert!(!r.verify_signature());

        let mut r = sample_response(&keypair);
        r.calculated.final_score = 90;
        assert!(!r.verify_signature());

        let mut r = sample_response(&keypair);
        r.confidence = 0.1;
        assert!(!r.verify_signature());

        let mut r = sample_response(&keypair);
        r.challenge_nonce = Hash256::new([8; 32]);
        assert!(!r.verify_signature());

        let mut r = sample_response(&keypair);
        r.timestamp += 1;
        assert!(!r.verify_signature());

        let mut r = sample_response(&keypair);
        r.has_wot = false;
        assert!(!r.verify_signature());

        let mut r = sample_response(&keypair);
        r.component_status.behavior_verified = true;
        assert!(!r.verify_signature());

        let mut r = sample_response(&keypair);
        r.trust_paths.clear();
        assert!(!r.verify_signature());
    }

    #[test]
    fn test_wrong_key_for_address_rejected() {
        let keypair = KeyPair::generate();
        let other = KeyPair::generate();

        let mut response = sample_response(&keypair);
        // Re-sign with a different key: signature is valid for the bytes but
        // the pubkey no longer hashes to the claimed validator address
        response.validator_pubkey = other.public_key().clone();
        response.signature = other.sign(&response.canonical_bytes());
        assert!(!response.verify_signature());
    }

    #[test]
    fn test_challenge_nonce_depends_on_all_inputs() {
        let tx = Hash256::new([1; 32]);
        let n1 = ValidationRequest::generate_challenge_nonce(&tx, 100, 1_000);
        let n2 = ValidationRequest::generate_challenge_nonce(&tx, 101, 1_000);
        let n3 = ValidationRequest::generate_challenge_nonce(&tx, 100, 1_001);
        assert_ne!(n1, n2);
        assert_ne!(n1, n3);
    }

    #[test]
    fn test_validator_stats_accuracy() {
        let mut stats = ValidatorStats::new(addr(1));
        stats.total_validations = 10;
        stats.accurate_validations = 9;
        stats.update_accuracy();
        assert!((stats.accuracy_rate - 0.9).abs() < 1e-12);
        assert_eq!(stats.validator_reputation, 50);
    }
}
