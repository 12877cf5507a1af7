// cvm-consensus/src/lib.rs

//! Distributed validator consensus over self-reported reputation scores
//!
//! Senders declare their HAT v2 score in transactions; deterministically
//! selected validators recompute it and vote. Consensus needs 70%+ weighted
//! agreement with at least 30% WoT coverage among responders; anything else
//! escalates to the DAO. Confirmed fraud becomes a permanent on-chain
//! record with a reputation penalty and bond slash.
//!
//! The crate also carries the consensus-safety validator: every value that
//! influences consensus is determinism-checked before use, and gas pricing
//! derived from reputation is pure integer arithmetic.

pub mod engine;
pub mod fraud;
pub mod safety;
pub mod selection;
pub mod session;
pub mod types;

pub use engine::HatConsensus;
pub use fraud::{FraudRecord, FraudRecorder};
pub use safety::{ConsensusSafetyValidator, ExecutionPricing, StateComparison};
pub use selection::{EligibilityRequirements, SetScreenResult, ValidatorSelector, ValidatorSetScreen};
pub use session::ValidationSession;
pub use types::{
    ComponentStatus, ConsensusOutcome, DisputeCase, TransactionState, ValidationRequest,
    ValidationResponse, ValidationVote, ValidatorStats,
};

/// Minimum validators selected per transaction
pub const MIN_VALIDATORS: usize = 10;

/// Wall-clock deadline for a validation session, in seconds
pub const VALIDATION_TIMEOUT_SECS: u64 = 30;

/// Weighted agreement required for consensus
pub const CONSENSUS_THRESHOLD: f64 = 0.70;

/// Minimum fraction of responders with a WoT path
pub const WOT_COVERAGE_THRESHOLD: f64 = 0.30;

/// Vote weight of a validator with a WoT path
pub const WOT_VOTE_WEIGHT: f64 = 1.0;

/// Vote weight of a validator without a WoT path
pub const NON_WOT_VOTE_WEIGHT: f64 = 0.5;

/// Per-component verification tolerances
pub const BEHAVIOR_TOLERANCE: f64 = 0.03;
pub const ECONOMIC_TOLERANCE: f64 = 0.03;
pub const TEMPORAL_TOLERANCE: f64 = 0.03;
pub const WOT_TOLERANCE: f64 = 0.05;

/// Score deltas below this are measurement variance, not fraud
pub const FRAUD_MIN_DELTA: i16 = 5;

/// Cluster fraud records within this block window trigger DAO review
pub const FRAUD_CLUSTER_WINDOW: u64 = 1000;
pub const FRAUD_CLUSTER_LIMIT: u64 = 5;

/// Timeouts before a validator loses eligibility
pub const MAX_VALIDATOR_TIMEOUTS: u32 = 5;

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Errors that can occur during consensus operations
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Invalid signature on validation response")]
    InvalidSignature,

    #[error("Challenge nonce does not match the open request")]
    InvalidNonce,

    #[error("Duplicate response from validator")]
    DuplicateResponse,

    #[error("Validation session not found: {0}")]
    SessionNotFound(cvm_crypto::Hash256),

    #[error("Session expired before enough responses arrived")]
    Timeout,

    #[error("Validator session closed without reaching the threshold")]
    NoConsensus,

    #[error("Validator is rate-limited")]
    RateLimited,

    #[error("Insufficient reputation: required {required}, actual {actual}")]
    InsufficientReputation { required: i16, actual: i16 },

    #[error("Determinism violation in {0}; value must not be used")]
    DeterminismViolation(String),

    #[error("Dispute not found: {0}")]
    DisputeNotFound(cvm_crypto::Hash256),

    #[error("Store error: {0}")]
    Store(#[from] cvm_store::StoreError),

    #[error("Trust graph error: {0}")]
    Trust(#[from] cvm_trust::TrustError),

    #[error("Scorer error: {0}")]
    Hat(#[from] cvm_hat::HatError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] cvm_envelope::EnvelopeError),
}
