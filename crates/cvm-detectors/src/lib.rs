// cvm-detectors/src/lib.rs

//! Pattern miners over reputation, votes and the trust graph
//!
//! Detectors are read-only against the core graph and scorer state; their
//! findings surface as [`AnomalyAlert`]s and feed penalties back only via
//! fraud records or validator-reputation updates. High-confidence alerts
//! (>= 0.80) are persisted and may trigger DAO escalation.

pub mod alert;
pub mod anomaly;
pub mod manipulation;
pub mod sybil;
pub mod validator_behavior;
pub mod vote;

pub use alert::{AlertStore, AlertType, AnomalyAlert};
pub use anomaly::ReputationAnomalyDetector;
pub use manipulation::{
    ManipulationKind, TrustGraphManipulationDetector, TrustManipulationResult,
};
pub use sybil::{ValidatorDiversityScreen, ValidatorNetworkInfo, VotePatternSybilDetector};
pub use validator_behavior::{ResponseObservation, ValidatorBehaviorDetector};
pub use vote::detect_coordinated_voting;

/// Alerts at or above this confidence are persisted
pub const PERSIST_CONFIDENCE: f64 = 0.80;

/// Rolling window of per-address reputation samples
pub const REPUTATION_WINDOW: usize = 100;

/// Rolling window of per-validator response observations
pub const VALIDATOR_WINDOW: usize = 100;

/// Result type for detector operations
pub type DetectorResult<T> = Result<T, DetectorError>;

/// Errors that can occur inside detectors
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Store error: {0}")]
    Store(#[from] cvm_store::StoreError),

    #[error("Trust graph error: {0}")]
    Trust(#[from] cvm_trust::TrustError),

    #[error("Scorer error: {0}")]
    Hat(#[from] cvm_hat::HatError),
}
