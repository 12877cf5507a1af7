// cvm-hat/src/lib.rs

//! HAT v2 (Hybrid Adaptive Trust) scorer
//!
//! Produces a deterministic trust score for a `(target, viewer)` pair from
//! four components:
//! - behavior: on-chain trading evidence with multiplicative fraud penalties
//! - web-of-trust: depth-bounded path search from viewer to target
//! - economic: logistic of stake, scaled by a monotone stake-age factor
//! - temporal: account age and activity regularity
//!
//! Weights are 0.40/0.30/0.20/0.10 when a WoT path exists and
//! 0.57/0.29/0.14 (behavior/economic/temporal) when the scorer has none.
//! Scores are recomputed on demand and never persisted.

pub mod metrics;
pub mod scorer;

pub use metrics::{AddressMetrics, BehaviorMetrics, FraudEvent, StakeInfo, TemporalMetrics};
pub use scorer::{HatV2Score, SecureHat, TrustBreakdown};

/// Component weights with a WoT path
pub const WEIGHT_BEHAVIOR: f64 = 0.40;
pub const WEIGHT_WOT: f64 = 0.30;
pub const WEIGHT_ECONOMIC: f64 = 0.20;
pub const WEIGHT_TEMPORAL: f64 = 0.10;

/// Renormalized weights without a WoT path (proportional to 40/20/10)
pub const NO_WOT_WEIGHT_BEHAVIOR: f64 = 0.57;
pub const NO_WOT_WEIGHT_ECONOMIC: f64 = 0.29;
pub const NO_WOT_WEIGHT_TEMPORAL: f64 = 0.14;

/// Paths sharing one cluster at or above this count trigger the penalty
pub const WOT_CLUSTER_PENALTY_THRESHOLD: usize = 3;

/// Distinct trusters at or above this count earn the centrality bonus
pub const WOT_CENTRALITY_THRESHOLD: usize = 3;

/// Result type for scorer operations
pub type HatResult<T> = Result<T, HatError>;

/// Errors that can occur during scoring
#[derive(Debug, thiserror::Error)]
pub enum HatError {
    #[error("Store error: {0}")]
    Store(#[from] cvm_store::StoreError),

    #[error("Trust graph error: {0}")]
    Trust(#[from] cvm_trust::TrustError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_vectors_sum_to_one() {
        let with_wot = WEIGHT_BEHAVIOR + WEIGHT_WOT + WEIGHT_ECONOMIC + WEIGHT_TEMPORAL;
        assert!((with_wot - 1.0).abs() < 1e-12);

        let without = NO_WOT_WEIGHT_BEHAVIOR + NO_WOT_WEIGHT_ECONOMIC + NO_WOT_WEIGHT_TEMPORAL;
        assert!((without - 1.0).abs() < 1e-12);
    }
}
