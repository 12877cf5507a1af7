// cvm-consensus/src/safety.rs

use crate::{ConsensusError, ConsensusResult};
use cvm_crypto::hash::HashWriter;
use cvm_crypto::{Gas, Hash256};
use cvm_hat::HatV2Score;
use cvm_trust::TrustGraph;
use serde::{Deserialize, Serialize};

/// Float results must agree within this epsilon across evaluations
pub const FLOAT_EPSILON: f64 = 1e-4;

/// Free gas requires at least this reputation
pub const FREE_GAS_MIN_REPUTATION: u64 = 80;

/// Result of comparing trust-graph state hashes with a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateComparison {
    Match,
    /// Hashes differ; request a delta from the peer
    MismatchRequestDelta,
}

/// Reputation-derived execution pricing handed to the VM layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPricing {
    pub caller_reputation: u64,
    pub gas_discount: Gas,
    pub free_gas_allowance: Gas,
    /// Whether the trust gate admits the caller at all
    pub trust_gate_open: bool,
}

/// Determinism firewall in front of every consensus-relevant value
///
/// Values are recomputed two extra times before use: integer results must
/// be byte-equal, float results must agree within `FLOAT_EPSILON`. A failed
/// check is a consensus bug; the value is discarded and the failure reason
/// surfaces for audit.
pub struct ConsensusSafetyValidator;

impl ConsensusSafetyValidator {
    pub fn new() -> Self {
        Self
    }

    /// Triple-evaluate an integer-valued computation
    pub fn check_int<T, F>(&self, label: &str, compute: F) -> ConsensusResult<T>
    where
        T: Eq + Copy + std::fmt::Debug,
        F: Fn() -> T,
    {
        let first = compute();
        for round in 1..3 {
            let again = compute();
            if again != first {
                tracing::error!(label, round, ?first, ?again, "Integer determinism check failed");
                return Err(ConsensusError::DeterminismViolation(format!(
                    "{label}: run {round} returned {again:?}, expected {first:?}"
                )));
            }
        }
        Ok(first)
    }

    /// Triple-evaluate a float-valued computation
    pub fn check_float<F>(&self, label: &str, compute: F) -> ConsensusResult<f64>
    where
        F: Fn() -> f64,
    {
        let first = compute();
        for round in 1..3 {
            let again = compute();
            if (again - first).abs() > FLOAT_EPSILON {
                tracing::error!(label, round, first, again, "Float determinism check failed");
                return Err(ConsensusError::DeterminismViolation(format!(
                    "{label}: run {round} returned {again}, expected {first} (eps {FLOAT_EPSILON})"
                )));
            }
        }
        Ok(first)
    }

    /// Per-component hashes plus the composite execution hash
    /// `H(b || w || e || t || final || height)`
    pub fn execution_hashes(score: &HatV2Score, height: u64) -> ([Hash256; 4], Hash256) {
        let component = |label: u8, value: f64| {
            let mut w = HashWriter::new();
            w.write_u8(label).write_f64(value);
            w.finalize()
        };

        let hashes = [
            component(b'b', score.behavior),
            component(b'w', score.wot),
            component(b'e', score.economic),
            component(b't', score.temporal),
        ];

        let mut w = HashWriter::new();
        w.write_f64(score.behavior)
            .write_f64(score.wot)
            .write_f64(score.economic)
            .write_f64(score.temporal)
            .write_u32(score.final_score as u32)
            .write_u64(height);

        (hashes, w.finalize())
    }

    /// Determinism-checked score evaluation
    ///
    /// Runs the scorer three times: the integer final must be identical and
    /// every float component must stay within epsilon.
    pub fn verified_score<F>(&self, label: &str, evaluate: F) -> ConsensusResult<HatV2Score>
    where
        F: Fn() -> ConsensusResult<HatV2Score>,
    {
        let first = evaluate()?;
        for round in 1..3 {
            let again = evaluate()?;
            if again.final_score != first.final_score {
                return Err(ConsensusError::DeterminismViolation(format!(
                    "{label}: final score {} != {} on run {round}",
                    again.final_score, first.final_score
                )));
            }
            let drifted = [
                (again.behavior - first.behavior).abs(),
                (again.wot - first.wot).abs(),
                (again.economic - first.economic).abs(),
                (again.temporal - first.temporal).abs(),
            ]
            .into_iter()
            .any(|d| d > FLOAT_EPSILON);
            if drifted {
                return Err(ConsensusError::DeterminismViolation(format!(
                    "{label}: component drift beyond {FLOAT_EPSILON} on run {round}"
                )));
            }
        }
        Ok(first)
    }

    /// Gas discount: `min(base * rep * 5 / 1000, base / 2)`
    ///
    /// Pure integer arithmetic; widened through u128 so the product cannot
    /// overflow for any `base < 2^63`.
    pub fn gas_discount(base_gas: Gas, reputation: u64) -> Gas {
        let discount = (base_gas as u128) * (reputation as u128) * 5 / 1000;
        discount.min((base_gas / 2) as u128) as Gas
    }

    /// Free gas eligibility: reputation at or above the threshold
    pub fn free_gas_eligible(reputation: u64) -> bool {
        reputation >= FREE_GAS_MIN_REPUTATION
    }

    /// Free gas allowance: `BASE * (20 + rep - 80) / 20` when eligible
    pub fn free_gas_allowance(base_allowance: Gas, reputation: u64) -> Gas {
        if !Self::free_gas_eligible(reputation) {
            return 0;
        }
        ((base_allowance as u128) * (20 + reputation as u128 - 80) / 20) as Gas
    }

    /// Determinism-checked pricing bundle for the VM layer
    pub fn execution_pricing(
        &self,
        reputation: u64,
        base_gas: Gas,
        base_allowance: Gas,
        trust_gate_open: bool,
    ) -> ConsensusResult<ExecutionPricing> {
        let gas_discount =
            self.check_int("gas_discount", || Self::gas_discount(base_gas, reputation))?;
        let free_gas_allowance = self.check_int("free_gas_allowance", || {
            Self::free_gas_allowance(base_allowance, reputation)
        })?;

        Ok(ExecutionPricing {
            caller_reputation: reputation,
            gas_discount,
            free_gas_allowance,
            trust_gate_open,
        })
    }

    /// Determinism-checked trust-graph state hash
    pub fn verified_state_hash(&self, graph: &TrustGraph) -> ConsensusResult<Hash256> {
        let first = graph.state_hash()?;
        for round in 1..3 {
            let again = graph.state_hash()?;
            if again != first {
                return Err(ConsensusError::DeterminismViolation(format!(
                    "trust_graph_state_hash: mismatch on run {round}"
                )));
            }
        }
        Ok(first)
    }

    /// Compare the local state hash against a peer's
    pub fn compare_peer_state(local: &Hash256, peer: &Hash256) -> StateComparison {
        if local == peer {
            StateComparison::Match
        } else {
            tracing::warn!(local = %local, peer = %peer, "Trust-graph state mismatch with peer");
            StateComparison::MismatchRequestDelta
        }
    }
}

impl Default for ConsensusSafetyValidator {
    fn default() -> Self {
        Self::new()
    }
}
