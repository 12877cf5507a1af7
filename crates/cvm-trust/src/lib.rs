// cvm-trust/src/lib.rs

//! Trust graph, wallet clustering and trust propagation
//!
//! Three tightly coupled pieces:
//! - [`TrustGraph`]: the authoritative store of bonded trust edges, keyed
//!   `(from, to)`, with incoming/outgoing enumeration, depth-bounded path
//!   search and the cross-node state hash
//! - [`WalletClusterer`]: heuristic grouping of addresses presumed to
//!   belong to one entity (union-find over co-spend observations)
//! - [`TrustPropagator`]: fans an authoritative edge across the target's
//!   whole cluster and serves cached cluster trust summaries

pub mod cluster;
pub mod graph;
pub mod lru;
pub mod propagator;

pub use cluster::{ClusterEvent, WalletClusterer};
pub use graph::{BondedVote, TrustEdge, TrustGraph, TrustPath};
pub use lru::{EntrySize, LruByteCache};
pub use propagator::{ClusterTrustSummary, PropagatedTrustEdge, PropagationResult, TrustPropagator};

use cvm_crypto::{Amount, COIN};

/// Minimum bond required to carry any non-zero trust weight
pub const MIN_BOND: Amount = COIN / 100;

/// Additional bond required per point of trust weight
pub const BOND_PER_POINT: Amount = COIN / 1000;

/// Maximum cluster members touched by a single propagation operation
pub const MAX_CLUSTER_SIZE: usize = 10_000;

/// Maximum depth for web-of-trust path search
pub const WOT_MAX_DEPTH: usize = 3;

/// Byte budget for the cluster-trust summary cache
pub const SUMMARY_CACHE_BUDGET: usize = 100 * 1024 * 1024;

/// Result type for trust operations
pub type TrustResult<T> = Result<T, TrustError>;

/// Errors that can occur during trust graph operations
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("Insufficient bond: required {required}, provided {provided}")]
    InsufficientBond { required: Amount, provided: Amount },

    #[error("Trust weight {0} outside [-100, 100]")]
    InvalidWeight(i16),

    #[error("Self-trust edges are not allowed")]
    SelfTrust,

    #[error("Trust edge not found: {from} -> {to}")]
    EdgeNotFound {
        from: cvm_crypto::Address,
        to: cvm_crypto::Address,
    },

    #[error("Store error: {0}")]
    Store(#[from] cvm_store::StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bond_floor_constants() {
        // A full-weight edge needs the per-point bond, not just the floor
        assert!(100 * BOND_PER_POINT > MIN_BOND);
    }
}
