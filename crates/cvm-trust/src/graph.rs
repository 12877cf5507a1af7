// cvm-trust/src/graph.rs

use crate::{TrustError, TrustResult, BOND_PER_POINT, MIN_BOND, WOT_MAX_DEPTH};
use cvm_crypto::hash::HashWriter;
use cvm_crypto::{Address, Amount, Hash256, Timestamp};
use cvm_store::{keys, KeyPrefix, KvStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// A bonded, directed trust relation
///
/// Unique per `(from, to)`; `slashed` is monotonic and only ever set by a
/// DAO decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEdge {
    pub from: Address,
    pub to: Address,
    /// Trust weight in [-100, 100]
    pub weight: i8,
    pub bond_amount: Amount,
    pub bond_tx: Hash256,
    pub timestamp: Timestamp,
    pub reason: Vec<u8>,
    pub slashed: bool,
}

/// A vote backed by a slashable bond; spawns or updates a trust edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondedVote {
    pub voter: Address,
    pub target: Address,
    pub value: i8,
    pub bond: Amount,
    pub timestamp: Timestamp,
    pub tx: Hash256,
}

impl BondedVote {
    /// Build a vote from a parsed BONDED_VOTE envelope payload
    ///
    /// The voter and bond transaction are supplied by the carrying
    /// transaction; the payload only names the target and terms.
    pub fn from_payload(payload: &cvm_envelope::BondedVotePayload, voter: Address, tx: Hash256) -> Self {
        Self {
            voter,
            target: payload.target,
            value: payload.value,
            bond: payload.bond_amount,
            timestamp: payload.timestamp,
            tx,
        }
    }
}

/// A directed path through the web of trust
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustPath {
    /// Hops from viewer to target, endpoints included
    pub hops: Vec<Address>,
    /// Product of normalized edge weights divided by path length
    pub strength: f64,
}

impl TrustPath {
    pub fn len(&self) -> usize {
        self.hops.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.hops.len() < 2
    }
}

/// Bound on paths collected per query; traversal is depth-limited anyway
const MAX_PATHS_PER_QUERY: usize = 16;

/// The authoritative trust edge store
pub struct TrustGraph {
    store: Arc<KvStore>,
}

impl TrustGraph {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    /// Apply a bonded vote, creating or replacing the `(voter, target)` edge
    ///
    /// Bond discipline: any non-zero weight requires `MIN_BOND`, and the
    /// bond must cover `|weight| * BOND_PER_POINT`.
    pub fn apply_bonded_vote(&self, vote: &BondedVote) -> TrustResult<TrustEdge> {
        if vote.voter == vote.target {
            return Err(TrustError::SelfTrust);
        }
        if vote.value != 0 {
            let per_point = vote.value.unsigned_abs() as Amount * BOND_PER_POINT;
            let required = MIN_BOND.max(per_point);
            if vote.bond < required {
                return Err(TrustError::InsufficientBond {
                    required,
                    provided: vote.bond,
                });
            }
        }

        let edge = TrustEdge {
            from: vote.voter,
            to: vote.target,
            weight: vote.value,
            bond_amount: vote.bond,
            bond_tx: vote.tx,
            timestamp: vote.timestamp,
            reason: Vec::new(),
            slashed: false,
        };

        // Vote record and edge update commit together
        let mut batch = self.store.batch();
        batch.put(&keys::bonded_vote_key(&vote.tx), vote)?;
        batch.put(&keys::trust_edge_key(&edge.from, &edge.to), &edge)?;
        batch.commit()?;

        tracing::debug!(
            from = %edge.from, to = %edge.to, weight = edge.weight,
            "Trust edge applied from bonded vote"
        );

        Ok(edge)
    }

    pub fn get_edge(&self, from: &Address, to: &Address) -> TrustResult<Option<TrustEdge>> {
        Ok(self.store.get(&keys::trust_edge_key(from, to))?)
    }

    pub fn get_vote(&self, tx: &Hash256) -> TrustResult<Option<BondedVote>> {
        Ok(self.store.get(&keys::bonded_vote_key(tx))?)
    }

    /// All edges pointing at `to`
    ///
    /// Keys are sorted by `from`, so the enumeration walks the whole edge
    /// family; edge counts are bounded by the bond requirement.
    pub fn incoming_edges(&self, to: &Address) -> TrustResult<Vec<TrustEdge>> {
        let edges: Vec<TrustEdge> = self
            .store
            .scan_prefix_values(KeyPrefix::TrustEdge.as_bytes())?;
        Ok(edges.into_iter().filter(|e| &e.to == to).collect())
    }

    /// All edges originating at `from` (single prefix scan)
    pub fn outgoing_edges(&self, from: &Address) -> TrustResult<Vec<TrustEdge>> {
        let mut prefix = KeyPrefix::TrustEdge.as_bytes().to_vec();
        prefix.extend_from_slice(from.as_bytes());
        Ok(self.store.scan_prefix_values(&prefix)?)
    }

    pub fn all_edges(&self) -> TrustResult<Vec<TrustEdge>> {
        Ok(self
            .store
            .scan_prefix_values(KeyPrefix::TrustEdge.as_bytes())?)
    }

    /// Mark an edge slashed; monotonic, there is no unslash
    pub fn slash_edge(&self, from: &Address, to: &Address) -> TrustResult<TrustEdge> {
        let mut edge = self
            .get_edge(from, to)?
            .ok_or(TrustError::EdgeNotFound { from: *from, to: *to })?;

        if !edge.slashed {
            edge.slashed = true;
            self.store.put(&keys::trust_edge_key(from, to), &edge)?;
            tracing::info!(from = %from, to = %to, "Trust edge slashed");
        }

        Ok(edge)
    }

    /// Remove an edge; reserved for authoritative rewrites (DAO outcome)
    pub fn remove_edge(&self, from: &Address, to: &Address) -> TrustResult<()> {
        self.store.delete(&keys::trust_edge_key(from, to))?;
        Ok(())
    }

    /// Weighted incoming reputation: bond-weighted average of edge weights
    pub fn weighted_incoming_score(&self, target: &Address) -> TrustResult<f64> {
        let mut total_weight = 0.0;
        let mut total_bond_weight = 0.0;

        for edge in self.incoming_edges(target)? {
            if edge.slashed {
                continue;
            }
            let bond_weight = (edge.bond_amount as f64 / cvm_crypto::COIN as f64).max(1.0);
            total_weight += edge.weight as f64 * bond_weight;
            total_bond_weight += bond_weight;
        }

        if total_bond_weight > 0.0 {
            Ok(total_weight / total_bond_weight)
        } else {
            Ok(0.0)
        }
    }

    /// Depth-bounded directed path search from `viewer` to `target`
    ///
    /// Only positive, unslashed edges conduct trust. Path strength is the
    /// product of normalized weights divided by the path length.
    pub fn find_trust_paths(
        &self,
        viewer: &Address,
        target: &Address,
        max_depth: usize,
    ) -> TrustResult<Vec<TrustPath>> {
        let max_depth = max_depth.min(WOT_MAX_DEPTH);
        let mut paths = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(*viewer);

        self.dfs_paths(viewer, target, max_depth, &mut vec![*viewer], &mut visited, &mut paths)?;

        Ok(paths)
    }

    fn dfs_paths(
        &self,
        current: &Address,
        target: &Address,
        depth_left: usize,
        path: &mut Vec<Address>,
        visited: &mut HashSet<Address>,
        out: &mut Vec<TrustPath>,
    ) -> TrustResult<()> {
        if depth_left == 0 || out.len() >= MAX_PATHS_PER_QUERY {
            return Ok(());
        }

        for edge in self.outgoing_edges(current)? {
            if edge.slashed || edge.weight <= 0 {
                continue;
            }
            if visited.contains(&edge.to) {
                continue;
            }

            path.push(edge.to);
            if &edge.to == target {
                let strength = self.path_strength_of(path)?;
                out.push(TrustPath { hops: path.clone(), strength });
            } else {
                visited.insert(edge.to);
                self.dfs_paths(&edge.to, target, depth_left - 1, path, visited, out)?;
                visited.remove(&edge.to);
            }
            path.pop();

            if out.len() >= MAX_PATHS_PER_QUERY {
                break;
            }
        }

        Ok(())
    }

    fn path_strength_of(&self, hops: &[Address]) -> TrustResult<f64> {
        let mut product = 1.0;
        for pair in hops.windows(2) {
            let edge = self
                .get_edge(&pair[0], &pair[1])?
                .ok_or(TrustError::EdgeNotFound { from: pair[0], to: pair[1] })?;
            product *= edge.weight.max(0) as f64 / 100.0;
        }
        let length = (hops.len() - 1) as f64;
        Ok(product / length)
    }

    /// True when at least one WoT path exists within the depth bound
    pub fn has_wot_connection(&self, viewer: &Address, target: &Address) -> TrustResult<bool> {
        Ok(!self.find_trust_paths(viewer, target, WOT_MAX_DEPTH)?.is_empty())
    }

    // State counters exchanged between peers

    pub fn edge_count(&self) -> TrustResult<u64> {
        Ok(self.store.count_prefix(KeyPrefix::TrustEdge.as_bytes())?)
    }

    pub fn vote_count(&self) -> TrustResult<u64> {
        Ok(self.store.count_prefix(KeyPrefix::BondedVote.as_bytes())?)
    }

    pub fn slashed_count(&self) -> TrustResult<u64> {
        Ok(self.all_edges()?.iter().filter(|e| e.slashed).count() as u64)
    }

    /// Cross-node state summary:
    /// `H(total_edges || total_votes || total_disputes || slashed_votes)`
    ///
    /// Peers exchange this hash; a mismatch triggers a delta request.
    pub fn state_hash(&self) -> TrustResult<Hash256> {
        let total_disputes = self.store.count_prefix(KeyPrefix::DisputeCase.as_bytes())?;

        let mut writer = HashWriter::new();
        writer
            .write_u64(self.edge_count()?)
            .write_u64(self.vote_count()?)
            .write_u64(total_disputes)
            .write_u64(self.slashed_count()?);
        Ok(writer.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_graph() -> (TrustGraph, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(KvStore::open_at(temp_dir.path()).unwrap());
        (TrustGraph::new(store), temp_dir)
    }

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn vote(voter: u8, target: u8, value: i8, tx_seed: u8) -> BondedVote {
        BondedVote {
            voter: addr(voter),
            target: addr(target),
            value,
            bond: crate::MIN_BOND.max(value.unsigned_abs() as Amount * crate::BOND_PER_POINT),
            timestamp: 1_700_000_000 + tx_seed as u64,
            tx: Hash256::new([tx_seed; 32]),
        }
    }

    #[test]
    fn test_apply_bonded_vote_creates_edge() {
        let (graph, _temp) = create_test_graph();

        let edge = graph.apply_bonded_vote(&vote(1, 2, 60, 1)).unwrap();
        assert_eq!(edge.weight, 60);

        let loaded = graph.get_edge(&addr(1), &addr(2)).unwrap().unwrap();
        assert_eq!(loaded, edge);
        assert!(graph.get_vote(&Hash256::new([1; 32])).unwrap().is_some());
    }

    #[test]
    fn test_insufficient_bond_rejected() {
        let (graph, _temp) = create_test_graph();

        let mut v = vote(1, 2, 100, 1);
        v.bond = crate::MIN_BOND; // needs 100 * BOND_PER_POINT
        assert!(matches!(
            graph.apply_bonded_vote(&v),
            Err(TrustError::InsufficientBond { .. })
        ));
    }

    #[test]
    fn test_self_trust_rejected() {
        let (graph, _temp) = create_test_graph();
        assert!(matches!(
            graph.apply_bonded_vote(&vote(1, 1, 50, 1)),
            Err(TrustError::SelfTrust)
        ));
    }

    #[test]
    fn test_edge_unique_per_pair() {
        let (graph, _temp) = create_test_graph();

        graph.apply_bonded_vote(&vote(1, 2, 40, 1)).unwrap();
        graph.apply_bonded_vote(&vote(1, 2, 70, 2)).unwrap();

        assert_eq!(graph.edge_count().unwrap(), 1);
        let edge = graph.get_edge(&addr(1), &addr(2)).unwrap().unwrap();
        assert_eq!(edge.weight, 70);
    }

    #[test]
    fn test_incoming_outgoing_enumeration() {
        let (graph, _temp) = create_test_graph();

        graph.apply_bonded_vote(&vote(1, 3, 50, 1)).unwrap();
        graph.apply_bonded_vote(&vote(2, 3, 30, 2)).unwrap();
        graph.apply_bonded_vote(&vote(1, 4, 20, 3)).unwrap();

        assert_eq!(graph.incoming_edges(&addr(3)).unwrap().len(), 2);
        assert_eq!(graph.outgoing_edges(&addr(1)).unwrap().len(), 2);
    }

    #[test]
    fn test_slash_is_monotonic() {
        let (graph, _temp) = create_test_graph();

        graph.apply_bonded_vote(&vote(1, 2, 50, 1)).unwrap();
        let slashed = graph.slash_edge(&addr(1), &addr(2)).unwrap();
        assert!(slashed.slashed);

        // A second slash keeps the flag
        let again = graph.slash_edge(&addr(1), &addr(2)).unwrap();
        assert!(again.slashed);
        assert_eq!(graph.slashed_count().unwrap(), 1);
    }

    #[test]
    fn test_path_search_depth_bound() {
        let (graph, _temp) = create_test_graph();

        // 1 -> 2 -> 3 -> 4 -> 5: target 5 is 4 hops away, beyond WOT_MAX_DEPTH
        graph.apply_bonded_vote(&vote(1, 2, 80, 1)).unwrap();
        graph.apply_bonded_vote(&vote(2, 3, 80, 2)).unwrap();
        graph.apply_bonded_vote(&vote(3, 4, 80, 3)).unwrap();
        graph.apply_bonded_vote(&vote(4, 5, 80, 4)).unwrap();

        assert!(graph.has_wot_connection(&addr(1), &addr(4)).unwrap());
        assert!(!graph.has_wot_connection(&addr(1), &addr(5)).unwrap());
    }

    #[test]
    fn test_path_strength() {
        let (graph, _temp) = create_test_graph();

        graph.apply_bonded_vote(&vote(1, 2, 80, 1)).unwrap();
        graph.apply_bonded_vote(&vote(2, 3, 50, 2)).unwrap();

        let paths = graph.find_trust_paths(&addr(1), &addr(3), 3).unwrap();
        assert_eq!(paths.len(), 1);
        // (0.8 * 0.5) / 2 hops
        assert!((paths[0].strength - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_negative_edges_do_not_conduct() {
        let (graph, _temp) = create_test_graph();

        graph.apply_bonded_vote(&vote(1, 2, -60, 1)).unwrap();
        assert!(!graph.has_wot_connection(&addr(1), &addr(2)).unwrap());
    }

    #[test]
    fn test_state_hash_changes_with_edges() {
        let (graph, _temp) = create_test_graph();

        let empty = graph.state_hash().unwrap();
        graph.apply_bonded_vote(&vote(1, 2, 50, 1)).unwrap();
        let one_edge = graph.state_hash().unwrap();
        assert_ne!(empty, one_edge);

        // Same store state, same hash
        assert_eq!(one_edge, graph.state_hash().unwrap());
    }

    #[test]
    fn test_vote_from_envelope_payload() {
        let payload = cvm_envelope::BondedVotePayload {
            target: addr(9),
            value: 25,
            bond_amount: crate::MIN_BOND + crate::BOND_PER_POINT * 25,
            timestamp: 1_700_000_100,
        };
        let v = BondedVote::from_payload(&payload, addr(1), Hash256::new([8; 32]));
        assert_eq!(v.target, addr(9));
        assert_eq!(v.value, 25);

        let (graph, _temp) = create_test_graph();
        assert!(graph.apply_bonded_vote(&v).is_ok());
    }

    #[test]
    fn test_weighted_incoming_score() {
        let (graph, _temp) = create_test_graph();

        let mut v1 = vote(1, 3, 80, 1);
        v1.bond = 2 * cvm_crypto::COIN;
        graph.apply_bonded_vote(&v1).unwrap();
        let mut v2 = vote(2, 3, 20, 2);
        v2.bond = 2 * cvm_crypto::COIN;
        graph.apply_bonded_vote(&v2).unwrap();

        // Equal bonds, average of weights
        let score = graph.weighted_incoming_score(&addr(3)).unwrap();
        assert!((score - 50.0).abs() < 1e-9);
    }
}
