// cvm-trust/src/cluster.rs

use cvm_crypto::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Membership change produced by a clustering observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// A previously unseen address joined an existing cluster
    NewMember {
        address: Address,
        cluster_id: Address,
    },
    /// Two clusters became one; `absorbed_members` lists the side that
    /// changed cluster id
    Merged {
        cluster_id: Address,
        absorbed_members: BTreeSet<Address>,
    },
}

/// Heuristic wallet clusterer
///
/// Union-find over co-spend observations: addresses spending inputs in the
/// same transaction are presumed controlled by one entity. Membership is an
/// equivalence; clusters merge but never split. The cluster id is the
/// lexicographically smallest member, so it is stable under merge order.
pub struct WalletClusterer {
    parent: HashMap<Address, Address>,
    rank: HashMap<Address, u32>,
    /// Confidence that the cluster's members really share an owner
    confidence: HashMap<Address, f64>,
}

/// Confidence assigned to a fresh co-spend link
const COSPEND_CONFIDENCE: f64 = 0.85;

impl WalletClusterer {
    pub fn new() -> Self {
        Self {
            parent: HashMap::new(),
            rank: HashMap::new(),
            confidence: HashMap::new(),
        }
    }

    fn find(&mut self, addr: Address) -> Address {
        let parent = *self.parent.get(&addr).unwrap_or(&addr);
        if parent == addr {
            return addr;
        }
        let root = self.find(parent);
        self.parent.insert(addr, root); // path compression
        root
    }

    fn find_readonly(&self, addr: &Address) -> Address {
        let mut current = *addr;
        loop {
            match self.parent.get(&current) {
                Some(parent) if parent != &current => current = *parent,
                _ => return current,
            }
        }
    }

    /// Record a co-spend observation; all inputs merge into one cluster
    pub fn observe_cospend(&mut self, inputs: &[Address]) -> Vec<ClusterEvent> {
        let mut events = Vec::new();
        if inputs.len() < 2 {
            return events;
        }

        for pair in inputs.windows(2) {
            if let Some(event) = self.union(pair[0], pair[1], COSPEND_CONFIDENCE) {
                events.push(event);
            }
        }
        events
    }

    /// Merge the clusters of two addresses (explicit heuristic hit)
    pub fn union(&mut self, a: Address, b: Address, confidence: f64) -> Option<ClusterEvent> {
        let known_a = self.parent.contains_key(&a);
        let known_b = self.parent.contains_key(&b);
        self.parent.entry(a).or_insert(a);
        self.parent.entry(b).or_insert(b);

        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            // Same cluster already; a brand-new singleton joining itself is
            // still a new-member event for the propagator
            if !known_a && known_b {
                return Some(ClusterEvent::NewMember { address: a, cluster_id: self.cluster_of(&a) });
            }
            if !known_b && known_a {
                return Some(ClusterEvent::NewMember { address: b, cluster_id: self.cluster_of(&b) });
            }
            return None;
        }

        let members_a = self.members_of_root(root_a);
        let members_b = self.members_of_root(root_b);

        // Union by rank
        let rank_a = *self.rank.get(&root_a).unwrap_or(&0);
        let rank_b = *self.rank.get(&root_b).unwrap_or(&0);
        let (winner, loser) = if rank_a >= rank_b { (root_a, root_b) } else { (root_b, root_a) };
        self.parent.insert(loser, winner);
        if rank_a == rank_b {
            *self.rank.entry(winner).or_insert(0) += 1;
        }

        let merged_conf = self
            .confidence
            .get(&root_a)
            .copied()
            .unwrap_or(confidence)
            .min(self.confidence.get(&root_b).copied().unwrap_or(confidence))
            .min(confidence);
        self.confidence.insert(winner, merged_conf);

        let cluster_id = self.cluster_of(&winner);

        // Single fresh address joining a known cluster is growth, not a merge
        if !known_a && members_a.len() == 1 {
            return Some(ClusterEvent::NewMember { address: a, cluster_id });
        }
        if !known_b && members_b.len() == 1 {
            return Some(ClusterEvent::NewMember { address: b, cluster_id });
        }

        let absorbed_members = if loser == root_b { members_b } else { members_a };

        tracing::debug!(
            cluster = %cluster_id,
            absorbed = absorbed_members.len(),
            "Wallet clusters merged"
        );

        Some(ClusterEvent::Merged { cluster_id, absorbed_members })
    }

    /// The cluster id (smallest member) for an address
    ///
    /// An unknown address is its own single-member cluster.
    pub fn cluster_of(&self, addr: &Address) -> Address {
        let root = self.find_readonly(addr);
        self.members_of_root(root)
            .into_iter()
            .next()
            .unwrap_or(*addr)
    }

    /// All members of the cluster containing `addr` (always non-empty)
    pub fn members_of(&self, addr: &Address) -> BTreeSet<Address> {
        let root = self.find_readonly(addr);
        let mut members = self.members_of_root(root);
        members.insert(*addr);
        members
    }

    fn members_of_root(&self, root: Address) -> BTreeSet<Address> {
        let mut members: BTreeSet<Address> = self
            .parent
            .keys()
            .filter(|a| self.find_readonly(a) == root)
            .copied()
            .collect();
        members.insert(root);
        members
    }

    /// Confidence that the cluster around `addr` shares one owner
    pub fn confidence_of(&self, addr: &Address) -> f64 {
        let root = self.find_readonly(addr);
        self.confidence.get(&root).copied().unwrap_or(1.0)
    }

    /// Number of addresses the clusterer has seen
    pub fn known_addresses(&self) -> usize {
        self.parent.len()
    }
}

impl Default for WalletClusterer {
    fn default() -> Self {
        Self::new()
    }
}
