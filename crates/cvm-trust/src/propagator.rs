// cvm-trust/src/propagator.rs

use crate::cluster::WalletClusterer;
use crate::graph::{TrustEdge, TrustGraph};
use crate::lru::{EntrySize, LruByteCache};
use crate::{TrustResult, MAX_CLUSTER_SIZE, SUMMARY_CACHE_BUDGET};
use cvm_crypto::{Address, Amount, Hash256, Timestamp, COIN};
use cvm_store::{keys, KeyPrefix, KvStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// A trust edge materialized onto a cluster member of the original target
///
/// Exists iff a source edge `(from -> original_target)` exists and `to` is
/// in the target's cluster. Keyed `P + from + to`; indexed by source tx.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagatedTrustEdge {
    pub from: Address,
    pub to: Address,
    pub original_target: Address,
    pub source_edge_tx: Hash256,
    pub weight: i8,
    pub propagation_time: Timestamp,
    pub original_timestamp: Timestamp,
    pub bond_amount: Amount,
}

impl PropagatedTrustEdge {
    fn from_source(edge: &TrustEdge, member: Address, now: Timestamp) -> Self {
        Self {
            from: edge.from,
            to: member,
            original_target: edge.to,
            source_edge_tx: edge.bond_tx,
            weight: edge.weight,
            propagation_time: now,
            original_timestamp: edge.timestamp,
            bond_amount: edge.bond_amount,
        }
    }

    /// Conflict rule shared by merge and inheritance: newest original
    /// timestamp wins, ties broken by the greater source transaction hash
    fn wins_over(&self, other: &PropagatedTrustEdge) -> bool {
        if self.original_timestamp != other.original_timestamp {
            return self.original_timestamp > other.original_timestamp;
        }
        self.source_edge_tx > other.source_edge_tx
    }
}

/// Outcome of one propagation operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationResult {
    pub propagated_count: u32,
    pub original_cluster_size: u32,
    pub was_limited: bool,
}

/// Aggregated trust view of one wallet cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTrustSummary {
    pub cluster_id: Address,
    pub member_count: u32,
    /// Unique trusters across the cluster
    pub edge_count: u32,
    pub total_incoming: i64,
    pub total_negative: i64,
    /// Minimum member score across the cluster
    pub effective_score: f64,
    pub last_updated: Timestamp,
}

impl EntrySize for ClusterTrustSummary {
    fn entry_size(&self) -> usize {
        std::mem::size_of::<Self>() + std::mem::size_of::<Address>()
    }
}

/// Fans authoritative trust edges across wallet clusters
pub struct TrustPropagator {
    store: Arc<KvStore>,
    summary_cache: Mutex<LruByteCache<Address, ClusterTrustSummary>>,
}

impl TrustPropagator {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self::with_cache_budget(store, SUMMARY_CACHE_BUDGET)
    }

    pub fn with_cache_budget(store: Arc<KvStore>, budget_bytes: usize) -> Self {
        Self {
            store,
            summary_cache: Mutex::new(LruByteCache::new(budget_bytes)),
        }
    }

    /// Materialize `edge` onto every member of the target's cluster
    ///
    /// A target unknown to the clusterer is treated as a single-address
    /// cluster. At most `MAX_CLUSTER_SIZE` members are touched; callers
    /// needing more use [`propagate_edge_batched`].
    pub fn propagate_edge(
        &self,
        clusterer: &WalletClusterer,
        edge: &TrustEdge,
        now: Timestamp,
    ) -> TrustResult<PropagationResult> {
        let (members, mut result) = self.cluster_members_for(clusterer, &edge.to);

        let mut batch = self.store.batch();
        for member in &members {
            let propagated = PropagatedTrustEdge::from_source(edge, *member, now);
            batch.put(&keys::propagated_edge_key(&propagated.from, member), &propagated)?;
            batch.put(&keys::propagation_index_key(&edge.bond_tx, member), &edge.from)?;
            result.propagated_count += 1;
        }
        batch.commit()?;

        self.invalidate_cluster(&clusterer.cluster_of(&edge.to));

        tracing::debug!(
            from = %edge.from, target = %edge.to,
            count = result.propagated_count, limited = result.was_limited,
            "Trust edge propagated"
        );

        Ok(result)
    }

    /// Batched propagation with a progress callback
    ///
    /// The callback receives `(propagated_so_far, total_members)` after each
    /// batch commit and may return `false` to abort between batches.
    pub fn propagate_edge_batched<F>(
        &self,
        clusterer: &WalletClusterer,
        edge: &TrustEdge,
        batch_size: u32,
        now: Timestamp,
        mut callback: F,
    ) -> TrustResult<PropagationResult>
    where
        F: FnMut(u32, u32) -> bool,
    {
        let (members, mut result) = self.cluster_members_for(clusterer, &edge.to);
        let total = members.len() as u32;
        let batch_size = batch_size.max(1);

        let mut batch = self.store.batch();
        let mut in_batch = 0u32;

        for member in &members {
            let propagated = PropagatedTrustEdge::from_source(edge, *member, now);
            batch.put(&keys::propagated_edge_key(&propagated.from, member), &propagated)?;
            batch.put(&keys::propagation_index_key(&edge.bond_tx, member), &edge.from)?;
            result.propagated_count += 1;
            in_batch += 1;

            if in_batch >= batch_size {
                batch.commit()?;
                batch = self.store.batch();
                in_batch = 0;
                if !callback(result.propagated_count, total) {
                    tracing::debug!(done = result.propagated_count, total, "Batched propagation aborted by caller");
                    self.invalidate_cluster(&clusterer.cluster_of(&edge.to));
                    return Ok(result);
                }
            }
        }
        if !batch.is_empty() {
            batch.commit()?;
        }

        self.invalidate_cluster(&clusterer.cluster_of(&edge.to));
        Ok(result)
    }

    fn cluster_members_for(
        &self,
        clusterer: &WalletClusterer,
        target: &Address,
    ) -> (BTreeSet<Address>, PropagationResult) {
        let mut members = clusterer.members_of(target);
        let mut result = PropagationResult {
            original_cluster_size: members.len() as u32,
            ..Default::default()
        };

        if members.len() > MAX_CLUSTER_SIZE {
            tracing::warn!(
                size = members.len(),
                cap = MAX_CLUSTER_SIZE,
                "Cluster exceeds propagation cap, limiting"
            );
            members = members.into_iter().take(MAX_CLUSTER_SIZE).collect();
            result.was_limited = true;
        }

        (members, result)
    }

    /// Inherit existing cluster trust for a newly detected member
    ///
    /// Uses existing members' propagated edges (and not-yet-propagated
    /// direct edges) as templates, preserving the original timestamp and
    /// bond amount. One template per source transaction.
    pub fn inherit_for_new_member(
        &self,
        clusterer: &WalletClusterer,
        graph: &TrustGraph,
        new_address: &Address,
        now: Timestamp,
    ) -> TrustResult<u32> {
        let members = clusterer.members_of(new_address);

        let mut templates: BTreeMap<Hash256, PropagatedTrustEdge> = BTreeMap::new();
        for member in members.iter().filter(|m| *m != new_address) {
            for prop in self.propagated_edges_for_address(member)? {
                templates.entry(prop.source_edge_tx).or_insert(prop);
            }
            for direct in graph.incoming_edges(member)? {
                templates
                    .entry(direct.bond_tx)
                    .or_insert_with(|| PropagatedTrustEdge::from_source(&direct, *member, direct.timestamp));
            }
        }

        if templates.is_empty() {
            return Ok(0);
        }

        let mut batch = self.store.batch();
        let mut inherited = 0u32;
        for template in templates.values() {
            let edge = PropagatedTrustEdge {
                to: *new_address,
                propagation_time: now,
                ..template.clone()
            };
            batch.put(&keys::propagated_edge_key(&edge.from, new_address), &edge)?;
            batch.put(&keys::propagation_index_key(&edge.source_edge_tx, new_address), &edge.from)?;
            inherited += 1;
        }
        batch.commit()?;

        self.invalidate_cluster(&clusterer.cluster_of(new_address));

        tracing::debug!(address = %new_address, inherited, "New cluster member inherited trust");
        Ok(inherited)
    }

    /// Re-propagate after a cluster merge
    ///
    /// Trust sources from both former clusters are combined; for each
    /// distinct truster the edge with the newest original timestamp wins,
    /// ties broken by the greater source transaction hash. Afterwards every
    /// member carries exactly one propagated edge per truster.
    pub fn handle_cluster_merge(
        &self,
        clusterer: &WalletClusterer,
        graph: &TrustGraph,
        merged_cluster: &Address,
        now: Timestamp,
    ) -> TrustResult<u32> {
        let mut members = clusterer.members_of(merged_cluster);
        if members.len() > MAX_CLUSTER_SIZE {
            members = members.into_iter().take(MAX_CLUSTER_SIZE).collect();
        }

        // One winning edge per truster across both former clusters
        let mut winners: BTreeMap<Address, PropagatedTrustEdge> = BTreeMap::new();
        let mut stale: Vec<(Address, Address)> = Vec::new();

        for member in &members {
            for prop in self.propagated_edges_for_address(member)? {
                stale.push((prop.from, prop.to));
                match winners.get(&prop.from) {
                    Some(current) if !prop.wins_over(current) => {}
                    _ => {
                        winners.insert(prop.from, prop);
                    }
                }
            }
            for direct in graph.incoming_edges(member)? {
                let candidate = PropagatedTrustEdge::from_source(&direct, *member, direct.timestamp);
                match winners.get(&candidate.from) {
                    Some(current) if !candidate.wins_over(current) => {}
                    _ => {
                        winners.insert(candidate.from, candidate);
                    }
                }
            }
        }

        let mut batch = self.store.batch();
        for (from, to) in &stale {
            batch.delete(&keys::propagated_edge_key(from, to));
        }

        let mut written = 0u32;
        for (from, winner) in &winners {
            for member in &members {
                let edge = PropagatedTrustEdge {
                    to: *member,
                    propagation_time: now,
                    ..winner.clone()
                };
                batch.put(&keys::propagated_edge_key(from, member), &edge)?;
                batch.put(&keys::propagation_index_key(&edge.source_edge_tx, member), from)?;
                written += 1;
            }
        }
        batch.commit()?;

        self.invalidate_cluster(merged_cluster);

        tracing::info!(
            cluster = %merged_cluster,
            trusters = winners.len(),
            members = members.len(),
            "Cluster merge re-propagated"
        );
        Ok(written)
    }

    /// Rewrite all propagated edges of a source edge with a new weight
    pub fn update_propagated_edges(&self, source_tx: &Hash256, new_weight: i8) -> TrustResult<u32> {
        let entries = self.index_entries(source_tx)?;

        let mut batch = self.store.batch();
        let mut updated = 0u32;
        for (to, from) in &entries {
            let key = keys::propagated_edge_key(from, to);
            if let Some(mut edge) = self.store.get::<PropagatedTrustEdge>(&key)? {
                edge.weight = new_weight;
                batch.put(&key, &edge)?;
                updated += 1;
            }
        }
        batch.commit()?;

        tracing::debug!(source = %source_tx, updated, "Propagated edges rewritten");
        Ok(updated)
    }

    /// Remove all propagated edges derived from a source edge
    pub fn delete_propagated_edges(&self, source_tx: &Hash256) -> TrustResult<u32> {
        let entries = self.index_entries(source_tx)?;

        let mut batch = self.store.batch();
        for (to, from) in &entries {
            batch.delete(&keys::propagated_edge_key(from, to));
            batch.delete(&keys::propagation_index_key(source_tx, to));
        }
        batch.commit()?;

        tracing::debug!(source = %source_tx, removed = entries.len(), "Propagated edges removed");
        Ok(entries.len() as u32)
    }

    /// `(to, from)` pairs recorded in the propagation index of a source tx
    fn index_entries(&self, source_tx: &Hash256) -> TrustResult<Vec<(Address, Address)>> {
        let prefix = keys::propagation_index_prefix(source_tx);
        let mut entries = Vec::new();
        for (key, value) in self.store.scan_prefix(&prefix)? {
            let to = Address::from_slice(&key[prefix.len()..])
                .map_err(|e| cvm_store::StoreError::Corruption(e.to_string()))?;
            let from: Address = bincode::deserialize(&value)
                .map_err(|e| cvm_store::StoreError::SerializationError(e.to_string()))?;
            entries.push((to, from));
        }
        Ok(entries)
    }

    /// All propagated edges targeting one address
    pub fn propagated_edges_for_address(&self, target: &Address) -> TrustResult<Vec<PropagatedTrustEdge>> {
        let edges: Vec<PropagatedTrustEdge> = self
            .store
            .scan_prefix_values(KeyPrefix::PropagatedEdge.as_bytes())?;
        Ok(edges.into_iter().filter(|e| &e.to == target).collect())
    }

    /// All propagated edges derived from one source tx
    pub fn propagated_edges_by_source(&self, source_tx: &Hash256) -> TrustResult<Vec<PropagatedTrustEdge>> {
        let mut edges = Vec::new();
        for (to, from) in self.index_entries(source_tx)? {
            if let Some(edge) = self.store.get(&keys::propagated_edge_key(&from, &to))? {
                edges.push(edge);
            }
        }
        Ok(edges)
    }

    /// Cached aggregated trust view for the cluster containing `address`
    pub fn cluster_trust_summary(
        &self,
        clusterer: &WalletClusterer,
        graph: &TrustGraph,
        address: &Address,
        now: Timestamp,
    ) -> TrustResult<ClusterTrustSummary> {
        let cluster_id = clusterer.cluster_of(address);

        if let Ok(mut cache) = self.summary_cache.lock() {
            if let Some(summary) = cache.get(&cluster_id) {
                return Ok(summary.clone());
            }
        }

        let summary = self.build_summary(clusterer, graph, &cluster_id, now)?;

        // Seed the persistent cache and the in-memory LRU
        self.store.put(&keys::cluster_summary_key(&cluster_id), &summary)?;
        if let Ok(mut cache) = self.summary_cache.lock() {
            cache.insert(cluster_id, summary.clone());
        }

        Ok(summary)
    }

    fn build_summary(
        &self,
        clusterer: &WalletClusterer,
        graph: &TrustGraph,
        cluster_id: &Address,
        now: Timestamp,
    ) -> TrustResult<ClusterTrustSummary> {
        let members = clusterer.members_of(cluster_id);

        let mut unique_trusters: BTreeSet<Address> = BTreeSet::new();
        let mut total_incoming = 0i64;
        let mut total_negative = 0i64;
        let mut min_score = f64::MAX;

        for member in &members {
            for edge in graph.incoming_edges(member)? {
                unique_trusters.insert(edge.from);
                if edge.weight > 0 {
                    total_incoming += edge.weight as i64;
                } else {
                    total_negative += edge.weight as i64;
                }
            }
            for edge in self.propagated_edges_for_address(member)? {
                unique_trusters.insert(edge.from);
                if edge.weight > 0 {
                    total_incoming += edge.weight as i64;
                } else {
                    total_negative += edge.weight as i64;
                }
            }

            let score = self.member_score(graph, member)?;
            if score < min_score {
                min_score = score;
            }
        }

        Ok(ClusterTrustSummary {
            cluster_id: *cluster_id,
            member_count: members.len() as u32,
            edge_count: unique_trusters.len() as u32,
            total_incoming,
            total_negative,
            effective_score: if min_score == f64::MAX { 0.0 } else { min_score },
            last_updated: now,
        })
    }

    /// Bond-weighted average of all incoming trust (direct and propagated)
    fn member_score(&self, graph: &TrustGraph, member: &Address) -> TrustResult<f64> {
        let mut total_weight = 0.0;
        let mut total_bond_weight = 0.0;

        for edge in graph.incoming_edges(member)? {
            let bond_weight = (edge.bond_amount as f64 / COIN as f64).max(1.0);
            total_weight += edge.weight as f64 * bond_weight;
            total_bond_weight += bond_weight;
        }
        for edge in self.propagated_edges_for_address(member)? {
            let bond_weight = (edge.bond_amount as f64 / COIN as f64).max(1.0);
            total_weight += edge.weight as f64 * bond_weight;
            total_bond_weight += bond_weight;
        }

        if total_bond_weight > 0.0 {
            Ok(total_weight / total_bond_weight)
        } else {
            Ok(0.0)
        }
    }

    /// Drop cached summaries after any edge change touching the cluster
    pub fn invalidate_cluster(&self, cluster_id: &Address) {
        if let Ok(mut cache) = self.summary_cache.lock() {
            cache.remove(cluster_id);
        }
        let _ = self.store.delete(&keys::cluster_summary_key(cluster_id));
    }
}
