// cvm-detectors/src/manipulation.rs

use crate::DetectorResult;
use cvm_crypto::{Address, Timestamp};
use cvm_hat::AddressMetrics;
use cvm_store::{keys, KeyPrefix, KvStore};
use cvm_trust::{TrustEdge, TrustGraph, WalletClusterer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Maximum ring size explored by the cycle search
pub const CYCLE_SEARCH_DEPTH: usize = 6;

/// Incoming edges needed before pattern statistics are meaningful
const MIN_EDGES_FOR_PATTERN: usize = 3;

/// Sliding window for the coordinated-boost grouping, in seconds
const COORDINATED_TIME_WINDOW: u64 = 3600;

// Per-pattern detection thresholds
const ARTIFICIAL_PATH_THRESHOLD: f64 = 0.60;
const RAPID_ACCUMULATION_THRESHOLD: f64 = 0.50;
const COORDINATED_BOOST_THRESHOLD: f64 = 0.30;
const SYBIL_DENSITY_THRESHOLD: f64 = 0.30;
const TRUST_WASHING_THRESHOLD: f64 = 0.50;
const RECIPROCAL_ABUSE_THRESHOLD: f64 = 0.30;

// Rapid-accumulation rate ceilings
const SUSPICIOUS_EDGES_PER_HOUR: f64 = 5.0;
const SUSPICIOUS_WEIGHT_PER_HOUR: f64 = 200.0;

// Genuine-history predicate
const GENUINE_MIN_AGE_SECS: u64 = 7 * 86_400;
const GENUINE_MIN_ACTIVITY: u64 = 5;
const GENUINE_MIN_COUNTERPARTIES: u32 = 3;

/// Trust-graph manipulation patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManipulationKind {
    ArtificialPathCreation,
    CircularTrustRing,
    RapidTrustAccumulation,
    CoordinatedTrustBoost,
    SybilTrustNetwork,
    TrustWashing,
    ReciprocalTrustAbuse,
}

/// One detected manipulation pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustManipulationResult {
    pub kind: ManipulationKind,
    pub confidence: f64,
    pub involved_addresses: Vec<Address>,
    pub suspicious_edges: Vec<TrustEdge>,
    pub description: String,
    pub escalate_to_dao: bool,
}

/// Persisted flag for an address caught manipulating the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManipulationFlag {
    pub kind: ManipulationKind,
    pub confidence: f64,
    pub timestamp: Timestamp,
}

/// Read-only miner for trust-graph manipulation patterns
///
/// Penalties are never applied here; findings flow out as flags, alerts
/// and DAO escalations.
pub struct TrustGraphManipulationDetector {
    store: Arc<KvStore>,
}

impl TrustGraphManipulationDetector {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// Run every pattern against one address
    pub fn analyze_address(
        &self,
        graph: &TrustGraph,
        clusterer: &WalletClusterer,
        address: &Address,
        now: Timestamp,
    ) -> DetectorResult<Vec<TrustManipulationResult>> {
        let mut findings = Vec::new();

        if let Some(r) = self.detect_artificial_path_creation(graph, address, now)? {
            findings.push(r);
        }
        if let Some(r) = self.detect_circular_trust_ring(graph, address, CYCLE_SEARCH_DEPTH)? {
            findings.push(r);
        }
        if let Some(r) = self.detect_rapid_accumulation(graph, address, COORDINATED_TIME_WINDOW, now)? {
            findings.push(r);
        }
        if let Some(r) = self.detect_coordinated_boost(graph, clusterer, address)? {
            findings.push(r);
        }
        if let Some(r) = self.detect_sybil_trust_network(graph, clusterer, address)? {
            findings.push(r);
        }
        if let Some(r) = self.detect_trust_washing(graph, address)? {
            findings.push(r);
        }
        if let Some(r) = self.detect_reciprocal_abuse(graph, address)? {
            findings.push(r);
        }

        for finding in &findings {
            self.flag_address(address, finding, now)?;
            tracing::warn!(
                address = %address,
                kind = ?finding.kind,
                confidence = finding.confidence,
                "Trust-graph manipulation detected"
            );
        }

        Ok(findings)
    }

    /// Artificial path creation: clustered-in-time, similar-weight edges
    /// from sources without genuine history
    pub fn detect_artificial_path_creation(
        &self,
        graph: &TrustGraph,
        target: &Address,
        _now: Timestamp,
    ) -> DetectorResult<Option<TrustManipulationResult>> {
        let incoming = graph.incoming_edges(target)?;
        if incoming.len() < MIN_EDGES_FOR_PATTERN {
            return Ok(None);
        }

        let time_clustering = Self::time_clustering_score(&incoming);
        let weight_similarity = Self::weight_similarity_score(&incoming);

        let mut suspicious_sources = Vec::new();
        for edge in &incoming {
            if !self.has_genuine_history(&edge.from)? {
                suspicious_sources.push(edge.from);
            }
        }
        let suspicious_ratio = suspicious_sources.len() as f64 / incoming.len() as f64;

        let confidence = time_clustering * 0.3 + weight_similarity * 0.3 + suspicious_ratio * 0.4;
        if confidence < ARTIFICIAL_PATH_THRESHOLD {
            return Ok(None);
        }

        let suspicious_edges: Vec<TrustEdge> = incoming
            .iter()
            .filter(|e| suspicious_sources.contains(&e.from))
            .cloned()
            .collect();
        let mut involved = suspicious_sources;
        involved.push(*target);

        Ok(Some(TrustManipulationResult {
            kind: ManipulationKind::ArtificialPathCreation,
            confidence,
            description: format!(
                "Artificial trust paths: {} suspicious sources, time clustering {:.0}%, weight similarity {:.0}%",
                suspicious_edges.len(),
                time_clustering * 100.0,
                weight_similarity * 100.0
            ),
            involved_addresses: involved,
            suspicious_edges,
            escalate_to_dao: confidence >= 0.80,
        }))
    }

    /// Circular trust ring: a directed cycle returning to the origin
    pub fn detect_circular_trust_ring(
        &self,
        graph: &TrustGraph,
        origin: &Address,
        max_ring_size: usize,
    ) -> DetectorResult<Option<TrustManipulationResult>> {
        let mut path = vec![*origin];
        let mut visited = HashSet::new();
        visited.insert(*origin);

        if !self.find_circular_path(graph, origin, origin, &mut path, &mut visited, max_ring_size)? {
            return Ok(None);
        }

        let mut suspicious_edges = Vec::new();
        for i in 0..path.len() {
            let next = path[(i + 1) % path.len()];
            if let Some(edge) = graph.get_edge(&path[i], &next)? {
                suspicious_edges.push(edge);
            }
        }

        let confidence = 0.60 + 0.30 * (1.0 - path.len() as f64 / max_ring_size as f64);
        Ok(Some(TrustManipulationResult {
            kind: ManipulationKind::CircularTrustRing,
            confidence,
            description: format!("Circular trust ring with {} addresses", path.len()),
            involved_addresses: path,
            suspicious_edges,
            escalate_to_dao: true,
        }))
    }

    fn find_circular_path(
        &self,
        graph: &TrustGraph,
        current: &Address,
        origin: &Address,
        path: &mut Vec<Address>,
        visited: &mut HashSet<Address>,
        max_depth: usize,
    ) -> DetectorResult<bool> {
        if path.len() > max_depth {
            return Ok(false);
        }

        for edge in graph.outgoing_edges(current)? {
            if edge.weight <= 0 || edge.slashed {
                continue;
            }
            if &edge.to == origin && path.len() >= 2 {
                return Ok(true);
            }
            if visited.contains(&edge.to) {
                continue;
            }

            visited.insert(edge.to);
            path.push(edge.to);
            if self.find_circular_path(graph, &edge.to, origin, path, visited, max_depth)? {
                return Ok(true);
            }
            path.pop();
            visited.remove(&edge.to);
        }

        Ok(false)
    }

    /// Rapid accumulation: edge or weight inflow rate beyond the ceilings
    pub fn detect_rapid_accumulation(
        &self,
        graph: &TrustGraph,
        target: &Address,
        time_window: u64,
        now: Timestamp,
    ) -> DetectorResult<Option<TrustManipulationResult>> {
        let incoming = graph.incoming_edges(target)?;
        if incoming.is_empty() {
            return Ok(None);
        }

        let window_start = now.saturating_sub(time_window);
        let recent: Vec<&TrustEdge> = incoming.iter().filter(|e| e.timestamp >= window_start).collect();
        let total_weight: i64 = recent.iter().map(|e| e.weight as i64).sum();

        let hours = time_window as f64 / 3600.0;
        let edges_per_hour = recent.len() as f64 / hours;
        let weight_per_hour = total_weight as f64 / hours;

        let edge_score = (edges_per_hour / SUSPICIOUS_EDGES_PER_HOUR).min(1.0);
        let weight_score = (weight_per_hour / SUSPICIOUS_WEIGHT_PER_HOUR).min(1.0);
        let confidence = edge_score * 0.5 + weight_score * 0.5;

        if confidence < RAPID_ACCUMULATION_THRESHOLD {
            return Ok(None);
        }

        let mut involved = vec![*target];
        involved.extend(recent.iter().map(|e| e.from));

        Ok(Some(TrustManipulationResult {
            kind: ManipulationKind::RapidTrustAccumulation,
            confidence,
            description: format!(
                "Rapid trust accumulation: {} edges, total weight {} within {}h",
                recent.len(),
                total_weight,
                time_window / 3600
            ),
            involved_addresses: involved,
            suspicious_edges: recent.into_iter().cloned().collect(),
            escalate_to_dao: confidence >= 0.90,
        }))
    }

    /// Coordinated boost: several edges landing in one sliding window with
    /// cluster-linked sources
    pub fn detect_coordinated_boost(
        &self,
        graph: &TrustGraph,
        clusterer: &WalletClusterer,
        target: &Address,
    ) -> DetectorResult<Option<TrustManipulationResult>> {
        let incoming = graph.incoming_edges(target)?;
        if incoming.len() < MIN_EDGES_FOR_PATTERN {
            return Ok(None);
        }

        let mut groups: std::collections::BTreeMap<u64, Vec<&TrustEdge>> = Default::default();
        for edge in &incoming {
            groups.entry(edge.timestamp / COORDINATED_TIME_WINDOW).or_default().push(edge);
        }

        let mut suspicious_edges: Vec<TrustEdge> = Vec::new();
        let mut suspicious_sources: BTreeSet<Address> = BTreeSet::new();

        for group in groups.values().filter(|g| g.len() >= 3) {
            let mut cluster_pairs = 0usize;
            let mut total_pairs = 0usize;
            for i in 0..group.len() {
                for j in (i + 1)..group.len() {
                    total_pairs += 1;
                    if clusterer.cluster_of(&group[i].from) == clusterer.cluster_of(&group[j].from) {
                        cluster_pairs += 1;
                    }
                }
            }
            let cluster_ratio = cluster_pairs as f64 / total_pairs as f64;

            if cluster_ratio >= 0.30 || group.len() >= 5 {
                for edge in group {
                    suspicious_edges.push((*edge).clone());
                    suspicious_sources.insert(edge.from);
                }
            }
        }

        if suspicious_edges.is_empty() {
            return Ok(None);
        }
        let confidence = (suspicious_edges.len() as f64 / 10.0).min(1.0);
        if confidence < COORDINATED_BOOST_THRESHOLD {
            return Ok(None);
        }

        let mut involved = vec![*target];
        involved.extend(suspicious_sources.iter().copied());

        Ok(Some(TrustManipulationResult {
            kind: ManipulationKind::CoordinatedTrustBoost,
            confidence,
            description: format!(
                "Coordinated trust boost: {} edges from {} addresses",
                suspicious_edges.len(),
                suspicious_sources.len()
            ),
            involved_addresses: involved,
            suspicious_edges,
            escalate_to_dao: confidence >= 0.85,
        }))
    }

    /// Intra-cluster Sybil: dense trust inside one wallet cluster
    pub fn detect_sybil_trust_network(
        &self,
        graph: &TrustGraph,
        clusterer: &WalletClusterer,
        address: &Address,
    ) -> DetectorResult<Option<TrustManipulationResult>> {
        let cluster = clusterer.members_of(address);
        if cluster.len() <= 1 {
            return Ok(None);
        }

        let mut intra_edges = Vec::new();
        for a in &cluster {
            for b in &cluster {
                if a != b {
                    if let Some(edge) = graph.get_edge(a, b)? {
                        intra_edges.push(edge);
                    }
                }
            }
        }

        let max_possible = cluster.len() * (cluster.len() - 1);
        let density = intra_edges.len() as f64 / max_possible as f64;
        if density < SYBIL_DENSITY_THRESHOLD || intra_edges.len() < 3 {
            return Ok(None);
        }

        Ok(Some(TrustManipulationResult {
            kind: ManipulationKind::SybilTrustNetwork,
            confidence: (density + 0.50).min(1.0),
            description: format!(
                "Sybil trust network: {} addresses, {} intra-cluster edges, density {:.0}%",
                cluster.len(),
                intra_edges.len(),
                density * 100.0
            ),
            involved_addresses: cluster.into_iter().collect(),
            suspicious_edges: intra_edges,
            escalate_to_dao: true,
        }))
    }

    /// Trust washing: an intermediary received trust and re-emitted it to
    /// the target within 24 hours of its own creation
    pub fn detect_trust_washing(
        &self,
        graph: &TrustGraph,
        target: &Address,
    ) -> DetectorResult<Option<TrustManipulationResult>> {
        let incoming = graph.incoming_edges(target)?;
        if incoming.is_empty() {
            return Ok(None);
        }

        let mut suspicious_edges = Vec::new();
        let mut intermediaries = BTreeSet::new();

        for edge in &incoming {
            let source_metrics = AddressMetrics::load(&self.store, &edge.from)?;
            let source_created = source_metrics.temporal.first_seen;
            if source_created == 0 || edge.timestamp.saturating_sub(source_created) >= 86_400 {
                continue;
            }
            // Fresh source that itself holds incoming trust: a pass-through
            if !graph.incoming_edges(&edge.from)?.is_empty() {
                suspicious_edges.push(edge.clone());
                intermediaries.insert(edge.from);
            }
        }

        if suspicious_edges.is_empty() {
            return Ok(None);
        }
        // Even a single pass-through is suspicious; more raise confidence
        let confidence = (suspicious_edges.len() as f64 / 5.0).max(TRUST_WASHING_THRESHOLD).min(1.0);

        let mut involved = vec![*target];
        involved.extend(intermediaries.iter().copied());

        Ok(Some(TrustManipulationResult {
            kind: ManipulationKind::TrustWashing,
            confidence,
            description: format!("Trust washing through {} intermediary addresses", intermediaries.len()),
            involved_addresses: involved,
            suspicious_edges,
            escalate_to_dao: confidence >= 0.85,
        }))
    }

    /// Reciprocal abuse: mirror-image edge pairs between low-activity peers
    pub fn detect_reciprocal_abuse(
        &self,
        graph: &TrustGraph,
        address: &Address,
    ) -> DetectorResult<Option<TrustManipulationResult>> {
        let outgoing = graph.outgoing_edges(address)?;
        let mut pairs = Vec::new();

        for out_edge in &outgoing {
            let Some(in_edge) = graph.get_edge(&out_edge.to, address)? else {
                continue;
            };

            let weight_diff = (out_edge.weight as i16 - in_edge.weight as i16).abs();
            let time_diff = out_edge.timestamp.abs_diff(in_edge.timestamp);
            let counterparty = AddressMetrics::load(&self.store, &out_edge.to)?;
            let low_activity = counterparty.behavior.total_trades < 10;

            if weight_diff <= 10 && time_diff <= 3600 && low_activity {
                pairs.push((out_edge.clone(), in_edge));
            }
        }

        if pairs.is_empty() {
            return Ok(None);
        }
        let confidence = (pairs.len() as f64 / 3.0).min(1.0);
        if confidence < RECIPROCAL_ABUSE_THRESHOLD {
            return Ok(None);
        }

        let mut involved = vec![*address];
        let mut suspicious_edges = Vec::new();
        for (out_edge, in_edge) in pairs {
            involved.push(out_edge.to);
            suspicious_edges.push(out_edge);
            suspicious_edges.push(in_edge);
        }

        Ok(Some(TrustManipulationResult {
            kind: ManipulationKind::ReciprocalTrustAbuse,
            confidence,
            description: format!("Reciprocal trust abuse: {} suspicious pairs", suspicious_edges.len() / 2),
            involved_addresses: involved,
            suspicious_edges,
            escalate_to_dao: confidence >= 0.80,
        }))
    }

    /// Health of the trust neighbourhood around one address, in [0, 100]
    pub fn health_score(
        &self,
        graph: &TrustGraph,
        clusterer: &WalletClusterer,
        address: &Address,
        now: Timestamp,
    ) -> DetectorResult<i16> {
        let findings = self.analyze_address(graph, clusterer, address, now)?;

        let mut score = 100.0;
        for finding in &findings {
            let deduction = match finding.kind {
                ManipulationKind::ArtificialPathCreation => 20.0,
                ManipulationKind::CircularTrustRing => 25.0,
                ManipulationKind::RapidTrustAccumulation => 15.0,
                ManipulationKind::CoordinatedTrustBoost => 20.0,
                ManipulationKind::SybilTrustNetwork => 25.0,
                ManipulationKind::TrustWashing => 15.0,
                ManipulationKind::ReciprocalTrustAbuse => 10.0,
            };
            score -= deduction * finding.confidence;
        }

        Ok(score.clamp(0.0, 100.0) as i16)
    }

    // Pattern statistics

    /// 1.0 when inter-arrival times are tightly clustered, 0.0 when spread
    fn time_clustering_score(edges: &[TrustEdge]) -> f64 {
        if edges.len() < 2 {
            return 0.0;
        }
        let mut times: Vec<u64> = edges.iter().map(|e| e.timestamp).collect();
        times.sort_unstable();

        let gaps: Vec<f64> = times.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
        let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
        if mean <= 0.0 {
            return 1.0; // all in the same second
        }
        let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
        let cv = variance.sqrt() / mean;

        (1.0 - cv).clamp(0.0, 1.0)
    }

    /// 1.0 when edge weights are nearly identical, 0.0 when spread
    fn weight_similarity_score(edges: &[TrustEdge]) -> f64 {
        if edges.len() < 2 {
            return 0.0;
        }
        let weights: Vec<f64> = edges.iter().map(|e| e.weight as f64).collect();
        let mean = weights.iter().sum::<f64>() / weights.len() as f64;
        let variance = weights.iter().map(|w| (w - mean).powi(2)).sum::<f64>() / weights.len() as f64;

        // Full similarity at zero spread, none at a 30-point spread
        (1.0 - variance.sqrt() / 30.0).clamp(0.0, 1.0)
    }

    /// Age, activity and counterparty spread say this address is real
    fn has_genuine_history(&self, address: &Address) -> DetectorResult<bool> {
        let metrics = AddressMetrics::load(&self.store, address)?;
        if metrics.temporal.first_seen == 0 {
            return Ok(false);
        }
        let age = metrics.temporal.last_activity.saturating_sub(metrics.temporal.first_seen);

        Ok(age >= GENUINE_MIN_AGE_SECS
            && metrics.behavior.total_trades >= GENUINE_MIN_ACTIVITY
            && metrics.behavior.unique_partners >= GENUINE_MIN_COUNTERPARTIES)
    }

    // Flag persistence

    pub fn flag_address(
        &self,
        address: &Address,
        finding: &TrustManipulationResult,
        now: Timestamp,
    ) -> DetectorResult<()> {
        let flag = ManipulationFlag {
            kind: finding.kind,
            confidence: finding.confidence,
            timestamp: now,
        };
        self.store.put(&keys::manipulation_flag_key(address), &flag)?;
        Ok(())
    }

    pub fn is_flagged(&self, address: &Address) -> DetectorResult<bool> {
        Ok(self.store.exists(&keys::manipulation_flag_key(address))?)
    }

    pub fn unflag_address(&self, address: &Address) -> DetectorResult<()> {
        self.store.delete(&keys::manipulation_flag_key(address))?;
        Ok(())
    }

    /// All flagged addresses (survives restart)
    pub fn flagged_addresses(&self) -> DetectorResult<Vec<Address>> {
        let prefix = KeyPrefix::ManipulationFlag.as_bytes();
        let mut flagged = Vec::new();
        for (key, _) in self.store.scan_prefix(prefix)? {
            if let Ok(address) = Address::from_slice(&key[prefix.len()..]) {
                flagged.push(address);
            }
        }
        Ok(flagged)
    }
}
