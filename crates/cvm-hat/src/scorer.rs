// cvm-hat/src/scorer.rs

use crate::metrics::{AddressMetrics, BehaviorMetrics, StakeInfo, TemporalMetrics};
use crate::{
    HatResult, NO_WOT_WEIGHT_BEHAVIOR, NO_WOT_WEIGHT_ECONOMIC, NO_WOT_WEIGHT_TEMPORAL,
    WEIGHT_BEHAVIOR, WEIGHT_ECONOMIC, WEIGHT_TEMPORAL, WEIGHT_WOT, WOT_CENTRALITY_THRESHOLD,
    WOT_CLUSTER_PENALTY_THRESHOLD,
};
use cvm_crypto::{Address, Timestamp, COIN};
use cvm_store::{keys, KvStore};
use cvm_trust::{TrustGraph, WalletClusterer, WOT_MAX_DEPTH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A complete HAT v2 score with component breakdown
///
/// Validators compare their calculated scores against sender-declared ones
/// component by component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HatV2Score {
    pub address: Address,
    /// Final trust score in [0, 100]
    pub final_score: i16,
    pub timestamp: Timestamp,

    // Component scores, each in [0, 1]
    pub behavior: f64,
    pub wot: f64,
    pub economic: f64,
    pub temporal: f64,

    pub has_wot: bool,
    pub wot_path_count: u32,
    pub wot_path_strength: f64,
}

impl Default for HatV2Score {
    fn default() -> Self {
        Self {
            address: Address::zero(),
            final_score: 0,
            timestamp: 0,
            behavior: 0.0,
            wot: 0.0,
            economic: 0.0,
            temporal: 0.0,
            has_wot: false,
            wot_path_count: 0,
            wot_path_strength: 0.0,
        }
    }
}

/// Raw component view exposed for contract-level auditing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustBreakdown {
    pub behavior: f64,
    pub wot: Option<f64>,
    pub economic: f64,
    pub temporal: f64,
    pub final_score: i16,
    /// Accumulated penalty points applied at read time
    pub penalty_applied: u16,
}

// Behavior shape parameters
const DIVERSITY_SATURATION: f64 = 20.0;
const VOLUME_SATURATION_COINS: f64 = 100.0;
const FRAUD_DECAY: f64 = 0.7;

// Economic shape parameters
const STAKE_MIDPOINT_COINS: f64 = 50.0;
const STAKE_SLOPE_COINS: f64 = 20.0;
const LOCK_CAP_SECS: f64 = 90.0 * 86_400.0;

// Temporal shape parameters
const AGE_SATURATION_SECS: f64 = 180.0 * 86_400.0;
const IDLE_GAP_SECS: u64 = 30 * 86_400;

/// Diminishing-returns factor applied to successive WoT paths
const PATH_DECAY: f64 = 0.5;
const WOT_CLUSTER_PENALTY: f64 = 0.7;
const WOT_CENTRALITY_BONUS: f64 = 0.10;

/// The HAT v2 scoring engine
///
/// Holds no mutable state of its own; every evaluation is a pure function
/// of the store snapshot and the provided clock, so repeated evaluations
/// agree exactly.
pub struct SecureHat {
    store: Arc<KvStore>,
}

impl SecureHat {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// Behavior component: success rate, partner diversity, volume, with
    /// multiplicative penalties for fraud history and pattern anomalies
    pub fn behavior_component(metrics: &BehaviorMetrics) -> f64 {
        let diversity = (metrics.unique_partners as f64 / DIVERSITY_SATURATION).min(1.0);
        let volume = (metrics.total_volume as f64 / (VOLUME_SATURATION_COINS * COIN as f64)).min(1.0);

        let base = 0.5 * metrics.success_rate() + 0.3 * diversity + 0.2 * volume;
        let fraud_factor = FRAUD_DECAY.powi(metrics.fraud_count as i32);
        let anomaly_factor = 1.0 - 0.5 * metrics.anomaly_score.clamp(0.0, 1.0);

        (base * fraud_factor * anomaly_factor).clamp(0.0, 1.0)
    }

    /// Economic component: logistic of stake, scaled by a monotone
    /// stake-age factor (lock commitment rewarded linearly up to a cap)
    pub fn economic_component(stake: &StakeInfo, now: Timestamp) -> f64 {
        let coins = stake.amount as f64 / COIN as f64;
        let logistic = 1.0 / (1.0 + (-(coins - STAKE_MIDPOINT_COINS) / STAKE_SLOPE_COINS).exp());

        let committed = stake.stake_age(now).saturating_add(stake.min_lock_duration) as f64;
        let age_factor = 0.5 + 0.5 * (committed / LOCK_CAP_SECS).min(1.0);

        (logistic * age_factor).clamp(0.0, 1.0)
    }

    /// Temporal component: account age and activity regularity; long idle
    /// gaps and bursty clustered-in-time activity are penalized
    pub fn temporal_component(temporal: &TemporalMetrics, now: Timestamp) -> f64 {
        let age_score = (temporal.account_age(now) as f64 / AGE_SATURATION_SECS).min(1.0);

        let regularity = if temporal.activity_times.len() < 3 {
            0.5 // too little evidence to judge rhythm
        } else {
            let gaps: Vec<f64> = temporal
                .activity_times
                .windows(2)
                .map(|w| w[1].saturating_sub(w[0]) as f64)
                .collect();
            let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
            let mut score = if mean > 0.0 {
                let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
                let cv = variance.sqrt() / mean;
                if cv > 1.0 {
                    (1.0 / cv).min(1.0)
                } else {
                    1.0
                }
            } else {
                // All samples in the same second: maximally bursty
                0.2
            };

            let max_gap = gaps.iter().cloned().fold(0.0f64, f64::max);
            if max_gap > IDLE_GAP_SECS as f64 {
                score *= 0.5;
            }
            score
        };

        (0.6 * age_score + 0.4 * regularity).clamp(0.0, 1.0)
    }

    /// Web-of-trust component for a viewer, or `None` without any path
    ///
    /// Paths aggregate under a diminishing-returns curve; a cluster penalty
    /// applies when too many paths arrive through one wallet cluster and a
    /// centrality bonus rewards diverse trusters.
    pub fn wot_component(
        &self,
        graph: &TrustGraph,
        clusterer: &WalletClusterer,
        viewer: &Address,
        target: &Address,
    ) -> HatResult<Option<(f64, u32, f64)>> {
        let mut paths = graph.find_trust_paths(viewer, target, WOT_MAX_DEPTH)?;
        if paths.is_empty() {
            return Ok(None);
        }

        paths.sort_by(|a, b| b.strength.partial_cmp(&a.strength).unwrap_or(std::cmp::Ordering::Equal));

        let mut score = 0.0;
        for (i, path) in paths.iter().enumerate() {
            score += path.strength * PATH_DECAY.powi(i as i32);
        }
        score = score.min(1.0);

        // Truster = the hop that vouches for the target directly
        let trusters: Vec<Address> = paths
            .iter()
            .map(|p| p.hops[p.hops.len() - 2])
            .collect();

        let mut per_cluster: BTreeMap<Address, usize> = BTreeMap::new();
        for truster in &trusters {
            *per_cluster.entry(clusterer.cluster_of(truster)).or_insert(0) += 1;
        }
        if per_cluster.values().any(|&n| n >= WOT_CLUSTER_PENALTY_THRESHOLD) {
            score *= WOT_CLUSTER_PENALTY;
        }

        let distinct_trusters: std::collections::BTreeSet<&Address> = trusters.iter().collect();
        if distinct_trusters.len() >= WOT_CENTRALITY_THRESHOLD {
            score = (score + WOT_CENTRALITY_BONUS).min(1.0);
        }

        let avg_strength = paths.iter().map(|p| p.strength).sum::<f64>() / paths.len() as f64;
        Ok(Some((score.clamp(0.0, 1.0), paths.len() as u32, avg_strength)))
    }

    /// Full evaluation for `(target, viewer)`
    pub fn calculate(
        &self,
        graph: &TrustGraph,
        clusterer: &WalletClusterer,
        target: &Address,
        viewer: &Address,
        now: Timestamp,
    ) -> HatResult<HatV2Score> {
        let metrics = AddressMetrics::load(&self.store, target)?;

        let behavior = Self::behavior_component(&metrics.behavior);
        let economic = Self::economic_component(&metrics.stake, now);
        let temporal = Self::temporal_component(&metrics.temporal, now);
        let wot = self.wot_component(graph, clusterer, viewer, target)?;

        let mut score = HatV2Score {
            address: *target,
            timestamp: now,
            behavior,
            economic,
            temporal,
            ..Default::default()
        };

        let raw = match wot {
            Some((wot_score, path_count, path_strength)) => {
                score.has_wot = true;
                score.wot = wot_score;
                score.wot_path_count = path_count;
                score.wot_path_strength = path_strength;
                WEIGHT_BEHAVIOR * behavior
                    + WEIGHT_WOT * wot_score
                    + WEIGHT_ECONOMIC * economic
                    + WEIGHT_TEMPORAL * temporal
            }
            None => {
                NO_WOT_WEIGHT_BEHAVIOR * behavior
                    + NO_WOT_WEIGHT_ECONOMIC * economic
                    + NO_WOT_WEIGHT_TEMPORAL * temporal
            }
        };

        score.final_score = self.apply_penalties(target, (raw * 100.0).round() as i16)?;

        tracing::debug!(
            target = %target, viewer = %viewer,
            final_score = score.final_score, has_wot = score.has_wot,
            "HAT v2 evaluated"
        );

        Ok(score)
    }

    /// Non-WoT evaluation for validators without any path to the target
    ///
    /// The WoT component is ignored entirely; the remaining components use
    /// the renormalized weight vector.
    pub fn calculate_non_wot(&self, target: &Address, now: Timestamp) -> HatResult<HatV2Score> {
        let metrics = AddressMetrics::load(&self.store, target)?;

        let behavior = Self::behavior_component(&metrics.behavior);
        let economic = Self::economic_component(&metrics.stake, now);
        let temporal = Self::temporal_component(&metrics.temporal, now);

        let raw = NO_WOT_WEIGHT_BEHAVIOR * behavior
            + NO_WOT_WEIGHT_ECONOMIC * economic
            + NO_WOT_WEIGHT_TEMPORAL * temporal;

        Ok(HatV2Score {
            address: *target,
            final_score: self.apply_penalties(target, (raw * 100.0).round() as i16)?,
            timestamp: now,
            behavior,
            economic,
            temporal,
            ..Default::default()
        })
    }

    /// Audit surface exposing raw components
    pub fn calculate_with_breakdown(
        &self,
        graph: &TrustGraph,
        clusterer: &WalletClusterer,
        target: &Address,
        viewer: &Address,
        now: Timestamp,
    ) -> HatResult<TrustBreakdown> {
        let score = self.calculate(graph, clusterer, target, viewer, now)?;
        Ok(TrustBreakdown {
            behavior: score.behavior,
            wot: score.has_wot.then_some(score.wot),
            economic: score.economic,
            temporal: score.temporal,
            final_score: score.final_score,
            penalty_applied: self.accumulated_penalty(target)?,
        })
    }

    /// Accumulated penalty points recorded against an address
    pub fn accumulated_penalty(&self, address: &Address) -> HatResult<u16> {
        Ok(self
            .store
            .get::<u16>(&keys::penalty_key(address))?
            .unwrap_or(0))
    }

    // Penalties live in their own log and are applied when scores are read;
    // no persisted reputation field is ever decremented in place.
    fn apply_penalties(&self, address: &Address, raw_final: i16) -> HatResult<i16> {
        let penalty = self.accumulated_penalty(address)? as i16;
        Ok((raw_final.clamp(0, 100) - penalty).clamp(0, 100))
    }

    /// Reflect a recorded fraud into the target's behavior evidence
    pub fn register_fraud(
        &self,
        address: &Address,
        tx_hash: cvm_crypto::Hash256,
        penalty: u16,
        timestamp: Timestamp,
    ) -> HatResult<()> {
        let mut metrics = AddressMetrics::load(&self.store, address)?;
        metrics.behavior.add_fraud_record(tx_hash, penalty, timestamp);
        metrics.save(&self.store, address)?;

        // Accumulate into the read-time penalty log
        let total = self.accumulated_penalty(address)?.saturating_add(penalty);
        self.store.put(&keys::penalty_key(address), &total)?;

        tracing::info!(address = %address, penalty, total, "Fraud reflected into behavior metrics");
        Ok(())
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_crypto::{Amount, Hash256};
    use cvm_trust::{BondedVote, MIN_BOND};
    use tempfile::TempDir;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn setup() -> (Arc<KvStore>, SecureHat, TrustGraph, WalletClusterer, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(KvStore::open_at(temp_dir.path()).unwrap());
        let hat = SecureHat::new(store.clone());
        let graph = TrustGraph::new(store.clone());
        (store, hat, graph, WalletClusterer::new(), temp_dir)
    }

    fn seed_metrics(store: &KvStore, address: &Address, now: Timestamp) {
        let mut metrics = AddressMetrics::default();
        for i in 0..20 {
            metrics.behavior.record_trade(i < 15, 10 * COIN, i % 10 != 0);
        }
        metrics.stake.amount = 60 * COIN;
        metrics.stake.stake_start = now - 40 * 86_400;
        metrics.stake.min_lock_duration = 30 * 86_400;
        metrics.temporal.first_seen = now - 200 * 86_400;
        for d in (0..30u64).rev() {
            metrics.temporal.record_activity(now - d * 86_400);
        }
        metrics.save(store, address).unwrap();
    }

    fn bonded(voter: Address, target: Address, value: i8, seed: u8) -> BondedVote {
        BondedVote {
            voter,
            target,
            value,
            bond: MIN_BOND.max(value.unsigned_abs() as Amount * cvm_trust::BOND_PER_POINT),
            timestamp: 1_700_000_000,
            tx: Hash256::new([seed; 32]),
        }
    }

    const NOW: Timestamp = 1_700_000_000;

    #[test]
    fn test_score_is_deterministic() {
        let (store, hat, graph, clusterer, _temp) = setup();
        seed_metrics(&store, &addr(2), NOW);
        graph.apply_bonded_vote(&bonded(addr(1), addr(2), 80, 1)).unwrap();

        let s1 = hat.calculate(&graph, &clusterer, &addr(2), &addr(1), NOW).unwrap();
        let s2 = hat.calculate(&graph, &clusterer, &addr(2), &addr(1), NOW).unwrap();
        let s3 = hat.calculate(&graph, &clusterer, &addr(2), &addr(1), NOW).unwrap();

        assert_eq!(s1.final_score, s2.final_score);
        assert_eq!(s2.final_score, s3.final_score);
        assert!((s1.behavior - s3.behavior).abs() < 1e-4);
        assert!((s1.wot - s3.wot).abs() < 1e-4);
        assert!((s1.economic - s3.economic).abs() < 1e-4);
        assert!((s1.temporal - s3.temporal).abs() < 1e-4);
    }

    #[test]
    fn test_wot_viewer_scores_with_four_components() {
        let (store, hat, graph, clusterer, _temp) = setup();
        seed_metrics(&store, &addr(2), NOW);
        graph.apply_bonded_vote(&bonded(addr(1), addr(2), 90, 1)).unwrap();

        let with_wot = hat.calculate(&graph, &clusterer, &addr(2), &addr(1), NOW).unwrap();
        assert!(with_wot.has_wot);
        assert!(with_wot.wot_path_count >= 1);
        assert!(with_wot.wot > 0.0);

        // A viewer with no path falls back to the renormalized vector
        let without = hat.calculate(&graph, &clusterer, &addr(2), &addr(9), NOW).unwrap();
        assert!(!without.has_wot);
        assert_eq!(without.wot_path_count, 0);

        let expected = NO_WOT_WEIGHT_BEHAVIOR * without.behavior
            + NO_WOT_WEIGHT_ECONOMIC * without.economic
            + NO_WOT_WEIGHT_TEMPORAL * without.temporal;
        assert_eq!(without.final_score, (expected * 100.0).round() as i16);
    }

    #[test]
    fn test_non_wot_matches_viewerless_evaluation() {
        let (store, hat, graph, clusterer, _temp) = setup();
        seed_metrics(&store, &addr(2), NOW);

        let viewerless = hat.calculate_non_wot(&addr(2), NOW).unwrap();
        let no_path = hat.calculate(&graph, &clusterer, &addr(2), &addr(9), NOW).unwrap();
        assert_eq!(viewerless.final_score, no_path.final_score);
    }

    #[test]
    fn test_fraud_penalty_is_multiplicative() {
        let mut metrics = BehaviorMetrics {
            total_trades: 100,
            successful_trades: 95,
            unique_partners: 25,
            total_volume: 200 * COIN,
            ..Default::default()
        };
        let clean = SecureHat::behavior_component(&metrics);

        metrics.fraud_count = 1;
        let one = SecureHat::behavior_component(&metrics);
        metrics.fraud_count = 2;
        let two = SecureHat::behavior_component(&metrics);

        assert!(one < clean);
        assert!(two < one);
        assert!((one / clean - FRAUD_DECAY).abs() < 1e-9);
    }

    #[test]
    fn test_economic_monotone_in_stake() {
        let now = NOW;
        let mut prev = -1.0;
        for coins in [0u64, 10, 50, 100, 500] {
            let stake = StakeInfo {
                amount: coins * COIN,
                stake_start: now - 86_400,
                min_lock_duration: 0,
            };
            let score = SecureHat::economic_component(&stake, now);
            assert!(score > prev, "economic must grow with stake");
            prev = score;
        }
    }

    #[test]
    fn test_temporal_penalizes_idle_gap() {
        let now = NOW;
        let mut regular = TemporalMetrics::default();
        regular.first_seen = now - 300 * 86_400;
        for d in (0..20u64).rev() {
            regular.record_activity(now - d * 86_400);
        }

        let mut idle = TemporalMetrics::default();
        idle.first_seen = now - 300 * 86_400;
        idle.record_activity(now - 200 * 86_400);
        idle.record_activity(now - 100 * 86_400); // 100-day gap
        idle.record_activity(now);

        assert!(
            SecureHat::temporal_component(&idle, now)
                < SecureHat::temporal_component(&regular, now)
        );
    }

    #[test]
    fn test_read_time_penalty_application() {
        let (store, hat, graph, clusterer, _temp) = setup();
        seed_metrics(&store, &addr(2), NOW);

        let before = hat.calculate(&graph, &clusterer, &addr(2), &addr(9), NOW).unwrap();
        hat.register_fraud(&addr(2), Hash256::new([7; 32]), 15, NOW).unwrap();
        let after = hat.calculate(&graph, &clusterer, &addr(2), &addr(9), NOW).unwrap();

        // Penalty log applies at read time and fraud also degrades behavior
        assert!(after.final_score <= before.final_score - 15);
        assert_eq!(hat.accumulated_penalty(&addr(2)).unwrap(), 15);
    }

    #[test]
    fn test_breakdown_exposes_components() {
        let (store, hat, graph, clusterer, _temp) = setup();
        seed_metrics(&store, &addr(2), NOW);
        graph.apply_bonded_vote(&bonded(addr(1), addr(2), 70, 1)).unwrap();

        let breakdown = hat
            .calculate_with_breakdown(&graph, &clusterer, &addr(2), &addr(1), NOW)
            .unwrap();
        assert!(breakdown.wot.is_some());
        assert!(breakdown.behavior > 0.0);
        assert_eq!(breakdown.penalty_applied, 0);
    }

    #[test]
    fn test_cluster_penalty_on_colluding_paths() {
        let (_store, hat, graph, mut clusterer, _temp) = setup();

        // Three trusters vouch for the target, all in one wallet cluster
        for (i, truster) in [addr(3), addr(4), addr(5)].iter().enumerate() {
            graph.apply_bonded_vote(&bonded(addr(1), *truster, 90, 10 + i as u8)).unwrap();
            graph.apply_bonded_vote(&bonded(*truster, addr(2), 90, 20 + i as u8)).unwrap();
        }

        let (diverse_score, _, _) = hat
            .wot_component(&graph, &clusterer, &addr(1), &addr(2))
            .unwrap()
            .unwrap();

        clusterer.observe_cospend(&[addr(3), addr(4), addr(5)]);
        let (clustered_score, _, _) = hat
            .wot_component(&graph, &clusterer, &addr(1), &addr(2))
            .unwrap()
            .unwrap();

        assert!(clustered_score < diverse_score);
    }

    #[test]
    fn test_final_score_bounds() {
        let (store, hat, graph, clusterer, _temp) = setup();

        // Empty evidence must stay within [0, 100]
        let empty = hat.calculate(&graph, &clusterer, &addr(8), &addr(9), NOW).unwrap();
        assert!((0..=100).contains(&empty.final_score));

        seed_metrics(&store, &addr(2), NOW);
        let seeded = hat.calculate(&graph, &clusterer, &addr(2), &addr(9), NOW).unwrap();
        assert!((0..=100).contains(&seeded.final_score));
    }
}
