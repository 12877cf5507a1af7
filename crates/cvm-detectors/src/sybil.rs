// cvm-detectors/src/sybil.rs

use crate::alert::{AlertStore, AlertType, AnomalyAlert};
use crate::DetectorResult;
use cvm_consensus::{SetScreenResult, ValidatorSetScreen};
use cvm_crypto::{Address, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};

/// Minimum addresses (each with enough votes) before clustering is judged
const MIN_SYBIL_ADDRESSES: usize = 3;
const MIN_VOTES_PER_ADDRESS: u64 = 10;

/// Pairwise rate tolerance for "similar" voting patterns
const SIMILARITY_TOLERANCE: f64 = 0.1;

/// Fraction of similar pairs above which the group is a Sybil cluster
const SYBIL_PAIR_FRACTION: f64 = 0.80;

/// Diversity thresholds for a validator set
const MAX_SAME_SUBNET_FRACTION: f64 = 0.25;
const MAX_PEER_OVERLAP: f64 = 0.50;
const MIN_STAKE_SOURCES: usize = 3;
const MIN_NON_WOT_FRACTION: f64 = 0.40;

/// Per-address vote pattern summary
#[derive(Debug, Clone, Copy, Default)]
pub struct VotePattern {
    pub total_votes: u64,
    pub accepts: u64,
    pub rejects: u64,
}

impl VotePattern {
    fn accept_rate(&self) -> f64 {
        if self.total_votes == 0 {
            return 0.0;
        }
        self.accepts as f64 / self.total_votes as f64
    }

    fn reject_rate(&self) -> f64 {
        if self.total_votes == 0 {
            return 0.0;
        }
        self.rejects as f64 / self.total_votes as f64
    }

    fn similar_to(&self, other: &VotePattern) -> bool {
        (self.accept_rate() - other.accept_rate()).abs() <= SIMILARITY_TOLERANCE
            && (self.reject_rate() - other.reject_rate()).abs() <= SIMILARITY_TOLERANCE
    }
}

/// Finds address groups with suspiciously similar voting patterns
pub struct VotePatternSybilDetector {
    patterns: Mutex<HashMap<Address, VotePattern>>,
}

impl VotePatternSybilDetector {
    pub fn new() -> Self {
        Self { patterns: Mutex::new(HashMap::new()) }
    }

    pub fn record_vote(&self, address: Address, accepted: bool, rejected: bool) {
        let mut patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
        let pattern = patterns.entry(address).or_default();
        pattern.total_votes += 1;
        if accepted {
            pattern.accepts += 1;
        }
        if rejected {
            pattern.rejects += 1;
        }
    }

    /// Judge a group of addresses for vote-pattern similarity
    pub fn analyze_group(
        &self,
        alerts: &AlertStore,
        addresses: &[Address],
        now: Timestamp,
        block_height: u64,
    ) -> DetectorResult<Option<AnomalyAlert>> {
        let patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());

        let qualified: Vec<(Address, VotePattern)> = addresses
            .iter()
            .filter_map(|a| patterns.get(a).map(|p| (*a, *p)))
            .filter(|(_, p)| p.total_votes >= MIN_VOTES_PER_ADDRESS)
            .collect();

        if qualified.len() < MIN_SYBIL_ADDRESSES {
            return Ok(None);
        }

        let mut similar_pairs = 0usize;
        let mut total_pairs = 0usize;
        for i in 0..qualified.len() {
            for j in (i + 1)..qualified.len() {
                total_pairs += 1;
                if qualified[i].1.similar_to(&qualified[j].1) {
                    similar_pairs += 1;
                }
            }
        }

        let fraction = similar_pairs as f64 / total_pairs as f64;
        if fraction <= SYBIL_PAIR_FRACTION {
            return Ok(None);
        }

        let members: Vec<Address> = qualified.iter().map(|(a, _)| *a).collect();
        let alert = alerts.raise(
            AlertType::SybilCluster,
            members[0],
            members.clone(),
            fraction,
            fraction.clamp(0.5, 1.0),
            format!(
                "{similar_pairs}/{total_pairs} address pairs share a voting pattern",
            ),
            serde_json::json!({ "members": members.len(), "similar_fraction": fraction }),
            now,
            block_height,
        )?;
        Ok(Some(alert))
    }
}

impl Default for VotePatternSybilDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Network-topology facts about one validator
#[derive(Debug, Clone, Default)]
pub struct ValidatorNetworkInfo {
    /// First three octets of the validator's IPv4 address
    pub subnet: [u8; 3],
    pub peers: BTreeSet<Address>,
    pub stake_sources: BTreeSet<Address>,
    pub has_wot: bool,
}

/// Eclipse defense: vets a selected validator set for diversity
///
/// A set is diverse iff subnets are spread (<= 25% in one /24), pairwise
/// peer overlap stays under 50%, stake flows from at least three sources,
/// and at least 40% of the set has no WoT path to the sender.
pub struct ValidatorDiversityScreen {
    info: RwLock<HashMap<Address, ValidatorNetworkInfo>>,
}

impl ValidatorDiversityScreen {
    pub fn new() -> Self {
        Self { info: RwLock::new(HashMap::new()) }
    }

    pub fn update_network_info(&self, validator: Address, info: ValidatorNetworkInfo) {
        let mut map = self.info.write().unwrap_or_else(|e| e.into_inner());
        map.insert(validator, info);
    }

    fn peer_overlap(a: &BTreeSet<Address>, b: &BTreeSet<Address>) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let shared = a.intersection(b).count();
        shared as f64 / a.len().min(b.len()) as f64
    }

    /// Raise an eclipse alert for a failed set (S4 escalation path)
    pub fn raise_alert(
        &self,
        alerts: &AlertStore,
        verdict: &SetScreenResult,
        now: Timestamp,
        block_height: u64,
    ) -> DetectorResult<Option<AnomalyAlert>> {
        if verdict.diverse || verdict.suspicious.is_empty() {
            return Ok(None);
        }
        let alert = alerts.raise(
            AlertType::EclipseRisk,
            verdict.suspicious[0],
            verdict.suspicious.clone(),
            0.9,
            verdict.confidence,
            verdict.reason.clone(),
            serde_json::json!({ "suspicious": verdict.suspicious.len() }),
            now,
            block_height,
        )?;
        Ok(Some(alert))
    }
}

impl Default for ValidatorDiversityScreen {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidatorSetScreen for ValidatorDiversityScreen {
    fn check(&self, validators: &[Address]) -> SetScreenResult {
        if validators.is_empty() {
            return SetScreenResult { diverse: true, ..Default::default() };
        }
        let map = self.info.read().unwrap_or_else(|e| e.into_inner());

        // Subnet concentration
        let mut subnet_counts: HashMap<[u8; 3], Vec<Address>> = HashMap::new();
        for v in validators {
            if let Some(info) = map.get(v) {
                subnet_counts.entry(info.subnet).or_default().push(*v);
            }
        }
        if let Some((subnet, members)) = subnet_counts.iter().max_by_key(|(_, m)| m.len()) {
            let fraction = members.len() as f64 / validators.len() as f64;
            if fraction > MAX_SAME_SUBNET_FRACTION {
                return SetScreenResult {
                    diverse: false,
                    suspicious: members.clone(),
                    confidence: fraction.min(1.0),
                    reason: format!(
                        "{} of {} validators share subnet {}.{}.{}.0/24",
                        members.len(),
                        validators.len(),
                        subnet[0],
                        subnet[1],
                        subnet[2]
                    ),
                };
            }
        }

        // Pairwise peer-connection overlap
        for i in 0..validators.len() {
            for j in (i + 1)..validators.len() {
                let (Some(a), Some(b)) = (map.get(&validators[i]), map.get(&validators[j])) else {
                    continue;
                };
                let overlap = Self::peer_overlap(&a.peers, &b.peers);
                if overlap >= MAX_PEER_OVERLAP {
                    return SetScreenResult {
                        diverse: false,
                        suspicious: vec![validators[i], validators[j]],
                        confidence: overlap.min(1.0),
                        reason: format!("Peer overlap {overlap:.2} between two selected validators"),
                    };
                }
            }
        }

        // Stake-source spread
        let sources: BTreeSet<Address> = validators
            .iter()
            .filter_map(|v| map.get(v))
            .flat_map(|info| info.stake_sources.iter().copied())
            .collect();
        if !sources.is_empty() && sources.len() < MIN_STAKE_SOURCES {
            return SetScreenResult {
                diverse: false,
                suspicious: Vec::new(),
                confidence: 0.7,
                reason: format!("Only {} distinct stake sources across the set", sources.len()),
            };
        }

        // WoT-class spread: an all-WoT set can be steered by the graph
        let known_wot: Vec<bool> = validators
            .iter()
            .filter_map(|v| map.get(v).map(|i| i.has_wot))
            .collect();
        if !known_wot.is_empty() {
            let non_wot = known_wot.iter().filter(|w| !**w).count();
            let fraction = non_wot as f64 / known_wot.len() as f64;
            if fraction < MIN_NON_WOT_FRACTION {
                return SetScreenResult {
                    diverse: false,
                    suspicious: Vec::new(),
                    confidence: 0.6,
                    reason: format!("Only {:.0}% of the set is non-WoT", fraction * 100.0),
                };
            }
        }

        SetScreenResult { diverse: true, ..Default::default() }
    }
}
