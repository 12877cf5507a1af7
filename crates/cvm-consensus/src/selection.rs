// cvm-consensus/src/selection.rs

use crate::types::ValidatorStats;
use crate::{ConsensusResult, MAX_VALIDATOR_TIMEOUTS, MIN_VALIDATORS};
use cvm_crypto::hash::HashWriter;
use cvm_crypto::{Address, Amount, Hash256, Timestamp, COIN};
use cvm_hat::AddressMetrics;
use cvm_store::{KeyPrefix, KvStore};
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use std::sync::Arc;

/// Eligibility thresholds for the validator pool
#[derive(Debug, Clone)]
pub struct EligibilityRequirements {
    /// Minimum stake in base units
    pub min_stake: Amount,
    /// Minimum validator reputation
    pub min_reputation: i16,
    /// Activity window in seconds (1000 blocks at ~150 s)
    pub activity_window_secs: u64,
    /// Timeout strikes before suspension
    pub max_timeouts: u32,
}

impl Default for EligibilityRequirements {
    fn default() -> Self {
        Self {
            min_stake: COIN,
            min_reputation: 70,
            activity_window_secs: 1000 * 150,
            max_timeouts: MAX_VALIDATOR_TIMEOUTS,
        }
    }
}

/// Verdict of an external validator-set screen (diversity / Sybil)
#[derive(Debug, Clone, Default)]
pub struct SetScreenResult {
    pub diverse: bool,
    /// Validators to strip from the set
    pub suspicious: Vec<Address>,
    pub confidence: f64,
    pub reason: String,
}

/// Seam for the eclipse/Sybil detectors to veto a selected set
///
/// The selection loop stays deterministic: the screen only looks at the
/// candidate set, and extension/stripping walks the already-shuffled pool.
pub trait ValidatorSetScreen {
    fn check(&self, validators: &[Address]) -> SetScreenResult;
}

/// Deterministic validator selection
///
/// The pool is shuffled by Fisher-Yates under a ChaCha20 stream seeded by
/// `H(tx_hash || block_hash || height)`, so two nodes with the same view
/// pick the same set.
pub struct ValidatorSelector {
    store: Arc<KvStore>,
    requirements: EligibilityRequirements,
}

impl ValidatorSelector {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self {
            store,
            requirements: EligibilityRequirements::default(),
        }
    }

    pub fn with_requirements(store: Arc<KvStore>, requirements: EligibilityRequirements) -> Self {
        Self { store, requirements }
    }

    /// `H(tx_hash || block_hash || height)`
    pub fn selection_seed(tx_hash: &Hash256, block_hash: &Hash256, height: u64) -> Hash256 {
        let mut writer = HashWriter::new();
        writer
            .write_bytes(tx_hash.as_bytes())
            .write_bytes(block_hash.as_bytes())
            .write_u64(height);
        writer.finalize()
    }

    /// Check one validator against the eligibility rules
    pub fn is_eligible(&self, stats: &ValidatorStats, now: Timestamp) -> ConsensusResult<bool> {
        if stats.validator_reputation < self.requirements.min_reputation {
            return Ok(false);
        }
        if stats.timeout_count >= self.requirements.max_timeouts {
            return Ok(false);
        }
        if stats.last_activity > 0
            && now.saturating_sub(stats.last_activity) > self.requirements.activity_window_secs
        {
            return Ok(false);
        }

        let metrics = AddressMetrics::load(&self.store, &stats.address)?;
        Ok(metrics.stake.amount >= self.requirements.min_stake)
    }

    /// All eligible validators, sorted by address for a view-independent
    /// shuffle base
    pub fn eligible_pool(&self, now: Timestamp) -> ConsensusResult<Vec<Address>> {
        let mut pool = Vec::new();
        let all: Vec<ValidatorStats> = self
            .store
            .scan_prefix_values(KeyPrefix::ValidatorStats.as_bytes())?;

        for stats in all {
            if self.is_eligible(&stats, now)? {
                pool.push(stats.address);
            }
        }
        pool.sort();
        Ok(pool)
    }

    fn shuffle(pool: &mut [Address], seed: &Hash256) {
        let mut rng = ChaCha20Rng::from_seed(seed.to_bytes());
        // Fisher-Yates under the deterministic stream
        for i in (1..pool.len()).rev() {
            let j = (rng.next_u64() % (i as u64 + 1)) as usize;
            pool.swap(i, j);
        }
    }

    /// Select validators for a transaction
    ///
    /// Takes the first `MIN_VALIDATORS` of the shuffled pool. When the
    /// screen reports the set as non-diverse, selection extends along the
    /// shuffled order up to `2 * MIN_VALIDATORS`; a suspicious subset is
    /// stripped and refilled from the remaining pool.
    pub fn select(
        &self,
        tx_hash: &Hash256,
        block_hash: &Hash256,
        height: u64,
        now: Timestamp,
        screen: Option<&dyn ValidatorSetScreen>,
    ) -> ConsensusResult<Vec<Address>> {
        let seed = Self::selection_seed(tx_hash, block_hash, height);
        let mut pool = self.eligible_pool(now)?;

        if pool.len() < MIN_VALIDATORS {
            tracing::warn!(
                pool = pool.len(),
                need = MIN_VALIDATORS,
                "Eligible validator pool below minimum"
            );
        }
        Self::shuffle(&mut pool, &seed);

        let take = MIN_VALIDATORS.min(pool.len());
        let mut selected: Vec<Address> = pool[..take].to_vec();

        let Some(screen) = screen else {
            return Ok(selected);
        };

        let mut verdict = screen.check(&selected);
        if !verdict.diverse {
            tracing::debug!(reason = %verdict.reason, "Validator set failed diversity, extending");
            let mut next = take;
            while next < pool.len() && selected.len() < 2 * MIN_VALIDATORS {
                selected.push(pool[next]);
                next += 1;
                verdict = screen.check(&selected);
                if verdict.diverse {
                    break;
                }
            }
        }

        if !verdict.suspicious.is_empty() {
            tracing::warn!(
                suspicious = verdict.suspicious.len(),
                confidence = verdict.confidence,
                reason = %verdict.reason,
                "Stripping suspicious validators from selection"
            );
            let mut clean: Vec<Address> = selected
                .iter()
                .filter(|v| !verdict.suspicious.contains(v))
                .copied()
                .collect();

            // Refill along the shuffled order
            for candidate in pool.iter() {
                if clean.len() >= MIN_VALIDATORS {
                    break;
                }
                if !clean.contains(candidate) && !verdict.suspicious.contains(candidate) {
                    clean.push(*candidate);
                }
            }
            selected = clean;
        }

        Ok(selected)
    }
}
