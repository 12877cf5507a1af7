// cvm-hat/src/metrics.rs

use crate::HatResult;
use cvm_crypto::{Address, Amount, Hash256, Timestamp};
use cvm_store::{keys, KvStore};
use serde::{Deserialize, Serialize};

/// A fraud record reflected back into behavior evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudEvent {
    pub tx_hash: Hash256,
    pub penalty: u16,
    pub timestamp: Timestamp,
}

/// On-chain trading evidence for one address
///
/// Monotonic accumulators updated by confirmed blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorMetrics {
    pub total_trades: u64,
    pub successful_trades: u64,
    pub unique_partners: u32,
    pub total_volume: Amount,
    pub fraud_count: u32,
    pub fraud_history: Vec<FraudEvent>,
    /// Pattern-anomaly score in [0, 1] maintained by the detectors
    pub anomaly_score: f64,
}

impl BehaviorMetrics {
    pub fn record_trade(&mut self, partner_is_new: bool, volume: Amount, successful: bool) {
        self.total_trades += 1;
        if successful {
            self.successful_trades += 1;
        }
        if partner_is_new {
            self.unique_partners += 1;
        }
        self.total_volume = self.total_volume.saturating_add(volume);
    }

    pub fn add_fraud_record(&mut self, tx_hash: Hash256, penalty: u16, timestamp: Timestamp) {
        self.fraud_count += 1;
        self.fraud_history.push(FraudEvent { tx_hash, penalty, timestamp });
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.5; // no evidence either way
        }
        self.successful_trades as f64 / self.total_trades as f64
    }
}

/// Stake evidence for one address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeInfo {
    pub amount: Amount,
    pub stake_start: Timestamp,
    /// Lock commitment in seconds; rewarded linearly up to a cap
    pub min_lock_duration: u64,
}

impl StakeInfo {
    pub fn stake_age(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.stake_start)
    }
}

/// Activity timeline evidence for one address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalMetrics {
    pub first_seen: Timestamp,
    pub last_activity: Timestamp,
    /// Recent activity timestamps, oldest first, bounded window
    pub activity_times: Vec<Timestamp>,
}

/// Activity samples kept per address
const ACTIVITY_WINDOW: usize = 100;

impl TemporalMetrics {
    pub fn record_activity(&mut self, now: Timestamp) {
        if self.first_seen == 0 {
            self.first_seen = now;
        }
        self.last_activity = now;
        self.activity_times.push(now);
        if self.activity_times.len() > ACTIVITY_WINDOW {
            let excess = self.activity_times.len() - ACTIVITY_WINDOW;
            self.activity_times.drain(..excess);
        }
    }

    pub fn account_age(&self, now: Timestamp) -> u64 {
        if self.first_seen == 0 {
            return 0;
        }
        now.saturating_sub(self.first_seen)
    }
}

/// The per-address HAT input record persisted under the metrics prefix
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressMetrics {
    pub behavior: BehaviorMetrics,
    pub stake: StakeInfo,
    pub temporal: TemporalMetrics,
}

impl AddressMetrics {
    pub fn load(store: &KvStore, address: &Address) -> HatResult<Self> {
        Ok(store
            .get(&keys::hat_metrics_key(address))?
            .unwrap_or_default())
    }

    pub fn save(&self, store: &KvStore, address: &Address) -> HatResult<()> {
        store.put(&keys::hat_metrics_key(address), self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_store::KvStore;
    use tempfile::TempDir;

    #[test]
    fn test_success_rate_defaults_neutral() {
        let metrics = BehaviorMetrics::default();
        assert!((metrics.success_rate() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_record_trade_accumulates() {
        let mut metrics = BehaviorMetrics::default();
        metrics.record_trade(true, 1000, true);
        metrics.record_trade(false, 500, false);

        assert_eq!(metrics.total_trades, 2);
        assert_eq!(metrics.successful_trades, 1);
        assert_eq!(metrics.unique_partners, 1);
        assert_eq!(metrics.total_volume, 1500);
    }

    #[test]
    fn test_fraud_record_feedback() {
        let mut metrics = BehaviorMetrics::default();
        metrics.add_fraud_record(Hash256::new([1; 32]), 15, 1_700_000_000);

        assert_eq!(metrics.fraud_count, 1);
        assert_eq!(metrics.fraud_history.len(), 1);
        assert_eq!(metrics.fraud_history[0].penalty, 15);
    }

    #[test]
    fn test_activity_window_bounded() {
        let mut temporal = TemporalMetrics::default();
        for i in 0..150u64 {
            temporal.record_activity(1_000 + i);
        }
        assert_eq!(temporal.activity_times.len(), ACTIVITY_WINDOW);
        assert_eq!(temporal.first_seen, 1_000);
        assert_eq!(temporal.last_activity, 1_149);
    }

    #[test]
    fn test_metrics_roundtrip_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::open_at(temp_dir.path()).unwrap();
        let address = Address::new([5u8; 20]);

        let mut metrics = AddressMetrics::default();
        metrics.behavior.record_trade(true, 42, true);
        metrics.stake.amount = 7;
        metrics.save(&store, &address).unwrap();

        let loaded = AddressMetrics::load(&store, &address).unwrap();
        assert_eq!(loaded, metrics);

        // Missing address loads defaults
        let missing = AddressMetrics::load(&store, &Address::zero()).unwrap();
        assert_eq!(missing, AddressMetrics::default());
    }
}
