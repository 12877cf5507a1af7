// cvm-consensus/src/fraud.rs

use crate::{ConsensusResult, FRAUD_CLUSTER_LIMIT, FRAUD_CLUSTER_WINDOW, FRAUD_MIN_DELTA};
use cvm_crypto::{Address, Amount, Hash256, Timestamp};
use cvm_envelope::{build_fraud_envelope, parse_fraud_envelope, ByteReader, ByteWriter, EnvelopeResult};
use cvm_hat::{AddressMetrics, HatV2Score, SecureHat};
use cvm_store::{keys, KeyPrefix, KvStore};
use cvm_trust::WalletClusterer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Permanent on-chain record of a reputation fraud attempt
///
/// Created only from a DAO-confirmed dispute outcome; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudRecord {
    pub tx_hash: Hash256,
    pub fraudster: Address,
    pub claimed: HatV2Score,
    pub actual: HatV2Score,
    pub score_difference: i16,
    pub timestamp: Timestamp,
    pub block_height: u64,

    pub reputation_penalty: u16,
    pub bond_slashed: Amount,
}

fn write_score(w: &mut ByteWriter, score: &HatV2Score) {
    w.write_address(&score.address)
        .write_u16(score.final_score as u16)
        .write_u64(score.timestamp)
        .write_u64(score.behavior.to_bits())
        .write_u64(score.wot.to_bits())
        .write_u64(score.economic.to_bits())
        .write_u64(score.temporal.to_bits())
        .write_u8(score.has_wot as u8)
        .write_u32(score.wot_path_count)
        .write_u64(score.wot_path_strength.to_bits());
}

fn read_score(r: &mut ByteReader<'_>) -> EnvelopeResult<HatV2Score> {
    Ok(HatV2Score {
        address: r.read_address()?,
        final_score: r.read_u16()? as i16,
        timestamp: r.read_u64()?,
        behavior: f64::from_bits(r.read_u64()?),
        wot: f64::from_bits(r.read_u64()?),
        economic: f64::from_bits(r.read_u64()?),
        temporal: f64::from_bits(r.read_u64()?),
        has_wot: r.read_u8()? != 0,
        wot_path_count: r.read_u32()?,
        wot_path_strength: f64::from_bits(r.read_u64()?),
    })
}

impl FraudRecord {
    /// Explicit-field-order encoding embedded in the FRAUD envelope
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_hash(&self.tx_hash).write_address(&self.fraudster);
        write_score(&mut w, &self.claimed);
        write_score(&mut w, &self.actual);
        w.write_u16(self.score_difference as u16)
            .write_u64(self.timestamp)
            .write_u64(self.block_height)
            .write_u16(self.reputation_penalty)
            .write_u64(self.bond_slashed);
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> EnvelopeResult<Self> {
        let mut r = ByteReader::new(data);
        Ok(Self {
            tx_hash: r.read_hash()?,
            fraudster: r.read_address()?,
            claimed: read_score(&mut r)?,
            actual: read_score(&mut r)?,
            score_difference: r.read_u16()? as i16,
            timestamp: r.read_u64()?,
            block_height: r.read_u64()?,
            reputation_penalty: r.read_u16()?,
            bond_slashed: r.read_u64()?,
        })
    }

    /// `"FRAUD" | version | record` bytes for the next block's OP_RETURN
    pub fn to_envelope(&self) -> Vec<u8> {
        build_fraud_envelope(&self.serialize())
    }
}

/// Penalty schedule by absolute score difference
///
/// Monotone in the delta on both axes.
pub fn penalty_for_delta(delta: i16) -> u16 {
    let delta = delta.unsigned_abs();
    if delta <= 10 {
        5
    } else if delta <= 30 {
        15
    } else {
        30
    }
}

/// Bond slash by absolute score difference, as a fraction of stake
pub fn slash_for_delta(delta: i16, stake: Amount) -> Amount {
    let delta = delta.unsigned_abs();
    if delta > 30 {
        stake / 10
    } else if delta > 10 {
        stake / 20
    } else {
        0
    }
}

/// Emits and extracts canonical fraud records
pub struct FraudRecorder {
    store: Arc<KvStore>,
}

impl FraudRecorder {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// Record a DAO-confirmed fraud attempt
    ///
    /// Gates before recording:
    /// - deltas under `FRAUD_MIN_DELTA` are measurement variance, dropped;
    /// - a cluster that produced more than `FRAUD_CLUSTER_LIMIT` records in
    ///   the last `FRAUD_CLUSTER_WINDOW` blocks goes to DAO manual review
    ///   instead, blunting coordinated false-accusation attacks.
    ///
    /// Returns the record, or `None` when a gate held it back.
    #[allow(clippy::too_many_arguments)]
    pub fn record_fraud(
        &self,
        hat: &SecureHat,
        clusterer: &WalletClusterer,
        fraudster: &Address,
        tx_hash: &Hash256,
        claimed: &HatV2Score,
        actual: &HatV2Score,
        block_height: u64,
        now: Timestamp,
    ) -> ConsensusResult<Option<FraudRecord>> {
        let score_difference = claimed.final_score - actual.final_score;
        if score_difference.abs() < FRAUD_MIN_DELTA {
            tracing::debug!(
                delta = score_difference,
                "Score difference below fraud threshold, treating as variance"
            );
            return Ok(None);
        }

        let cluster = clusterer.members_of(fraudster);
        if cluster.len() > 1 {
            let recent = self.count_recent_frauds(&cluster, block_height, FRAUD_CLUSTER_WINDOW)?;
            if recent > FRAUD_CLUSTER_LIMIT {
                tracing::warn!(
                    fraudster = %fraudster,
                    cluster_size = cluster.len(),
                    recent_records = recent,
                    "Cluster fraud volume suggests coordinated accusations, escalating to DAO"
                );
                return Ok(None);
            }
        }

        let stake = AddressMetrics::load(&self.store, fraudster)?.stake.amount;
        let record = FraudRecord {
            tx_hash: *tx_hash,
            fraudster: *fraudster,
            claimed: claimed.clone(),
            actual: actual.clone(),
            score_difference,
            timestamp: now,
            block_height,
            reputation_penalty: penalty_for_delta(score_difference),
            bond_slashed: slash_for_delta(score_difference, stake),
        };

        self.store.put(&keys::fraud_record_key(tx_hash), &record)?;

        // Feed the fraud back into behavior evidence and the penalty log
        hat.register_fraud(fraudster, *tx_hash, record.reputation_penalty, now)?;

        tracing::info!(
            fraudster = %fraudster, delta = score_difference,
            penalty = record.reputation_penalty, slashed = record.bond_slashed,
            "Fraud attempt recorded"
        );

        Ok(Some(record))
    }

    pub fn get_record(&self, tx_hash: &Hash256) -> ConsensusResult<Option<FraudRecord>> {
        Ok(self.store.get(&keys::fraud_record_key(tx_hash))?)
    }

    /// Count persisted fraud records against any of `addresses` within the
    /// trailing block window
    pub fn count_recent_frauds(
        &self,
        addresses: &std::collections::BTreeSet<Address>,
        current_height: u64,
        window: u64,
    ) -> ConsensusResult<u64> {
        let floor = current_height.saturating_sub(window);
        let records: Vec<FraudRecord> = self
            .store
            .scan_prefix_values(KeyPrefix::FraudRecord.as_bytes())?;

        Ok(records
            .iter()
            .filter(|r| r.block_height >= floor && addresses.contains(&r.fraudster))
            .count() as u64)
    }

    /// Deterministically extract fraud records from a block's OP_RETURN data
    pub fn extract_from_block(outputs: &[Vec<u8>]) -> ConsensusResult<Vec<FraudRecord>> {
        let mut records = Vec::new();
        for output in outputs {
            if let Some(bytes) = parse_fraud_envelope(output)? {
                records.push(FraudRecord::deserialize(&bytes)?);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NOW: Timestamp = 1_700_000_000;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn score(n: u8, final_score: i16) -> HatV2Score {
        HatV2Score {
            address: addr(n),
            final_score,
            timestamp: NOW,
            behavior: 0.6,
            wot: 0.5,
            economic: 0.4,
            temporal: 0.3,
            has_wot: true,
            wot_path_count: 1,
            wot_path_strength: 0.5,
        }
    }

    fn setup() -> (Arc<KvStore>, FraudRecorder, SecureHat, WalletClusterer, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(KvStore::open_at(temp_dir.path()).unwrap());
        let recorder = FraudRecorder::new(store.clone());
        let hat = SecureHat::new(store.clone());
        (store, recorder, hat, WalletClusterer::new(), temp_dir)
    }

    #[test]
    fn test_penalty_schedule() {
        assert_eq!(penalty_for_delta(5), 5);
        assert_eq!(penalty_for_delta(10), 5);
        assert_eq!(penalty_for_delta(11), 15);
        assert_eq!(penalty_for_delta(30), 15);
        assert_eq!(penalty_for_delta(31), 30);
        assert_eq!(penalty_for_delta(-31), 30);
    }

    #[test]
    fn test_slash_schedule() {
        let stake = 100 * cvm_crypto::COIN;
        assert_eq!(slash_for_delta(10, stake), 0);
        assert_eq!(slash_for_delta(20, stake), stake / 20);
        assert_eq!(slash_for_delta(31, stake), stake / 10);
    }

    #[test]
    fn test_penalty_monotone_in_delta() {
        // P5: larger delta never yields a smaller penalty or slash
        let stake = 50 * cvm_crypto::COIN;
        let mut last_penalty = 0u16;
        let mut last_slash = 0u64;
        for delta in 0i16..=100 {
            let p = penalty_for_delta(delta);
            let s = slash_for_delta(delta, stake);
            assert!(p >= last_penalty, "penalty regressed at delta {delta}");
            assert!(s >= last_slash, "slash regressed at delta {delta}");
            last_penalty = p;
            last_slash = s;
        }
    }

    #[test]
    fn test_small_delta_not_recorded() {
        let (_store, recorder, hat, clusterer, _temp) = setup();

        let record = recorder
            .record_fraud(&hat, &clusterer, &addr(1), &Hash256::new([1; 32]),
                          &score(1, 72), &score(1, 70), 100, NOW)
            .unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn test_record_and_feedback() {
        let (store, recorder, hat, clusterer, _temp) = setup();

        // Give the fraudster a stake so the slash is visible
        let mut metrics = AddressMetrics::default();
        metrics.stake.amount = 100 * cvm_crypto::COIN;
        metrics.save(&store, &addr(1)).unwrap();

        let tx = Hash256::new([1; 32]);
        let record = recorder
            .record_fraud(&hat, &clusterer, &addr(1), &tx, &score(1, 90), &score(1, 60), 100, NOW)
            .unwrap()
            .unwrap();

        assert_eq!(record.score_difference, 30);
        assert_eq!(record.reputation_penalty, 15);
        assert_eq!(record.bond_slashed, 100 * cvm_crypto::COIN / 20);

        // Persisted and reflected into behavior evidence + penalty log
        assert!(recorder.get_record(&tx).unwrap().is_some());
        let metrics = AddressMetrics::load(&store, &addr(1)).unwrap();
        assert_eq!(metrics.behavior.fraud_count, 1);
        assert_eq!(hat.accumulated_penalty(&addr(1)).unwrap(), 15);
    }

    #[test]
    fn test_cluster_accusation_gate() {
        let (store, recorder, hat, mut clusterer, _temp) = setup();
        clusterer.observe_cospend(&[addr(1), addr(2), addr(3)]);

        // Saturate the cluster with recent records
        for i in 0..6u8 {
            let member = addr(1 + (i % 3));
            let tx = Hash256::new([100 + i; 32]);
            let record = FraudRecord {
                tx_hash: tx,
                fraudster: member,
                claimed: score(1, 90),
                actual: score(1, 50),
                score_difference: 40,
                timestamp: NOW,
                block_height: 95,
                reputation_penalty: 30,
                bond_slashed: 0,
            };
            store.put(&keys::fraud_record_key(&tx), &record).unwrap();
        }

        let held_back = recorder
            .record_fraud(&hat, &clusterer, &addr(1), &Hash256::new([1; 32]),
                          &score(1, 90), &score(1, 50), 100, NOW)
            .unwrap();
        assert!(held_back.is_none());
    }

    #[test]
    fn test_envelope_roundtrip_through_block() {
        let (_store, _recorder, _hat, _clusterer, _temp) = setup();

        let record = FraudRecord {
            tx_hash: Hash256::new([1; 32]),
            fraudster: addr(1),
            claimed: score(1, 90),
            actual: score(1, 60),
            score_difference: 30,
            timestamp: NOW,
            block_height: 100,
            reputation_penalty: 15,
            bond_slashed: 5 * cvm_crypto::COIN,
        };

        // A block with unrelated outputs and one fraud envelope
        let outputs = vec![
            b"unrelated output".to_vec(),
            record.to_envelope(),
            Vec::new(),
        ];

        let extracted = FraudRecorder::extract_from_block(&outputs).unwrap();
        assert_eq!(extracted, vec![record]);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let record = FraudRecord {
            tx_hash: Hash256::new([2; 32]),
            fraudster: addr(4),
            claimed: score(4, 80),
            actual: score(4, 40),
            score_difference: 40,
            timestamp: NOW,
            block_height: 7,
            reputation_penalty: 30,
            bond_slashed: 123,
        };
        let bytes = record.serialize();
        assert_eq!(FraudRecord::deserialize(&bytes).unwrap(), record);
        assert_eq!(record.to_envelope(), record.to_envelope());
    }
}
