// cvm-store/src/keys.rs

use cvm_crypto::{Address, Hash256};

/// Record families in the sorted keyspace
///
/// Single-character prefixes follow the on-disk discipline of the consensus
/// records; longer word prefixes are used by the slower-churn operational
/// records (flags, penalties, bans).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPrefix {
    /// 'T' + from + to -> TrustEdge
    TrustEdge,
    /// 'V' + tx_hash -> BondedVote
    BondedVote,
    /// 'P' + from + to -> PropagatedTrustEdge
    PropagatedEdge,
    /// 'I' + source_tx + to -> propagation index entry
    PropagationIndex,
    /// 'C' + cluster_id -> ClusterTrustSummary cache seed
    ClusterSummary,
    /// 'Z' + alert_id -> AnomalyAlert
    AnomalyAlert,
    /// 'D' + dispute_id -> DisputeCase
    DisputeCase,
    /// 'F' + tx_hash -> FraudRecord
    FraudRecord,
    /// 'S' + address -> ValidatorStats
    ValidatorStats,
    /// 'E' + tx_hash -> ValidationSession
    ValidationSession,
    /// "flag" + address -> trust-graph manipulation flag
    ManipulationFlag,
    /// "penalty" + address -> reputation penalty counter
    PenaltyCounter,
    /// "ban" + address -> ban record
    Ban,
    /// 'M' + address -> HAT input metrics (behavior/stake/temporal)
    HatMetrics,
}

impl KeyPrefix {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            KeyPrefix::TrustEdge => b"T",
            KeyPrefix::BondedVote => b"V",
            KeyPrefix::PropagatedEdge => b"P",
            KeyPrefix::PropagationIndex => b"I",
            KeyPrefix::ClusterSummary => b"C",
            KeyPrefix::AnomalyAlert => b"Z",
            KeyPrefix::DisputeCase => b"D",
            KeyPrefix::FraudRecord => b"F",
            KeyPrefix::ValidatorStats => b"S",
            KeyPrefix::ValidationSession => b"E",
            KeyPrefix::ManipulationFlag => b"flag",
            KeyPrefix::PenaltyCounter => b"penalty",
            KeyPrefix::Ban => b"ban",
            KeyPrefix::HatMetrics => b"M",
        }
    }

    fn key_with(&self, parts: &[&[u8]]) -> Vec<u8> {
        let len = self.as_bytes().len() + parts.iter().map(|p| p.len()).sum::<usize>();
        let mut key = Vec::with_capacity(len);
        key.extend_from_slice(self.as_bytes());
        for part in parts {
            key.extend_from_slice(part);
        }
        key
    }
}

pub fn trust_edge_key(from: &Address, to: &Address) -> Vec<u8> {
    KeyPrefix::TrustEdge.key_with(&[from.as_bytes(), to.as_bytes()])
}

pub fn bonded_vote_key(tx_hash: &Hash256) -> Vec<u8> {
    KeyPrefix::BondedVote.key_with(&[tx_hash.as_bytes()])
}

pub fn propagated_edge_key(from: &Address, to: &Address) -> Vec<u8> {
    KeyPrefix::PropagatedEdge.key_with(&[from.as_bytes(), to.as_bytes()])
}

pub fn propagation_index_key(source_tx: &Hash256, to: &Address) -> Vec<u8> {
    KeyPrefix::PropagationIndex.key_with(&[source_tx.as_bytes(), to.as_bytes()])
}

/// Prefix covering every index entry of one source transaction
pub fn propagation_index_prefix(source_tx: &Hash256) -> Vec<u8> {
    KeyPrefix::PropagationIndex.key_with(&[source_tx.as_bytes()])
}

pub fn cluster_summary_key(cluster_id: &Address) -> Vec<u8> {
    KeyPrefix::ClusterSummary.key_with(&[cluster_id.as_bytes()])
}

/// Alert ids are big-endian so the prefix scan yields chronological order
pub fn anomaly_alert_key(alert_id: u64) -> Vec<u8> {
    KeyPrefix::AnomalyAlert.key_with(&[&alert_id.to_be_bytes()])
}

pub fn dispute_key(dispute_id: &Hash256) -> Vec<u8> {
    KeyPrefix::DisputeCase.key_with(&[dispute_id.as_bytes()])
}

pub fn fraud_record_key(tx_hash: &Hash256) -> Vec<u8> {
    KeyPrefix::FraudRecord.key_with(&[tx_hash.as_bytes()])
}

pub fn validator_stats_key(address: &Address) -> Vec<u8> {
    KeyPrefix::ValidatorStats.key_with(&[address.as_bytes()])
}

pub fn validation_session_key(tx_hash: &Hash256) -> Vec<u8> {
    KeyPrefix::ValidationSession.key_with(&[tx_hash.as_bytes()])
}

pub fn manipulation_flag_key(address: &Address) -> Vec<u8> {
    KeyPrefix::ManipulationFlag.key_with(&[address.as_bytes()])
}

pub fn penalty_key(address: &Address) -> Vec<u8> {
    KeyPrefix::PenaltyCounter.key_with(&[address.as_bytes()])
}

pub fn ban_key(address: &Address) -> Vec<u8> {
    KeyPrefix::Ban.key_with(&[address.as_bytes()])
}

pub fn hat_metrics_key(address: &Address) -> Vec<u8> {
    KeyPrefix::HatMetrics.key_with(&[address.as_bytes()])
}
