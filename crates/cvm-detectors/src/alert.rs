// cvm-detectors/src/alert.rs

use crate::{DetectorResult, PERSIST_CONFIDENCE};
use cvm_crypto::{Address, Timestamp};
use cvm_store::{keys, KeyPrefix, KvStore};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Kinds of anomalies the detectors raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    ReputationSpike,
    ReputationDrop,
    ReputationOscillation,
    SlowResponse,
    ErraticTiming,
    VoteBias,
    VoteManipulation,
    SybilCluster,
    EclipseRisk,
    TrustGraphManipulation,
}

/// A detector finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyAlert {
    /// Monotonically increasing id
    pub id: u64,
    pub alert_type: AlertType,
    pub primary_address: Address,
    pub related_addresses: Vec<Address>,
    /// Impact in [0, 1]
    pub severity: f64,
    /// Detector confidence in [0, 1]
    pub confidence: f64,
    pub description: String,
    pub evidence: serde_json::Value,
    pub timestamp: Timestamp,
    pub block_height: u64,
    pub acknowledged: bool,
    pub resolved: bool,
}

impl AnomalyAlert {
    /// Whether the alert should go to the DAO
    pub fn escalates(&self) -> bool {
        self.confidence >= PERSIST_CONFIDENCE
    }
}

/// Creates alerts with monotonic ids and persists the high-confidence ones
pub struct AlertStore {
    store: Arc<KvStore>,
    next_id: Mutex<u64>,
}

impl AlertStore {
    pub fn open(store: Arc<KvStore>) -> DetectorResult<Self> {
        // Resume the id sequence from the last persisted alert
        let existing = store.scan_prefix(KeyPrefix::AnomalyAlert.as_bytes())?;
        let next = existing
            .last()
            .and_then(|(key, _)| key[1..].try_into().ok().map(u64::from_be_bytes))
            .map(|id| id + 1)
            .unwrap_or(0);

        Ok(Self {
            store,
            next_id: Mutex::new(next),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn raise(
        &self,
        alert_type: AlertType,
        primary_address: Address,
        related_addresses: Vec<Address>,
        severity: f64,
        confidence: f64,
        description: String,
        evidence: serde_json::Value,
        timestamp: Timestamp,
        block_height: u64,
    ) -> DetectorResult<AnomalyAlert> {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            let id = *next;
            *next += 1;
            id
        };

        let alert = AnomalyAlert {
            id,
            alert_type,
            primary_address,
            related_addresses,
            severity: severity.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            description,
            evidence,
            timestamp,
            block_height,
            acknowledged: false,
            resolved: false,
        };

        if alert.confidence >= PERSIST_CONFIDENCE {
            self.store.put(&keys::anomaly_alert_key(id), &alert)?;
            tracing::warn!(
                id,
                kind = ?alert.alert_type,
                address = %alert.primary_address,
                confidence = alert.confidence,
                "High-confidence anomaly persisted"
            );
        } else {
            tracing::debug!(id, kind = ?alert.alert_type, confidence = alert.confidence, "Anomaly raised");
        }

        Ok(alert)
    }

    pub fn get(&self, id: u64) -> DetectorResult<Option<AnomalyAlert>> {
        Ok(self.store.get(&keys::anomaly_alert_key(id))?)
    }

    /// All persisted alerts in id order
    pub fn all(&self) -> DetectorResult<Vec<AnomalyAlert>> {
        Ok(self
            .store
            .scan_prefix_values(KeyPrefix::AnomalyAlert.as_bytes())?)
    }

    pub fn resolve(&self, id: u64) -> DetectorResult<bool> {
        match self.get(id)? {
            Some(mut alert) => {
                alert.resolved = true;
                self.store.put(&keys::anomaly_alert_key(id), &alert)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn setup() -> (AlertStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(KvStore::open_at(temp.path()).unwrap());
        (AlertStore::open(store).unwrap(), temp)
    }

    fn raise(alerts: &AlertStore, confidence: f64) -> AnomalyAlert {
        alerts
            .raise(
                AlertType::ReputationSpike,
                addr(1),
                vec![],
                0.5,
                confidence,
                "test".into(),
                serde_json::json!({}),
                1_000,
                10,
            )
            .unwrap()
    }

    #[test]
    fn test_ids_are_monotonic() {
        let (alerts, _temp) = setup();
        let a = raise(&alerts, 0.9);
        let b = raise(&alerts, 0.9);
        assert!(b.id > a.id);
    }

    #[test]
    fn test_only_high_confidence_persisted() {
        let (alerts, _temp) = setup();
        let low = raise(&alerts, 0.5);
        let high = raise(&alerts, 0.85);

        assert!(alerts.get(low.id).unwrap().is_none());
        assert!(alerts.get(high.id).unwrap().is_some());
        assert!(high.escalates());
        assert!(!low.escalates());
    }

    #[test]
    fn test_resolution() {
        let (alerts, _temp) = setup();
        let alert = raise(&alerts, 0.9);

        assert!(alerts.resolve(alert.id).unwrap());
        assert!(alerts.get(alert.id).unwrap().unwrap().resolved);
    }
}
