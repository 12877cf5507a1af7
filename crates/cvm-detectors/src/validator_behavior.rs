// cvm-detectors/src/validator_behavior.rs

use crate::alert::{AlertStore, AlertType, AnomalyAlert};
use crate::{DetectorResult, VALIDATOR_WINDOW};
use cvm_consensus::ValidationVote;
use cvm_crypto::{Address, Timestamp};
use std::collections::{HashMap, VecDeque};

/// Responses slower than this are "slow", in seconds
const SLOW_RESPONSE_SECS: f64 = 5.0;
const SLOW_RESPONSE_FRACTION: f64 = 0.50;

/// Coefficient of variation above which timing is erratic
const ERRATIC_CV: f64 = 1.5;

/// One-sided vote rate above which a validator is biased
const BIAS_RATE: f64 = 0.95;
const BIAS_MIN_VOTES: usize = 20;

/// One observed validator response
#[derive(Debug, Clone, Copy)]
pub struct ResponseObservation {
    pub response_time_secs: f64,
    pub vote: ValidationVote,
    pub timestamp: Timestamp,
}

/// Watches per-validator response behavior over a rolling window
pub struct ValidatorBehaviorDetector {
    windows: HashMap<Address, VecDeque<ResponseObservation>>,
}

impl ValidatorBehaviorDetector {
    pub fn new() -> Self {
        Self { windows: HashMap::new() }
    }

    /// Record an observation and run the behavior checks
    pub fn record_response(
        &mut self,
        alerts: &AlertStore,
        validator: Address,
        observation: ResponseObservation,
        block_height: u64,
    ) -> DetectorResult<Vec<AnomalyAlert>> {
        let window = self.windows.entry(validator).or_default();
        window.push_back(observation);
        if window.len() > VALIDATOR_WINDOW {
            window.pop_front();
        }

        let mut raised = Vec::new();
        let now = observation.timestamp;

        if let Some(alert) = Self::check_slow_response(alerts, &validator, window, now, block_height)? {
            raised.push(alert);
        }
        if let Some(alert) = Self::check_erratic_timing(alerts, &validator, window, now, block_height)? {
            raised.push(alert);
        }
        if let Some(alert) = Self::check_bias(alerts, &validator, window, now, block_height)? {
            raised.push(alert);
        }
        Ok(raised)
    }

    fn check_slow_response(
        alerts: &AlertStore,
        validator: &Address,
        window: &VecDeque<ResponseObservation>,
        now: Timestamp,
        block_height: u64,
    ) -> DetectorResult<Option<AnomalyAlert>> {
        if window.len() < 10 {
            return Ok(None);
        }
        let slow = window.iter().filter(|o| o.response_time_secs > SLOW_RESPONSE_SECS).count();
        let fraction = slow as f64 / window.len() as f64;
        if fraction <= SLOW_RESPONSE_FRACTION {
            return Ok(None);
        }

        Ok(Some(alerts.raise(
            AlertType::SlowResponse,
            *validator,
            vec![],
            fraction,
            fraction.clamp(0.5, 1.0),
            format!("{:.0}% of recent responses exceed {SLOW_RESPONSE_SECS}s", fraction * 100.0),
            serde_json::json!({ "slow": slow, "window": window.len() }),
            now,
            block_height,
        )?))
    }

    fn check_erratic_timing(
        alerts: &AlertStore,
        validator: &Address,
        window: &VecDeque<ResponseObservation>,
        now: Timestamp,
        block_height: u64,
    ) -> DetectorResult<Option<AnomalyAlert>> {
        if window.len() < 10 {
            return Ok(None);
        }
        let times: Vec<f64> = window.iter().map(|o| o.response_time_secs).collect();
        let mean = times.iter().sum::<f64>() / times.len() as f64;
        if mean <= 0.0 {
            return Ok(None);
        }
        let variance = times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / times.len() as f64;
        let cv = variance.sqrt() / mean;
        if cv <= ERRATIC_CV {
            return Ok(None);
        }

        Ok(Some(alerts.raise(
            AlertType::ErraticTiming,
            *validator,
            vec![],
            (cv / 3.0).min(1.0),
            ((cv - ERRATIC_CV) / ERRATIC_CV).clamp(0.5, 1.0),
            format!("Response-time coefficient of variation {cv:.2}"),
            serde_json::json!({ "cv": cv, "mean_secs": mean }),
            now,
            block_height,
        )?))
    }

    fn check_bias(
        alerts: &AlertStore,
        validator: &Address,
        window: &VecDeque<ResponseObservation>,
        now: Timestamp,
        block_height: u64,
    ) -> DetectorResult<Option<AnomalyAlert>> {
        if window.len() < BIAS_MIN_VOTES {
            return Ok(None);
        }
        let accepts = window.iter().filter(|o| o.vote == ValidationVote::Accept).count();
        let rejects = window.iter().filter(|o| o.vote == ValidationVote::Reject).count();
        let accept_rate = accepts as f64 / window.len() as f64;
        let reject_rate = rejects as f64 / window.len() as f64;

        let rate = accept_rate.max(reject_rate);
        if rate <= BIAS_RATE {
            return Ok(None);
        }

        Ok(Some(alerts.raise(
            AlertType::VoteBias,
            *validator,
            vec![],
            rate,
            rate.clamp(0.5, 1.0),
            format!(
                "One-sided voting: accept {accept_rate:.2} / reject {reject_rate:.2} over {} votes",
                window.len()
            ),
            serde_json::json!({ "accept_rate": accept_rate, "reject_rate": reject_rate }),
            now,
            block_height,
        )?))
    }
}

impl Default for ValidatorBehaviorDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_store::KvStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn setup() -> (AlertStore, ValidatorBehaviorDetector, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(KvStore::open_at(temp.path()).unwrap());
        (
            AlertStore::open(store).unwrap(),
            ValidatorBehaviorDetector::new(),
            temp,
        )
    }

    fn obs(secs: f64, vote: ValidationVote, ts: Timestamp) -> ResponseObservation {
        ResponseObservation { response_time_secs: secs, vote, timestamp: ts }
    }

    #[test]
    fn test_slow_responder_flagged() {
        let (alerts, mut detector, _temp) = setup();
        let mut found = false;
        for i in 0..20u64 {
            let vote = if i % 2 == 0 { ValidationVote::Accept } else { ValidationVote::Reject };
            let raised = detector
                .record_response(&alerts, addr(1), obs(8.0, vote, 1_000 + i), 10)
                .unwrap();
            if raised.iter().any(|a| a.alert_type == AlertType::SlowResponse) {
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_fast_responder_clean() {
        let (alerts, mut detector, _temp) = setup();
        for i in 0..30u64 {
            let vote = if i % 2 == 0 { ValidationVote::Accept } else { ValidationVote::Reject };
            let raised = detector
                .record_response(&alerts, addr(1), obs(1.0, vote, 1_000 + i), 10)
                .unwrap();
            assert!(raised
                .iter()
                .all(|a| a.alert_type != AlertType::SlowResponse
                    && a.alert_type != AlertType::ErraticTiming));
        }
    }

    #[test]
    fn test_erratic_timing_flagged() {
        let (alerts, mut detector, _temp) = setup();
        let mut found = false;
        for i in 0..30u64 {
            // Mostly instant with rare huge outliers pushes CV past 1.5
            let secs = if i % 10 == 0 { 60.0 } else { 0.2 };
            let vote = if i % 2 == 0 { ValidationVote::Accept } else { ValidationVote::Reject };
            let raised = detector
                .record_response(&alerts, addr(1), obs(secs, vote, 1_000 + i), 10)
                .unwrap();
            if raised.iter().any(|a| a.alert_type == AlertType::ErraticTiming) {
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_bias_flagged() {
        let (alerts, mut detector, _temp) = setup();
        let mut found = false;
        for i in 0..25u64 {
            let raised = detector
                .record_response(&alerts, addr(1), obs(1.0, ValidationVote::Accept, 1_000 + i), 10)
                .unwrap();
            if raised.iter().any(|a| a.alert_type == AlertType::VoteBias) {
                found = true;
            }
        }
        assert!(found);
    }
}
