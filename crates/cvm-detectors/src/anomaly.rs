// cvm-detectors/src/anomaly.rs

use crate::alert::{AlertStore, AlertType, AnomalyAlert};
use crate::{DetectorResult, REPUTATION_WINDOW};
use cvm_crypto::{Address, Timestamp};
use std::collections::{HashMap, VecDeque};

/// Z-score beyond which a sample is a spike/drop
const Z_THRESHOLD: f64 = 2.5;

/// Direction-change rate above which a series oscillates
const OSCILLATION_RATE: f64 = 0.70;
const OSCILLATION_MIN_SAMPLES: usize = 10;

/// Rolling statistics over per-address reputation scores
///
/// Keeps an in-memory window per address; each new sample is judged against
/// the statistics of the samples before it.
pub struct ReputationAnomalyDetector {
    windows: HashMap<Address, VecDeque<i16>>,
}

impl ReputationAnomalyDetector {
    pub fn new() -> Self {
        Self { windows: HashMap::new() }
    }

    /// Record a new score sample and raise any resulting alerts
    pub fn record_score(
        &mut self,
        alerts: &AlertStore,
        address: Address,
        score: i16,
        now: Timestamp,
        block_height: u64,
    ) -> DetectorResult<Vec<AnomalyAlert>> {
        let window = self.windows.entry(address).or_default();
        let mut raised = Vec::new();

        if window.len() >= 3 {
            let mean = window.iter().map(|&s| s as f64).sum::<f64>() / window.len() as f64;
            let variance = window
                .iter()
                .map(|&s| (s as f64 - mean).powi(2))
                .sum::<f64>()
                / window.len() as f64;
            let stddev = variance.sqrt();

            if stddev > 0.0 {
                let z = (score as f64 - mean) / stddev;
                if z > Z_THRESHOLD {
                    raised.push(alerts.raise(
                        AlertType::ReputationSpike,
                        address,
                        vec![],
                        (z / 5.0).min(1.0),
                        ((z - Z_THRESHOLD) / Z_THRESHOLD).clamp(0.5, 1.0),
                        format!("Reputation spike: score {score} at z={z:.2} over window of {}", window.len()),
                        serde_json::json!({ "z": z, "mean": mean, "stddev": stddev }),
                        now,
                        block_height,
                    )?);
                } else if z < -Z_THRESHOLD {
                    raised.push(alerts.raise(
                        AlertType::ReputationDrop,
                        address,
                        vec![],
                        (-z / 5.0).min(1.0),
                        ((-z - Z_THRESHOLD) / Z_THRESHOLD).clamp(0.5, 1.0),
                        format!("Reputation drop: score {score} at z={z:.2} over window of {}", window.len()),
                        serde_json::json!({ "z": z, "mean": mean, "stddev": stddev }),
                        now,
                        block_height,
                    )?);
                }
            }
        }

        window.push_back(score);
        if window.len() > REPUTATION_WINDOW {
            window.pop_front();
        }

        if let Some(alert) = self.check_oscillation(alerts, &address, now, block_height)? {
            raised.push(alert);
        }

        Ok(raised)
    }

    fn check_oscillation(
        &self,
        alerts: &AlertStore,
        address: &Address,
        now: Timestamp,
        block_height: u64,
    ) -> DetectorResult<Option<AnomalyAlert>> {
        let Some(window) = self.windows.get(address) else {
            return Ok(None);
        };
        if window.len() < OSCILLATION_MIN_SAMPLES {
            return Ok(None);
        }

        let samples: Vec<i16> = window.iter().copied().collect();
        let mut direction_changes = 0usize;
        let mut comparisons = 0usize;
        let mut last_direction = 0i8;

        for pair in samples.windows(2) {
            let direction = match pair[1].cmp(&pair[0]) {
                std::cmp::Ordering::Greater => 1i8,
                std::cmp::Ordering::Less => -1i8,
                std::cmp::Ordering::Equal => continue,
            };
            if last_direction != 0 {
                comparisons += 1;
                if direction != last_direction {
                    direction_changes += 1;
                }
            }
            last_direction = direction;
        }

        if comparisons == 0 {
            return Ok(None);
        }
        let rate = direction_changes as f64 / comparisons as f64;
        if rate <= OSCILLATION_RATE {
            return Ok(None);
        }

        Ok(Some(alerts.raise(
            AlertType::ReputationOscillation,
            *address,
            vec![],
            rate,
            rate.clamp(0.5, 1.0),
            format!("Reputation oscillation: direction-change rate {rate:.2} over {} samples", samples.len()),
            serde_json::json!({ "rate": rate, "samples": samples.len() }),
            now,
            block_height,
        )?))
    }
}

impl Default for ReputationAnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}
