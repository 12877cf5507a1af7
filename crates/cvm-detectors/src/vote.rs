// cvm-detectors/src/vote.rs

use crate::alert::{AlertStore, AlertType, AnomalyAlert};
use crate::DetectorResult;
use cvm_consensus::{ValidationResponse, ValidationVote};
use cvm_crypto::Timestamp;

/// Minimum responses before coordination is judged
const MIN_RESPONSES: usize = 5;

/// Same-vote fraction above which the set looks coordinated
const SAME_VOTE_FRACTION: f64 = 0.80;

/// Timestamp spread under which the set looks scripted, in seconds
const TIGHT_SPREAD_SECS: u64 = 1;

/// Detect coordinated voting on one transaction
///
/// With five or more responses, a super-majority casting the same vote
/// inside a sub-second window is treated as vote manipulation.
pub fn detect_coordinated_voting(
    alerts: &AlertStore,
    responses: &[ValidationResponse],
    now: Timestamp,
    block_height: u64,
) -> DetectorResult<Option<AnomalyAlert>> {
    if responses.len() < MIN_RESPONSES {
        return Ok(None);
    }

    let count_of = |vote: ValidationVote| responses.iter().filter(|r| r.vote == vote).count();
    let (dominant_vote, dominant) = [
        ValidationVote::Accept,
        ValidationVote::Reject,
        ValidationVote::Abstain,
    ]
    .into_iter()
    .map(|v| (v, count_of(v)))
    .max_by_key(|(_, n)| *n)
    .unwrap_or((ValidationVote::Abstain, 0));

    let same_fraction = dominant as f64 / responses.len() as f64;
    if same_fraction <= SAME_VOTE_FRACTION {
        return Ok(None);
    }

    let min_ts = responses.iter().map(|r| r.timestamp).min().unwrap_or(0);
    let max_ts = responses.iter().map(|r| r.timestamp).max().unwrap_or(0);
    if max_ts - min_ts >= TIGHT_SPREAD_SECS {
        return Ok(None);
    }

    let voters: Vec<_> = responses.iter().map(|r| r.validator).collect();
    let alert = alerts.raise(
        AlertType::VoteManipulation,
        responses[0].calculated.address,
        voters,
        1.0,
        same_fraction.max(0.5),
        format!(
            "{dominant} of {} responses cast {dominant_vote:?} within {}s",
            responses.len(),
            max_ts - min_ts
        ),
        serde_json::json!({
            "tx": responses[0].tx_hash.to_hex(),
            "same_fraction": same_fraction,
            "spread_secs": max_ts - min_ts,
        }),
        now,
        block_height,
    )?;

    Ok(Some(alert))
}
