// cvm-consensus/src/session.rs

use crate::types::{TransactionState, ValidationRequest, ValidationResponse};
use crate::{MIN_VALIDATORS, VALIDATION_TIMEOUT_SECS};
use cvm_crypto::{Address, Timestamp};
use serde::{Deserialize, Serialize};

/// Tracks one transaction's ongoing validation
///
/// Persisted under the session prefix; the session record is also the
/// authoritative carrier of the transaction's validation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSession {
    pub tx_hash: cvm_crypto::Hash256,
    pub request: ValidationRequest,
    /// Validators the challenge was sent to
    pub validators: Vec<Address>,
    pub responses: Vec<ValidationResponse>,
    pub start_time: Timestamp,
    pub completed: bool,
    pub state: TransactionState,
}

impl ValidationSession {
    pub fn new(request: ValidationRequest, validators: Vec<Address>, start_time: Timestamp) -> Self {
        Self {
            tx_hash: request.tx_hash,
            request,
            validators,
            responses: Vec::new(),
            start_time,
            completed: false,
            state: TransactionState::PendingValidation,
        }
    }

    pub fn has_minimum_responses(&self) -> bool {
        self.responses.len() >= MIN_VALIDATORS
    }

    pub fn is_timed_out(&self, now: Timestamp) -> bool {
        now > self.start_time + VALIDATION_TIMEOUT_SECS
    }

    pub fn has_response_from(&self, validator: &Address) -> bool {
        self.responses.iter().any(|r| &r.validator == validator)
    }

    /// Selected validators that never responded
    pub fn non_responders(&self) -> Vec<Address> {
        self.validators
            .iter()
            .filter(|v| !self.has_response_from(v))
            .copied()
            .collect()
    }
}
