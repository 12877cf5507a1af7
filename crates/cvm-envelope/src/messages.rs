// cvm-envelope/src/messages.rs

use crate::{EnvelopeError, EnvelopeResult};
use cvm_crypto::{Address, KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// Peer message kinds framed by the host's P2P layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Challenge a validator to recompute a sender's score
    ValidationChallenge,
    /// Signed validator verdict
    ValidationResponse,
    /// Escalation of a failed consensus session
    DaoDispute,
    /// DAO verdict on a dispute
    DaoResolution,
    /// Validator liveness/eligibility announcement
    ValidatorAnnouncement,
}

impl MessageKind {
    fn to_byte(self) -> u8 {
        match self {
            MessageKind::ValidationChallenge => 0x01,
            MessageKind::ValidationResponse => 0x02,
            MessageKind::DaoDispute => 0x03,
            MessageKind::DaoResolution => 0x04,
            MessageKind::ValidatorAnnouncement => 0x05,
        }
    }
}

/// A peer message with issuer identity and signature over canonical bytes
///
/// The payload is the bincode encoding of the typed message owned by the
/// consensus layer; this wrapper only fixes the signing discipline, so the
/// envelope crate stays below the consensus crate in the dependency order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPeerMessage {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub issuer_pubkey: PublicKey,
    pub signature: Signature,
}

impl SignedPeerMessage {
    /// Canonical signing preimage: kind byte followed by the raw payload
    fn canonical_bytes(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(kind.to_byte());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Build and sign a message
    pub fn sign(kind: MessageKind, payload: Vec<u8>, keypair: &KeyPair) -> Self {
        let signature = keypair.sign(&Self::canonical_bytes(kind, &payload));
        Self {
            kind,
            payload,
            issuer_pubkey: keypair.public_key().clone(),
            signature,
        }
    }

    /// Verify the signature and return the issuer's address
    pub fn verify(&self) -> EnvelopeResult<Address> {
        let preimage = Self::canonical_bytes(self.kind, &self.payload);
        let valid = self
            .issuer_pubkey
            .verify(&preimage, &self.signature)
            .map_err(|_| EnvelopeError::InvalidSignature)?;
        if !valid {
            return Err(EnvelopeError::InvalidSignature);
        }
        Ok(self.issuer_pubkey.to_address())
    }
}
