// cvm-envelope/src/lib.rs

//! On-chain envelope codec and peer message framing for the CVM
//!
//! Two wire surfaces:
//! - OP_RETURN envelopes: `"CVM" | op_type | payload`, at most 80 bytes,
//!   carrying length-prefixed versioned records with explicit field order.
//!   A payload with fewer trailing fields still parses; an unknown op_type
//!   is skipped (soft-fork rule).
//! - Peer messages: typed payloads framed by the host's P2P layer, each
//!   carrying the issuer's public key and a signature over canonical bytes.

pub mod codec;
pub mod envelope;
pub mod messages;
pub mod payload;

pub use codec::{ByteReader, ByteWriter};
pub use envelope::{
    build_fraud_envelope, build_op_return, parse_fraud_envelope, parse_op_return, Envelope, OpType,
    CVM_MAGIC, FRAUD_MAGIC, MAX_OP_RETURN_SIZE,
};
pub use messages::{MessageKind, SignedPeerMessage};
pub use payload::{
    BondedVotePayload, BytecodeFormat, CallPayload, DaoDisputePayload, DaoVotePayload,
    DeployPayload, ReputationVotePayload, TrustEdgePayload, PAYLOAD_VERSION,
};

/// Result type for envelope operations
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Errors that can occur while framing or parsing envelopes
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Invalid envelope magic")]
    InvalidMagic,

    #[error("Invalid envelope length: {0}")]
    InvalidLength(usize),

    #[error("Payload version {0} is newer than supported")]
    UnsupportedVersion(u8),

    #[error("Truncated payload: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("Payload exceeds OP_RETURN capacity: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid field encoding: {0}")]
    InvalidField(String),

    #[error("Invalid signature on peer message")]
    InvalidSignature,
}
