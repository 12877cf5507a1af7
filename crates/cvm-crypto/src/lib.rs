// cvm-crypto/src/lib.rs

//! Cryptographic primitives shared by the Cascoin Validator Module
//!
//! This crate provides:
//! - 32-byte content hashes (SHA-256 default, SHA3/BLAKE3 available)
//! - Ed25519 key pairs and signatures for validator messages
//! - 20-byte addresses derived from public keys
//! - Scalar aliases used across the module (amounts, timestamps, heights)

pub mod hash;
pub mod keys;
pub mod types;

pub use hash::{double_hash, Hash256, HashAlgorithm, Hashable, HASH_SIZE};
pub use keys::{Address, KeyPair, PublicKey, SecretKey, Signature, ADDRESS_SIZE};
pub use types::{Amount, BlockHeight, Gas, Timestamp, COIN};

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Invalid hash")]
    InvalidHash,

    #[error("Invalid address")]
    InvalidAddress,

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}
