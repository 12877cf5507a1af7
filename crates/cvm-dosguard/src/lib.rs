// cvm-dosguard/src/lib.rs

//! Reputation-gated DoS protection
//!
//! Three independent admission surfaces in front of the node:
//! - mempool admission: per-address transaction rate and minimum fee,
//!   both tiered by reputation
//! - deployment: per-hour caps plus bytecode screening
//! - RPC / P2P: per-address and per-peer message limits
//!
//! Violations accumulate; past the limit the address is banned for
//! `BASE_BAN_SECONDS x violation_count`. Bans survive restart.

pub mod bytecode;
pub mod guard;

pub use bytecode::{BytecodeScreener, ScreeningReport, RISK_BLOCK_THRESHOLD};
pub use guard::{BanRecord, DosGuard, OpKind, ReputationTier};

/// Sliding window for transactions, RPC and P2P, in seconds
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Sliding window for contract deployments, in seconds
pub const DEPLOY_RATE_LIMIT_WINDOW_SECS: u64 = 3600;

/// Violations before a ban is imposed
pub const MAX_VIOLATION_COUNT: u32 = 10;

/// Ban duration unit; scaled by the violation count
pub const BASE_BAN_SECONDS: u64 = 300;

/// Result type for guard operations
pub type GuardResult<T> = Result<T, GuardError>;

/// Errors surfaced by the DoS guard
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Banned: {remaining_secs}s remaining")]
    Banned { remaining_secs: u64 },

    #[error("Insufficient fee: minimum {minimum} for this reputation tier")]
    InsufficientFee { minimum: cvm_crypto::Amount },

    #[error("Malicious bytecode: risk score {risk:.2}")]
    MaliciousBytecode { risk: f64 },

    #[error("Store error: {0}")]
    Store(#[from] cvm_store::StoreError),
}
