// cvm-envelope/src/payload.rs

use crate::codec::{ByteReader, ByteWriter};
use crate::{EnvelopeError, EnvelopeResult};
use cvm_crypto::{Address, Amount, Hash256, Timestamp};

/// Current payload record version
pub const PAYLOAD_VERSION: u8 = 0x01;

fn check_version(reader: &mut ByteReader<'_>) -> EnvelopeResult<u8> {
    let version = reader.read_u8()?;
    if version > PAYLOAD_VERSION {
        return Err(EnvelopeError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Bytecode container format for deploy/call payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BytecodeFormat {
    CvmNative,
    EvmBytecode,
    #[default]
    Unknown,
}

impl BytecodeFormat {
    fn to_byte(self) -> u8 {
        match self {
            BytecodeFormat::CvmNative => 0x01,
            BytecodeFormat::EvmBytecode => 0x02,
            BytecodeFormat::Unknown => 0x00,
        }
    }

    fn from_byte(b: u8) -> Self {
        match b {
            0x01 => BytecodeFormat::CvmNative,
            0x02 => BytecodeFormat::EvmBytecode,
            _ => BytecodeFormat::Unknown,
        }
    }
}

/// CONTRACT_DEPLOY / EVM_DEPLOY payload
///
/// The bytecode itself travels in the transaction witness; the envelope
/// commits to its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployPayload {
    pub code_hash: Hash256,
    pub gas_limit: u64,
    pub format: BytecodeFormat,
    pub metadata: Vec<u8>,
}

impl DeployPayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u8(PAYLOAD_VERSION)
            .write_hash(&self.code_hash)
            .write_u64(self.gas_limit)
            .write_u8(self.format.to_byte())
            .write_var_bytes(&self.metadata);
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> EnvelopeResult<Self> {
        let mut r = ByteReader::new(data);
        check_version(&mut r)?;

        let code_hash = r.read_hash()?;
        let gas_limit = r.read_u64()?;

        // Trailing fields absent in records from older senders
        let format = if r.has_remaining() {
            BytecodeFormat::from_byte(r.read_u8()?)
        } else {
            BytecodeFormat::Unknown
        };
        let metadata = if r.has_remaining() { r.read_var_bytes()? } else { Vec::new() };

        Ok(Self { code_hash, gas_limit, format, metadata })
    }
}

/// CONTRACT_CALL / EVM_CALL payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPayload {
    pub contract: Address,
    pub gas_limit: u64,
    pub format: BytecodeFormat,
    pub call_data: Vec<u8>,
}

impl CallPayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u8(PAYLOAD_VERSION)
            .write_address(&self.contract)
            .write_u64(self.gas_limit)
            .write_u8(self.format.to_byte())
            .write_var_bytes(&self.call_data);
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> EnvelopeResult<Self> {
        let mut r = ByteReader::new(data);
        check_version(&mut r)?;

        let contract = r.read_address()?;
        let gas_limit = r.read_u64()?;
        let format = if r.has_remaining() {
            BytecodeFormat::from_byte(r.read_u8()?)
        } else {
            BytecodeFormat::Unknown
        };
        let call_data = if r.has_remaining() { r.read_var_bytes()? } else { Vec::new() };

        Ok(Self { contract, gas_limit, format, call_data })
    }
}

/// REPUTATION_VOTE payload: an unbonded advisory vote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationVotePayload {
    pub target: Address,
    pub value: i8,
    pub timestamp: Timestamp,
}

impl ReputationVotePayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u8(PAYLOAD_VERSION)
            .write_address(&self.target)
            .write_i8(self.value)
            .write_u64(self.timestamp);
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> EnvelopeResult<Self> {
        let mut r = ByteReader::new(data);
        check_version(&mut r)?;

        Ok(Self {
            target: r.read_address()?,
            value: r.read_i8()?,
            timestamp: r.read_u64()?,
        })
    }
}

/// TRUST_EDGE payload: declares a directed trust relation
///
/// The carrying transaction supplies the bond output and its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustEdgePayload {
    pub target: Address,
    pub weight: i8,
    pub timestamp: Timestamp,
    pub reason: Vec<u8>,
}

impl TrustEdgePayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u8(PAYLOAD_VERSION)
            .write_address(&self.target)
            .write_i8(self.weight)
            .write_u64(self.timestamp)
            .write_var_bytes(&self.reason);
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> EnvelopeResult<Self> {
        let mut r = ByteReader::new(data);
        check_version(&mut r)?;

        let target = r.read_address()?;
        let weight = r.read_i8()?;
        let timestamp = r.read_u64()?;
        let reason = if r.has_remaining() { r.read_var_bytes()? } else { Vec::new() };

        Ok(Self { target, weight, timestamp, reason })
    }
}

/// BONDED_VOTE payload: a vote backed by a slashable stake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedVotePayload {
    pub target: Address,
    pub value: i8,
    pub bond_amount: Amount,
    pub timestamp: Timestamp,
}

impl BondedVotePayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u8(PAYLOAD_VERSION)
            .write_address(&self.target)
            .write_i8(self.value)
            .write_u64(self.bond_amount)
            .write_u64(self.timestamp);
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> EnvelopeResult<Self> {
        let mut r = ByteReader::new(data);
        check_version(&mut r)?;

        Ok(Self {
            target: r.read_address()?,
            value: r.read_i8()?,
            bond_amount: r.read_u64()?,
            timestamp: r.read_u64()?,
        })
    }
}

/// DAO_DISPUTE payload: opens or references a dispute case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaoDisputePayload {
    pub dispute_id: Hash256,
    pub reason_code: u8,
}

impl DaoDisputePayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u8(PAYLOAD_VERSION)
            .write_hash(&self.dispute_id)
            .write_u8(self.reason_code);
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> EnvelopeResult<Self> {
        let mut r = ByteReader::new(data);
        check_version(&mut r)?;

        let dispute_id = r.read_hash()?;
        let reason_code = if r.has_remaining() { r.read_u8()? } else { 0 };

        Ok(Self { dispute_id, reason_code })
    }
}

/// DAO_VOTE payload: a member's vote on an open dispute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaoVotePayload {
    pub dispute_id: Hash256,
    pub approve: bool,
    pub timestamp: Timestamp,
}

impl DaoVotePayload {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u8(PAYLOAD_VERSION)
            .write_hash(&self.dispute_id)
            .write_u8(self.approve as u8)
            .write_u64(self.timestamp);
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> EnvelopeResult<Self> {
        let mut r = ByteReader::new(data);
        check_version(&mut r)?;

        Ok(Self {
            dispute_id: r.read_hash()?,
            approve: r.read_u8()? != 0,
            timestamp: r.read_u64()?,
        })
    }
}
