// cvm-envelope/src/envelope.rs

use crate::{EnvelopeError, EnvelopeResult};

/// Magic bytes identifying a CVM OP_RETURN output
pub const CVM_MAGIC: &[u8; 3] = b"CVM";

/// Magic bytes identifying an embedded fraud record
pub const FRAUD_MAGIC: &[u8; 5] = b"FRAUD";

/// Maximum OP_RETURN data size imposed by the host chain
pub const MAX_OP_RETURN_SIZE: usize = 80;

/// Fraud envelope version
pub const FRAUD_VERSION: u8 = 0x01;

/// CVM operation carried by an OP_RETURN output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    ContractDeploy,
    ContractCall,
    EvmDeploy,
    EvmCall,
    ReputationVote,
    TrustEdge,
    BondedVote,
    DaoDispute,
    DaoVote,
    Fraud,
    /// Reserved by a future soft fork; carried but ignored
    Unknown(u8),
}

impl OpType {
    pub fn to_byte(self) -> u8 {
        match self {
            OpType::ContractDeploy => 0x01,
            OpType::ContractCall => 0x02,
            OpType::EvmDeploy => 0x03,
            OpType::EvmCall => 0x04,
            OpType::ReputationVote => 0x05,
            OpType::TrustEdge => 0x06,
            OpType::BondedVote => 0x07,
            OpType::DaoDispute => 0x08,
            OpType::DaoVote => 0x09,
            OpType::Fraud => 0x0a,
            OpType::Unknown(b) => b,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => OpType::ContractDeploy,
            0x02 => OpType::ContractCall,
            0x03 => OpType::EvmDeploy,
            0x04 => OpType::EvmCall,
            0x05 => OpType::ReputationVote,
            0x06 => OpType::TrustEdge,
            0x07 => OpType::BondedVote,
            0x08 => OpType::DaoDispute,
            0x09 => OpType::DaoVote,
            0x0a => OpType::Fraud,
            other => OpType::Unknown(other),
        }
    }

    /// Soft-fork rule: unknown operations are skipped, not rejected
    pub fn is_known(&self) -> bool {
        !matches!(self, OpType::Unknown(_))
    }
}

/// A parsed CVM OP_RETURN envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub op_type: OpType,
    pub payload: Vec<u8>,
}

/// Frame a payload into OP_RETURN data bytes: `"CVM" | op_type | payload`
pub fn build_op_return(op_type: OpType, payload: &[u8]) -> EnvelopeResult<Vec<u8>> {
    let total = CVM_MAGIC.len() + 1 + payload.len();
    if total > MAX_OP_RETURN_SIZE {
        return Err(EnvelopeError::PayloadTooLarge(total));
    }

    let mut data = Vec::with_capacity(total);
    data.extend_from_slice(CVM_MAGIC);
    data.push(op_type.to_byte());
    data.extend_from_slice(payload);
    Ok(data)
}

/// Parse OP_RETURN data bytes
///
/// Returns `Ok(None)` when the output is not a CVM envelope at all (no
/// magic); `Err` when it claims to be one but is malformed.
pub fn parse_op_return(data: &[u8]) -> EnvelopeResult<Option<Envelope>> {
    if data.len() < CVM_MAGIC.len() || &data[..CVM_MAGIC.len()] != CVM_MAGIC {
        return Ok(None);
    }
    if data.len() > MAX_OP_RETURN_SIZE {
        return Err(EnvelopeError::InvalidLength(data.len()));
    }
    if data.len() < CVM_MAGIC.len() + 1 {
        return Err(EnvelopeError::InvalidLength(data.len()));
    }

    let op_type = OpType::from_byte(data[CVM_MAGIC.len()]);
    let payload = data[CVM_MAGIC.len() + 1..].to_vec();

    if !op_type.is_known() {
        tracing::debug!(op = op_type.to_byte(), "Ignoring unknown CVM op_type");
    }

    Ok(Some(Envelope { op_type, payload }))
}

/// Frame a serialized fraud record: `"FRAUD" | version | record`
///
/// Fraud records use their own magic so block scanners can extract them
/// without understanding the rest of the CVM envelope space.
pub fn build_fraud_envelope(record_bytes: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(FRAUD_MAGIC.len() + 1 + record_bytes.len());
    data.extend_from_slice(FRAUD_MAGIC);
    data.push(FRAUD_VERSION);
    data.extend_from_slice(record_bytes);
    data
}

/// Extract the serialized fraud record from a fraud envelope
///
/// Returns `Ok(None)` when the data does not carry the fraud magic.
pub fn parse_fraud_envelope(data: &[u8]) -> EnvelopeResult<Option<Vec<u8>>> {
    if data.len() < FRAUD_MAGIC.len() || &data[..FRAUD_MAGIC.len()] != FRAUD_MAGIC {
        return Ok(None);
    }
    if data.len() < FRAUD_MAGIC.len() + 1 {
        return Err(EnvelopeError::InvalidLength(data.len()));
    }

    let version = data[FRAUD_MAGIC.len()];
    if version > FRAUD_VERSION {
        return Err(EnvelopeError::UnsupportedVersion(version));
    }

    Ok(Some(data[FRAUD_MAGIC.len() + 1..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_parse_roundtrip() {
        let data = build_op_return(OpType::BondedVote, b"payload").unwrap();
        let envelope = parse_op_return(&data).unwrap().unwrap();

        assert_eq!(envelope.op_type, OpType::BondedVote);
        assert_eq!(envelope.payload, b"payload");
    }

    #[test]
    fn test_non_cvm_data_is_none() {
        assert!(parse_op_return(b"arbitrary output").unwrap().is_none());
        assert!(parse_op_return(b"").unwrap().is_none());
    }

    #[test]
    fn test_size_cap_enforced() {
        let oversized = vec![0u8; MAX_OP_RETURN_SIZE];
        assert!(matches!(
            build_op_return(OpType::ContractDeploy, &oversized),
            Err(EnvelopeError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_op_type_carried() {
        let data = build_op_return(OpType::Unknown(0x7f), b"future").unwrap();
        let envelope = parse_op_return(&data).unwrap().unwrap();

        assert_eq!(envelope.op_type, OpType::Unknown(0x7f));
        assert!(!envelope.op_type.is_known());
    }

    #[test]
    fn test_op_type_byte_roundtrip() {
        for b in 0u8..=0x20 {
            assert_eq!(OpType::from_byte(b).to_byte(), b);
        }
    }

    #[test]
    fn test_fraud_envelope_roundtrip() {
        let record = b"serialized fraud record".to_vec();
        let data = build_fraud_envelope(&record);

        assert!(data.starts_with(FRAUD_MAGIC));
        assert_eq!(data[FRAUD_MAGIC.len()], FRAUD_VERSION);
        assert_eq!(parse_fraud_envelope(&data).unwrap().unwrap(), record);
    }

    #[test]
    fn test_fraud_envelope_newer_version_rejected() {
        let mut data = build_fraud_envelope(b"record");
        data[FRAUD_MAGIC.len()] = 0x02;
        assert!(matches!(
            parse_fraud_envelope(&data),
            Err(EnvelopeError::UnsupportedVersion(0x02))
        ));
    }
}
