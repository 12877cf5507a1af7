// cvm-dosguard/src/bytecode.rs

use crate::{GuardError, GuardResult};
use cvm_crypto::{Hash256, Hashable};
use cvm_trust::{EntrySize, LruByteCache};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Deployments at or above this risk are blocked
pub const RISK_BLOCK_THRESHOLD: f64 = 0.90;

/// Byte budget for the screening-report cache
const SCREEN_CACHE_BUDGET: usize = 1024 * 1024;

// EVM opcodes the screener cares about
const OP_CALLER: u8 = 0x33;
const OP_EQ: u8 = 0x14;
const OP_SSTORE: u8 = 0x55;
const OP_JUMP: u8 = 0x56;
const OP_JUMPI: u8 = 0x57;
const OP_GAS: u8 = 0x5a;
const OP_PUSH1: u8 = 0x60;
const OP_PUSH32: u8 = 0x7f;
const OP_CALL: u8 = 0xf1;
const OP_CALLCODE: u8 = 0xf2;
const OP_DELEGATECALL: u8 = 0xf4;
const OP_SELFDESTRUCT: u8 = 0xff;

// Per-pattern risk weights
const W_UNGATED_SELFDESTRUCT: f64 = 0.50;
const W_REENTRANCY_SHAPE: f64 = 0.35;
const W_UNCHECKED_BACKJUMP: f64 = 0.30;
const W_DELEGATION: f64 = 0.20;
const W_EXHAUSTION: f64 = 0.30;

/// Fraction of expensive opcodes above which the code looks like a
/// gas-exhaustion vehicle
const EXHAUSTION_RATIO: f64 = 0.30;

/// Structural findings reported by the screener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskPattern {
    UngatedSelfDestruct,
    ReentrancyShape,
    UncheckedBackwardJump,
    DelegatedExecution,
    GasExhaustionShape,
}

/// Result of screening one bytecode blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningReport {
    pub code_hash: Hash256,
    pub risk_score: f64,
    pub findings: Vec<RiskPattern>,
}

impl ScreeningReport {
    pub fn blocks_deployment(&self) -> bool {
        self.risk_score >= RISK_BLOCK_THRESHOLD
    }
}

impl EntrySize for ScreeningReport {
    fn entry_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.findings.len() * std::mem::size_of::<RiskPattern>()
    }
}

/// Decoded instruction stream position
struct Instruction {
    offset: usize,
    opcode: u8,
}

/// Static bytecode screener with a result cache keyed by code hash
pub struct BytecodeScreener {
    cache: Mutex<LruByteCache<Hash256, ScreeningReport>>,
}

impl BytecodeScreener {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruByteCache::new(SCREEN_CACHE_BUDGET)),
        }
    }

    /// Screen bytecode, serving repeated hashes from the cache
    pub fn screen(&self, code: &[u8]) -> ScreeningReport {
        let code_hash = code.hash();

        if let Ok(mut cache) = self.cache.lock() {
            if let Some(report) = cache.get(&code_hash) {
                return report.clone();
            }
        }

        let report = Self::analyze(code_hash, code);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(code_hash, report.clone());
        }
        report
    }

    /// Gate a deployment on the screening outcome
    pub fn check_deployment(&self, code: &[u8]) -> GuardResult<ScreeningReport> {
        let report = self.screen(code);
        if report.blocks_deployment() {
            tracing::warn!(
                code = %report.code_hash,
                risk = report.risk_score,
                findings = report.findings.len(),
                "Deployment blocked by bytecode screening"
            );
            return Err(GuardError::MaliciousBytecode { risk: report.risk_score });
        }
        Ok(report)
    }

    fn analyze(code_hash: Hash256, code: &[u8]) -> ScreeningReport {
        let instructions = Self::decode(code);
        let mut findings = Vec::new();
        let mut risk = 0.0;

        if Self::has_ungated_selfdestruct(&instructions) {
            findings.push(RiskPattern::UngatedSelfDestruct);
            risk += W_UNGATED_SELFDESTRUCT;
        }
        if Self::has_reentrancy_shape(&instructions) {
            findings.push(RiskPattern::ReentrancyShape);
            risk += W_REENTRANCY_SHAPE;
        }
        if Self::has_unchecked_backward_jump(&instructions, code) {
            findings.push(RiskPattern::UncheckedBackwardJump);
            risk += W_UNCHECKED_BACKJUMP;
        }
        if instructions
            .iter()
            .any(|i| i.opcode == OP_DELEGATECALL || i.opcode == OP_CALLCODE)
        {
            findings.push(RiskPattern::DelegatedExecution);
            risk += W_DELEGATION;
        }
        if Self::exhaustion_ratio(&instructions) >= EXHAUSTION_RATIO {
            findings.push(RiskPattern::GasExhaustionShape);
            risk += W_EXHAUSTION;
        }

        ScreeningReport {
            code_hash,
            risk_score: risk.min(1.0),
            findings,
        }
    }

    /// Walk opcodes, skipping PUSH immediates
    fn decode(code: &[u8]) -> Vec<Instruction> {
        let mut instructions = Vec::new();
        let mut i = 0;
        while i < code.len() {
            let opcode = code[i];
            instructions.push(Instruction { offset: i, opcode });
            if (OP_PUSH1..=OP_PUSH32).contains(&opcode) {
                i += 1 + (opcode - OP_PUSH1) as usize + 1;
            } else {
                i += 1;
            }
        }
        instructions
    }

    /// SELFDESTRUCT without a caller-identity comparison anywhere before it
    fn has_ungated_selfdestruct(instructions: &[Instruction]) -> bool {
        let Some(position) = instructions.iter().position(|i| i.opcode == OP_SELFDESTRUCT) else {
            return false;
        };
        let guarded = instructions[..position]
            .windows(2)
            .any(|w| w[0].opcode == OP_CALLER || (w[0].opcode == OP_EQ && w[1].opcode == OP_JUMPI));
        let has_caller = instructions[..position].iter().any(|i| i.opcode == OP_CALLER);
        !(guarded && has_caller)
    }

    /// External CALL with a storage write after it in the same stream
    fn has_reentrancy_shape(instructions: &[Instruction]) -> bool {
        let mut seen_call = false;
        for instruction in instructions {
            match instruction.opcode {
                OP_CALL => seen_call = true,
                OP_SSTORE if seen_call => return true,
                _ => {}
            }
        }
        false
    }

    /// `PUSH target; JUMP/JUMPI` to an earlier offset without a GAS check
    /// in between
    fn has_unchecked_backward_jump(instructions: &[Instruction], code: &[u8]) -> bool {
        for (idx, instruction) in instructions.iter().enumerate() {
            if instruction.opcode != OP_JUMP && instruction.opcode != OP_JUMPI {
                continue;
            }
            let Some(prev) = idx.checked_sub(1).map(|p| &instructions[p]) else {
                continue;
            };
            if !(OP_PUSH1..=OP_PUSH32).contains(&prev.opcode) {
                continue;
            }

            let push_len = (prev.opcode - OP_PUSH1) as usize + 1;
            if push_len > 8 || prev.offset + 1 + push_len > code.len() {
                continue;
            }
            let mut target = 0usize;
            for &byte in &code[prev.offset + 1..prev.offset + 1 + push_len] {
                target = (target << 8) | byte as usize;
            }

            if target < instruction.offset {
                let gas_checked = instructions[..idx]
                    .iter()
                    .rev()
                    .take(8)
                    .any(|i| i.opcode == OP_GAS);
                if !gas_checked {
                    return true;
                }
            }
        }
        false
    }

    /// Fraction of storage/call opcodes in the stream
    fn exhaustion_ratio(instructions: &[Instruction]) -> f64 {
        if instructions.is_empty() {
            return 0.0;
        }
        let expensive = instructions
            .iter()
            .filter(|i| matches!(i.opcode, OP_SSTORE | OP_CALL | OP_CALLCODE | OP_DELEGATECALL))
            .count();
        expensive as f64 / instructions.len() as f64
    }
}

impl Default for BytecodeScreener {
    fn default() -> Self {
        Self::new()
    }
}
