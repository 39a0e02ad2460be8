//! x86_64 control-transfer synthesis
//!
//! The patcher only ever emits relative transfers (the displacement is
//! measured from the end of the instruction) plus one absolute form, the
//! rip-indirect jump stub, for targets outside 32-bit reach.

use crate::errors::{Error, Result};

const X64_CALLQ: u8 = 0xe8;
const X64_JMPQ: u8 = 0xe9;
const X64_JMP: u8 = 0xeb;

/// jmpq *0(%rip) followed by the 64-bit target
const INDIRECT_JMP: [u8; 6] = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// callq rel32, 5 bytes
    Call,
    /// jmpq rel32, 5 bytes
    Jmpq,
    /// jmp rel8, 2 bytes
    Jmp,
}

impl JumpKind {
    pub fn encoded_len(self) -> usize {
        match self {
            JumpKind::Call | JumpKind::Jmpq => 5,
            JumpKind::Jmp => 2,
        }
    }
}

/// encode a relative transfer at `cur` landing on `tgt`
pub fn relative_jump(kind: JumpKind, cur: u64, tgt: u64) -> Result<Vec<u8>> {
    let len = kind.encoded_len() as i64;
    let disp = tgt as i64 - cur as i64 - len;
    match kind {
        JumpKind::Call | JumpKind::Jmpq => {
            if disp < i64::from(i32::min_value()) || disp > i64::from(i32::max_value()) {
                return Err(Error::EncodingRange { cur, tgt, bits: 32 });
            }
            let opcode = if kind == JumpKind::Call {
                X64_CALLQ
            } else {
                X64_JMPQ
            };
            let mut buf = Vec::with_capacity(5);
            buf.push(opcode);
            buf.extend_from_slice(&(disp as i32).to_le_bytes());
            Ok(buf)
        }
        JumpKind::Jmp => {
            if disp < i64::from(i8::min_value()) || disp > i64::from(i8::max_value()) {
                return Err(Error::EncodingRange { cur, tgt, bits: 8 });
            }
            Ok(vec![X64_JMP, disp as i8 as u8])
        }
    }
}

/// absolute jump stub placed in a patch place; reaches any 64-bit target
pub fn indirect_jump(tgt: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(INDIRECT_JMP.len() + 8);
    buf.extend_from_slice(&INDIRECT_JMP);
    buf.extend_from_slice(&tgt.to_le_bytes());
    buf
}
