use crate::arch::{InsnClass, Instruction, RelOperand};
use crate::error::DecodeError;

pub const NOP: u32 = 0xD503201F;
pub const RET: u32 = 0xD65F03C0;
pub const BTI_C: u32 = 0xD503245F;
pub const PACIASP: u32 = 0xD503233F;
pub const PACIBSP: u32 = 0xD503237F;

#[inline]
fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

pub fn decode_imm26(insn: u32) -> i64 {
    sign_extend(insn & 0x03FF_FFFF, 26) << 2
}

pub fn decode_imm19(insn: u32) -> i64 {
    sign_extend((insn >> 5) & 0x7FFFF, 19) << 2
}

pub fn decode_imm14(insn: u32) -> i64 {
    sign_extend((insn >> 5) & 0x3FFF, 14) << 2
}

/// ADR/ADRP immediate, in bytes (ADR) or pages (ADRP).
pub fn decode_adr_imm(insn: u32) -> i64 {
    let immlo = (insn >> 29) & 0x3;
    let immhi = (insn >> 5) & 0x7FFFF;
    sign_extend((immhi << 2) | immlo, 21)
}

pub fn is_bti(insn: u32) -> bool {
    insn & 0xFFFF_FF3F == 0xD503_241F
}

/// Classify one instruction word.
pub fn classify(insn: u32) -> InsnClass {
    if insn & 0x7C00_0000 == 0x1400_0000 {
        if insn & 0x8000_0000 != 0 {
            InsnClass::Call
        } else {
            InsnClass::Jump
        }
    } else if insn & 0xFF00_0010 == 0x5400_0000 {
        InsnClass::CondJump
    } else if insn & 0x7E00_0000 == 0x3400_0000 {
        InsnClass::CompareBranch
    } else if insn & 0x7E00_0000 == 0x3600_0000 {
        InsnClass::TestBranch
    } else if insn & 0x9F00_0000 == 0x1000_0000 {
        InsnClass::PcRelative
    } else if insn & 0x9F00_0000 == 0x9000_0000 {
        InsnClass::PcRelativePage
    } else if insn & 0x3B00_0000 == 0x1800_0000 {
        InsnClass::LiteralLoad
    } else if insn & 0xFFFF_FC1F == 0xD65F_0000 || insn == 0xD65F_0BFF || insn == 0xD65F_0FFF {
        InsnClass::Ret
    } else if insn == NOP {
        InsnClass::Nop
    } else if insn & 0xFFE0_001F == 0xD420_0000 || insn & 0xFFE0_001F == 0xD440_0000 || insn & 0xFFFF_0000 == 0 {
        // BRK, HLT, UDF
        InsnClass::Trap
    } else if is_bti(insn) || insn == PACIASP || insn == PACIBSP {
        InsnClass::FunctionEntry
    } else if insn & 0xFFFF_FC1F == 0xD61F_0000 || insn & 0xFFFF_F81F == 0xD61F_081F || insn & 0xFFFF_F800 == 0xD71F_0800 {
        // BR, BRAAZ/BRABZ, BRAA/BRAB
        InsnClass::IndirectJump
    } else {
        InsnClass::Other
    }
}

fn target_of(insn: u32, class: InsnClass, pc: u64) -> Option<u64> {
    let delta = match class {
        InsnClass::Jump | InsnClass::Call => decode_imm26(insn),
        InsnClass::CondJump | InsnClass::CompareBranch | InsnClass::LiteralLoad => decode_imm19(insn),
        InsnClass::TestBranch => decode_imm14(insn),
        InsnClass::PcRelative => decode_adr_imm(insn),
        InsnClass::PcRelativePage => {
            let pages = decode_adr_imm(insn);
            return Some((pc & !0xFFF).wrapping_add((pages << 12) as u64));
        }
        _ => return None,
    };
    Some(pc.wrapping_add(delta as u64))
}

pub fn decode(window: &[u8], pc: u64) -> Result<Instruction, DecodeError> {
    if pc & 3 != 0 {
        return Err(DecodeError::Misaligned { pc });
    }
    let Some(word) = window.get(..4) else {
        return Err(DecodeError::Truncated { needed: 4, available: window.len() });
    };
    let insn = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
    let class = classify(insn);
    let target = target_of(insn, class, pc);
    Ok(Instruction {
        pc,
        len: 4,
        opcode: insn,
        class,
        rel: target.map(|_| RelOperand { offset: 0, width: 4 }),
        target,
    })
}

/// `stp x29, x30, [sp, #-N]!`, optionally behind a landing marker.
pub fn is_frame_setup(code: &[u8]) -> bool {
    let word = |i: usize| code.get(i * 4..i * 4 + 4).map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    let mut i = 0;
    while let Some(w) = word(i) {
        if classify(w) == InsnClass::FunctionEntry && i < 2 {
            i += 1;
            continue;
        }
        // STP (pre-index, 64-bit) with Rt=x29, Rt2=x30, Rn=sp; any offset.
        return w & 0xFFC0_7FFF == 0xA980_7BFD;
    }
    false
}
