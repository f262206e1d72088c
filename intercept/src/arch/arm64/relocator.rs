use crate::arch::arm64::writer::{Arm64Writer, Reg};
use crate::arch::{fits_signed, Emitted, Encoding, InsnClass, Instruction, RelocContext};
use crate::error::RelocationError;

#[inline]
fn rd(insn: u32) -> u32 {
    insn & 0x1F
}

fn word_of(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// Words skipped by an inverted branch over `LDR; BR; .quad`.
const SKIP_LITERAL_JUMP: u32 = 5;
/// Words skipped by an inverted branch over one `B`.
const SKIP_SHORT_JUMP: u32 = 2;

/// B.cond with the condition inverted and a word offset of `words`.
fn invert_b_cond(insn: u32, words: u32) -> u32 {
    let cond = (insn & 0xF) ^ 1;
    (insn & 0xFF00_0010) | (words << 5) | cond
}

/// CBZ <-> CBNZ (bit 24) with a word offset of `words`.
fn invert_cbz(insn: u32, words: u32) -> u32 {
    let out = insn ^ (1 << 24);
    (out & !0x00FF_FFE0) | (words << 5)
}

/// TBZ <-> TBNZ (bit 24) with a word offset of `words`.
fn invert_tbz(insn: u32, words: u32) -> u32 {
    let out = insn ^ (1 << 24);
    (out & !0x0007_FFE0) | (words << 5)
}

/// Re-encode the immediate of a branch or literal with `delta` bytes, if it fits.
fn reencode(insn: u32, class: InsnClass, delta: i64) -> Option<u32> {
    if delta & 3 != 0 && !matches!(class, InsnClass::PcRelative | InsnClass::PcRelativePage) {
        return None;
    }
    match class {
        InsnClass::Jump | InsnClass::Call if fits_signed(delta, 28) => {
            Some((insn & 0xFC00_0000) | (((delta >> 2) as u32) & 0x03FF_FFFF))
        }
        InsnClass::CondJump | InsnClass::CompareBranch | InsnClass::LiteralLoad if fits_signed(delta, 21) => {
            Some((insn & !0x00FF_FFE0) | ((((delta >> 2) as u32) & 0x7FFFF) << 5))
        }
        InsnClass::TestBranch if fits_signed(delta, 16) => {
            Some((insn & !0x0007_FFE0) | ((((delta >> 2) as u32) & 0x3FFF) << 5))
        }
        InsnClass::PcRelative | InsnClass::PcRelativePage if fits_signed(delta, 21) => {
            let imm = delta as u32;
            Some((insn & 0x9F00_001F) | ((imm & 0x3) << 29) | (((imm >> 2) & 0x7FFFF) << 5))
        }
        _ => None,
    }
}

fn out_of_range(insn: &Instruction, target: u64) -> RelocationError {
    let pc = insn.pc;
    match insn.class {
        InsnClass::Jump | InsnClass::Call => RelocationError::BranchOutOfRange { pc, target },
        InsnClass::CondJump => RelocationError::CondBranchOutOfRange { pc, target },
        InsnClass::CompareBranch => RelocationError::CompareBranchOutOfRange { pc, target },
        InsnClass::TestBranch => RelocationError::TestBranchOutOfRange { pc, target },
        InsnClass::PcRelative => RelocationError::AdrOutOfRange { pc, target },
        InsnClass::PcRelativePage => RelocationError::AdrpOutOfRange { pc, target },
        _ => RelocationError::LiteralOutOfRange { pc, target },
    }
}

#[inline]
fn page_delta(from: u64, to: u64) -> i64 {
    ((to & !0xFFF) as i64).wrapping_sub((from & !0xFFF) as i64) >> 12
}

/// Re-emit one AArch64 instruction at `at`.
///
/// Each family keeps its native form while the immediate reaches, then falls
/// back to a sequence through `ctx.scratch` (or the destination register
/// itself for address and literal loads).
pub fn relocate(
    insn: &Instruction,
    raw: &[u8],
    at: u64,
    target: Option<u64>,
    floor: Encoding,
    ctx: &RelocContext,
) -> Result<Emitted, RelocationError> {
    let word = word_of(raw);
    let Some(target) = target else {
        return Ok(Emitted { bytes: raw[..4].to_vec(), encoding: Encoding::Original });
    };

    let mut level = floor;
    if level == Encoding::Original {
        let delta = if insn.class == InsnClass::PcRelativePage {
            page_delta(at, target)
        } else {
            (target as i64).wrapping_sub(at as i64)
        };
        if let Some(w) = reencode(word, insn.class, delta) {
            return Ok(Emitted { bytes: w.to_le_bytes().to_vec(), encoding: Encoding::Original });
        }
        if !ctx.allow_widening {
            return Err(out_of_range(insn, target));
        }
        level = Encoding::Wide;
    }

    let scratch = Reg::scratch(ctx.scratch);
    let mut w = Arm64Writer::new(at);
    let b_reaches = |from: u64| fits_signed((target as i64).wrapping_sub(from as i64), 28);
    let adrp_reaches = |from: u64| fits_signed(page_delta(from, target), 21);

    let encoding = match insn.class {
        InsnClass::Jump => {
            if level == Encoding::Wide && adrp_reaches(at) {
                w.put_adrp_add_br(scratch, target);
                Encoding::Wide
            } else {
                w.put_ldr_br_address(scratch, target);
                Encoding::Absolute
            }
        }
        InsnClass::Call => {
            if level == Encoding::Wide && adrp_reaches(at) {
                w.put_adrp(scratch, target);
                w.put_add_reg_reg_imm(scratch, scratch, (target & 0xFFF) as u32);
                w.put_blr_reg(scratch);
                Encoding::Wide
            } else {
                w.put_mov_reg_u64(scratch, target);
                w.put_blr_reg(scratch);
                Encoding::Absolute
            }
        }
        InsnClass::CondJump | InsnClass::CompareBranch | InsnClass::TestBranch => {
            let invert = match insn.class {
                InsnClass::CondJump => invert_b_cond,
                InsnClass::CompareBranch => invert_cbz,
                _ => invert_tbz,
            };
            if level == Encoding::Wide && b_reaches(at + 4) {
                w.put_u32(invert(word, SKIP_SHORT_JUMP));
                w.put_b_imm(target);
                Encoding::Wide
            } else {
                w.put_u32(invert(word, SKIP_LITERAL_JUMP));
                w.put_ldr_br_address(scratch, target);
                Encoding::Absolute
            }
        }
        InsnClass::PcRelative => {
            let dst = Reg::from_index(rd(word) as u8);
            if level == Encoding::Wide && adrp_reaches(at) {
                w.put_adrp(dst, target);
                w.put_add_reg_reg_imm(dst, dst, (target & 0xFFF) as u32);
                Encoding::Wide
            } else {
                w.put_mov_reg_u64(dst, target);
                Encoding::Absolute
            }
        }
        InsnClass::PcRelativePage => {
            w.put_mov_reg_u64(Reg::from_index(rd(word) as u8), target);
            Encoding::Absolute
        }
        InsnClass::LiteralLoad => {
            relocate_literal(&mut w, word, target, scratch);
            Encoding::Absolute
        }
        _ => return Err(out_of_range(insn, target)),
    };
    Ok(Emitted { bytes: w.into_bytes(), encoding })
}

/// Literal load through an absolute address materialized in a register.
fn relocate_literal(w: &mut Arm64Writer, word: u32, target: u64, scratch: Reg) {
    let rt = rd(word);
    let opc = word >> 30;
    let simd = word & (1 << 26) != 0;
    if simd {
        // FP/SIMD destinations never alias a GPR, so use the scratch as base.
        w.put_mov_reg_u64(scratch, target);
        let base = scratch as u32;
        let load = match opc {
            0 => 0xBD40_0000,
            1 => 0xFD40_0000,
            _ => 0x3DC0_0000,
        };
        w.put_u32(load | (base << 5) | rt);
        return;
    }
    match opc {
        // PRFM has no architectural effect.
        3 => w.put_nop(),
        _ => {
            let dst = Reg::from_index(rt as u8);
            w.put_mov_reg_u64(dst, target);
            let load = match opc {
                0 => 0xB940_0000,
                1 => 0xF940_0000,
                _ => 0xB980_0000,
            };
            w.put_u32(load | (rt << 5) | rt);
        }
    }
}

/// Register dest/source fields that can name x16 or x17.
fn uses_reg(insn: u32, reg: u32) -> bool {
    let fields = [insn & 0x1F, (insn >> 5) & 0x1F, (insn >> 10) & 0x1F, (insn >> 16) & 0x1F];
    fields.contains(&reg)
}

/// x16 unless the moved code already touches it, then x17.
pub fn pick_scratch(code: &[u8]) -> u8 {
    let words = code.chunks_exact(4).map(word_of);
    let mut x16 = false;
    let mut x17 = false;
    for w in words {
        x16 |= uses_reg(w, 16);
        x17 |= uses_reg(w, 17);
    }
    if x16 && !x17 {
        17
    } else {
        16
    }
}
