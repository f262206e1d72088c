use crate::arch::x86_64::writer::{Reg, X86_64Writer};
use crate::arch::{fits_signed, Emitted, Encoding, InsnClass, Instruction, RelocContext};
use crate::error::RelocationError;

/// Far jump size: `jmp [rip+2]; ud2; .quad`.
const FAR_JMP_LEN: i8 = 16;

/// Copy of `raw` with its relative field rewritten for a copy at `at`.
fn patch_rel(insn: &Instruction, raw: &[u8], at: u64, target: u64) -> Option<Vec<u8>> {
    let rel = insn.rel?;
    let disp = (target as i64).wrapping_sub(at as i64 + insn.len as i64);
    if !fits_signed(disp, (rel.width * 8) as u32) {
        return None;
    }
    let mut out = raw[..insn.len].to_vec();
    let bytes = disp.to_le_bytes();
    out[rel.offset..rel.offset + rel.width].copy_from_slice(&bytes[..rel.width]);
    Some(out)
}

fn condition_code(insn: &Instruction, raw: &[u8]) -> u8 {
    // The condition lives in the low nibble of the byte before the displacement.
    insn.rel.map(|r| raw[r.offset - 1] & 0x0F).unwrap_or(0)
}

/// Re-emit `insn` at `at`, widening when its displacement no longer fits.
pub fn relocate(
    insn: &Instruction,
    raw: &[u8],
    at: u64,
    target: Option<u64>,
    floor: Encoding,
    ctx: &RelocContext,
) -> Result<Emitted, RelocationError> {
    let verbatim = || Emitted { bytes: raw[..insn.len].to_vec(), encoding: Encoding::Original };
    let Some(target) = target else {
        return Ok(verbatim());
    };
    let overflow = || {
        if insn.class == InsnClass::CompareBranch {
            RelocationError::NoWideForm { pc: insn.pc }
        } else {
            RelocationError::DisplacementOverflow { pc: insn.pc, target }
        }
    };

    let mut level = floor;
    if level == Encoding::Original {
        if let Some(bytes) = patch_rel(insn, raw, at, target) {
            return Ok(Emitted { bytes, encoding: Encoding::Original });
        }
        if !ctx.allow_widening {
            return Err(overflow());
        }
        level = Encoding::Wide;
    }

    match insn.class {
        // RIP-relative memory operands have no wider form.
        InsnClass::PcRelative => Err(RelocationError::DisplacementOverflow { pc: insn.pc, target }),
        InsnClass::Jump => {
            let mut w = X86_64Writer::new(at);
            if level == Encoding::Wide && super::writer::near_reachable(at, 5, target) {
                w.put_jmp_near(target);
                return Ok(Emitted { bytes: w.into_bytes(), encoding: Encoding::Wide });
            }
            w.put_jmp_far(target);
            Ok(Emitted { bytes: w.into_bytes(), encoding: Encoding::Absolute })
        }
        InsnClass::CondJump => {
            let cc = condition_code(insn, raw);
            let mut w = X86_64Writer::new(at);
            if level == Encoding::Wide && super::writer::near_reachable(at, 6, target) {
                w.put_jcc_near(cc, target);
                return Ok(Emitted { bytes: w.into_bytes(), encoding: Encoding::Wide });
            }
            // Inverted condition skips the far jump.
            w.put_jcc_short_rel(cc ^ 1, FAR_JMP_LEN);
            w.put_jmp_far(target);
            Ok(Emitted { bytes: w.into_bytes(), encoding: Encoding::Absolute })
        }
        InsnClass::Call => {
            let mut w = X86_64Writer::new(at);
            if level == Encoding::Wide && super::writer::near_reachable(at, 5, target) {
                w.put_call_near(target);
                return Ok(Emitted { bytes: w.into_bytes(), encoding: Encoding::Wide });
            }
            let scratch = Reg::from_index(ctx.scratch);
            w.put_mov_reg_imm64(scratch, target);
            w.put_call_reg(scratch);
            Ok(Emitted { bytes: w.into_bytes(), encoding: Encoding::Absolute })
        }
        InsnClass::CompareBranch => {
            // jrcxz/loop only exist with rel8: branch over a short jump onto a
            // long jump to the real target.
            let prefix = &raw[..insn.rel.map(|r| r.offset).unwrap_or(1)];
            let mut w = X86_64Writer::new(at);
            w.put_bytes(prefix);
            w.put_bytes(&[0x02]);
            let far_at = w.pc() + 2;
            if level == Encoding::Wide && super::writer::near_reachable(far_at, 5, target) {
                w.put_bytes(&[0xEB, 0x05]);
                w.put_jmp_near(target);
                return Ok(Emitted { bytes: w.into_bytes(), encoding: Encoding::Wide });
            }
            w.put_bytes(&[0xEB, FAR_JMP_LEN as u8]);
            w.put_jmp_far(target);
            Ok(Emitted { bytes: w.into_bytes(), encoding: Encoding::Absolute })
        }
        _ => Err(overflow()),
    }
}

/// `call $+0` pushes its own return address; the copy must push the original one.
pub fn is_pc_thunk(insn: &Instruction) -> bool {
    insn.class == InsnClass::Call && insn.target == Some(insn.end())
}

pub fn relocate_pc_thunk(insn: &Instruction, at: u64, ctx: &RelocContext) -> Emitted {
    let scratch = Reg::from_index(ctx.scratch);
    let mut w = X86_64Writer::new(at);
    w.put_mov_reg_imm64(scratch, insn.end());
    w.put_push_reg(scratch);
    Emitted { bytes: w.into_bytes(), encoding: Encoding::Absolute }
}
