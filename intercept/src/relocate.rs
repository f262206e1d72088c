//! Architecture-agnostic prologue relocation.
//!
//! Picks the prefix a redirect displaces, refuses functions that branch back
//! into it, and re-emits it at a new address until every instruction offset
//! is stable.

use crate::arch::{decode_all, Arch, Encoding, InsnClass, Instruction, RelocContext, DECODE_WINDOW};
use crate::error::{DecodeError, PatchError, RelocationError, Result};
use log::{debug, trace};

/// Instructions displaced by a redirect of `needed` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    pub insns: Vec<Instruction>,
    /// `P`: byte length of the prefix.
    pub len: usize,
}

impl Prefix {
    fn index_of(&self, offset: usize, from: u64) -> Option<usize> {
        self.insns.iter().position(|i| (i.pc - from) as usize == offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocated {
    /// Relocated prefix followed by the tail jump (if any).
    pub bytes: Vec<u8>,
    pub prefix_len: usize,
    /// Length of the relocated prefix alone.
    pub body_len: usize,
    pub passes: usize,
    /// Instructions that left their original encoding.
    pub widened: usize,
}

/// Pass 1: accumulate whole instructions until `needed` bytes are covered,
/// then sweep in trailing returns and no-op padding.
pub fn select_prefix<A: Arch>(code: &[u8], from: u64, needed: usize) -> Result<Prefix> {
    let too_short = |len: usize| PatchError::FunctionTooShort { target: from as usize, len, needed };
    if needed >= code.len() {
        return Err(too_short(code.len()));
    }

    let mut insns = Vec::new();
    let mut off = 0usize;
    while off < code.len() {
        let end = (off + DECODE_WINDOW).min(code.len());
        let insn = match A::decode(&code[off..end], from + off as u64) {
            Ok(insn) => insn,
            Err(DecodeError::Truncated { .. }) if off < needed => return Err(too_short(off)),
            Err(DecodeError::Truncated { .. }) => break,
            Err(source) if off < needed => return Err(PatchError::Decode { pc: from + off as u64, source }),
            Err(_) => break,
        };
        if off >= needed && !matches!(insn.class, InsnClass::Ret | InsnClass::Nop) {
            break;
        }
        if off < needed && insn.class == InsnClass::Trap {
            // Padding or an existing redirect sentinel: the function ends here.
            return Err(too_short(off));
        }
        off += insn.len;
        insns.push(insn);
    }
    if off < needed {
        return Err(too_short(off));
    }
    Ok(Prefix { insns, len: off })
}

/// Reject branches that land inside the prefix from outside it, and prefix
/// branches that land between prefix instructions.
pub fn check_internal_branches<A: Arch>(
    code: &[u8],
    from: u64,
    prefix: &Prefix,
) -> std::result::Result<(), RelocationError> {
    let p = prefix.len as u64;
    let inside = |t: u64| t >= from && t < from + p;

    for insn in &prefix.insns {
        if let Some(t) = insn.target.filter(|_| insn.is_branch()) {
            if inside(t) && prefix.index_of((t - from) as usize, from).is_none() {
                return Err(RelocationError::MidInstructionTarget { target_offset: (t - from) as usize });
            }
        }
    }

    let (rest, err) = decode_all::<A>(&code[prefix.len..], from + p);
    if let Some(e) = err {
        debug!("branch scan stopped at {:#x}: {e}", from + p + rest.iter().map(|i| i.len as u64).sum::<u64>());
    }
    for insn in rest.iter().filter(|i| i.is_branch()) {
        let Some(t) = insn.target else { continue };
        // A recursive call re-enters through the redirect, which is intended.
        if insn.class == InsnClass::Call && t == from {
            continue;
        }
        if inside(t) {
            return Err(RelocationError::BranchIntoPatchedRegion {
                source_offset: (insn.pc - from) as usize,
                target_offset: (t - from) as usize,
            });
        }
    }
    Ok(())
}

/// Relocate the prefix of the function `code` (anchored at `from`) to `to`.
///
/// `code` is the whole function body; the tail jump back to `from + P` is
/// appended when the prefix does not cover all of it.
pub fn relocate<A: Arch>(code: &[u8], from: u64, needed: usize, to: u64, ctx: &RelocContext) -> Result<Relocated> {
    let prefix = select_prefix::<A>(code, from, needed)?;
    check_internal_branches::<A>(code, from, &prefix)?;
    emit::<A>(code, from, &prefix, to, ctx, code.len())
}

/// Pass 2 and onward: emit with the previous pass's layout until it repeats.
pub fn emit<A: Arch>(
    code: &[u8],
    from: u64,
    prefix: &Prefix,
    to: u64,
    ctx: &RelocContext,
    func_len: usize,
) -> Result<Relocated> {
    let n = prefix.insns.len();
    let mut floors = vec![Encoding::Original; n];
    let mut layout: Vec<usize> = prefix.insns.iter().map(|i| (i.pc - from) as usize).collect();
    let limit = 3 * n + 2;

    for pass in 1..=limit {
        let mut out = Vec::with_capacity(prefix.len * 2);
        let mut next_layout = Vec::with_capacity(n);
        for (idx, insn) in prefix.insns.iter().enumerate() {
            let off = (insn.pc - from) as usize;
            let raw = &code[off..off + insn.len];
            let at = to + out.len() as u64;
            let target = insn.target.map(|t| match t.checked_sub(from) {
                Some(rel) if rel < prefix.len as u64 => match prefix.index_of(rel as usize, from) {
                    Some(j) => to + layout[j] as u64,
                    None => t,
                },
                _ => t,
            });
            let emitted = A::encode_relocated(insn, raw, at, target, floors[idx], ctx)?;
            trace!("{:#x} -> {at:#x}: {:02x?} ({:?})", insn.pc, emitted.bytes, emitted.encoding);
            floors[idx] = floors[idx].max(emitted.encoding);
            next_layout.push(out.len());
            out.extend_from_slice(&emitted.bytes);
        }

        if next_layout == layout {
            let body_len = out.len();
            if prefix.len < func_len {
                out.extend(A::encode_tail_jump(to + body_len as u64, from + prefix.len as u64, ctx));
            }
            let widened = floors.iter().filter(|&&f| f > Encoding::Original).count();
            if widened > 0 {
                debug!("relocated {:#x}: {widened} instruction(s) widened after {pass} pass(es)", from);
            }
            return Ok(Relocated { bytes: out, prefix_len: prefix.len, body_len, passes: pass, widened });
        }
        layout = next_layout;
    }
    Err(RelocationError::DidNotConverge { passes: limit }.into())
}
