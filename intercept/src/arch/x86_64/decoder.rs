//! x86_64 length decoder.
//!
//! Only lengths, control-flow classes and pc-relative fields are recovered;
//! operand semantics are irrelevant for relocation. Covers legacy and REX
//! prefixes, the one-, two- and three-byte maps, VEX and EVEX.

use crate::arch::{InsnClass, Instruction, RelOperand};
use crate::error::DecodeError;

const MAX_LEN: usize = 15;

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, DecodeError> {
        self.bytes.get(self.pos).copied().ok_or(DecodeError::Truncated {
            needed: self.pos + 1,
            available: self.bytes.len(),
        })
    }

    fn next(&mut self) -> Result<u8, DecodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if self.pos + n > self.bytes.len() {
            return Err(DecodeError::Truncated { needed: self.pos + n, available: self.bytes.len() });
        }
        self.pos += n;
        Ok(())
    }

    fn signed(&self, at: usize, width: usize) -> i64 {
        match width {
            1 => self.bytes[at] as i8 as i64,
            2 => i16::from_le_bytes([self.bytes[at], self.bytes[at + 1]]) as i64,
            _ => i32::from_le_bytes([
                self.bytes[at],
                self.bytes[at + 1],
                self.bytes[at + 2],
                self.bytes[at + 3],
            ]) as i64,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Prefixes {
    opsize: bool,
    addrsize: bool,
    rep: bool,
    rex: u8,
}

impl Prefixes {
    fn rex_w(&self) -> bool {
        self.rex & 0x08 != 0
    }

    fn rex_b(&self) -> bool {
        self.rex & 0x01 != 0
    }

    fn imm_z(&self) -> usize {
        if self.opsize {
            2
        } else {
            4
        }
    }
}

struct ModRm {
    byte: u8,
    /// Offset of the disp32 when the operand is RIP-relative.
    rip_disp: Option<usize>,
}

impl ModRm {
    fn reg(&self) -> u8 {
        (self.byte >> 3) & 7
    }
}

fn read_modrm(cur: &mut Cursor<'_>) -> Result<ModRm, DecodeError> {
    let byte = cur.next()?;
    let md = byte >> 6;
    let rm = byte & 7;
    let mut rip_disp = None;
    if md != 3 {
        if rm == 4 {
            let sib = cur.next()?;
            if md == 0 && sib & 7 == 5 {
                cur.skip(4)?;
            }
        }
        match md {
            0 if rm == 5 => {
                rip_disp = Some(cur.pos);
                cur.skip(4)?;
            }
            1 => cur.skip(1)?,
            2 => cur.skip(4)?,
            _ => {}
        }
    }
    Ok(ModRm { byte, rip_disp })
}

fn one_byte_has_modrm(op: u8) -> bool {
    matches!(
        op,
        0x00..=0x03
            | 0x08..=0x0B
            | 0x10..=0x13
            | 0x18..=0x1B
            | 0x20..=0x23
            | 0x28..=0x2B
            | 0x30..=0x33
            | 0x38..=0x3B
            | 0x63
            | 0x69
            | 0x6B
            | 0x80..=0x81
            | 0x83..=0x8F
            | 0xC0..=0xC1
            | 0xC6..=0xC7
            | 0xD0..=0xD3
            | 0xD8..=0xDF
            | 0xF6..=0xF7
            | 0xFE..=0xFF
    )
}

fn one_byte_imm_size(op: u8, p: &Prefixes) -> usize {
    match op {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => p.imm_z(),
        0x68 | 0x69 | 0x81 | 0xA9 | 0xC7 => p.imm_z(),
        0x6A | 0x6B | 0x80 | 0x83 | 0xA8 | 0xC0 | 0xC1 | 0xC6 | 0xCD => 1,
        0xE4..=0xE7 => 1,
        // moffs: address-sized, 64-bit unless overridden
        0xA0..=0xA3 => {
            if p.addrsize {
                4
            } else {
                8
            }
        }
        0xB0..=0xB7 => 1,
        0xB8..=0xBF => {
            if p.rex_w() {
                8
            } else {
                p.imm_z()
            }
        }
        0xC2 | 0xCA => 2,
        0xC8 => 3,
        _ => 0,
    }
}

fn invalid_in_long_mode(op: u8) -> bool {
    matches!(
        op,
        0x06 | 0x07
            | 0x0E
            | 0x16
            | 0x17
            | 0x1E
            | 0x1F
            | 0x27
            | 0x2F
            | 0x37
            | 0x3F
            | 0x60
            | 0x61
            | 0x82
            | 0x9A
            | 0xCE
            | 0xD4
            | 0xD5
            | 0xD6
            | 0xEA
    )
}

fn two_byte_has_modrm(op: u8) -> bool {
    !matches!(
        op,
        0x05..=0x09 | 0x0B | 0x0E | 0x30..=0x37 | 0x77 | 0x80..=0x8F | 0xA0..=0xA2 | 0xA8..=0xAA | 0xC8..=0xCF
    )
}

fn two_byte_imm_size(op: u8) -> usize {
    match op {
        0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => 1,
        0x80..=0x8F => 4,
        _ => 0,
    }
}

/// Immediate size for VEX/EVEX-encoded instructions in `map`.
fn vex_imm_size(map: u8, op: u8) -> usize {
    match map {
        3 => 1,
        1 if matches!(op, 0x70..=0x73 | 0xC2 | 0xC4..=0xC6) => 1,
        _ => 0,
    }
}

struct Decoded {
    opcode: u32,
    class: InsnClass,
    /// Branch displacement field (offset, width).
    branch: Option<(usize, usize)>,
    rip_disp: Option<usize>,
}

impl Decoded {
    fn plain(opcode: u32, class: InsnClass) -> Self {
        Self { opcode, class, branch: None, rip_disp: None }
    }

    fn with_modrm(opcode: u32, m: &ModRm) -> Self {
        let class = if m.rip_disp.is_some() { InsnClass::PcRelative } else { InsnClass::Other };
        Self { opcode, class, branch: None, rip_disp: m.rip_disp }
    }
}

/// Decode one instruction from the start of `window`, which lives at `pc`.
pub fn decode(window: &[u8], pc: u64) -> Result<Instruction, DecodeError> {
    let mut cur = Cursor { bytes: window, pos: 0 };
    let mut p = Prefixes::default();

    loop {
        match cur.peek()? {
            0x66 => p.opsize = true,
            0x67 => p.addrsize = true,
            0xF3 => p.rep = true,
            0xF2 | 0xF0 | 0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 => {}
            _ => break,
        }
        cur.pos += 1;
        if cur.pos >= MAX_LEN {
            return Err(DecodeError::InvalidOpcode { pc, opcode: window[0] as u32 });
        }
    }
    if cur.peek()? & 0xF0 == 0x40 {
        p.rex = cur.next()?;
    }

    let op = cur.next()?;
    let d = match op {
        0x0F => decode_0f(&mut cur, &p)?,
        0xC4 | 0xC5 => decode_vex(&mut cur, op)?,
        0x62 => decode_evex(&mut cur)?,
        op if invalid_in_long_mode(op) => {
            return Err(DecodeError::InvalidOpcode { pc, opcode: op as u32 });
        }
        0xC3 | 0xCB => Decoded::plain(op as u32, InsnClass::Ret),
        0xC2 | 0xCA => {
            cur.skip(2)?;
            Decoded::plain(op as u32, InsnClass::Ret)
        }
        0xCC | 0xF4 => Decoded::plain(op as u32, InsnClass::Trap),
        0x90 if !p.rex_b() => Decoded::plain(op as u32, InsnClass::Nop),
        0x70..=0x7F => {
            let at = cur.pos;
            cur.skip(1)?;
            Decoded { branch: Some((at, 1)), ..Decoded::plain(op as u32, InsnClass::CondJump) }
        }
        0xE0..=0xE3 => {
            let at = cur.pos;
            cur.skip(1)?;
            Decoded { branch: Some((at, 1)), ..Decoded::plain(op as u32, InsnClass::CompareBranch) }
        }
        0xEB => {
            let at = cur.pos;
            cur.skip(1)?;
            Decoded { branch: Some((at, 1)), ..Decoded::plain(op as u32, InsnClass::Jump) }
        }
        0xE8 | 0xE9 => {
            let at = cur.pos;
            cur.skip(4)?;
            let class = if op == 0xE8 { InsnClass::Call } else { InsnClass::Jump };
            Decoded { branch: Some((at, 4)), ..Decoded::plain(op as u32, class) }
        }
        op if one_byte_has_modrm(op) => {
            let m = read_modrm(&mut cur)?;
            let imm = match op {
                0xF6 if m.reg() <= 1 => 1,
                0xF7 if m.reg() <= 1 => p.imm_z(),
                _ => one_byte_imm_size(op, &p),
            };
            cur.skip(imm)?;
            let mut d = Decoded::with_modrm(op as u32, &m);
            // FF /4 and FF /5: jmp r/m and jmp m16:64
            if op == 0xFF && matches!(m.reg(), 4 | 5) {
                d.class = InsnClass::IndirectJump;
            }
            d
        }
        op => {
            cur.skip(one_byte_imm_size(op, &p))?;
            Decoded::plain(op as u32, InsnClass::Other)
        }
    };

    let len = cur.pos;
    if len > MAX_LEN {
        return Err(DecodeError::InvalidOpcode { pc, opcode: d.opcode });
    }
    let end = pc.wrapping_add(len as u64);
    let (rel, target) = match (d.branch, d.rip_disp) {
        (Some((offset, width)), _) => {
            let disp = cur.signed(offset, width);
            (Some(RelOperand { offset, width }), Some(end.wrapping_add(disp as u64)))
        }
        (None, Some(offset)) => {
            let disp = cur.signed(offset, 4);
            (Some(RelOperand { offset, width: 4 }), Some(end.wrapping_add(disp as u64)))
        }
        (None, None) => (None, None),
    };

    Ok(Instruction { pc, len, opcode: d.opcode, class: d.class, rel, target })
}

fn decode_0f(cur: &mut Cursor<'_>, p: &Prefixes) -> Result<Decoded, DecodeError> {
    let op2 = cur.next()?;
    let opcode = 0x0F00 | op2 as u32;
    let d = match op2 {
        0x0B => Decoded::plain(opcode, InsnClass::Trap),
        0x38 => {
            let op3 = cur.next()?;
            let m = read_modrm(cur)?;
            Decoded::with_modrm(0x0F_3800 | op3 as u32, &m)
        }
        0x3A => {
            let op3 = cur.next()?;
            let m = read_modrm(cur)?;
            cur.skip(1)?;
            Decoded::with_modrm(0x0F_3A00 | op3 as u32, &m)
        }
        // 3DNow!: opcode suffix byte after the operands
        0x0F => {
            let m = read_modrm(cur)?;
            cur.skip(1)?;
            Decoded::with_modrm(opcode, &m)
        }
        0x80..=0x8F => {
            let at = cur.pos;
            cur.skip(4)?;
            Decoded { branch: Some((at, 4)), ..Decoded::plain(opcode, InsnClass::CondJump) }
        }
        0x1E if p.rep && matches!(cur.peek()?, 0xFA | 0xFB) => {
            cur.skip(1)?;
            Decoded::plain(opcode, InsnClass::FunctionEntry)
        }
        // UD1 / UD0
        0xB9 | 0xFF => {
            read_modrm(cur)?;
            Decoded::plain(opcode, InsnClass::Trap)
        }
        0x1F | 0x18..=0x1D => {
            let m = read_modrm(cur)?;
            let mut d = Decoded::with_modrm(opcode, &m);
            if op2 == 0x1F && d.class == InsnClass::Other {
                d.class = InsnClass::Nop;
            }
            d
        }
        op2 if two_byte_has_modrm(op2) => {
            let m = read_modrm(cur)?;
            cur.skip(two_byte_imm_size(op2))?;
            Decoded::with_modrm(opcode, &m)
        }
        op2 => {
            cur.skip(two_byte_imm_size(op2))?;
            Decoded::plain(opcode, InsnClass::Other)
        }
    };
    Ok(d)
}

fn decode_vex(cur: &mut Cursor<'_>, lead: u8) -> Result<Decoded, DecodeError> {
    let map = if lead == 0xC5 {
        cur.next()?;
        1
    } else {
        let p1 = cur.next()?;
        cur.next()?;
        p1 & 0x1F
    };
    let op = cur.next()?;
    let opcode = ((lead as u32) << 16) | ((map as u32) << 8) | op as u32;
    // vzeroupper / vzeroall carry no ModRM
    if map == 1 && op == 0x77 {
        return Ok(Decoded::plain(opcode, InsnClass::Other));
    }
    let m = read_modrm(cur)?;
    cur.skip(vex_imm_size(map, op))?;
    Ok(Decoded::with_modrm(opcode, &m))
}

fn decode_evex(cur: &mut Cursor<'_>) -> Result<Decoded, DecodeError> {
    let p0 = cur.next()?;
    cur.skip(2)?;
    let map = p0 & 0x07;
    let op = cur.next()?;
    let m = read_modrm(cur)?;
    cur.skip(vex_imm_size(map, op))?;
    Ok(Decoded::with_modrm(0x62_0000 | ((map as u32) << 8) | op as u32, &m))
}

/// `endbr64` at the start of `code`.
pub fn is_endbr64(code: &[u8]) -> bool {
    code.starts_with(&[0xF3, 0x0F, 0x1E, 0xFA])
}

/// `push rbp; mov rbp, rsp`, optionally behind `endbr64`.
pub fn is_frame_setup(code: &[u8]) -> bool {
    let code = if is_endbr64(code) { &code[4..] } else { code };
    code.starts_with(&[0x55, 0x48, 0x89, 0xE5])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(code: &[u8]) -> Instruction {
        decode(code, 0x1000).expect("decode")
    }

    #[test]
    fn decode_prologue_instructions() {
        assert_eq!(one(&[0x55]).len, 1);
        assert_eq!(one(&[0x48, 0x89, 0xE5]).len, 3);
        // sub rsp, 0x20
        assert_eq!(one(&[0x48, 0x83, 0xEC, 0x20]).len, 4);
        // mov [rbp-0x8], rdi
        assert_eq!(one(&[0x48, 0x89, 0x7D, 0xF8]).len, 4);
        // mov qword [rsp+0x10], 0x1
        assert_eq!(one(&[0x48, 0xC7, 0x44, 0x24, 0x10, 0x01, 0x00, 0x00, 0x00]).len, 9);
        // movabs rax, imm64
        assert_eq!(one(&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8]).len, 10);
    }

    #[test]
    fn decode_ret_and_traps() {
        assert_eq!(one(&[0xC3]).class, InsnClass::Ret);
        let ret_imm = one(&[0xC2, 0x08, 0x00]);
        assert_eq!((ret_imm.len, ret_imm.class), (3, InsnClass::Ret));
        assert_eq!(one(&[0xF3, 0xC3]).class, InsnClass::Ret);
        assert_eq!(one(&[0xCC]).class, InsnClass::Trap);
        let ud2 = one(&[0x0F, 0x0B]);
        assert_eq!((ud2.len, ud2.class), (2, InsnClass::Trap));
    }

    #[test]
    fn decode_already_patched_far_jump() {
        // jmp [rip+2]; ud2; .quad: the jmp and then the trap sentinel
        let code = [0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0F, 0x0B, 1, 2, 3, 4, 5, 6, 7, 8];
        let jmp = one(&code);
        assert_eq!(jmp.len, 6);
        assert_eq!(jmp.class, InsnClass::IndirectJump);
        assert!(jmp.is_terminator() && !jmp.is_branch());
        assert_eq!(jmp.target, Some(0x1008));
        assert_eq!(decode(&code[6..], 0x1006).unwrap().class, InsnClass::Trap);
    }

    #[test]
    fn decode_ff_group_jumps_and_calls() {
        // jmp rax; jmp r11; jmp far [rax]
        let jmp_rax = one(&[0xFF, 0xE0]);
        assert_eq!((jmp_rax.len, jmp_rax.class, jmp_rax.target), (2, InsnClass::IndirectJump, None));
        assert_eq!(one(&[0x41, 0xFF, 0xE3]).class, InsnClass::IndirectJump);
        assert_eq!(one(&[0xFF, 0x28]).class, InsnClass::IndirectJump);
        // call rax and call [rip+0x10] fall through to the next instruction
        assert_eq!(one(&[0xFF, 0xD0]).class, InsnClass::Other);
        let call_mem = one(&[0xFF, 0x15, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(call_mem.class, InsnClass::PcRelative);
        assert!(!call_mem.is_terminator());
        // inc dword [rax] and push [rax] are unaffected
        assert_eq!(one(&[0xFF, 0x00]).class, InsnClass::Other);
        assert_eq!(one(&[0xFF, 0x30]).class, InsnClass::Other);
    }

    #[test]
    fn decode_nops() {
        assert_eq!(one(&[0x90]).class, InsnClass::Nop);
        // xchg r8, rax is not a nop
        assert_eq!(one(&[0x41, 0x90]).class, InsnClass::Other);
        let long = one(&[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!((long.len, long.class), (9, InsnClass::Nop));
        let cs_nop = one(&[0x66, 0x2E, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!((cs_nop.len, cs_nop.class), (10, InsnClass::Nop));
    }

    #[test]
    fn decode_branch_targets() {
        let jcc = one(&[0x74, 0x10]);
        assert_eq!(jcc.class, InsnClass::CondJump);
        assert_eq!(jcc.rel, Some(RelOperand { offset: 1, width: 1 }));
        assert_eq!(jcc.target, Some(0x1012));

        let back = one(&[0xEB, 0xFE]);
        assert_eq!(back.class, InsnClass::Jump);
        assert_eq!(back.target, Some(0x1000));

        let jcc32 = one(&[0x0F, 0x85, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(jcc32.rel, Some(RelOperand { offset: 2, width: 4 }));
        assert_eq!(jcc32.target, Some(0x1106));

        let call = one(&[0xE8, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(call.class, InsnClass::Call);
        assert_eq!(call.target, Some(0x1005));

        let jrcxz = one(&[0xE3, 0x05]);
        assert_eq!(jrcxz.class, InsnClass::CompareBranch);
        assert_eq!(jrcxz.target, Some(0x1007));
    }

    #[test]
    fn decode_rip_relative_with_immediate() {
        // cmp dword [rip+0x100], 0x5: disp32 at offset 2, then imm8
        let insn = one(&[0x83, 0x3D, 0x00, 0x01, 0x00, 0x00, 0x05]);
        assert_eq!(insn.len, 7);
        assert_eq!(insn.class, InsnClass::PcRelative);
        assert_eq!(insn.rel, Some(RelOperand { offset: 2, width: 4 }));
        assert_eq!(insn.target, Some(0x1007 + 0x100));

        // lea rax, [rip-0x10]
        let lea = one(&[0x48, 0x8D, 0x05, 0xF0, 0xFF, 0xFF, 0xFF]);
        assert_eq!(lea.target, Some(0x1007 - 0x10));
    }

    #[test]
    fn decode_sib_without_base() {
        // mov eax, [rax*4 + 0x1000]
        assert_eq!(one(&[0x8B, 0x04, 0x85, 0x00, 0x10, 0x00, 0x00]).len, 7);
        // lea rax, [rdi+rdi]
        assert_eq!(one(&[0x48, 0x8D, 0x04, 0x3F]).len, 4);
    }

    #[test]
    fn decode_moffs_respects_address_size() {
        assert_eq!(one(&[0x48, 0xA1, 1, 2, 3, 4, 5, 6, 7, 8]).len, 10);
        assert_eq!(one(&[0x67, 0xA1, 1, 2, 3, 4]).len, 6);
    }

    #[test]
    fn decode_group3_test_immediate() {
        // test byte [rdi], 0x1
        assert_eq!(one(&[0xF6, 0x07, 0x01]).len, 3);
        // test eax, 0x10 via F7 /0
        assert_eq!(one(&[0xF7, 0xC0, 0x10, 0x00, 0x00, 0x00]).len, 6);
        // neg rax: F7 /3 has no immediate
        assert_eq!(one(&[0x48, 0xF7, 0xD8]).len, 3);
    }

    #[test]
    fn decode_three_byte_maps() {
        // pshufb xmm0, xmm1
        assert_eq!(one(&[0x66, 0x0F, 0x38, 0x00, 0xC1]).len, 5);
        // palignr xmm0, xmm1, 4
        assert_eq!(one(&[0x66, 0x0F, 0x3A, 0x0F, 0xC1, 0x04]).len, 6);
    }

    #[test]
    fn decode_vex_and_evex() {
        // vmovdqu ymm0, [rdi]
        assert_eq!(one(&[0xC5, 0xFE, 0x6F, 0x07]).len, 4);
        // vpxor xmm0, xmm0, [rip+0x20]
        let rip = one(&[0xC5, 0xF9, 0xEF, 0x05, 0x20, 0x00, 0x00, 0x00]);
        assert_eq!((rip.len, rip.class), (8, InsnClass::PcRelative));
        // vpblendd ymm0, ymm1, ymm2, 0x3 (map 0F3A, imm8)
        assert_eq!(one(&[0xC4, 0xE3, 0x75, 0x02, 0xC2, 0x03]).len, 6);
        assert_eq!(one(&[0xC5, 0xF8, 0x77]).len, 3);
        // vmovdqu64 zmm0, [rdi]
        assert_eq!(one(&[0x62, 0xF1, 0xFE, 0x48, 0x6F, 0x07]).len, 6);
    }

    #[test]
    fn decode_entry_markers() {
        let endbr = one(&[0xF3, 0x0F, 0x1E, 0xFA]);
        assert_eq!((endbr.len, endbr.class), (4, InsnClass::FunctionEntry));
        assert!(is_endbr64(&[0xF3, 0x0F, 0x1E, 0xFA, 0x55]));
        assert!(is_frame_setup(&[0x55, 0x48, 0x89, 0xE5]));
        assert!(is_frame_setup(&[0xF3, 0x0F, 0x1E, 0xFA, 0x55, 0x48, 0x89, 0xE5]));
        assert!(!is_frame_setup(&[0x48, 0x89, 0xE5]));
    }

    #[test]
    fn decode_rejects_invalid_and_truncated() {
        assert!(matches!(decode(&[0x06], 0x1000), Err(DecodeError::InvalidOpcode { opcode: 0x06, .. })));
        assert!(matches!(decode(&[0xE8, 0x01], 0x1000), Err(DecodeError::Truncated { needed: 5, available: 2 })));
        assert!(matches!(decode(&[], 0x1000), Err(DecodeError::Truncated { .. })));
    }
}
