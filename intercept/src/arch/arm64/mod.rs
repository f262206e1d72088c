pub mod decoder;
pub mod relocator;
pub mod writer;

use crate::arch::{fits_signed, Arch, Emitted, Encoding, Instruction, RelocContext};
use crate::error::{DecodeError, RelocationError};
use writer::{Arm64Writer, Reg};

/// B imm26: ±128MB.
pub const B_RANGE: u64 = 128 * 1024 * 1024 - 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm64;

fn encode_jump(from: u64, to: u64, reg: Reg) -> Vec<u8> {
    let mut w = Arm64Writer::new(from);
    let delta = (to as i64).wrapping_sub(from as i64);
    let pages = ((to & !0xFFF) as i64).wrapping_sub((from & !0xFFF) as i64) >> 12;
    if fits_signed(delta, 28) {
        w.put_b_imm(to);
    } else if fits_signed(pages, 21) {
        w.put_adrp_add_br(reg, to);
    } else {
        w.put_ldr_br_address(reg, to);
    }
    w.into_bytes()
}

impl Arch for Arm64 {
    const NAME: &'static str = "aarch64";
    const ALIGN: usize = 4;
    const SHORT_JUMP_LEN: usize = 4;
    const NEAR_RANGE: u64 = B_RANGE;

    fn decode(window: &[u8], pc: u64) -> Result<Instruction, DecodeError> {
        decoder::decode(window, pc)
    }

    fn entry_marker_len(code: &[u8]) -> usize {
        // PACIASP signs the return address and has to run in the copy, BTI only lands.
        match code.get(..4) {
            Some(w) if decoder::is_bti(u32::from_le_bytes([w[0], w[1], w[2], w[3]])) => 4,
            _ => 0,
        }
    }

    fn is_frame_setup(code: &[u8]) -> bool {
        decoder::is_frame_setup(code)
    }

    fn encode_redirect_jump(from: u64, to: u64) -> Vec<u8> {
        // x16 is the intra-procedure-call register; dead at a function entry.
        encode_jump(from, to, Reg::X16)
    }

    fn encode_tail_jump(from: u64, to: u64, ctx: &RelocContext) -> Vec<u8> {
        encode_jump(from, to, Reg::scratch(ctx.scratch))
    }

    fn encode_relocated(
        insn: &Instruction,
        raw: &[u8],
        at: u64,
        target: Option<u64>,
        floor: Encoding,
        ctx: &RelocContext,
    ) -> Result<Emitted, RelocationError> {
        relocator::relocate(insn, raw, at, target, floor, ctx)
    }

    fn scratch_register(code: &[u8]) -> u8 {
        relocator::pick_scratch(code)
    }

    fn encode_context_stub(at: u64, context: u64, handler: u64) -> Vec<u8> {
        let mut w = Arm64Writer::new(at);
        w.put_mov_reg_u64(Reg::X0, context);
        w.put_mov_reg_u64(Reg::X16, handler);
        w.put_br_reg(Reg::X16);
        w.into_bytes()
    }

    unsafe fn flush_instruction_cache(addr: *mut u8, len: usize) {
        crate::code::cache::invalidate_icache(addr, len);
    }
}
