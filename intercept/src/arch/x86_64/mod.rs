pub mod decoder;
pub mod relocator;
pub mod writer;

use crate::arch::{Arch, Emitted, Encoding, Instruction, RelocContext};
use crate::error::{DecodeError, RelocationError};
use writer::{Reg, X86_64Writer};

/// Near JMP (E9 rel32): 5 bytes.
pub const NEAR_JMP_SIZE: usize = 5;

/// Far JMP (FF 25 02 00 00 00; 0F 0B; .quad addr): 16 bytes.
pub const FAR_JMP_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86_64;

impl Arch for X86_64 {
    const NAME: &'static str = "x86_64";
    const ALIGN: usize = 1;
    const SHORT_JUMP_LEN: usize = NEAR_JMP_SIZE;
    const NEAR_RANGE: u64 = 0x7FFF_0000;

    fn decode(window: &[u8], pc: u64) -> Result<Instruction, DecodeError> {
        decoder::decode(window, pc)
    }

    fn entry_marker_len(code: &[u8]) -> usize {
        if decoder::is_endbr64(code) {
            4
        } else {
            0
        }
    }

    fn is_frame_setup(code: &[u8]) -> bool {
        decoder::is_frame_setup(code)
    }

    fn encode_redirect_jump(from: u64, to: u64) -> Vec<u8> {
        let mut w = X86_64Writer::new(from);
        w.put_jmp_address(to);
        w.into_bytes()
    }

    fn encode_relocated(
        insn: &Instruction,
        raw: &[u8],
        at: u64,
        target: Option<u64>,
        floor: Encoding,
        ctx: &RelocContext,
    ) -> Result<Emitted, RelocationError> {
        if relocator::is_pc_thunk(insn) {
            return Ok(relocator::relocate_pc_thunk(insn, at, ctx));
        }
        relocator::relocate(insn, raw, at, target, floor, ctx)
    }

    fn scratch_register(_code: &[u8]) -> u8 {
        // r11 is neither an argument nor callee-saved in the SysV ABI.
        Reg::R11 as u8
    }

    fn encode_context_stub(at: u64, context: u64, handler: u64) -> Vec<u8> {
        let mut w = X86_64Writer::new(at);
        w.put_mov_reg_imm64(Reg::RDI, context);
        w.put_mov_reg_imm64(Reg::RAX, handler);
        w.put_jmp_reg(Reg::RAX);
        w.into_bytes()
    }

    unsafe fn flush_instruction_cache(addr: *mut u8, len: usize) {
        crate::code::cache::invalidate_icache(addr, len);
    }
}
