//! Per-ISA backends behind one strategy trait.
//!
//! Both backends are pure byte encoders/decoders and build on every host, so
//! cross-architecture tests run everywhere. [`HostArch`] names the backend
//! that matches the compilation target.

pub mod arm64;
pub mod x86_64;

use crate::error::{DecodeError, RelocationError};

/// Longest window any backend needs to decode one instruction.
pub const DECODE_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnClass {
    Other,
    Nop,
    Ret,
    /// Breakpoint, undefined or halt opcode. Marks padding or an already
    /// patched entry.
    Trap,
    /// Indirect-branch landing marker (`endbr64`, `bti`, `paciasp`).
    FunctionEntry,
    Jump,
    /// Jump through a register or memory operand. On x86_64 a RIP-relative
    /// operand's address is the `target`, not the destination.
    IndirectJump,
    CondJump,
    Call,
    /// `cbz`/`cbnz`, and on x86_64 `jrcxz`/`loop`.
    CompareBranch,
    TestBranch,
    /// Address or memory operand relative to the program counter.
    PcRelative,
    /// `adrp`: page-granular pc-relative address.
    PcRelativePage,
    LiteralLoad,
}

/// Location of the relative field inside the instruction bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelOperand {
    pub offset: usize,
    pub width: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub pc: u64,
    pub len: usize,
    /// Primary opcode (x86_64, with map prefix folded in) or the raw word (arm64).
    pub opcode: u32,
    pub class: InsnClass,
    pub rel: Option<RelOperand>,
    /// Absolute address the relative operand resolves to.
    pub target: Option<u64>,
}

impl Instruction {
    pub fn end(&self) -> u64 {
        self.pc + self.len as u64
    }

    pub fn is_branch(&self) -> bool {
        matches!(
            self.class,
            InsnClass::Jump
                | InsnClass::CondJump
                | InsnClass::Call
                | InsnClass::CompareBranch
                | InsnClass::TestBranch
        )
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self.class, InsnClass::Ret | InsnClass::Jump | InsnClass::IndirectJump | InsnClass::Trap)
    }
}

/// How far an instruction has been promoted while relocating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Encoding {
    /// Same instruction, same length, with a recomputed displacement.
    Original,
    /// Longer native form with a wider displacement field.
    Wide,
    /// Sequence that reaches any address (absolute jump/call, skip branches).
    Absolute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitted {
    pub bytes: Vec<u8>,
    pub encoding: Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocContext {
    /// Register the backend may clobber in emitted sequences.
    pub scratch: u8,
    pub allow_widening: bool,
}

/// Architecture strategy used by the relocator, trampoline builder and engine.
pub trait Arch {
    const NAME: &'static str;
    /// Instruction alignment in bytes.
    const ALIGN: usize;
    /// Length of the shortest redirect the engine can write.
    const SHORT_JUMP_LEN: usize;
    /// Distance reachable by the shortest redirect.
    const NEAR_RANGE: u64;

    fn decode(window: &[u8], pc: u64) -> Result<Instruction, DecodeError>;

    /// Bytes at the function entry that must stay in place (landing markers).
    fn entry_marker_len(code: &[u8]) -> usize;

    /// Frame-setup prologue that starts a compiled function.
    fn is_frame_setup(code: &[u8]) -> bool;

    /// Shortest jump from `from` to `to`, clobbering nothing live at a call boundary.
    fn encode_redirect_jump(from: u64, to: u64) -> Vec<u8>;

    /// Jump back into the body of a function from the end of its trampoline.
    fn encode_tail_jump(from: u64, to: u64, ctx: &RelocContext) -> Vec<u8> {
        let _ = ctx;
        Self::encode_redirect_jump(from, to)
    }

    /// Re-emit `insn` at address `at` so that its relative operand resolves to
    /// `target`. `floor` is the least-compact encoding that previous passes
    /// already chose; the returned encoding is never below it.
    fn encode_relocated(
        insn: &Instruction,
        raw: &[u8],
        at: u64,
        target: Option<u64>,
        floor: Encoding,
        ctx: &RelocContext,
    ) -> Result<Emitted, RelocationError>;

    /// Register that relocated code may clobber, given the code being moved.
    fn scratch_register(code: &[u8]) -> u8;

    /// Stub that loads `context` into the first argument register and jumps to `handler`.
    fn encode_context_stub(at: u64, context: u64, handler: u64) -> Vec<u8>;

    /// Make freshly written code at `addr` visible to instruction fetch.
    ///
    /// # Safety
    /// `addr` must point to `len` bytes of mapped memory.
    unsafe fn flush_instruction_cache(addr: *mut u8, len: usize);
}

#[cfg(target_arch = "x86_64")]
pub type HostArch = x86_64::X86_64;

#[cfg(target_arch = "aarch64")]
pub type HostArch = arm64::Arm64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("hotswap-intercept supports x86_64 and aarch64 only");

/// Decode every instruction in `code` (anchored at `pc`) until it runs out or
/// fails. Returns the instructions and the error that stopped the sweep, if any.
pub fn decode_all<A: Arch>(code: &[u8], pc: u64) -> (Vec<Instruction>, Option<DecodeError>) {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off < code.len() {
        let end = (off + DECODE_WINDOW).min(code.len());
        match A::decode(&code[off..end], pc + off as u64) {
            Ok(insn) => {
                off += insn.len;
                out.push(insn);
            }
            Err(e) => return (out, Some(e)),
        }
    }
    (out, None)
}

#[inline]
pub(crate) fn fits_signed(value: i64, bits: u32) -> bool {
    let half = 1i64 << (bits - 1);
    (-half..half).contains(&value)
}
