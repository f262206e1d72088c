//! Patch-feasibility report for one function's bytes.

use std::fmt;

use hotswap_intercept::arch::{decode_all, Arch, Instruction, RelocContext};
use hotswap_intercept::relocate;

/// Destination used to test relocation far from the original address.
const FAR_OFFSET: u64 = 1 << 40;

pub struct Report {
    pub arch: &'static str,
    pub address: u64,
    pub code: Vec<u8>,
    pub insns: Vec<Instruction>,
    pub decode_stop: Option<String>,
    pub jump_len: usize,
    pub marker_len: usize,
    pub prefix: Result<Vec<Instruction>, String>,
    pub far: Result<FarRelocation, String>,
}

pub struct FarRelocation {
    pub to: u64,
    pub len: usize,
    pub passes: usize,
    pub widened: usize,
}

pub fn build<A: Arch>(code: &[u8], address: u64) -> Report {
    let (insns, stop) = decode_all::<A>(code, address);
    let marker_len = A::entry_marker_len(code);
    let patch_at = address + marker_len as u64;
    let jump_len = A::encode_redirect_jump(patch_at, patch_at + 0x1000).len();
    let needed = marker_len + jump_len;

    let prefix = relocate::select_prefix::<A>(code, address, needed)
        .map(|p| p.insns)
        .map_err(|e| e.to_string());

    let ctx = RelocContext { scratch: A::scratch_register(code), allow_widening: true };
    let to = address.wrapping_add(FAR_OFFSET);
    let far = relocate::relocate::<A>(code, address, needed, to, &ctx)
        .map(|r| FarRelocation { to, len: r.bytes.len(), passes: r.passes, widened: r.widened })
        .map_err(|e| e.to_string());

    Report {
        arch: A::NAME,
        address,
        code: code.to_vec(),
        insns,
        decode_stop: stop.map(|e| e.to_string()),
        jump_len,
        marker_len,
        prefix,
        far,
    }
}

impl Report {
    fn write_insn(&self, f: &mut fmt::Formatter<'_>, insn: &Instruction) -> fmt::Result {
        let off = (insn.pc - self.address) as usize;
        let bytes: Vec<String> = self.code[off..off + insn.len].iter().map(|b| format!("{b:02x}")).collect();
        write!(f, "  {:#010x}  {:<30} {:?}", insn.pc, bytes.join(" "), insn.class)?;
        if let Some(t) = insn.target {
            write!(f, " -> {t:#x}")?;
        }
        writeln!(f)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} function at {:#x}, {} bytes", self.arch, self.address, self.code.len())?;
        for insn in &self.insns {
            self.write_insn(f, insn)?;
        }
        if let Some(stop) = &self.decode_stop {
            writeln!(f, "  (decoding stopped: {stop})")?;
        }
        writeln!(f)?;
        if self.marker_len > 0 {
            writeln!(f, "entry marker: {} bytes kept in place", self.marker_len)?;
        }
        writeln!(f, "near redirect: {} bytes", self.jump_len)?;
        match &self.prefix {
            Ok(insns) => {
                let p: usize = insns.iter().map(|i| i.len).sum();
                writeln!(f, "displaced prefix: P = {p} bytes, {} instruction(s)", insns.len())?;
                for insn in insns {
                    self.write_insn(f, insn)?;
                }
            }
            Err(e) => writeln!(f, "displaced prefix: unavailable ({e})")?,
        }
        match &self.far {
            Ok(r) => writeln!(
                f,
                "far relocation to {:#x}: ok, {} bytes in {} pass(es), {} widened",
                r.to, r.len, r.passes, r.widened
            ),
            Err(e) => writeln!(f, "far relocation: rejected ({e})"),
        }
    }
}
