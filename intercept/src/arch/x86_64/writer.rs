#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding.
    #[inline]
    fn lo3(self) -> u8 {
        (self as u8) & 7
    }

    /// Whether this register requires the REX.B or REX.R extension bit.
    #[inline]
    fn is_extended(self) -> bool {
        (self as u8) >= 8
    }

    pub fn from_index(index: u8) -> Reg {
        match index & 0xF {
            0 => Reg::RAX,
            1 => Reg::RCX,
            2 => Reg::RDX,
            3 => Reg::RBX,
            4 => Reg::RSP,
            5 => Reg::RBP,
            6 => Reg::RSI,
            7 => Reg::RDI,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::R13,
            14 => Reg::R14,
            _ => Reg::R15,
        }
    }
}

/// Code emitter anchored at a fixed program counter.
#[derive(Debug, Clone)]
pub struct X86_64Writer {
    code: Vec<u8>,
    base_pc: u64,
}

impl X86_64Writer {
    pub fn new(pc: u64) -> Self {
        Self { code: Vec::with_capacity(32), base_pc: pc }
    }

    pub fn pc(&self) -> u64 {
        self.base_pc.wrapping_add(self.code.len() as u64)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }

    fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn emit_u32_le(&mut self, val: u32) {
        self.code.extend_from_slice(&val.to_le_bytes());
    }

    fn emit_u64_le(&mut self, val: u64) {
        self.code.extend_from_slice(&val.to_le_bytes());
    }

    /// REX prefix: 0100 W R X B
    #[inline]
    fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
        0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
    }

    /// ModRM byte: mod(2) | reg(3) | rm(3)
    #[inline]
    fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
        ((mod_ & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    fn rel32_from(&self, insn_len: usize, target: u64) -> i64 {
        (target as i64).wrapping_sub(self.pc() as i64 + insn_len as i64)
    }

    // ── Push / Pop ───────────────────────────────────────────────────

    /// `push reg`: [REX.B?] 50+rd
    pub fn put_push_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0x50 + reg.lo3());
    }

    /// `pop reg`: [REX.B?] 58+rd
    pub fn put_pop_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0x58 + reg.lo3());
    }

    // ── MOV ──────────────────────────────────────────────────────────

    /// `mov reg, imm64`: REX.W B8+rd io (10 bytes)
    pub fn put_mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        self.emit(Self::rex(true, false, false, reg.is_extended()));
        self.emit(0xB8 + reg.lo3());
        self.emit_u64_le(imm);
    }

    /// `mov dst, src` (64-bit): REX.W 89 ModRM (mod=11)
    pub fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit(Self::rex(true, src.is_extended(), false, dst.is_extended()));
        self.emit(0x89);
        self.emit(Self::modrm(0b11, src.lo3(), dst.lo3()));
    }

    // ── Arithmetic ───────────────────────────────────────────────────

    /// `add reg, imm32`: REX.W 81 /0 id
    pub fn put_add_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.emit(Self::rex(true, false, false, reg.is_extended()));
        self.emit(0x81);
        self.emit(Self::modrm(0b11, 0, reg.lo3()));
        self.emit_u32_le(imm);
    }

    /// `imul dst, src, imm32`: REX.W 69 /r id
    pub fn put_imul_reg_reg_imm32(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.emit(Self::rex(true, dst.is_extended(), false, src.is_extended()));
        self.emit(0x69);
        self.emit(Self::modrm(0b11, dst.lo3(), src.lo3()));
        self.emit_u32_le(imm as u32);
    }

    // ── Branches / Calls ─────────────────────────────────────────────

    /// `jmp rel32`: E9 cd (5 bytes). `target` is an absolute address.
    pub fn put_jmp_near(&mut self, target: u64) {
        let rel = self.rel32_from(5, target);
        self.emit(0xE9);
        self.emit_u32_le(rel as u32);
    }

    /// Far absolute jump via `jmp [rip+2]; ud2; .quad addr` (16 bytes).
    ///
    /// Encoding: FF 25 02 00 00 00  0F 0B  <8-byte address>
    pub fn put_jmp_far(&mut self, target: u64) {
        self.emit(0xFF);
        self.emit(0x25);
        self.emit_u32_le(0x02);
        self.put_ud2();
        self.emit_u64_le(target);
    }

    /// Near (5B) when rel32 reaches, far (16B) otherwise.
    pub fn put_jmp_address(&mut self, target: u64) {
        if near_reachable(self.pc(), 5, target) {
            self.put_jmp_near(target);
        } else {
            self.put_jmp_far(target);
        }
    }

    /// `jmp reg`: [REX.B?] FF /4
    pub fn put_jmp_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0xFF);
        self.emit(Self::modrm(0b11, 4, reg.lo3()));
    }

    /// `call rel32`: E8 cd (5 bytes). `target` is an absolute address.
    pub fn put_call_near(&mut self, target: u64) {
        let rel = self.rel32_from(5, target);
        self.emit(0xE8);
        self.emit_u32_le(rel as u32);
    }

    /// `call reg`: [REX.B?] FF /2
    pub fn put_call_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0xFF);
        self.emit(Self::modrm(0b11, 2, reg.lo3()));
    }

    /// `jcc rel8` with a raw displacement, used for skip sequences.
    pub fn put_jcc_short_rel(&mut self, cc: u8, rel: i8) {
        self.emit(0x70 | (cc & 0xF));
        self.emit(rel as u8);
    }

    /// `jcc rel32`: 0F 80+cc cd (6 bytes).
    pub fn put_jcc_near(&mut self, cc: u8, target: u64) {
        let rel = self.rel32_from(6, target);
        self.emit(0x0F);
        self.emit(0x80 | (cc & 0xF));
        self.emit_u32_le(rel as u32);
    }

    // ── Misc ─────────────────────────────────────────────────────────

    /// `ret`: C3
    pub fn put_ret(&mut self) {
        self.emit(0xC3);
    }

    /// `ud2`: 0F 0B
    pub fn put_ud2(&mut self) {
        self.emit(0x0F);
        self.emit(0x0B);
    }

    /// Emit raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }
}

/// Whether a `len`-byte instruction at `pc` can reach `target` with a rel32.
pub fn near_reachable(pc: u64, len: usize, target: u64) -> bool {
    let rel = (target as i64).wrapping_sub(pc as i64 + len as i64);
    (i32::MIN as i64..=i32::MAX as i64).contains(&rel)
}
