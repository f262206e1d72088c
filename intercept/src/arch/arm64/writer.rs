#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7,
    X8 = 8,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X13 = 13,
    X14 = 14,
    X15 = 15,
    X16 = 16,
    X17 = 17,
    X18 = 18,
    X19 = 19,
    X20 = 20,
    X21 = 21,
    X22 = 22,
    X23 = 23,
    X24 = 24,
    X25 = 25,
    X26 = 26,
    X27 = 27,
    X28 = 28,
    X29 = 29,
    X30 = 30,
    SP = 31,
}

impl Reg {
    const ALL: [Reg; 32] = [
        Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5, Reg::X6, Reg::X7,
        Reg::X8, Reg::X9, Reg::X10, Reg::X11, Reg::X12, Reg::X13, Reg::X14, Reg::X15,
        Reg::X16, Reg::X17, Reg::X18, Reg::X19, Reg::X20, Reg::X21, Reg::X22, Reg::X23,
        Reg::X24, Reg::X25, Reg::X26, Reg::X27, Reg::X28, Reg::X29, Reg::X30, Reg::SP,
    ];

    /// Register numbered by the low five bits of `index`.
    pub fn from_index(index: u8) -> Reg {
        Self::ALL[(index & 0x1F) as usize]
    }

    /// Only the two intra-procedure-call scratch registers are ever needed by index.
    pub fn scratch(index: u8) -> Reg {
        if index == 17 {
            Reg::X17
        } else {
            Reg::X16
        }
    }
}

/// Instruction emitter anchored at a fixed program counter.
#[derive(Debug, Clone)]
pub struct Arm64Writer {
    code: Vec<u8>,
    base_pc: u64,
}

impl Arm64Writer {
    pub fn new(pc: u64) -> Self {
        Self { code: Vec::with_capacity(32), base_pc: pc }
    }

    pub fn pc(&self) -> u64 {
        self.base_pc.wrapping_add(self.code.len() as u64)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }

    pub fn put_u32(&mut self, insn: u32) {
        self.code.extend_from_slice(&insn.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn word_offset(&self, target: u64) -> i64 {
        (target as i64).wrapping_sub(self.pc() as i64) >> 2
    }

    pub fn put_ret(&mut self) {
        self.put_u32(0xD65F03C0);
    }

    pub fn put_nop(&mut self) {
        self.put_u32(0xD503201F);
    }

    pub fn put_br_reg(&mut self, reg: Reg) {
        self.put_u32(0xD61F0000 | ((reg as u32) << 5));
    }

    pub fn put_blr_reg(&mut self, reg: Reg) {
        self.put_u32(0xD63F0000 | ((reg as u32) << 5));
    }

    /// STP Xa, Xb, [SP, #-16]!
    pub fn put_push_reg_reg(&mut self, a: Reg, b: Reg) {
        let imm7 = (-2i32 as u32) & 0x7f;
        self.put_u32(0xA980_0000 | (imm7 << 15) | ((b as u32) << 10) | ((Reg::SP as u32) << 5) | a as u32);
    }

    /// LDP Xa, Xb, [SP], #16
    pub fn put_pop_reg_reg(&mut self, a: Reg, b: Reg) {
        self.put_u32(0xA8C0_0000 | (2 << 15) | ((b as u32) << 10) | ((Reg::SP as u32) << 5) | a as u32);
    }

    /// ADD Xd, Xn, #imm12
    pub fn put_add_reg_reg_imm(&mut self, d: Reg, n: Reg, imm: u32) {
        self.put_u32(0x9100_0000 | ((imm & 0x0fff) << 10) | ((n as u32) << 5) | d as u32);
    }

    /// MUL Xd, Xn, Xm (MADD with XZR)
    pub fn put_mul_reg_reg_reg(&mut self, d: Reg, n: Reg, m: Reg) {
        self.put_u32(0x9B00_7C00 | ((m as u32) << 16) | ((n as u32) << 5) | d as u32);
    }

    /// MOVZ Xd, #imm16
    pub fn put_movz_reg_imm16(&mut self, dst: Reg, imm: u16) {
        self.put_u32(0xD280_0000 | ((imm as u32) << 5) | dst as u32);
    }

    pub fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        // ORR treats register 31 as XZR, so moves involving SP use ADD #0.
        if src == Reg::SP || dst == Reg::SP {
            self.put_add_reg_reg_imm(dst, src, 0);
            return;
        }
        self.put_u32(0xAA00_03E0 | ((src as u32) << 16) | dst as u32);
    }

    /// Materialize a 64-bit constant with MOVZ + 3×MOVK.
    pub fn put_mov_reg_u64(&mut self, dst: Reg, value: u64) {
        let rd = dst as u32;
        for hw in 0..4u32 {
            let imm16 = ((value >> (hw * 16)) & 0xffff) as u32;
            let base = if hw == 0 { 0xD280_0000 } else { 0xF280_0000 };
            self.put_u32(base | (hw << 21) | (imm16 << 5) | rd);
        }
    }

    pub fn put_b_imm(&mut self, target: u64) {
        let imm26 = (self.word_offset(target) as u32) & 0x03FF_FFFF;
        self.put_u32(0x1400_0000 | imm26);
    }

    /// ADRP+ADD+BR (12 bytes, ±4GB range).
    pub fn put_adrp_add_br(&mut self, reg: Reg, target: u64) {
        self.put_adrp(reg, target);
        self.put_add_reg_reg_imm(reg, reg, (target & 0xFFF) as u32);
        self.put_br_reg(reg);
    }

    /// ADRP Xd, page(target)
    pub fn put_adrp(&mut self, reg: Reg, target: u64) {
        let page_off = ((target & !0xFFF) as i64).wrapping_sub((self.pc() & !0xFFF) as i64) >> 12;
        let immlo = (page_off as u32) & 0x3;
        let immhi = ((page_off as u32) >> 2) & 0x7FFFF;
        self.put_u32(0x9000_0000 | (immlo << 29) | (immhi << 5) | reg as u32);
    }

    /// `LDR Xt, [PC, #8]; BR Xt; .quad addr`
    pub fn put_ldr_br_address(&mut self, reg: Reg, addr: u64) {
        self.put_u32(0x5800_0000 | (2 << 5) | reg as u32);
        self.put_br_reg(reg);
        self.put_u64(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(w: Arm64Writer) -> Vec<u32> {
        w.into_bytes()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn encode(f: impl FnOnce(&mut Arm64Writer)) -> Vec<u32> {
        let mut w = Arm64Writer::new(0x1000);
        f(&mut w);
        words(w)
    }

    #[test]
    fn encode_b_forward_and_backward() {
        assert_eq!(encode(|w| w.put_b_imm(0x1100)), vec![0x1400_0040]);
        assert_eq!(encode(|w| w.put_b_imm(0x0FFC)), vec![0x17FF_FFFF]);
    }

    #[test]
    fn encode_stp_ldp_frame_pair() {
        assert_eq!(encode(|w| w.put_push_reg_reg(Reg::X29, Reg::X30)), vec![0xA9BF_7BFD]);
        assert_eq!(encode(|w| w.put_pop_reg_reg(Reg::X29, Reg::X30)), vec![0xA8C1_7BFD]);
    }

    #[test]
    fn encode_arithmetic() {
        assert_eq!(encode(|w| w.put_add_reg_reg_imm(Reg::X0, Reg::X0, 100)), vec![0x9100_0000 | (100 << 10)]);
        assert_eq!(encode(|w| w.put_mul_reg_reg_reg(Reg::X0, Reg::X0, Reg::X1)), vec![0x9B01_7C00]);
        assert_eq!(encode(|w| w.put_movz_reg_imm16(Reg::X1, 3)), vec![0xD280_0061]);
        assert_eq!(encode(|w| w.put_mov_reg_reg(Reg::X16, Reg::SP)), vec![0x9100_0000 | (31 << 5) | 16]);
    }

    #[test]
    fn encode_mov_reg_u64() {
        let w = encode(|w| w.put_mov_reg_u64(Reg::X16, 0x0123_4567_89AB_CDEF));
        assert_eq!(w[0], 0xD280_0000 | (0xCDEF << 5) | 16);
        assert_eq!(w[1], 0xF280_0000 | (1 << 21) | (0x89AB << 5) | 16);
        assert_eq!(w[2], 0xF280_0000 | (2 << 21) | (0x4567 << 5) | 16);
        assert_eq!(w[3], 0xF280_0000 | (3 << 21) | (0x0123 << 5) | 16);
    }

    #[test]
    fn encode_adrp_add_br() {
        let w = encode(|w| w.put_adrp_add_br(Reg::X16, 0x0040_3123));
        // (0x403000 - 0x1000) >> 12 = 0x402: immlo = 2, immhi = 0x100
        assert_eq!(w[0], 0x9000_0000 | (2 << 29) | (0x100 << 5) | 16);
        assert_eq!(w[1], 0x9100_0000 | (0x123 << 10) | (16 << 5) | 16);
        assert_eq!(w[2], 0xD61F_0000 | (16 << 5));
    }

    #[test]
    fn encode_literal_sequences() {
        let w = encode(|w| w.put_ldr_br_address(Reg::X16, 0xDEAD_BEEF_CAFE_BABE));
        assert_eq!(w[0], 0x5800_0000 | (2 << 5) | 16);
        assert_eq!(w[1], 0xD61F_0000 | (16 << 5));
        assert_eq!((w[3] as u64) << 32 | w[2] as u64, 0xDEAD_BEEF_CAFE_BABE);
    }

    #[test]
    fn encode_branch_register_nop_ret() {
        assert_eq!(encode(|w| w.put_br_reg(Reg::X16)), vec![0xD61F_0200]);
        assert_eq!(encode(|w| w.put_blr_reg(Reg::X16)), vec![0xD63F_0200]);
        assert_eq!(encode(|w| { w.put_nop(); w.put_ret() }), vec![0xD503201F, 0xD65F03C0]);
    }
}
