// decoder.rs - RISC-V instruction decoder
//
// Decodes fixed-length 32-bit RV64I instructions into structured form for
// translation. Compressed instructions are out of scope; every PC is
// expected to be 4-byte aligned.

use crate::elf::Memory;
use thiserror::Error;

/// RISC-V opcodes (RV64I subset)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Opcode {
    // RV32I base
    LUI,
    AUIPC,
    JAL,
    JALR,
    BEQ,
    BNE,
    BLT,
    BGE,
    BLTU,
    BGEU,
    LB,
    LH,
    LW,
    LBU,
    LHU,
    SB,
    SH,
    SW,
    ADDI,
    SLTI,
    SLTIU,
    XORI,
    ORI,
    ANDI,
    SLLI,
    SRLI,
    SRAI,
    ADD,
    SUB,
    SLL,
    SLT,
    SLTU,
    XOR,
    SRL,
    SRA,
    OR,
    AND,
    FENCE,
    ECALL,
    EBREAK,

    // RV64I
    LWU,
    LD,
    SD,
    ADDIW,
    SLLIW,
    SRLIW,
    SRAIW,
    ADDW,
    SUBW,
    SLLW,
    SRLW,
    SRAW,
}

impl Opcode {
    /// Is this a conditional branch?
    pub fn is_cond_branch(&self) -> bool {
        matches!(
            self,
            Opcode::BEQ | Opcode::BNE | Opcode::BLT | Opcode::BGE | Opcode::BLTU | Opcode::BGEU
        )
    }

    /// Does this instruction trap (end execution)?
    pub fn is_trap(&self) -> bool {
        matches!(self, Opcode::ECALL | Opcode::EBREAK)
    }
}

/// Instruction operand. Convention: destination first; stores carry the
/// memory operand in the destination slot with the value register after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Guest register x0..x31
    Reg { index: u8 },
    /// Immediate, already sign-extended where the ISA says so
    Imm { value: i64 },
    /// base register + byte offset
    Mem { base: u8, offset: i64 },
}

/// A decoded RISC-V instruction
#[derive(Debug, Clone)]
pub struct DecodedInst {
    /// Guest PC of this instruction
    pub pc: u64,
    /// Raw instruction word
    pub raw: u32,
    /// Decoded opcode
    pub opcode: Opcode,
    /// Ordered operands (destination first)
    pub operands: Vec<Operand>,
}

impl DecodedInst {
    /// JALR x0, 0(ra) is the canonical return
    pub fn is_return(&self) -> bool {
        if self.opcode != Opcode::JALR || self.operands.len() < 2 {
            return false;
        }
        matches!(
            (&self.operands[0], &self.operands[1]),
            (Operand::Reg { index: 0 }, Operand::Mem { base: 1, offset: 0 })
        )
    }

    /// JALR that is not a return; target only known at runtime
    pub fn is_indirect_jump(&self) -> bool {
        self.opcode == Opcode::JALR && !self.is_return()
    }
}

/// Decode failure. Only the decoder reports recoverable errors; the CFG
/// builder folds them into Trap terminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("misaligned pc")]
    MisalignedPc,
    #[error("out-of-bounds instruction read")]
    OobRead,
    #[error("invalid or unsupported opcode")]
    InvalidOpcode,
}

#[inline]
fn bits(x: u32, hi: u32, lo: u32) -> u32 {
    (x >> lo) & ((1u32 << (hi - lo + 1)) - 1)
}

#[inline]
fn sext(x: u64, from_bits: u32) -> i64 {
    let m = 1u64 << (from_bits - 1);
    (x ^ m).wrapping_sub(m) as i64
}

#[inline]
fn rd(x: u32) -> u8 {
    ((x >> 7) & 0x1f) as u8
}
#[inline]
fn funct3(x: u32) -> u32 {
    (x >> 12) & 0x7
}
#[inline]
fn rs1(x: u32) -> u8 {
    ((x >> 15) & 0x1f) as u8
}
#[inline]
fn rs2(x: u32) -> u8 {
    ((x >> 20) & 0x1f) as u8
}
#[inline]
fn funct7(x: u32) -> u32 {
    (x >> 25) & 0x7f
}

/// I-type immediate: bits 31..20, sign-extended from 12 bits
fn imm_i(insn: u32) -> i64 {
    sext(u64::from(bits(insn, 31, 20)), 12)
}

/// U-type immediate: bits 31..12 shifted into place, sign-extended from 32
fn imm_u(insn: u32) -> i64 {
    sext(u64::from(insn & 0xffff_f000), 32)
}

/// S-type immediate: bits 31..25 ++ 11..7, sign-extended from 12
fn imm_s(insn: u32) -> i64 {
    let v = (bits(insn, 31, 25) << 5) | bits(insn, 11, 7);
    sext(u64::from(v), 12)
}

/// B-type immediate: [12|10:5|4:1|11] << 1, sign-extended from 13
fn imm_b(insn: u32) -> i64 {
    let v = (bits(insn, 31, 31) << 12)
        | (bits(insn, 7, 7) << 11)
        | (bits(insn, 30, 25) << 5)
        | (bits(insn, 11, 8) << 1);
    sext(u64::from(v), 13)
}

/// J-type immediate: [20|10:1|11|19:12] << 1, sign-extended from 21
fn imm_j(insn: u32) -> i64 {
    let v = (bits(insn, 31, 31) << 20)
        | (bits(insn, 19, 12) << 12)
        | (bits(insn, 20, 20) << 11)
        | (bits(insn, 30, 21) << 1);
    sext(u64::from(v), 21)
}

/// Decode the instruction word at `pc`.
pub fn decode(mem: &dyn Memory, pc: u64) -> Result<DecodedInst, DecodeError> {
    if pc & 0x3 != 0 {
        return Err(DecodeError::MisalignedPc);
    }
    let insn = mem.read32(pc).ok_or(DecodeError::OobRead)?;

    let reg = |index: u8| Operand::Reg { index };
    let imm = |value: i64| Operand::Imm { value };
    let mem_op = |base: u8, offset: i64| Operand::Mem { base, offset };

    let (opcode, operands) = match insn & 0x7f {
        0x37 => (Opcode::LUI, vec![reg(rd(insn)), imm(imm_u(insn))]),
        0x17 => (Opcode::AUIPC, vec![reg(rd(insn)), imm(imm_u(insn))]),
        0x6f => (Opcode::JAL, vec![reg(rd(insn)), imm(imm_j(insn))]),
        0x67 => {
            if funct3(insn) != 0 {
                return Err(DecodeError::InvalidOpcode);
            }
            (
                Opcode::JALR,
                vec![reg(rd(insn)), mem_op(rs1(insn), imm_i(insn))],
            )
        }
        0x63 => {
            let op = match funct3(insn) {
                0x0 => Opcode::BEQ,
                0x1 => Opcode::BNE,
                0x4 => Opcode::BLT,
                0x5 => Opcode::BGE,
                0x6 => Opcode::BLTU,
                0x7 => Opcode::BGEU,
                _ => return Err(DecodeError::InvalidOpcode),
            };
            (op, vec![reg(rs1(insn)), reg(rs2(insn)), imm(imm_b(insn))])
        }
        0x03 => {
            let op = match funct3(insn) {
                0x0 => Opcode::LB,
                0x1 => Opcode::LH,
                0x2 => Opcode::LW,
                0x3 => Opcode::LD,
                0x4 => Opcode::LBU,
                0x5 => Opcode::LHU,
                0x6 => Opcode::LWU,
                _ => return Err(DecodeError::InvalidOpcode),
            };
            (op, vec![reg(rd(insn)), mem_op(rs1(insn), imm_i(insn))])
        }
        0x23 => {
            let op = match funct3(insn) {
                0x0 => Opcode::SB,
                0x1 => Opcode::SH,
                0x2 => Opcode::SW,
                0x3 => Opcode::SD,
                _ => return Err(DecodeError::InvalidOpcode),
            };
            (op, vec![mem_op(rs1(insn), imm_s(insn)), reg(rs2(insn))])
        }
        0x13 => decode_op_imm(insn)?,
        0x1b => decode_op_imm32(insn)?,
        0x33 => {
            let op = match (funct7(insn), funct3(insn)) {
                (0x00, 0x0) => Opcode::ADD,
                (0x20, 0x0) => Opcode::SUB,
                (0x00, 0x1) => Opcode::SLL,
                (0x00, 0x2) => Opcode::SLT,
                (0x00, 0x3) => Opcode::SLTU,
                (0x00, 0x4) => Opcode::XOR,
                (0x00, 0x5) => Opcode::SRL,
                (0x20, 0x5) => Opcode::SRA,
                (0x00, 0x6) => Opcode::OR,
                (0x00, 0x7) => Opcode::AND,
                _ => return Err(DecodeError::InvalidOpcode),
            };
            (op, vec![reg(rd(insn)), reg(rs1(insn)), reg(rs2(insn))])
        }
        0x3b => {
            let op = match (funct7(insn), funct3(insn)) {
                (0x00, 0x0) => Opcode::ADDW,
                (0x20, 0x0) => Opcode::SUBW,
                (0x00, 0x1) => Opcode::SLLW,
                (0x00, 0x5) => Opcode::SRLW,
                (0x20, 0x5) => Opcode::SRAW,
                _ => return Err(DecodeError::InvalidOpcode),
            };
            (op, vec![reg(rd(insn)), reg(rs1(insn)), reg(rs2(insn))])
        }
        0x0f => (Opcode::FENCE, vec![]),
        0x73 => {
            if funct3(insn) != 0 {
                return Err(DecodeError::InvalidOpcode);
            }
            match bits(insn, 31, 20) {
                0 => (Opcode::ECALL, vec![]),
                1 => (Opcode::EBREAK, vec![]),
                _ => return Err(DecodeError::InvalidOpcode),
            }
        }
        _ => return Err(DecodeError::InvalidOpcode),
    };

    Ok(DecodedInst {
        pc,
        raw: insn,
        opcode,
        operands,
    })
}

/// OP-IMM (0x13). The 64-bit shifts carry a 6-bit shamt in bits 25..20, so
/// logical vs arithmetic right shift is distinguished on bits 31..26.
fn decode_op_imm(insn: u32) -> Result<(Opcode, Vec<Operand>), DecodeError> {
    let reg = |index: u8| Operand::Reg { index };
    let imm = |value: i64| Operand::Imm { value };
    let funct6 = bits(insn, 31, 26);
    let shamt = i64::from(bits(insn, 25, 20));

    let (op, immediate) = match funct3(insn) {
        0x0 => (Opcode::ADDI, imm_i(insn)),
        0x2 => (Opcode::SLTI, imm_i(insn)),
        0x3 => (Opcode::SLTIU, imm_i(insn)),
        0x4 => (Opcode::XORI, imm_i(insn)),
        0x6 => (Opcode::ORI, imm_i(insn)),
        0x7 => (Opcode::ANDI, imm_i(insn)),
        0x1 => {
            if funct6 != 0x00 {
                return Err(DecodeError::InvalidOpcode);
            }
            (Opcode::SLLI, shamt)
        }
        0x5 => match funct6 {
            0x00 => (Opcode::SRLI, shamt),
            0x10 => (Opcode::SRAI, shamt),
            _ => return Err(DecodeError::InvalidOpcode),
        },
        _ => return Err(DecodeError::InvalidOpcode),
    };
    Ok((op, vec![reg(rd(insn)), reg(rs1(insn)), imm(immediate)]))
}

/// OP-IMM-32 (0x1b). W-form shifts carry a 5-bit shamt in bits 24..20.
fn decode_op_imm32(insn: u32) -> Result<(Opcode, Vec<Operand>), DecodeError> {
    let reg = |index: u8| Operand::Reg { index };
    let imm = |value: i64| Operand::Imm { value };
    let shamt = i64::from(bits(insn, 24, 20));

    let (op, immediate) = match funct3(insn) {
        0x0 => (Opcode::ADDIW, imm_i(insn)),
        0x1 => {
            if funct7(insn) != 0x00 {
                return Err(DecodeError::InvalidOpcode);
            }
            (Opcode::SLLIW, shamt)
        }
        0x5 => match funct7(insn) {
            0x00 => (Opcode::SRLIW, shamt),
            0x20 => (Opcode::SRAIW, shamt),
            _ => return Err(DecodeError::InvalidOpcode),
        },
        _ => return Err(DecodeError::InvalidOpcode),
    };
    Ok((op, vec![reg(rd(insn)), reg(rs1(insn)), imm(immediate)]))
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Reg { index } => write!(f, "x{index}"),
            Operand::Imm { value } => write!(f, "{value}"),
            Operand::Mem { base, offset } => write!(f, "{offset}(x{base})"),
        }
    }
}

impl std::fmt::Display for DecodedInst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.opcode)?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {op}")?;
            } else {
                write!(f, ", {op}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::SpanMemory;
    use crate::testutil::*;

    fn decode_one(word: u32) -> DecodedInst {
        let mem = SpanMemory::new(0x1000, word.to_le_bytes().to_vec());
        decode(&mem, 0x1000).unwrap()
    }

    #[test]
    fn rv64i_basic_decode() {
        let mut code = Vec::new();
        // ADDI x1, x0, 1
        append_word_le(&mut code, encode_i(1, 0, 0x0, 1, 0x13));
        // LUI x2, 0x10
        append_word_le(&mut code, encode_u(0x10, 2, 0x37));
        // ADD x3, x1, x2
        append_word_le(&mut code, encode_r(0x00, 2, 1, 0x0, 3, 0x33));
        // BEQ x0, x0, 0
        append_word_le(&mut code, 0x0000_0063);

        let base = 0x1000;
        let mem = SpanMemory::new(base, code);

        let i = decode(&mem, base).unwrap();
        assert_eq!(i.pc, base);
        assert_eq!(i.opcode, Opcode::ADDI);
        assert_eq!(
            i.operands,
            vec![
                Operand::Reg { index: 1 },
                Operand::Reg { index: 0 },
                Operand::Imm { value: 1 }
            ]
        );

        let i = decode(&mem, base + 4).unwrap();
        assert_eq!(i.opcode, Opcode::LUI);
        assert_eq!(
            i.operands,
            vec![
                Operand::Reg { index: 2 },
                Operand::Imm { value: 0x10 << 12 }
            ]
        );

        let i = decode(&mem, base + 8).unwrap();
        assert_eq!(i.opcode, Opcode::ADD);
        assert_eq!(
            i.operands,
            vec![
                Operand::Reg { index: 3 },
                Operand::Reg { index: 1 },
                Operand::Reg { index: 2 }
            ]
        );

        let i = decode(&mem, base + 12).unwrap();
        assert_eq!(i.opcode, Opcode::BEQ);
        assert_eq!(
            i.operands,
            vec![
                Operand::Reg { index: 0 },
                Operand::Reg { index: 0 },
                Operand::Imm { value: 0 }
            ]
        );
    }

    #[test]
    fn rv64i_more_decode() {
        let mut code = Vec::new();
        // SRLI x4, x3, 7
        append_word_le(&mut code, encode_shift_i(0x00, 7, 3, 0x5, 4, 0x13));
        // SRAI x5, x3, 12
        append_word_le(&mut code, encode_shift_i(0x20, 12, 3, 0x5, 5, 0x13));
        // LD x6, 8(x1)
        append_word_le(&mut code, encode_i(8, 1, 0x3, 6, 0x03));
        // SD x6, 24(x2)
        append_word_le(&mut code, encode_s(24, 6, 2, 0x3, 0x23));
        // BEQ x1, x2, +16
        append_word_le(&mut code, encode_b(16, 2, 1, 0x0, 0x63));
        // SUB x7, x6, x1
        append_word_le(&mut code, encode_r(0x20, 1, 6, 0x0, 7, 0x33));
        // ORI x8, x7, 1234
        append_word_le(&mut code, encode_i(1234, 7, 0x6, 8, 0x13));
        // ECALL, EBREAK
        append_word_le(&mut code, 0x0000_0073);
        append_word_le(&mut code, 0x0010_0073);

        let base = 0x2000;
        let mem = SpanMemory::new(base, code);

        let i = decode(&mem, base).unwrap();
        assert_eq!(i.opcode, Opcode::SRLI);
        assert_eq!(i.operands[2], Operand::Imm { value: 7 });

        let i = decode(&mem, base + 4).unwrap();
        assert_eq!(i.opcode, Opcode::SRAI);
        assert_eq!(i.operands[2], Operand::Imm { value: 12 });

        let i = decode(&mem, base + 8).unwrap();
        assert_eq!(i.opcode, Opcode::LD);
        assert_eq!(
            i.operands,
            vec![
                Operand::Reg { index: 6 },
                Operand::Mem { base: 1, offset: 8 }
            ]
        );

        let i = decode(&mem, base + 12).unwrap();
        assert_eq!(i.opcode, Opcode::SD);
        assert_eq!(
            i.operands,
            vec![
                Operand::Mem { base: 2, offset: 24 },
                Operand::Reg { index: 6 }
            ]
        );

        let i = decode(&mem, base + 16).unwrap();
        assert_eq!(i.opcode, Opcode::BEQ);
        assert_eq!(i.operands[2], Operand::Imm { value: 16 });

        let i = decode(&mem, base + 20).unwrap();
        assert_eq!(i.opcode, Opcode::SUB);

        let i = decode(&mem, base + 24).unwrap();
        assert_eq!(i.opcode, Opcode::ORI);
        assert_eq!(i.operands[2], Operand::Imm { value: 1234 });

        assert_eq!(decode(&mem, base + 28).unwrap().opcode, Opcode::ECALL);
        assert_eq!(decode(&mem, base + 32).unwrap().opcode, Opcode::EBREAK);
    }

    #[test]
    fn negative_immediates_sign_extend() {
        // ADDI x1, x2, -5
        let i = decode_one(encode_i(-5, 2, 0x0, 1, 0x13));
        assert_eq!(i.operands[2], Operand::Imm { value: -5 });

        // SW x3, -8(x4)
        let i = decode_one(encode_s(-8, 3, 4, 0x2, 0x23));
        assert_eq!(
            i.operands[0],
            Operand::Mem {
                base: 4,
                offset: -8
            }
        );

        // BEQ x0, x0, -4 (backward branch)
        let i = decode_one(encode_b(-4, 0, 0, 0x0, 0x63));
        assert_eq!(i.operands[2], Operand::Imm { value: -4 });

        // JAL x1, -2048
        let i = decode_one(encode_j(-2048, 1, 0x6f));
        assert_eq!(i.operands[1], Operand::Imm { value: -2048 });

        // LUI x2, 0xfffff -> sign-extended negative
        let i = decode_one(encode_u(0xfffff, 2, 0x37));
        assert_eq!(i.operands[1], Operand::Imm { value: -4096 });
    }

    #[test]
    fn wide_shift_amounts() {
        // SRAI x1, x2, 45 (shamt >= 32 sets bit 25)
        let i = decode_one(encode_shift_i(0x20, 45, 2, 0x5, 1, 0x13));
        assert_eq!(i.opcode, Opcode::SRAI);
        assert_eq!(i.operands[2], Operand::Imm { value: 45 });

        // SLLI x1, x2, 63
        let i = decode_one(encode_shift_i(0x00, 63, 2, 0x1, 1, 0x13));
        assert_eq!(i.opcode, Opcode::SLLI);
        assert_eq!(i.operands[2], Operand::Imm { value: 63 });
    }

    #[test]
    fn w_form_decode() {
        // ADDIW x5, x6, -1
        let i = decode_one(encode_i(-1, 6, 0x0, 5, 0x1b));
        assert_eq!(i.opcode, Opcode::ADDIW);
        assert_eq!(i.operands[2], Operand::Imm { value: -1 });

        // SRAIW x5, x6, 3
        let i = decode_one(encode_shift_i(0x20, 3, 6, 0x5, 5, 0x1b));
        assert_eq!(i.opcode, Opcode::SRAIW);

        // ADDW x1, x2, x3 / SUBW x1, x2, x3
        assert_eq!(
            decode_one(encode_r(0x00, 3, 2, 0x0, 1, 0x3b)).opcode,
            Opcode::ADDW
        );
        assert_eq!(
            decode_one(encode_r(0x20, 3, 2, 0x0, 1, 0x3b)).opcode,
            Opcode::SUBW
        );
    }

    #[test]
    fn decode_errors() {
        let mem = SpanMemory::new(0x1000, vec![0x00, 0x00, 0x00, 0x00]);
        assert!(matches!(decode(&mem, 0x1001), Err(DecodeError::MisalignedPc)));
        assert!(matches!(decode(&mem, 0x1002), Err(DecodeError::MisalignedPc)));
        assert!(matches!(decode(&mem, 0x2000), Err(DecodeError::OobRead)));
        // All-zero word is not a valid encoding
        assert!(matches!(decode(&mem, 0x1000), Err(DecodeError::InvalidOpcode)));

        // SRAI with a stray funct6 is invalid
        let bad = SpanMemory::new(
            0x1000,
            encode_shift_i(0x10, 3, 2, 0x5, 1, 0x13).to_le_bytes().to_vec(),
        );
        assert!(matches!(decode(&bad, 0x1000), Err(DecodeError::InvalidOpcode)));

        // R-type with unknown funct7
        let bad = SpanMemory::new(
            0x1000,
            encode_r(0x11, 3, 2, 0x0, 1, 0x33).to_le_bytes().to_vec(),
        );
        assert!(matches!(decode(&bad, 0x1000), Err(DecodeError::InvalidOpcode)));
    }

    #[test]
    fn return_classification() {
        // JALR x0, 0(x1) is a return
        let i = decode_one(encode_i(0, 1, 0x0, 0, 0x67));
        assert!(i.is_return());
        assert!(!i.is_indirect_jump());

        // JALR x1, 0(x10) is an indirect call
        let i = decode_one(encode_i(0, 10, 0x0, 1, 0x67));
        assert!(!i.is_return());
        assert!(i.is_indirect_jump());

        // JALR x0, 8(x1) is a computed jump, not a return
        let i = decode_one(encode_i(8, 1, 0x0, 0, 0x67));
        assert!(i.is_indirect_jump());
    }

    #[test]
    fn display_forms() {
        let i = decode_one(encode_i(1, 0, 0x0, 1, 0x13));
        assert_eq!(i.to_string(), "ADDI x1, x0, 1");
        let i = decode_one(encode_s(24, 6, 2, 0x3, 0x23));
        assert_eq!(i.to_string(), "SD 24(x2), x6");
    }
}
