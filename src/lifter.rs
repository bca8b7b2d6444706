// lifter.rs - RISC-V basic block to IR
//
// Lifts every opcode the decoder can produce, so lifting is total.
// Guest x0 reads as zero through its state slot; writes to x0 are dropped.
// The builder threads the last compare and the JALR target into terminator
// synthesis instead of recovering them by scanning backwards.

use crate::cfg::{BasicBlock, TermKind};
use crate::decoder::{DecodedInst, Opcode, Operand};
use crate::ir::{self, BinOpKind, CmpCond, Payload, Type, ValueId};

struct BlockBuilder {
    insts: Vec<ir::Inst>,
    last_cmp: Option<ValueId>,
    indirect_target: Option<ValueId>,
}

impl BlockBuilder {
    fn new() -> Self {
        BlockBuilder {
            insts: Vec::new(),
            last_cmp: None,
            indirect_target: None,
        }
    }

    /// Append a producing instruction; the dest id is the dense index.
    fn value(&mut self, payload: Payload) -> ValueId {
        let id = self.insts.len() as ValueId;
        self.insts.push(ir::Inst {
            dest: Some(id),
            payload,
        });
        id
    }

    /// Append a non-producing instruction.
    fn effect(&mut self, payload: Payload) {
        self.insts.push(ir::Inst {
            dest: None,
            payload,
        });
    }

    fn read_reg(&mut self, reg: u8) -> ValueId {
        self.value(Payload::ReadReg { reg })
    }

    fn write_reg(&mut self, reg: u8, value: ValueId) {
        // Writes to x0 are architecturally discarded.
        if reg != 0 {
            self.effect(Payload::WriteReg { reg, value });
        }
    }

    fn imm(&mut self, ty: Type, value: u64) -> ValueId {
        self.value(Payload::Const { ty, value })
    }

    fn bin(&mut self, kind: BinOpKind, ty: Type, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.value(Payload::BinOp { kind, lhs, rhs, ty })
    }

    fn icmp(&mut self, cond: CmpCond, lhs: ValueId, rhs: ValueId) -> ValueId {
        let id = self.value(Payload::ICmp { cond, lhs, rhs });
        self.last_cmp = Some(id);
        id
    }

    fn load(&mut self, ty: Type, base: ValueId, offset: i64) -> ValueId {
        self.value(Payload::Load { base, offset, ty })
    }

    fn store(&mut self, ty: Type, value: ValueId, base: ValueId, offset: i64) {
        self.effect(Payload::Store {
            value,
            base,
            offset,
            ty,
        });
    }

    fn zext(&mut self, src: ValueId, to: Type) -> ValueId {
        self.value(Payload::ZExt { src, to })
    }

    fn sext(&mut self, src: ValueId, to: Type) -> ValueId {
        self.value(Payload::SExt { src, to })
    }

    fn get_pc(&mut self) -> ValueId {
        self.value(Payload::GetPC)
    }
}

fn get_reg(op: &Operand) -> u8 {
    match op {
        Operand::Reg { index } => *index,
        other => panic!("lifter: expected register operand, got {other:?}"),
    }
}

fn get_imm(op: &Operand) -> i64 {
    match op {
        Operand::Imm { value } => *value,
        other => panic!("lifter: expected immediate operand, got {other:?}"),
    }
}

fn get_mem(op: &Operand) -> (u8, i64) {
    match op {
        Operand::Mem { base, offset } => (*base, *offset),
        other => panic!("lifter: expected memory operand, got {other:?}"),
    }
}

fn branch_cond(op: Opcode) -> CmpCond {
    match op {
        Opcode::BEQ => CmpCond::Eq,
        Opcode::BNE => CmpCond::Ne,
        Opcode::BLT => CmpCond::Slt,
        Opcode::BGE => CmpCond::Sge,
        Opcode::BLTU => CmpCond::Ult,
        Opcode::BGEU => CmpCond::Uge,
        other => panic!("lifter: {other:?} is not a conditional branch"),
    }
}

/// rd = rs1 <op> imm, at the given width. W-forms sign-extend the 32-bit
/// result back to 64 bits before the register write.
fn lift_alu_imm(b: &mut BlockBuilder, inst: &DecodedInst, kind: BinOpKind, ty: Type) {
    let rd = get_reg(&inst.operands[0]);
    let rs1 = get_reg(&inst.operands[1]);
    let imm = get_imm(&inst.operands[2]) as u64;
    let v1 = b.read_reg(rs1);
    let c = b.imm(Type::I64, imm);
    let r = b.bin(kind, ty, v1, c);
    let r = if ty == Type::I32 {
        b.sext(r, Type::I64)
    } else {
        r
    };
    b.write_reg(rd, r);
}

/// rd = rs1 <op> rs2, at the given width.
fn lift_alu_reg(b: &mut BlockBuilder, inst: &DecodedInst, kind: BinOpKind, ty: Type) {
    let rd = get_reg(&inst.operands[0]);
    let rs1 = get_reg(&inst.operands[1]);
    let rs2 = get_reg(&inst.operands[2]);
    let v1 = b.read_reg(rs1);
    let v2 = b.read_reg(rs2);
    let r = b.bin(kind, ty, v1, v2);
    let r = if ty == Type::I32 {
        b.sext(r, Type::I64)
    } else {
        r
    };
    b.write_reg(rd, r);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LoadExt {
    Sign,
    Zero,
    None,
}

fn lift_load(b: &mut BlockBuilder, inst: &DecodedInst, ty: Type, ext: LoadExt) {
    let rd = get_reg(&inst.operands[0]);
    let (base, offset) = get_mem(&inst.operands[1]);
    let vbase = b.read_reg(base);
    let v = b.load(ty, vbase, offset);
    let v = match ext {
        LoadExt::Sign => b.sext(v, Type::I64),
        LoadExt::Zero => b.zext(v, Type::I64),
        LoadExt::None => v,
    };
    b.write_reg(rd, v);
}

fn lift_store(b: &mut BlockBuilder, inst: &DecodedInst, ty: Type) {
    let (base, offset) = get_mem(&inst.operands[0]);
    let rs = get_reg(&inst.operands[1]);
    let vbase = b.read_reg(base);
    let val = b.read_reg(rs);
    b.store(ty, val, vbase, offset);
}

/// rd = (rs1 cmp rhs) ? 1 : 0, for SLT/SLTU/SLTI/SLTIU.
fn lift_set_less(b: &mut BlockBuilder, inst: &DecodedInst, cond: CmpCond, rhs_imm: bool) {
    let rd = get_reg(&inst.operands[0]);
    let rs1 = get_reg(&inst.operands[1]);
    let v1 = b.read_reg(rs1);
    let v2 = if rhs_imm {
        let imm = get_imm(&inst.operands[2]) as u64;
        b.imm(Type::I64, imm)
    } else {
        let rs2 = get_reg(&inst.operands[2]);
        b.read_reg(rs2)
    };
    let c = b.icmp(cond, v1, v2);
    let r = b.zext(c, Type::I64);
    b.write_reg(rd, r);
}

/// Lift one basic block into IR.
pub fn lift(bb: &BasicBlock) -> ir::Block {
    let mut b = BlockBuilder::new();

    for inst in &bb.instrs {
        match inst.opcode {
            Opcode::LUI => {
                let rd = get_reg(&inst.operands[0]);
                let imm = get_imm(&inst.operands[1]) as u64;
                let c = b.imm(Type::I64, imm);
                b.write_reg(rd, c);
            }
            Opcode::AUIPC => {
                let rd = get_reg(&inst.operands[0]);
                let imm = get_imm(&inst.operands[1]) as u64;
                let pc = b.get_pc();
                let c = b.imm(Type::I64, imm);
                let sum = b.bin(BinOpKind::Add, Type::I64, pc, c);
                b.write_reg(rd, sum);
            }

            Opcode::ADDI => lift_alu_imm(&mut b, inst, BinOpKind::Add, Type::I64),
            Opcode::XORI => lift_alu_imm(&mut b, inst, BinOpKind::Xor, Type::I64),
            Opcode::ORI => lift_alu_imm(&mut b, inst, BinOpKind::Or, Type::I64),
            Opcode::ANDI => lift_alu_imm(&mut b, inst, BinOpKind::And, Type::I64),
            Opcode::SLLI => lift_alu_imm(&mut b, inst, BinOpKind::Shl, Type::I64),
            Opcode::SRLI => lift_alu_imm(&mut b, inst, BinOpKind::LShr, Type::I64),
            Opcode::SRAI => lift_alu_imm(&mut b, inst, BinOpKind::AShr, Type::I64),
            Opcode::SLTI => lift_set_less(&mut b, inst, CmpCond::Slt, true),
            Opcode::SLTIU => lift_set_less(&mut b, inst, CmpCond::Ult, true),

            Opcode::ADD => lift_alu_reg(&mut b, inst, BinOpKind::Add, Type::I64),
            Opcode::SUB => lift_alu_reg(&mut b, inst, BinOpKind::Sub, Type::I64),
            Opcode::AND => lift_alu_reg(&mut b, inst, BinOpKind::And, Type::I64),
            Opcode::OR => lift_alu_reg(&mut b, inst, BinOpKind::Or, Type::I64),
            Opcode::XOR => lift_alu_reg(&mut b, inst, BinOpKind::Xor, Type::I64),
            Opcode::SLL => lift_alu_reg(&mut b, inst, BinOpKind::Shl, Type::I64),
            Opcode::SRL => lift_alu_reg(&mut b, inst, BinOpKind::LShr, Type::I64),
            Opcode::SRA => lift_alu_reg(&mut b, inst, BinOpKind::AShr, Type::I64),
            Opcode::SLT => lift_set_less(&mut b, inst, CmpCond::Slt, false),
            Opcode::SLTU => lift_set_less(&mut b, inst, CmpCond::Ult, false),

            Opcode::ADDIW => lift_alu_imm(&mut b, inst, BinOpKind::Add, Type::I32),
            Opcode::SLLIW => lift_alu_imm(&mut b, inst, BinOpKind::Shl, Type::I32),
            Opcode::SRLIW => lift_alu_imm(&mut b, inst, BinOpKind::LShr, Type::I32),
            Opcode::SRAIW => lift_alu_imm(&mut b, inst, BinOpKind::AShr, Type::I32),
            Opcode::ADDW => lift_alu_reg(&mut b, inst, BinOpKind::Add, Type::I32),
            Opcode::SUBW => lift_alu_reg(&mut b, inst, BinOpKind::Sub, Type::I32),
            Opcode::SLLW => lift_alu_reg(&mut b, inst, BinOpKind::Shl, Type::I32),
            Opcode::SRLW => lift_alu_reg(&mut b, inst, BinOpKind::LShr, Type::I32),
            Opcode::SRAW => lift_alu_reg(&mut b, inst, BinOpKind::AShr, Type::I32),

            Opcode::LB => lift_load(&mut b, inst, Type::I8, LoadExt::Sign),
            Opcode::LH => lift_load(&mut b, inst, Type::I16, LoadExt::Sign),
            Opcode::LW => lift_load(&mut b, inst, Type::I32, LoadExt::Sign),
            Opcode::LBU => lift_load(&mut b, inst, Type::I8, LoadExt::Zero),
            Opcode::LHU => lift_load(&mut b, inst, Type::I16, LoadExt::Zero),
            Opcode::LWU => lift_load(&mut b, inst, Type::I32, LoadExt::Zero),
            Opcode::LD => lift_load(&mut b, inst, Type::I64, LoadExt::None),

            Opcode::SB => lift_store(&mut b, inst, Type::I8),
            Opcode::SH => lift_store(&mut b, inst, Type::I16),
            Opcode::SW => lift_store(&mut b, inst, Type::I32),
            Opcode::SD => lift_store(&mut b, inst, Type::I64),

            Opcode::BEQ
            | Opcode::BNE
            | Opcode::BLT
            | Opcode::BGE
            | Opcode::BLTU
            | Opcode::BGEU => {
                let rs1 = get_reg(&inst.operands[0]);
                let rs2 = get_reg(&inst.operands[1]);
                let v1 = b.read_reg(rs1);
                let v2 = b.read_reg(rs2);
                b.icmp(branch_cond(inst.opcode), v1, v2);
            }

            Opcode::JAL => {
                let rd = get_reg(&inst.operands[0]);
                let ra = b.imm(Type::I64, inst.pc + 4);
                b.write_reg(rd, ra);
            }
            Opcode::JALR => {
                let rd = get_reg(&inst.operands[0]);
                let (base, offset) = get_mem(&inst.operands[1]);
                let vbase = b.read_reg(base);
                let off = b.imm(Type::I64, offset as u64);
                let sum = b.bin(BinOpKind::Add, Type::I64, vbase, off);
                // JALR clears the low bit of the computed target.
                let mask = b.imm(Type::I64, !1u64);
                let target = b.bin(BinOpKind::And, Type::I64, sum, mask);
                b.indirect_target = Some(target);
                let ra = b.imm(Type::I64, inst.pc + 4);
                b.write_reg(rd, ra);
            }

            // Translation is single-threaded; ordering is vacuous.
            Opcode::FENCE => {}
            // Terminator becomes Trap via the block's TermKind.
            Opcode::ECALL | Opcode::EBREAK => {}
        }
    }

    let last_value = b.insts.iter().rev().find_map(|i| i.dest);
    let term = match bb.term {
        TermKind::Branch => ir::Terminator::CBr {
            cond: b.last_cmp.unwrap_or(0),
            t: bb.succs.first().copied().unwrap_or(0),
            f: bb.succs.get(1).copied().unwrap_or(0),
        },
        TermKind::Jump | TermKind::Fallthrough | TermKind::None => ir::Terminator::Br {
            target: bb.succs.first().copied().unwrap_or(0),
        },
        TermKind::IndirectJump => ir::Terminator::BrIndirect {
            target: b.indirect_target.or(last_value).unwrap_or(0),
        },
        TermKind::Return => ir::Terminator::Ret,
        TermKind::Trap => ir::Terminator::Trap,
    };

    ir::Block {
        start: bb.start,
        insts: b.insts,
        term,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_inst(pc: u64, opcode: Opcode, operands: Vec<Operand>) -> DecodedInst {
        DecodedInst {
            pc,
            raw: 0,
            opcode,
            operands,
        }
    }

    fn reg(index: u8) -> Operand {
        Operand::Reg { index }
    }
    fn imm(value: i64) -> Operand {
        Operand::Imm { value }
    }
    fn mem(base: u8, offset: i64) -> Operand {
        Operand::Mem { base, offset }
    }

    /// Every operand refers to a value defined earlier in the block.
    fn check_defs_precede_uses(bb: &ir::Block) {
        let defined_at = |id: ValueId| -> usize { id as usize };
        for (pos, inst) in bb.insts.iter().enumerate() {
            let uses: Vec<ValueId> = match &inst.payload {
                Payload::WriteReg { value, .. } => vec![*value],
                Payload::BinOp { lhs, rhs, .. } => vec![*lhs, *rhs],
                Payload::ICmp { lhs, rhs, .. } => vec![*lhs, *rhs],
                Payload::ZExt { src, .. }
                | Payload::SExt { src, .. }
                | Payload::Trunc { src, .. } => vec![*src],
                Payload::Load { base, .. } => vec![*base],
                Payload::Store { value, base, .. } => vec![*value, *base],
                _ => vec![],
            };
            for u in uses {
                assert!(
                    defined_at(u) < pos,
                    "%{u} used at {pos} before its definition"
                );
                assert_eq!(bb.insts[defined_at(u)].dest, Some(u));
            }
        }
    }

    #[test]
    fn addi_beq_lowers_to_cbr() {
        // x5 = x6 + 42; if (x5 == x7) goto 0x100c else 0x1008
        let bb = BasicBlock {
            start: 0x1000,
            instrs: vec![
                mk_inst(0x1000, Opcode::ADDI, vec![reg(5), reg(6), imm(42)]),
                mk_inst(0x1004, Opcode::BEQ, vec![reg(5), reg(7), imm(8)]),
            ],
            term: TermKind::Branch,
            succs: vec![0x100c, 0x1008],
        };
        let irbb = lift(&bb);
        assert_eq!(irbb.start, 0x1000);
        // readreg x6, const 42, add, writereg x5, readreg x5, readreg x7, icmp
        assert!(irbb.insts.len() >= 7);
        check_defs_precede_uses(&irbb);
        match irbb.term {
            ir::Terminator::CBr { cond, t, f } => {
                assert_eq!(t, 0x100c);
                assert_eq!(f, 0x1008);
                assert!(matches!(
                    irbb.insts[cond as usize].payload,
                    Payload::ICmp {
                        cond: CmpCond::Eq,
                        ..
                    }
                ));
            }
            other => panic!("expected CBr, got {other:?}"),
        }
    }

    #[test]
    fn jalr_lowers_to_br_indirect() {
        // jalr x1, 0(x10)
        let bb = BasicBlock {
            start: 0x2000,
            instrs: vec![mk_inst(0x2000, Opcode::JALR, vec![reg(1), mem(10, 0)])],
            term: TermKind::IndirectJump,
            succs: vec![],
        };
        let irbb = lift(&bb);
        check_defs_precede_uses(&irbb);
        match irbb.term {
            ir::Terminator::BrIndirect { target } => {
                // The threaded target is the masked (And) value, not the
                // return-address constant that was produced after it.
                assert!(matches!(
                    irbb.insts[target as usize].payload,
                    Payload::BinOp {
                        kind: BinOpKind::And,
                        ..
                    }
                ));
            }
            other => panic!("expected BrIndirect, got {other:?}"),
        }
        // Return address lands in x1.
        assert!(irbb.insts.iter().any(|i| matches!(
            i.payload,
            Payload::WriteReg { reg: 1, .. }
        )));
    }

    #[test]
    fn writes_to_x0_are_suppressed() {
        // addi x0, x1, 1 computes but discards
        let bb = BasicBlock {
            start: 0x1000,
            instrs: vec![mk_inst(0x1000, Opcode::ADDI, vec![reg(0), reg(1), imm(1)])],
            term: TermKind::None,
            succs: vec![],
        };
        let irbb = lift(&bb);
        assert!(!irbb
            .insts
            .iter()
            .any(|i| matches!(i.payload, Payload::WriteReg { .. })));
    }

    #[test]
    fn loads_attach_extensions() {
        let bb = BasicBlock {
            start: 0x1000,
            instrs: vec![
                mk_inst(0x1000, Opcode::LW, vec![reg(1), mem(2, 4)]),
                mk_inst(0x1004, Opcode::LBU, vec![reg(3), mem(2, 8)]),
                mk_inst(0x1008, Opcode::LD, vec![reg(4), mem(2, 16)]),
            ],
            term: TermKind::None,
            succs: vec![],
        };
        let irbb = lift(&bb);
        check_defs_precede_uses(&irbb);
        assert!(irbb.insts.iter().any(|i| matches!(
            i.payload,
            Payload::SExt { to: Type::I64, .. }
        )));
        assert!(irbb.insts.iter().any(|i| matches!(
            i.payload,
            Payload::ZExt { to: Type::I64, .. }
        )));
        // LD writes the loaded value directly.
        let ld_load = irbb
            .insts
            .iter()
            .position(|i| matches!(i.payload, Payload::Load { ty: Type::I64, .. }))
            .unwrap();
        assert!(irbb.insts.iter().any(|i| matches!(
            i.payload,
            Payload::WriteReg { reg: 4, value } if value == ld_load as ValueId
        )));
    }

    #[test]
    fn w_forms_narrow_and_sign_extend() {
        let bb = BasicBlock {
            start: 0x1000,
            instrs: vec![mk_inst(0x1000, Opcode::ADDIW, vec![reg(5), reg(6), imm(-1)])],
            term: TermKind::None,
            succs: vec![],
        };
        let irbb = lift(&bb);
        let add = irbb
            .insts
            .iter()
            .position(|i| {
                matches!(
                    i.payload,
                    Payload::BinOp {
                        kind: BinOpKind::Add,
                        ty: Type::I32,
                        ..
                    }
                )
            })
            .expect("i32 add");
        assert!(matches!(
            irbb.insts[add + 1].payload,
            Payload::SExt { to: Type::I64, src } if src == add as ValueId
        ));
    }

    #[test]
    fn slt_produces_compare_and_zext() {
        let bb = BasicBlock {
            start: 0x1000,
            instrs: vec![mk_inst(0x1000, Opcode::SLTU, vec![reg(1), reg(2), reg(3)])],
            term: TermKind::None,
            succs: vec![],
        };
        let irbb = lift(&bb);
        check_defs_precede_uses(&irbb);
        let cmp = irbb
            .insts
            .iter()
            .position(|i| {
                matches!(
                    i.payload,
                    Payload::ICmp {
                        cond: CmpCond::Ult,
                        ..
                    }
                )
            })
            .expect("ult compare");
        assert!(matches!(
            irbb.insts[cmp + 1].payload,
            Payload::ZExt { to: Type::I64, src } if src == cmp as ValueId
        ));
    }

    #[test]
    fn store_reads_base_then_value() {
        let bb = BasicBlock {
            start: 0x1000,
            instrs: vec![mk_inst(0x1000, Opcode::SD, vec![mem(2, 24), reg(6)])],
            term: TermKind::Return,
            succs: vec![],
        };
        let irbb = lift(&bb);
        check_defs_precede_uses(&irbb);
        assert_eq!(irbb.term, ir::Terminator::Ret);
        match &irbb.insts[2].payload {
            Payload::Store {
                value,
                base,
                offset,
                ty,
            } => {
                assert_eq!(*ty, Type::I64);
                assert_eq!(*offset, 24);
                assert!(matches!(
                    irbb.insts[*base as usize].payload,
                    Payload::ReadReg { reg: 2 }
                ));
                assert!(matches!(
                    irbb.insts[*value as usize].payload,
                    Payload::ReadReg { reg: 6 }
                ));
            }
            other => panic!("expected store, got {other:?}"),
        }
    }

    #[test]
    fn fallthrough_becomes_br() {
        let bb = BasicBlock {
            start: 0x1000,
            instrs: vec![mk_inst(0x1000, Opcode::FENCE, vec![])],
            term: TermKind::Fallthrough,
            succs: vec![0x1004],
        };
        let irbb = lift(&bb);
        assert!(irbb.insts.is_empty());
        assert_eq!(irbb.term, ir::Terminator::Br { target: 0x1004 });
    }
}
